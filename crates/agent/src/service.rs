use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use vessel_config::AgentConfig;
use vessel_domain::{
    ConsumerConfig, FileSystem, MessageBus, Route, ScriptRuntime, StreamConfig, Subjects,
};
use vessel_errors::VesselResult;

use crate::announcer::{client_info, ConnectionInfoAnnouncer};
use crate::dispatcher::Dispatcher;
use crate::group::TaskGroup;
use crate::pipeline::{Connector, Endpoints};
use crate::worker::WorkerContext;

/// One agent process: connector, dispatcher and announcer under one token.
pub struct AgentService {
    config: AgentConfig,
    bus: Arc<dyn MessageBus>,
    subjects: Subjects,
    runtime: Arc<dyn ScriptRuntime>,
    filesystem: Arc<dyn FileSystem>,
}

impl AgentService {
    pub fn new(
        config: AgentConfig,
        bus: Arc<dyn MessageBus>,
        subjects: Subjects,
        runtime: Arc<dyn ScriptRuntime>,
        filesystem: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            config,
            bus,
            subjects,
            runtime,
            filesystem,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            name: self.subjects.stream_name(&self.config.agent_id),
            subjects: self.subjects.stream_subjects(&self.config.agent_id),
        }
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            agent_id: self.config.agent_id.clone(),
            bus: Arc::clone(&self.bus),
            subjects: self.subjects.clone(),
            runtime: Arc::clone(&self.runtime),
            filesystem: Arc::clone(&self.filesystem),
            stdout_chunk_size: self.config.stdout_chunk_size,
            final_status_timeout: Duration::from_millis(self.config.final_status_timeout_ms),
        }
    }

    /// Serve until `cancel` fires or a pipeline stage fails. Running workers
    /// are cancelled and drained before this returns.
    pub async fn run(self, cancel: CancellationToken) -> VesselResult<()> {
        let agent_id = self.config.agent_id.clone();
        let stream = self.stream_config();
        let stream_name = stream.name.clone();
        self.bus.create_stream(stream).await?;

        let mut group = TaskGroup::new(&cancel);
        let consumer = ConsumerConfig::ordered(
            self.subjects
                .agent_filters(&[Route::WorkerStart, Route::WorkerStop], &agent_id),
        )
        .durable(format!("dispatcher_{agent_id}"));
        let Endpoints { inbound, outbound } =
            Connector::new(Arc::clone(&self.bus), stream_name, consumer)
                .start(&mut group)
                .await?;

        let mut dispatcher = Dispatcher::new(self.worker_context(), group.token());
        group.spawn("dispatcher", async move {
            dispatcher.run(inbound, outbound).await
        });

        let every = match self.config.info_interval_seconds {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        };
        let announcer = ConnectionInfoAnnouncer::new(
            agent_id.clone(),
            client_info(&self.config.address),
            Arc::clone(&self.bus),
            self.subjects.clone(),
            every,
        );
        group.spawn("announcer", announcer.run(group.token()));

        info!(agent_id = %agent_id, "Agent service started");
        let result = group.wait().await;
        info!(agent_id = %agent_id, "Agent service stopped");
        result
    }
}
