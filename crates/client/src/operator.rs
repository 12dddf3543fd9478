use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;
use vessel_domain::{
    MessageBus, OutboundMessage, ProtocolMessage, StartWorkerRequest, StopWorkerRequest,
    StreamConfig, Subjects, UpdateWorkerStdio,
};
use vessel_errors::VesselResult;

use crate::tracker::JobTracker;

/// Output of a worker read from the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StdoutChunk {
    pub data: Vec<u8>,
    /// Pass back to continue where this read stopped.
    pub next_sequence: u64,
}

/// Operator commands: publish requests to an agent's subjects.
#[derive(Clone)]
pub struct Operator {
    bus: Arc<dyn MessageBus>,
    subjects: Subjects,
    tracker: JobTracker,
}

impl Operator {
    pub fn new(bus: Arc<dyn MessageBus>, subjects: Subjects) -> Self {
        let tracker = JobTracker::new(Arc::clone(&bus), subjects.clone());
        Self {
            bus,
            subjects,
            tracker,
        }
    }

    pub fn with_tracker(mut self, tracker: JobTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    pub async fn ensure_agent_stream(&self, agent_id: &str) -> VesselResult<()> {
        self.bus
            .create_stream(StreamConfig {
                name: self.subjects.stream_name(agent_id),
                subjects: self.subjects.stream_subjects(agent_id),
            })
            .await
    }

    async fn send(&self, subject: String, message: ProtocolMessage) -> VesselResult<String> {
        let outbound = OutboundMessage::new(subject, &message)?;
        let id = outbound.id.clone();
        self.bus.publish(outbound).await?;
        Ok(id)
    }

    /// Ask `agent_id` to start a job; returns the new job id.
    pub async fn start_job(
        &self,
        agent_id: &str,
        command: impl Into<String>,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    ) -> VesselResult<String> {
        let worker_id = Uuid::new_v4().to_string();
        let request = StartWorkerRequest {
            command: command.into(),
            args,
            env,
        };
        let subject = self.subjects.start(agent_id, &worker_id)?;
        info!(
            agent_id = %agent_id,
            worker_id = %worker_id,
            command = %request.command,
            "Starting job"
        );
        self.send(subject, request.into()).await?;
        Ok(worker_id)
    }

    /// Returns the id of the stop request.
    pub async fn stop_job(&self, agent_id: &str, worker_id: &str) -> VesselResult<String> {
        let subject = self.subjects.stop(agent_id, worker_id)?;
        info!(agent_id = %agent_id, worker_id = %worker_id, "Stopping job");
        self.send(subject, StopWorkerRequest {}.into()).await
    }

    pub async fn write_stdin(
        &self,
        agent_id: &str,
        worker_id: &str,
        data: Vec<u8>,
    ) -> VesselResult<String> {
        let subject = self.subjects.stdin(agent_id, worker_id)?;
        self.send(subject, UpdateWorkerStdio { data }.into()).await
    }

    /// Concatenated stdout published since `start_sequence`.
    pub async fn read_stdout(
        &self,
        agent_id: &str,
        worker_id: &str,
        start_sequence: u64,
    ) -> VesselResult<StdoutChunk> {
        let filters = vec![self.subjects.stdout(agent_id, worker_id)?];
        let messages = self
            .tracker
            .fetch_all(agent_id, &filters, start_sequence)
            .await?;

        let mut chunk = StdoutChunk {
            data: Vec::new(),
            next_sequence: start_sequence.max(1),
        };
        for message in &messages {
            if let Ok(ProtocolMessage::UpdateWorkerStdio(stdio)) = message.decode() {
                chunk.data.extend_from_slice(&stdio.data);
            }
            chunk.next_sequence = chunk.next_sequence.max(message.sequence + 1);
        }
        Ok(chunk)
    }
}
