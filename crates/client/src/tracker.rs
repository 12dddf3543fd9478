use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use tracing::{debug, info, warn};
use vessel_domain::{
    agent_from_stream, DiscoverResult, Job, Message, MessageBus, Route, Subjects,
};
use vessel_errors::{VesselError, VesselResult};

use crate::fold::{order_messages, DiscoverFold, JobFold};

pub const DEFAULT_FETCH_BATCH_SIZE: usize = 256;

/// 任务状态追踪器
///
/// Rebuilds jobs and agent identities from the per-agent message log. Holds
/// no state of its own between calls.
#[derive(Clone)]
pub struct JobTracker {
    bus: Arc<dyn MessageBus>,
    subjects: Subjects,
    fetch_batch_size: usize,
}

impl JobTracker {
    pub fn new(bus: Arc<dyn MessageBus>, subjects: Subjects) -> Self {
        Self {
            bus,
            subjects,
            fetch_batch_size: DEFAULT_FETCH_BATCH_SIZE,
        }
    }

    pub fn with_fetch_batch_size(mut self, fetch_batch_size: usize) -> Self {
        self.fetch_batch_size = fetch_batch_size.max(1);
        self
    }

    pub fn subjects(&self) -> &Subjects {
        &self.subjects
    }

    /// Agents that own a stream.
    pub async fn list_agents(&self) -> VesselResult<Vec<String>> {
        let mut agents: Vec<String> = self
            .bus
            .list_streams()
            .await?
            .iter()
            .filter_map(|stream| agent_from_stream(stream).map(str::to_string))
            .collect();
        agents.sort();
        Ok(agents)
    }

    /// One bounded batch of an agent's log.
    pub async fn list_messages(
        &self,
        agent_id: &str,
        filter_subjects: &[String],
        start_sequence: u64,
        limit: usize,
    ) -> VesselResult<Vec<Message>> {
        let stream = self.subjects.stream_name(agent_id);
        if !self.bus.list_streams().await?.contains(&stream) {
            return Err(VesselError::agent_not_found(agent_id));
        }
        self.bus
            .fetch(&stream, filter_subjects, start_sequence, limit)
            .await
    }

    /// Every matching message from `start_sequence` on, in batches.
    pub async fn fetch_all(
        &self,
        agent_id: &str,
        filter_subjects: &[String],
        start_sequence: u64,
    ) -> VesselResult<Vec<Message>> {
        let mut messages = Vec::new();
        let mut next = start_sequence.max(1);
        loop {
            let batch = self
                .list_messages(agent_id, filter_subjects, next, self.fetch_batch_size)
                .await?;
            let full = batch.len() == self.fetch_batch_size;
            let last = batch.last().map(|m| m.sequence);
            messages.extend(batch);
            match last {
                Some(sequence) if full && sequence >= next => next = sequence + 1,
                _ => break,
            }
        }
        debug!(
            agent_id = %agent_id,
            count = messages.len(),
            "Fetched messages"
        );
        Ok(messages)
    }

    pub async fn list_jobs(&self, agent_id: &str) -> VesselResult<BTreeMap<String, Job>> {
        let filters = self.subjects.agent_filters(&Route::JOB_LIFECYCLE, agent_id);
        let mut messages = self.fetch_all(agent_id, &filters, 1).await?;
        order_messages(&mut messages);

        let mut fold = JobFold::new(&self.subjects);
        fold.apply_all(&messages);
        Ok(fold.into_jobs())
    }

    /// Jobs of every agent. An agent whose log cannot be read is skipped.
    pub async fn list_all_jobs(&self) -> VesselResult<BTreeMap<String, Job>> {
        let mut jobs = BTreeMap::new();
        for agent_id in self.list_agents().await? {
            match self.list_jobs(&agent_id).await {
                Ok(agent_jobs) => jobs.extend(agent_jobs),
                Err(e) => warn!(agent_id = %agent_id, "Skipping agent: {}", e),
            }
        }
        Ok(jobs)
    }

    pub async fn get_job(&self, job_id: &str) -> VesselResult<Job> {
        self.list_all_jobs()
            .await?
            .remove(job_id)
            .ok_or_else(|| VesselError::job_not_found(job_id))
    }

    /// Last known identity of every agent. `timeout` bounds the whole
    /// discovery; agents that never announced themselves, or that were not
    /// read before the deadline, are reported with empty identity fields.
    pub async fn discover(&self, timeout: Duration) -> VesselResult<BTreeMap<String, DiscoverResult>> {
        let deadline = Instant::now() + timeout;
        let mut fold = DiscoverFold::new(&self.subjects);
        for agent_id in self.list_agents().await? {
            fold.register(&agent_id);
            let filters = vec![self.subjects.agent_filter(Route::ConnectionInfo, &agent_id)];
            let fetched = tokio::time::timeout_at(deadline, self.fetch_all(&agent_id, &filters, 1))
                .await
                .unwrap_or_else(|_| {
                    Err(VesselError::Timeout(format!(
                        "discover deadline of {timeout:?} passed before agent {agent_id}"
                    )))
                });
            match fetched {
                Ok(mut messages) => {
                    order_messages(&mut messages);
                    for message in &messages {
                        fold.apply(message);
                    }
                }
                Err(e) => warn!(agent_id = %agent_id, "Discover failed: {}", e),
            }
        }
        let agents = fold.into_agents();
        info!("Discovered {} agents", agents.len());
        Ok(agents)
    }
}
