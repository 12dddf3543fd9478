use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{EXIT_CANCELLED, EXIT_SUCCESS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "CANCELLING")]
    Cancelling,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "FAILED")]
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Cancelled | JobStatus::Failed
        )
    }

    /// Status implied by a worker exit code.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            EXIT_SUCCESS => JobStatus::Finished,
            EXIT_CANCELLED => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Cancelling => "CANCELLING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator view of one worker, rebuilt from the message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Same as the worker id.
    pub id: String,
    pub agent_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            command: command.into(),
            args,
            status: JobStatus::Pending,
            error: None,
            created: at,
            updated: at,
        }
    }

    // Terminal states are only replaced by another exit status; replies and
    // stop requests that arrive late never move a job backwards.

    /// Reply to the start request.
    pub fn on_started(&mut self, error: Option<String>, at: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        match error {
            Some(error) => {
                self.status = JobStatus::Failed;
                self.error = Some(error);
            }
            None if self.status == JobStatus::Pending => self.status = JobStatus::Running,
            None => {}
        }
        self.updated = at;
    }

    pub fn on_stop_requested(&mut self, at: DateTime<Utc>) {
        if matches!(self.status, JobStatus::Pending | JobStatus::Running) {
            self.status = JobStatus::Cancelling;
            self.updated = at;
        }
    }

    /// Reply to the stop request.
    pub fn on_stopped(&mut self, error: Option<String>, at: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        match error {
            Some(error) => {
                self.status = JobStatus::Failed;
                self.error = Some(error);
            }
            None => self.status = JobStatus::Cancelled,
        }
        self.updated = at;
    }

    pub fn on_exit(&mut self, exit_code: i32, at: DateTime<Utc>) {
        self.status = JobStatus::from_exit_code(exit_code);
        self.error = match self.status {
            JobStatus::Failed => Some(format!("exit status {exit_code}")),
            _ => None,
        };
        self.updated = at;
    }
}

/// Last known identity of an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverResult {
    pub agent_id: String,
    pub username: String,
    pub hostname: String,
    pub system: String,
    pub address: String,
    /// `None` for agents that own a stream but never announced themselves.
    pub last_seen: Option<DateTime<Utc>>,
}

impl DiscoverResult {
    pub fn silent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Default::default()
        }
    }
}
