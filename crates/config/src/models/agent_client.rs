use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::ConfigResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    /// Reported in connection info.
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_chunk_size")]
    pub stdout_chunk_size: usize,
    /// Budget for the stdout drain and for the terminal status publish.
    #[serde(default = "default_final_status_timeout_ms")]
    pub final_status_timeout_ms: u64,
    /// 0 disables the periodic re-announce.
    #[serde(default = "default_info_interval_seconds")]
    pub info_interval_seconds: u64,
}

fn default_chunk_size() -> usize {
    4096
}

fn default_final_status_timeout_ms() -> u64 {
    5000
}

fn default_info_interval_seconds() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: "agent-001".to_string(),
            address: "127.0.0.1".to_string(),
            stdout_chunk_size: default_chunk_size(),
            final_status_timeout_ms: default_final_status_timeout_ms(),
            info_interval_seconds: default_info_interval_seconds(),
        }
    }
}

impl ConfigValidator for AgentConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_subject_token(&self.agent_id, "agent.agent_id")?;
        ValidationUtils::validate_positive(self.stdout_chunk_size as u64, "agent.stdout_chunk_size")?;
        ValidationUtils::validate_positive(
            self.final_status_timeout_ms,
            "agent.final_status_timeout_ms",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: usize,
    #[serde(default = "default_discover_timeout_ms")]
    pub discover_timeout_ms: u64,
}

fn default_fetch_batch_size() -> usize {
    256
}

fn default_discover_timeout_ms() -> u64 {
    5000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            fetch_batch_size: default_fetch_batch_size(),
            discover_timeout_ms: default_discover_timeout_ms(),
        }
    }
}

impl ConfigValidator for ClientConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_positive(self.fetch_batch_size as u64, "client.fetch_batch_size")?;
        ValidationUtils::validate_positive(self.discover_timeout_ms, "client.discover_timeout_ms")?;
        Ok(())
    }
}
