use std::time::Duration;

use vessel_errors::{VesselError, VesselResult};

/// Redis总线配置
#[derive(Debug, Clone)]
pub struct RedisBusConfig {
    pub url: String,
    /// Every key the bus touches starts with this prefix.
    pub key_prefix: String,
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
    /// How often an idle consumer re-reads its stream.
    pub poll_interval: Duration,
}

impl Default for RedisBusConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "vessel".to_string(),
            max_retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl RedisBusConfig {
    pub fn from_url(url: &str, key_prefix: &str) -> VesselResult<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| VesselError::config_error(format!("无效的Redis URL: {e}")))?;
        if !matches!(parsed.scheme(), "redis" | "rediss") {
            return Err(VesselError::config_error(format!(
                "Redis URL must use redis:// or rediss://, got '{}'",
                parsed.scheme()
            )));
        }
        Ok(Self {
            url: url.to_string(),
            key_prefix: key_prefix.to_string(),
            ..Self::default()
        })
    }
}
