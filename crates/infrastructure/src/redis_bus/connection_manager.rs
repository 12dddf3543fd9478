use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::Client;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use vessel_errors::{VesselError, VesselResult};

use super::config::RedisBusConfig;

pub struct RedisConnectionManager {
    manager: ConnectionManager,
    config: RedisBusConfig,
}

impl RedisConnectionManager {
    pub async fn new(config: RedisBusConfig) -> VesselResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| {
            VesselError::transport(format!("Failed to create Redis client: {e}"))
        })?;

        let manager = Self::connect_with_retry(&client, &config).await?;
        let manager = Self { manager, config };
        manager.ping().await?;
        debug!("Successfully connected to Redis at {}", manager.config.url);

        Ok(manager)
    }

    async fn connect_with_retry(
        client: &Client,
        config: &RedisBusConfig,
    ) -> VesselResult<ConnectionManager> {
        let mut last_error = None;

        for attempt in 0..config.max_retry_attempts {
            match ConnectionManager::new(client.clone()).await {
                Ok(manager) => {
                    if attempt > 0 {
                        debug!(
                            "Successfully reconnected to Redis after {} attempts",
                            attempt + 1
                        );
                    }
                    return Ok(manager);
                }
                Err(e) => {
                    if attempt + 1 < config.max_retry_attempts {
                        warn!(
                            "Failed to connect to Redis (attempt {}/{}): {}. Retrying in {:?}...",
                            attempt + 1,
                            config.max_retry_attempts,
                            e,
                            config.retry_delay
                        );
                        sleep(config.retry_delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let error_msg = format!(
            "Failed to connect to Redis after {} attempts. Last error: {}",
            config.max_retry_attempts,
            last_error.map_or("Unknown".to_string(), |e| e.to_string())
        );
        error!("{}", error_msg);
        Err(VesselError::transport(error_msg))
    }

    /// Cheap clone of the multiplexed connection.
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    pub fn key(&self, parts: &[&str]) -> String {
        let mut key = self.config.key_prefix.clone();
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    pub async fn execute_command<T: redis::FromRedisValue>(
        &self,
        cmd: &mut redis::Cmd,
    ) -> VesselResult<T> {
        let mut conn = self.connection();
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| VesselError::transport(format!("Redis command failed: {e}")))
    }

    pub async fn ping(&self) -> VesselResult<()> {
        let response: String = self.execute_command(&mut redis::cmd("PING")).await?;
        if response == "PONG" {
            Ok(())
        } else {
            let error_msg = format!("Unexpected PING response: {response}");
            error!("{}", error_msg);
            Err(VesselError::transport(error_msg))
        }
    }
}
