use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vessel_domain::{MessageBus, OutboundMessage, Subjects, UpdateClientInfo};
use vessel_errors::VesselResult;

/// Identity of the host this agent runs on.
pub fn client_info(address: &str) -> UpdateClientInfo {
    let hostname = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    UpdateClientInfo {
        username,
        hostname,
        system: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        address: address.to_string(),
    }
}

/// Publishes `UpdateClientInfo` on start-up and then periodically.
pub struct ConnectionInfoAnnouncer {
    agent_id: String,
    info: UpdateClientInfo,
    bus: Arc<dyn MessageBus>,
    subjects: Subjects,
    /// `None` announces once.
    every: Option<Duration>,
}

impl ConnectionInfoAnnouncer {
    pub fn new(
        agent_id: impl Into<String>,
        info: UpdateClientInfo,
        bus: Arc<dyn MessageBus>,
        subjects: Subjects,
        every: Option<Duration>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            info,
            bus,
            subjects,
            every,
        }
    }

    pub async fn announce(&self) -> VesselResult<u64> {
        let subject = self.subjects.connection_info(&self.agent_id)?;
        let message = OutboundMessage::new(subject, &self.info.clone().into())?;
        let sequence = self.bus.publish(message).await?;
        debug!(agent_id = %self.agent_id, sequence, "Announced connection info");
        Ok(sequence)
    }

    /// Announce failures are logged and retried on the next tick.
    pub async fn run(self, cancel: CancellationToken) -> VesselResult<()> {
        info!(
            agent_id = %self.agent_id,
            hostname = %self.info.hostname,
            "Announcing agent"
        );
        if let Err(e) = self.announce().await {
            warn!(agent_id = %self.agent_id, "Failed to announce connection info: {}", e);
        }
        let Some(every) = self.every else {
            return Ok(());
        };

        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Announcer shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.announce().await {
                        warn!(agent_id = %self.agent_id, "Failed to announce connection info: {}", e);
                    }
                }
            }
        }
    }
}
