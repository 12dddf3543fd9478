use std::sync::Arc;

use tracing::{debug, info};
use vessel_config::{BusConfig, BusKind};
use vessel_domain::{MessageBus, ObjectStore};
use vessel_errors::VesselResult;

use crate::{InMemoryBus, RedisBus, RedisBusConfig};

/// Both faces of the broker: streams and object buckets.
#[derive(Clone)]
pub struct BusHandles {
    pub bus: Arc<dyn MessageBus>,
    pub objects: Arc<dyn ObjectStore>,
}

impl BusHandles {
    pub fn in_memory() -> Self {
        let bus = Arc::new(InMemoryBus::new());
        Self {
            bus: bus.clone(),
            objects: bus,
        }
    }
}

pub struct BusFactory;

impl BusFactory {
    pub async fn create(config: &BusConfig) -> VesselResult<BusHandles> {
        debug!("Creating message bus with kind: {:?}", config.kind);

        match config.kind {
            BusKind::Memory => {
                info!("Initializing in-memory message bus");
                Ok(BusHandles::in_memory())
            }
            BusKind::Redis => {
                info!("Initializing Redis message bus");
                let redis_config = RedisBusConfig::from_url(&config.url, &config.namespace)?;
                let bus = Arc::new(RedisBus::new(redis_config).await?);
                Ok(BusHandles {
                    bus: bus.clone(),
                    objects: bus,
                })
            }
        }
    }
}
