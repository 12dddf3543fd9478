pub mod agent_client;
pub mod app_config;
pub mod bus;
pub mod observability;

pub use agent_client::{AgentConfig, ClientConfig};
pub use app_config::AppConfig;
pub use bus::{BusConfig, BusKind};
pub use observability::{LogFormat, ObservabilityConfig};
