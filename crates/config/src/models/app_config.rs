use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    agent_client::{AgentConfig, ClientConfig},
    bus::BusConfig,
    observability::ObservabilityConfig,
};
use crate::validation::ConfigValidator;

const DEFAULT_PATHS: [&str; 3] = [
    "config/vessel.toml",
    "vessel.toml",
    "/etc/vessel/config.toml",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 加载配置: 默认值 -> TOML文件 -> `VESSEL__` 环境变量
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder()
            .set_default("agent.agent_id", AgentConfig::default().agent_id)?
            .set_default("bus.namespace", BusConfig::default().namespace)?;

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else if let Some(path) = DEFAULT_PATHS.iter().find(|p| Path::new(p).exists()) {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("VESSEL")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.bus.validate()?;
        self.agent.validate()?;
        self.client.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BusKind, LogFormat};
    use std::io::Write;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.bus.namespace, "vessel");
        assert_eq!(config.bus.kind, BusKind::Redis);
        assert_eq!(config.agent.stdout_chunk_size, 4096);
        assert_eq!(config.agent.final_status_timeout_ms, 5000);
        assert_eq!(config.client.fetch_batch_size, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = AppConfig::from_toml(
            r#"
            [bus]
            kind = "memory"

            [agent]
            agent_id = "edge-7"

            [observability]
            log_format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.bus.kind, BusKind::Memory);
        assert_eq!(config.bus.url, "redis://127.0.0.1:6379");
        assert_eq!(config.agent.agent_id, "edge-7");
        assert_eq!(config.agent.stdout_chunk_size, 4096);
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.agent.agent_id = "edge.7".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.agent.stdout_chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.client.fetch_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.bus.namespace = "ops..c2".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.observability.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[agent]\nagent_id = \"file-agent\"\ninfo_interval_seconds = 0\n[client]\nfetch_batch_size = 10"
        )
        .unwrap();
        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.agent.agent_id, "file-agent");
        assert_eq!(config.agent.info_interval_seconds, 0);
        assert_eq!(config.client.fetch_batch_size, 10);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(AppConfig::load(Some("/nonexistent/vessel.toml")).is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(AppConfig::from_toml(&text).unwrap(), config);
    }
}
