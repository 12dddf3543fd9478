use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    /// 进程内总线，只在单个进程内可见，适用于嵌入式部署与测试
    Memory,
    #[default]
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub kind: BusKind,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_namespace() -> String {
    "vessel".to_string()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::default(),
            url: default_url(),
            namespace: default_namespace(),
        }
    }
}

impl ConfigValidator for BusConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.namespace, "bus.namespace")?;
        if self.namespace.split('.').any(|token| {
            ValidationUtils::validate_subject_token(token, "bus.namespace").is_err()
        }) {
            return Err(ConfigError::Validation(format!(
                "bus.namespace '{}' is not a valid subject prefix",
                self.namespace
            )));
        }
        if self.kind == BusKind::Redis {
            ValidationUtils::validate_url(&self.url, "bus.url")?;
        }
        Ok(())
    }
}
