use anyhow::{Context, Result};
use vessel_config::{AppConfig, LogFormat};

/// 通用的应用启动配置
#[derive(Debug, Clone, Default)]
pub struct StartupConfig {
    pub config_path: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub agent_id: Option<String>,
}

/// 加载应用配置，命令行参数优先于配置文件
pub fn load_config(startup_config: &StartupConfig) -> Result<AppConfig> {
    let mut config = AppConfig::load(startup_config.config_path.as_deref()).with_context(|| {
        format!(
            "加载配置文件失败: {}",
            startup_config.config_path.as_deref().unwrap_or("<default>")
        )
    })?;

    if let Some(ref agent_id) = startup_config.agent_id {
        vessel_config::ValidationUtils::validate_subject_token(agent_id, "--agent-id")?;
        config.agent.agent_id = agent_id.clone();
    }
    if let Some(ref level) = startup_config.log_level {
        config.observability.log_level = level.clone();
    }
    if let Some(ref format) = startup_config.log_format {
        config.observability.log_format = LogFormat::parse(format)
            .ok_or_else(|| anyhow::anyhow!("不支持的日志格式: {format}"))?;
    }

    Ok(config)
}

/// 初始化日志系统
pub fn init_logging(config: &AppConfig) -> Result<()> {
    vessel_infrastructure::init_logging(
        &config.observability.log_level,
        config.observability.log_format,
    )
    .context("初始化日志系统失败")
}

/// Parse `KEY=VALUE` pairs given on the command line.
pub fn parse_env_pairs<'a>(pairs: impl IntoIterator<Item = &'a String>) -> Result<std::collections::BTreeMap<String, String>> {
    pairs
        .into_iter()
        .map(|pair| {
            pair.split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| anyhow::anyhow!("环境变量格式应为 KEY=VALUE: {pair}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_pairs() {
        let pairs = vec!["A=1".to_string(), "B=x=y".to_string()];
        let env = parse_env_pairs(&pairs).unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "x=y");

        let bad = vec!["=1".to_string()];
        assert!(parse_env_pairs(&bad).is_err());
        let bad = vec!["NOEQUALS".to_string()];
        assert!(parse_env_pairs(&bad).is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let config = load_config(&StartupConfig {
            agent_id: Some("edge-7".to_string()),
            log_format: Some("json".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(config.agent.agent_id, "edge-7");
        assert_eq!(config.observability.log_format, LogFormat::Json);

        assert!(load_config(&StartupConfig {
            agent_id: Some("bad.id".to_string()),
            ..Default::default()
        })
        .is_err());
        assert!(load_config(&StartupConfig {
            config_path: Some("/nonexistent/vessel.toml".to_string()),
            ..Default::default()
        })
        .is_err());
    }
}
