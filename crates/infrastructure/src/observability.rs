use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vessel_config::LogFormat;
use vessel_errors::{VesselError, VesselResult};

/// 初始化日志系统
///
/// `RUST_LOG` wins over `log_level` when set.
pub fn init_logging(log_level: &str, log_format: LogFormat) -> VesselResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| VesselError::config_error(format!("初始化JSON日志格式失败: {e}"))),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| VesselError::config_error(format!("初始化Pretty日志格式失败: {e}"))),
    }
}

/// Compact stderr logging for tests; safe to call more than once.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_test_writer(),
        )
        .try_init();
}
