//! Logging setup for binaries embedding the engine.

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// The log level to use
    pub level: Level,
    /// Whether to include file and line information
    pub file_info: bool,
    /// Application name to include in logs
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            file_info: false,
            app_name: "confero".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Create a new logging configuration.
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Enable file and line information in logs.
    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }
}

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` still wins over `config.level` so operators can raise
/// verbosity per module without a rebuild. Returns an error if a global
/// subscriber is already installed.
pub fn setup_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    builder.try_init()?;
    tracing::info!(app = %config.app_name, "logging initialised");
    Ok(())
}
