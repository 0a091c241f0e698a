mod privacy;
pub mod metrics;

pub use privacy::redact_sensitive_field;
pub use metrics::{MetricsCollector, MetricsSnapshot, TimedOperation};

use std::path::PathBuf;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, EnvFilter};

/// Logging configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub max_level: Level,
    pub privacy_mode: PrivacyMode,
}

/// How much journal content is allowed into the logs. A journaling client
/// handles deeply personal text; production builds never log it verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivacyMode {
    /// Log everything (development)
    Full,
    /// Redact journal text, tokens, and PII (production default)
    Redacted,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            max_level: if cfg!(debug_assertions) {
                Level::DEBUG
            } else {
                Level::INFO
            },
            privacy_mode: if cfg!(debug_assertions) {
                PrivacyMode::Full
            } else {
                PrivacyMode::Redacted
            },
        }
    }
}

impl LoggingConfig {
    pub fn with_log_dir(mut self, log_dir: PathBuf) -> Self {
        self.log_dir = log_dir;
        self
    }
}

/// Initialize the logging system with the provided configuration
pub fn init_logging(config: LoggingConfig) -> Result<(), String> {
    std::fs::create_dir_all(&config.log_dir)
        .map_err(|e| format!("Failed to create log directory: {}", e))?;

    // Daily rotation keeps individual files small enough to ship in bug reports
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "vellum.log");

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    std::mem::forget(guard); // Keep guard alive for app lifetime

    let env_filter = create_env_filter(&config);

    if cfg!(debug_assertions) {
        // Development: pretty output with source locations
        fmt()
            .with_env_filter(env_filter)
            .with_writer(non_blocking)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(false)
            .pretty()
            .init();
    } else {
        // Production: JSON file logging only
        fmt()
            .with_env_filter(env_filter)
            .with_writer(non_blocking)
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }

    tracing::info!(
        log_dir = %config.log_dir.display(),
        json_enabled = !cfg!(debug_assertions),
        privacy_mode = ?config.privacy_mode,
        "Logging initialized"
    );

    Ok(())
}

/// Create the environment filter for log levels
fn create_env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level_str = match config.max_level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };

        // Quiet the HTTP stack; keep pipeline modules verbose
        EnvFilter::new(format!(
            "{},\
            vellum=debug,\
            hyper=info,\
            tokio=info,\
            reqwest=info,\
            cpal=info",
            level_str
        ))
    })
}

/// Platform-specific default log directory
pub fn default_log_dir() -> PathBuf {
    if cfg!(target_os = "macos") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Library/Logs/vellum")
    } else if cfg!(target_os = "windows") {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vellum")
            .join("logs")
    } else {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vellum")
            .join("logs")
    }
}
