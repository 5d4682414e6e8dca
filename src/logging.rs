//! Logging and tracing initialization for jpkt.
//!
//! Structured logging through the `tracing` ecosystem, either as compact
//! console output or as JSON lines for log aggregation.

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

/// Configuration for the logging system.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

/// Initialize the tracing subscriber with the given configuration.
///
/// The log level can be overridden at runtime via `RUST_LOG`.
pub fn init(config: LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.verbose)));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

fn default_directive(verbose: bool) -> String {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    format!(
        "jpk_transfer={level},jpkt={level}",
        level = level.as_str().to_lowercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_switches_default_level() {
        assert_eq!(default_directive(false), "jpk_transfer=info,jpkt=info");
        assert_eq!(default_directive(true), "jpk_transfer=debug,jpkt=debug");
    }

    #[test]
    fn log_config_follows_app_config() {
        let app = AppConfig {
            json_logs: true,
            ..Default::default()
        };
        let log = LogConfig::from(&app);
        assert!(log.json);
        assert!(!log.verbose);
    }
}
