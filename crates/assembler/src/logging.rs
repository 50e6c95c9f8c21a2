//! Tracing subscriber setup

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter from `RUST_LOG` when set, otherwise from the configured level
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Later calls are ignored.
///
/// Logs go to stderr so stdout stays free for per-run results.
pub fn init_logging(config: &LoggingConfig) {
    let filter = env_filter(config);

    if config.json {
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
    } else {
        let subscriber = fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
    }
}
