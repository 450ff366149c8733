//! Tracing subscriber setup

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber. RUST_LOG wins over the configured level.
pub fn init(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = match config.format.as_str() {
        "json" => fmt().json().with_env_filter(filter).try_init(),
        _ => fmt().with_env_filter(filter).with_target(false).try_init(),
    };

    if let Err(e) = result {
        eprintln!("tracing subscriber already installed: {}", e);
    }
}
