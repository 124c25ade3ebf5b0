//! Structured logging setup

use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::{Error, Result};

/// Install a JSON `tracing` subscriber
///
/// `RUST_LOG` wins when set; otherwise `service.log_level` is used, falling
/// back to `info` when it does not parse. Fails if a global subscriber is
/// already installed.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter = env_filter(&config.service.log_level);

    tracing_subscriber::fmt()
        .json()
        .with_current_span(true)
        .with_target(true)
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize tracing: {}", e)))?;

    tracing::info!(service = %config.service.name, "Tracing initialized");

    Ok(())
}

/// Flush and shut down tracing
pub fn shutdown_tracing() {
    tracing::info!("Tracing shutdown complete");
}

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(log_level))
}

fn level_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_fails_cleanly() {
        let config = Config::default();
        let first = init_tracing(&config);
        let second = init_tracing(&config);
        // Another test may have installed a subscriber first; either way the
        // second attempt must not panic.
        assert!(first.is_err() || second.is_err());
    }

    #[test]
    fn test_level_filter() {
        assert_eq!(level_filter("debug").to_string(), "debug");
        assert_eq!(level_filter("grpc_bridge=verbose").to_string(), "info");
    }
}
