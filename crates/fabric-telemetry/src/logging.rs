//! Structured logging setup.
//!
//! Logs carry consistent fields (`timestamp`, `level`, `component`,
//! message plus call-site context) so a log shipper can parse them; JSON
//! output is a config switch.

use crate::{TelemetryConfig, TelemetryError};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured filter. Call once per process;
/// a second call returns `TelemetryError::AlreadyInitialized`.
///
/// # Errors
///
/// Returns `TelemetryError::AlreadyInitialized` when a global subscriber
/// is already set.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.clone()));

    let result = if config.json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    result.map_err(|_| TelemetryError::AlreadyInitialized)?;
    tracing::debug!(
        service = %config.service_name,
        json = config.json_logs,
        "Structured logging configured"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_rejected() {
        let config = TelemetryConfig::default();
        // Whichever call wins the race to install, the next must fail.
        let _ = init_logging(&config);
        assert!(matches!(
            init_logging(&config),
            Err(TelemetryError::AlreadyInitialized)
        ));
    }
}
