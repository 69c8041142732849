//! # Fabric Telemetry
//!
//! Observability for the messaging fabric:
//!
//! - **Metrics**: Prometheus counters/gauges/histograms under the
//!   `fabric_` prefix, exported as text exposition
//! - **Logging**: structured `tracing` output (plain or JSON) with
//!   env-filter control
//!
//! Components record into the global registry; the host process decides
//! where the exposition text is served from.

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::TelemetryConfig;

use thiserror::Error;

/// Telemetry initialization failures.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A metric could not be registered.
    #[error("Metric registration failed: {0}")]
    Registration(String),

    /// The tracing subscriber was already installed.
    #[error("Logging already initialized")]
    AlreadyInitialized,

    /// Metrics could not be encoded for exposition.
    #[error("Metrics encoding failed: {0}")]
    Encoding(String),
}
