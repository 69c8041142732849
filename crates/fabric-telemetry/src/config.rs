//! Telemetry configuration, environment-driven.

/// Configuration for logging and metrics.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to structured logs.
    pub service_name: String,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Emit logs as JSON for log shipping.
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "ossa-fabric".to_string(),
            log_filter: "info".to_string(),
            json_logs: false,
        }
    }
}

impl TelemetryConfig {
    /// Build from environment variables, falling back to defaults:
    /// `FABRIC_SERVICE_NAME`, `FABRIC_LOG_FILTER`, `FABRIC_JSON_LOGS`.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("FABRIC_SERVICE_NAME")
                .unwrap_or(defaults.service_name),
            log_filter: std::env::var("FABRIC_LOG_FILTER").unwrap_or(defaults.log_filter),
            json_logs: std::env::var("FABRIC_JSON_LOGS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.json_logs),
        }
    }
}
