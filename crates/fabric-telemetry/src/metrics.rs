//! Prometheus metrics for the messaging fabric.
//!
//! All metrics follow the naming convention: `fabric_<component>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., messages_published_total)
//! - **Gauge**: Value that can go up or down (e.g., messages_in_flight)
//! - **Histogram**: Distribution of values (e.g., processing_duration_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, Opts, Registry,
    TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // BUS METRICS (in-process broker)
    // =========================================================================

    /// Messages accepted by publish
    pub static ref BUS_MESSAGES_PUBLISHED: Counter = Counter::new(
        "fabric_bus_messages_published_total",
        "Messages accepted by the broker"
    ).expect("metric creation failed");

    /// Deliveries acknowledged
    pub static ref BUS_MESSAGES_ACKNOWLEDGED: Counter = Counter::new(
        "fabric_bus_messages_acknowledged_total",
        "Deliveries acknowledged by handlers"
    ).expect("metric creation failed");

    /// Deliveries that failed
    pub static ref BUS_MESSAGES_FAILED: Counter = Counter::new(
        "fabric_bus_messages_failed_total",
        "Deliveries that failed (handler error or nack)"
    ).expect("metric creation failed");

    /// Messages routed to dead-letter channels
    pub static ref BUS_MESSAGES_DEAD_LETTERED: Counter = Counter::new(
        "fabric_bus_messages_dead_lettered_total",
        "Messages routed to a dead-letter channel"
    ).expect("metric creation failed");

    // =========================================================================
    // TRANSPORT METRICS (durable broker)
    // =========================================================================

    /// Messages durably appended
    pub static ref TRANSPORT_MESSAGES_PUBLISHED: Counter = Counter::new(
        "fabric_transport_messages_published_total",
        "Messages durably appended to the event log"
    ).expect("metric creation failed");

    /// Messages consumed (acknowledged by a group)
    pub static ref TRANSPORT_MESSAGES_CONSUMED: Counter = Counter::new(
        "fabric_transport_messages_consumed_total",
        "Messages acknowledged by consumer groups"
    ).expect("metric creation failed");

    /// Failed delivery attempts
    pub static ref TRANSPORT_MESSAGES_FAILED: Counter = Counter::new(
        "fabric_transport_messages_failed_total",
        "Delivery attempts that failed"
    ).expect("metric creation failed");

    /// Dead-lettered messages
    pub static ref TRANSPORT_MESSAGES_DEAD_LETTERED: Counter = Counter::new(
        "fabric_transport_messages_dead_lettered_total",
        "Messages appended to a dead-letter channel"
    ).expect("metric creation failed");

    /// Store operation failures
    pub static ref TRANSPORT_STORE_ERRORS: Counter = Counter::new(
        "fabric_transport_store_errors_total",
        "Event log operations that failed"
    ).expect("metric creation failed");

    /// Deliveries awaiting acknowledgment
    pub static ref TRANSPORT_MESSAGES_IN_FLIGHT: Gauge = Gauge::new(
        "fabric_transport_messages_in_flight",
        "Deliveries currently awaiting acknowledgment"
    ).expect("metric creation failed");

    /// End-to-end processing latency
    pub static ref TRANSPORT_PROCESSING_DURATION: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "fabric_transport_processing_duration_seconds",
            "Time from dispatch to acknowledgment"
        ).buckets(exponential_buckets(0.0001, 2.0, 15).unwrap())
    ).expect("metric creation failed");

    /// Connection pool utilization
    pub static ref TRANSPORT_POOL_UTILIZATION: Gauge = Gauge::new(
        "fabric_transport_pool_utilization_ratio",
        "Fraction of pooled store connections checked out"
    ).expect("metric creation failed");

    // =========================================================================
    // CROSS-PROJECT METRICS
    // =========================================================================

    /// Cross-project messages sent
    pub static ref CROSS_PROJECT_MESSAGES_SENT: Counter = Counter::new(
        "fabric_cross_project_messages_sent_total",
        "Envelopes published across project boundaries"
    ).expect("metric creation failed");

    /// Cross-project messages received
    pub static ref CROSS_PROJECT_MESSAGES_RECEIVED: Counter = Counter::new(
        "fabric_cross_project_messages_received_total",
        "Envelopes delivered to project handlers"
    ).expect("metric creation failed");

    /// Cross-project sends rejected
    pub static ref CROSS_PROJECT_MESSAGES_FAILED: CounterVec = CounterVec::new(
        Opts::new(
            "fabric_cross_project_messages_failed_total",
            "Cross-project sends rejected"
        ),
        &["reason"]  // reason: authorization/contract/rate_limit/signature/publish
    ).expect("metric creation failed");

    /// Rate limiter rejections
    pub static ref CROSS_PROJECT_RATE_LIMITED: Counter = Counter::new(
        "fabric_cross_project_rate_limited_total",
        "Sends rejected by a project rate limiter"
    ).expect("metric creation failed");
}

/// Handle proving metrics are registered.
pub struct MetricsHandle {
    _registry: &'static Registry,
}

/// Register all fabric metrics with the global registry.
///
/// # Errors
///
/// Returns `TelemetryError::Registration` when a collector is registered
/// twice.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Bus
        Box::new(BUS_MESSAGES_PUBLISHED.clone()),
        Box::new(BUS_MESSAGES_ACKNOWLEDGED.clone()),
        Box::new(BUS_MESSAGES_FAILED.clone()),
        Box::new(BUS_MESSAGES_DEAD_LETTERED.clone()),
        // Transport
        Box::new(TRANSPORT_MESSAGES_PUBLISHED.clone()),
        Box::new(TRANSPORT_MESSAGES_CONSUMED.clone()),
        Box::new(TRANSPORT_MESSAGES_FAILED.clone()),
        Box::new(TRANSPORT_MESSAGES_DEAD_LETTERED.clone()),
        Box::new(TRANSPORT_STORE_ERRORS.clone()),
        Box::new(TRANSPORT_MESSAGES_IN_FLIGHT.clone()),
        Box::new(TRANSPORT_PROCESSING_DURATION.clone()),
        Box::new(TRANSPORT_POOL_UTILIZATION.clone()),
        // Cross-project
        Box::new(CROSS_PROJECT_MESSAGES_SENT.clone()),
        Box::new(CROSS_PROJECT_MESSAGES_RECEIVED.clone()),
        Box::new(CROSS_PROJECT_MESSAGES_FAILED.clone()),
        Box::new(CROSS_PROJECT_RATE_LIMITED.clone()),
    ];

    for collector in collectors {
        REGISTRY
            .register(collector)
            .map_err(|e| TelemetryError::Registration(e.to_string()))?;
    }

    Ok(MetricsHandle {
        _registry: &REGISTRY,
    })
}

/// Render the registry as Prometheus text exposition.
///
/// # Errors
///
/// Returns `TelemetryError::Encoding` when encoding fails.
pub fn export() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| TelemetryError::Encoding(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::Encoding(e.to_string()))
}
