//! # Ports
//!
//! The transport's inbound port is the fabric-wide
//! [`Broker`](fabric_bus::Broker) trait; `outbound` declares what the
//! transport requires from the host: an append-only event log.

pub mod outbound;
