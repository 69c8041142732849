//! # Projects & Contracts
//!
//! Tenant policy for cross-project traffic. A `ProjectConfig` is the
//! per-tenant policy record (allow-lists, rate limits, signing
//! credentials); a `CrossProjectEventContract` is the authorization +
//! schema unit that makes a `(source, target, event_type)` triple
//! deliverable. Both must pass for a message to flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Token-bucket quota for a project's outbound sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Sustained sends per second.
    pub events_per_second: u64,
    /// Maximum burst above the sustained rate.
    pub burst_limit: u64,
}

/// Signing credentials for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectCredentials {
    /// Public identifier presented by callers.
    pub api_key: String,
    /// HMAC signing secret. Never logged.
    pub secret: String,
}

/// Per-tenant policy record. Identity fields (`project_id`, `namespace`)
/// are immutable after registration; policy fields may be replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Unique project id.
    pub project_id: String,
    /// Human-readable name.
    pub name: String,
    /// Channel namespace prefix owned by this project.
    pub namespace: String,
    /// Event types this project may send.
    #[serde(default)]
    pub allowed_event_types: HashSet<String>,
    /// Project ids this project may send to.
    #[serde(default)]
    pub allowed_targets: HashSet<String>,
    /// Outbound quota; absent means unlimited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limiting: Option<RateLimitPolicy>,
    /// Signing credentials; absent means unsigned envelopes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<ProjectCredentials>,
}

impl ProjectConfig {
    /// Minimal valid config with empty policy.
    pub fn new(
        project_id: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            name: name.into(),
            namespace: namespace.into(),
            allowed_event_types: HashSet::new(),
            allowed_targets: HashSet::new(),
            rate_limiting: None,
            credentials: None,
        }
    }
}

/// Free-form contract bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractMetadata {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Authorization + validation unit for inter-project traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossProjectEventContract {
    /// Contract name, unique per version.
    pub name: String,
    /// Contract version string.
    pub version: String,
    /// Project allowed to send under this contract.
    pub source_project: String,
    /// Projects allowed to receive under this contract.
    pub target_projects: Vec<String>,
    /// Event types this contract covers.
    pub event_types: Vec<String>,
    /// JSON Schema for the event payload.
    pub schema: Value,
    /// Bookkeeping.
    #[serde(default)]
    pub metadata: ContractMetadata,
}

impl CrossProjectEventContract {
    /// True when this contract permits `event_type` from `source` to
    /// `target`.
    #[must_use]
    pub fn covers(&self, source: &str, target: &str, event_type: &str) -> bool {
        self.source_project == source
            && self.target_projects.iter().any(|t| t == target)
            && self.event_types.iter().any(|e| e == event_type)
    }
}
