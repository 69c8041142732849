//! Cross-project operation errors.
//!
//! Authorization and quota failures are rejected synchronously, before any
//! side effect; a caller seeing `RateLimitExceeded` may retry later,
//! the authorization variants require a policy change.

use fabric_bus::PublishError;
use thiserror::Error;

/// Errors from cross-project operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CrossProjectError {
    /// Registration payload is structurally invalid.
    #[error("Invalid project config: {reason}")]
    InvalidProjectConfig { reason: String },

    /// Contract payload is structurally invalid.
    #[error("Invalid contract: {reason}")]
    InvalidContract { reason: String },

    /// Source or target project is not registered.
    #[error("Project '{project_id}' is not registered")]
    ProjectNotRegistered { project_id: String },

    /// The target is not in the source's `allowed_targets`.
    #[error("Project '{source}' may not send to '{target}'")]
    CommunicationNotAllowed { source: String, target: String },

    /// The event type is not in the source's `allowed_event_types`.
    #[error("Project '{source}' may not send event type '{event_type}'")]
    EventTypeNotAuthorized { source: String, event_type: String },

    /// No registered contract covers the (source, target, event type)
    /// triple. Project policy alone is not sufficient.
    #[error("No contract covers '{event_type}' from '{source}' to '{target}'")]
    ContractNotCovered {
        source: String,
        target: String,
        event_type: String,
    },

    /// The source project's token bucket is empty.
    #[error("Rate limit exceeded for project '{project_id}'")]
    RateLimitExceeded { project_id: String },

    /// The envelope signature failed verification.
    #[error("Invalid envelope signature from project '{project_id}'")]
    InvalidSignature { project_id: String },

    /// The underlying broker rejected the publish.
    #[error(transparent)]
    Publish(#[from] PublishError),
}
