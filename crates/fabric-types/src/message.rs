//! # Messages
//!
//! The immutable unit of delivery. A message is validated once at publish
//! time; retries create new delivery attempts, never new messages. The
//! payload is an opaque `serde_json::Value` with one narrow accessor,
//! [`payload_path`], used by filter evaluation - there is no generic
//! reflection walk over payloads anywhere in the fabric.

use crate::channel::validate_channel_name;
use crate::errors::{FilterError, MessageError};
use crate::AGENT_URI_PREFIX;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Delivery and correlation metadata carried alongside the payload.
///
/// `correlation_id` pairs requests with replies: a responder copies the
/// requester's `correlation_id` into its reply and publishes it on the
/// channel named by the request's reply-to convention
/// (`agents.<requester>.replies`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Correlates request/reply pairs across channels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Distributed trace id propagated end-to-end.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Scheduling hint; the fabric carries it opaquely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Delivery attempts so far. Incremented per retry attempt.
    #[serde(default)]
    pub retry_count: u32,
}

/// A message published on a concrete channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id. Consumers under at-least-once delivery dedupe
    /// by this id.
    pub id: Uuid,
    /// Concrete (non-wildcard) channel name.
    pub channel: String,
    /// Sender URI, `ossa://agents/<name>`.
    pub sender: String,
    /// Publish timestamp (ISO-8601 on the wire).
    pub timestamp: DateTime<Utc>,
    /// Application-level message type.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Opaque structured payload.
    pub payload: Value,
    /// Delivery metadata.
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    /// Construct a message with a fresh id and the current timestamp.
    pub fn new(
        channel: impl Into<String>,
        sender: impl Into<String>,
        message_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            sender: sender.into(),
            timestamp: Utc::now(),
            message_type: message_type.into(),
            payload,
            metadata: MessageMetadata::default(),
        }
    }

    /// Validate grammar of `channel`, `sender`, and `type`.
    ///
    /// # Errors
    ///
    /// - `MessageError::Invalid` for empty type or bad channel grammar
    /// - `MessageError::InvalidSender` for a malformed sender URI
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.message_type.is_empty() {
            return Err(MessageError::Invalid {
                reason: "type is empty".to_string(),
            });
        }
        if validate_channel_name(&self.channel).is_err() {
            return Err(MessageError::Invalid {
                reason: format!("invalid channel name '{}'", self.channel),
            });
        }
        if !is_valid_sender_uri(&self.sender) {
            return Err(MessageError::InvalidSender {
                sender: self.sender.clone(),
            });
        }
        Ok(())
    }

    /// Serialized size in bytes, as counted against the channel limit.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }

    /// Enforce the owning channel's size limit.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::TooLarge` with the measured size.
    pub fn check_size(&self, limit: usize) -> Result<(), MessageError> {
        let size = self.serialized_size();
        if size > limit {
            return Err(MessageError::TooLarge { size, limit });
        }
        Ok(())
    }
}

/// Check a sender URI against `^ossa://agents/[a-zA-Z0-9_-]+$`.
#[must_use]
pub fn is_valid_sender_uri(sender: &str) -> bool {
    match sender.strip_prefix(AGENT_URI_PREFIX) {
        Some(name) => {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        None => false,
    }
}

/// Resolve a dotted path (`a.b.c`) inside a payload.
///
/// Only object traversal is supported; an array or scalar mid-path
/// resolves to `None`.
#[must_use]
pub fn payload_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// A flat map of dotted payload path to expected value.
///
/// Paths are validated when the subscription is created; evaluation is a
/// strict equality check at every named path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageFilter {
    entries: BTreeMap<String, Value>,
}

impl MessageFilter {
    /// Create an empty filter (matches everything).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an expected value at a dotted path.
    #[must_use]
    pub fn with(mut self, path: impl Into<String>, expected: Value) -> Self {
        self.entries.insert(path.into(), expected);
        self
    }

    /// True when no paths are constrained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validate every path: non-empty, no empty segments.
    ///
    /// # Errors
    ///
    /// Returns `FilterError::InvalidPath` for the first offending path.
    pub fn validate(&self) -> Result<(), FilterError> {
        for path in self.entries.keys() {
            if path.is_empty() || path.split('.').any(str::is_empty) {
                return Err(FilterError::InvalidPath { path: path.clone() });
            }
        }
        Ok(())
    }

    /// Evaluate the filter against a payload.
    #[must_use]
    pub fn matches(&self, payload: &Value) -> bool {
        self.entries
            .iter()
            .all(|(path, expected)| payload_path(payload, path) == Some(expected))
    }
}
