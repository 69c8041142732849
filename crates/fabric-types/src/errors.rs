//! # Validation Errors
//!
//! Typed errors for the shapes defined in this crate. Validation errors are
//! always returned synchronously to the caller and are never retried.

use thiserror::Error;

/// Errors from channel validation and registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel name violates the naming grammar or the per-type rule.
    #[error("Invalid channel name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// The QoS policy or channel config is out of platform bounds.
    #[error("Invalid channel config for '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    /// A channel with this name is already registered.
    #[error("Channel '{name}' already exists")]
    AlreadyExists { name: String },

    /// No channel with this name is registered.
    #[error("Channel '{name}' not found")]
    NotFound { name: String },
}

/// Errors from message validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// The message failed structural validation.
    #[error("Invalid message: {reason}")]
    Invalid { reason: String },

    /// The sender URI does not match `ossa://agents/<name>`.
    #[error("Invalid sender URI '{sender}'")]
    InvalidSender { sender: String },

    /// The serialized message exceeds the channel's size limit.
    #[error("Message of {size} bytes exceeds channel limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
}

/// Errors from topic pattern parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatternError {
    /// The pattern is empty or contains an empty segment.
    #[error("Invalid pattern '{pattern}': {reason}")]
    Invalid { pattern: String, reason: String },

    /// `#` appeared somewhere other than the final position.
    #[error("Invalid pattern '{pattern}': '#' is only allowed as the final segment")]
    MultiWildcardNotLast { pattern: String },
}

/// Errors from subscription filter validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// A filter path is empty or contains an empty segment.
    #[error("Invalid filter path '{path}'")]
    InvalidPath { path: String },
}
