//! # Channels
//!
//! A channel is a named communication endpoint with a type and a QoS policy.
//! Names are dot-delimited segments matching `[a-zA-Z0-9_-]+`; the type
//! constrains the name further:
//!
//! - `direct` channels are exactly `agents.<agentName>.<suffix>`
//! - `broadcast` channels start with `agents.broadcast.`
//! - `topic` channels only need to satisfy the general grammar
//!
//! Channels are created on first registration and mutated only via
//! whole-object replacement, so there are no partial-field races.

use crate::errors::ChannelError;
use crate::{MAX_MESSAGE_SIZE, MAX_RETRIES_LIMIT, MIN_MESSAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Suffix appended to a channel name to derive its dead-letter channel.
pub const DLQ_SUFFIX: &str = ".dlq";

/// The kind of endpoint a channel represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    /// Point-to-point channel addressed to a single agent.
    Direct,
    /// Many-to-many channel matched by topic patterns.
    Topic,
    /// One-to-all channel under the `agents.broadcast.` prefix.
    Broadcast,
}

/// Delivery guarantee requested for a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryGuarantee {
    /// Fire-and-forget; a crashed consumer loses the message.
    AtMostOnce,
    /// Redelivered until acknowledged; consumers must be idempotent.
    #[default]
    AtLeastOnce,
}

/// Quality-of-service policy for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosPolicy {
    /// Redelivery attempts before a message is dead-lettered (0..=100).
    pub max_retries: u32,
    /// How long a delivery may stay unacknowledged before it is treated
    /// as failed.
    pub ack_timeout: Duration,
    /// Requested delivery guarantee.
    pub delivery_guarantee: DeliveryGuarantee,
}

impl Default for QosPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            ack_timeout: Duration::from_secs(30),
            delivery_guarantee: DeliveryGuarantee::default(),
        }
    }
}

/// Per-channel configuration limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Largest accepted serialized message, in bytes.
    pub max_message_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_message_size: 1024 * 1024,
        }
    }
}

/// A registered communication endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Dot-delimited channel name.
    pub name: String,
    /// Endpoint kind.
    pub channel_type: ChannelType,
    /// Operator-facing description.
    #[serde(default)]
    pub description: String,
    /// Quality-of-service policy.
    #[serde(default)]
    pub qos: QosPolicy,
    /// Size limits.
    #[serde(default)]
    pub config: ChannelConfig,
}

impl Channel {
    /// Create a channel with default QoS and config.
    pub fn new(name: impl Into<String>, channel_type: ChannelType) -> Self {
        Self {
            name: name.into(),
            channel_type,
            description: String::new(),
            qos: QosPolicy::default(),
            config: ChannelConfig::default(),
        }
    }

    /// Name of this channel's dead-letter channel.
    #[must_use]
    pub fn dlq_name(&self) -> String {
        format!("{}{}", self.name, DLQ_SUFFIX)
    }

    /// Validate the full record: grammar, per-type rule, and bounds.
    ///
    /// # Errors
    ///
    /// - `ChannelError::InvalidName` for grammar or per-type violations
    /// - `ChannelError::InvalidConfig` for out-of-bounds QoS/config values
    pub fn validate(&self) -> Result<(), ChannelError> {
        validate_channel_name(&self.name)?;
        self.validate_type_rule()?;

        if self.qos.max_retries > MAX_RETRIES_LIMIT {
            return Err(ChannelError::InvalidConfig {
                name: self.name.clone(),
                reason: format!(
                    "max_retries {} exceeds limit {}",
                    self.qos.max_retries, MAX_RETRIES_LIMIT
                ),
            });
        }
        if self.qos.ack_timeout.is_zero() {
            return Err(ChannelError::InvalidConfig {
                name: self.name.clone(),
                reason: "ack_timeout must be non-zero".to_string(),
            });
        }
        if self.config.max_message_size < MIN_MESSAGE_SIZE
            || self.config.max_message_size > MAX_MESSAGE_SIZE
        {
            return Err(ChannelError::InvalidConfig {
                name: self.name.clone(),
                reason: format!(
                    "max_message_size {} outside [{}, {}]",
                    self.config.max_message_size, MIN_MESSAGE_SIZE, MAX_MESSAGE_SIZE
                ),
            });
        }

        Ok(())
    }

    /// Apply a partial update, producing the merged record.
    ///
    /// The merged record must be re-validated by the caller before it
    /// replaces the stored one.
    #[must_use]
    pub fn merged(&self, update: &ChannelUpdate) -> Self {
        Self {
            name: self.name.clone(),
            channel_type: update.channel_type.unwrap_or(self.channel_type),
            description: update
                .description
                .clone()
                .unwrap_or_else(|| self.description.clone()),
            qos: update.qos.clone().unwrap_or_else(|| self.qos.clone()),
            config: update.config.clone().unwrap_or_else(|| self.config.clone()),
        }
    }

    fn validate_type_rule(&self) -> Result<(), ChannelError> {
        let segments: Vec<&str> = self.name.split('.').collect();
        match self.channel_type {
            ChannelType::Direct => {
                if segments.len() != 3 || segments[0] != "agents" || segments[1] == "broadcast" {
                    return Err(ChannelError::InvalidName {
                        name: self.name.clone(),
                        reason: "direct channels must match agents.<agentName>.<suffix>"
                            .to_string(),
                    });
                }
            }
            ChannelType::Broadcast => {
                if segments.len() < 3 || segments[0] != "agents" || segments[1] != "broadcast" {
                    return Err(ChannelError::InvalidName {
                        name: self.name.clone(),
                        reason: "broadcast channels must start with agents.broadcast.".to_string(),
                    });
                }
            }
            ChannelType::Topic => {}
        }
        Ok(())
    }
}

/// Partial update applied to a channel via whole-object replacement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelUpdate {
    /// New endpoint kind, if changing.
    pub channel_type: Option<ChannelType>,
    /// New description, if changing.
    pub description: Option<String>,
    /// New QoS policy, if changing.
    pub qos: Option<QosPolicy>,
    /// New config, if changing.
    pub config: Option<ChannelConfig>,
}

/// Check a single name segment against `[a-zA-Z0-9_-]+`.
#[must_use]
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validate a concrete channel name against the general grammar
/// `segment("."segment)*`.
///
/// # Errors
///
/// Returns `ChannelError::InvalidName` with the offending detail.
pub fn validate_channel_name(name: &str) -> Result<(), ChannelError> {
    if name.is_empty() {
        return Err(ChannelError::InvalidName {
            name: name.to_string(),
            reason: "name is empty".to_string(),
        });
    }
    for segment in name.split('.') {
        if !is_valid_segment(segment) {
            return Err(ChannelError::InvalidName {
                name: name.to_string(),
                reason: format!("invalid segment '{segment}'"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names_per_type() {
        let direct = Channel::new("agents.worker-1.inbox", ChannelType::Direct);
        assert!(direct.validate().is_ok());

        let broadcast = Channel::new("agents.broadcast.shutdown", ChannelType::Broadcast);
        assert!(broadcast.validate().is_ok());

        let topic = Channel::new("tasks.created", ChannelType::Topic);
        assert!(topic.validate().is_ok());
    }

    #[test]
    fn test_invalid_grammar_rejected() {
        for bad in ["", "a..b", ".a", "a.", "agents.wo rker.inbox", "a.b!"] {
            let channel = Channel::new(bad, ChannelType::Topic);
            assert!(
                matches!(channel.validate(), Err(ChannelError::InvalidName { .. })),
                "expected rejection for '{bad}'"
            );
        }
    }

    #[test]
    fn test_direct_shape_enforced() {
        // Wrong segment count
        let channel = Channel::new("agents.worker", ChannelType::Direct);
        assert!(matches!(
            channel.validate(),
            Err(ChannelError::InvalidName { .. })
        ));

        // Wrong prefix
        let channel = Channel::new("services.worker.inbox", ChannelType::Direct);
        assert!(matches!(
            channel.validate(),
            Err(ChannelError::InvalidName { .. })
        ));

        // Reserved broadcast slot
        let channel = Channel::new("agents.broadcast.inbox", ChannelType::Direct);
        assert!(matches!(
            channel.validate(),
            Err(ChannelError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_broadcast_prefix_enforced() {
        let channel = Channel::new("agents.shutdown", ChannelType::Broadcast);
        assert!(matches!(
            channel.validate(),
            Err(ChannelError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_config_bounds() {
        let mut channel = Channel::new("tasks.created", ChannelType::Topic);
        channel.qos.max_retries = 101;
        assert!(matches!(
            channel.validate(),
            Err(ChannelError::InvalidConfig { .. })
        ));

        let mut channel = Channel::new("tasks.created", ChannelType::Topic);
        channel.config.max_message_size = 16;
        assert!(matches!(
            channel.validate(),
            Err(ChannelError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_merged_update_revalidates() {
        let channel = Channel::new("tasks.created", ChannelType::Topic);
        let update = ChannelUpdate {
            config: Some(ChannelConfig {
                max_message_size: 4,
            }),
            ..ChannelUpdate::default()
        };
        let merged = channel.merged(&update);
        assert!(merged.validate().is_err());
        // Original untouched
        assert!(channel.validate().is_ok());
    }

    #[test]
    fn test_dlq_name() {
        let channel = Channel::new("tasks.created", ChannelType::Topic);
        assert_eq!(channel.dlq_name(), "tasks.created.dlq");
    }
}
