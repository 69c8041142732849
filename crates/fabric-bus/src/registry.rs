//! # Channel Registry
//!
//! The authoritative map of registered channels. All mutation paths go
//! through the dashmap entry API, so create/update/delete are linearizable
//! per channel name. Reads return clones; the registry never hands out
//! references into the map.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fabric_types::{Channel, ChannelError, ChannelType, ChannelUpdate, TopicPattern};
use tracing::debug;

/// Concurrent registry of channels, shared by every broker implementation.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: DashMap<String, Channel>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new channel.
    ///
    /// # Errors
    ///
    /// - `ChannelError::InvalidName` / `InvalidConfig` from validation
    /// - `ChannelError::AlreadyExists` if the name is taken
    pub fn create(&self, channel: Channel) -> Result<Channel, ChannelError> {
        channel.validate()?;
        match self.channels.entry(channel.name.clone()) {
            Entry::Occupied(_) => Err(ChannelError::AlreadyExists {
                name: channel.name,
            }),
            Entry::Vacant(vacant) => {
                debug!(channel = %channel.name, channel_type = ?channel.channel_type, "Channel registered");
                vacant.insert(channel.clone());
                Ok(channel)
            }
        }
    }

    /// Register a channel if absent, returning the stored record either way.
    ///
    /// Used for synthetic channels (dead-letter, namespaced cross-project
    /// targets) where first-use registration is the intended behavior.
    pub fn ensure(&self, channel: Channel) -> Result<Channel, ChannelError> {
        channel.validate()?;
        Ok(self
            .channels
            .entry(channel.name.clone())
            .or_insert(channel)
            .clone())
    }

    /// Fetch a channel by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Channel> {
        self.channels.get(name).map(|c| c.clone())
    }

    /// True when a channel with this name is registered.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// All registered channels.
    #[must_use]
    pub fn list(&self) -> Vec<Channel> {
        self.channels.iter().map(|c| c.clone()).collect()
    }

    /// All channels of one type.
    #[must_use]
    pub fn get_by_type(&self, channel_type: ChannelType) -> Vec<Channel> {
        self.channels
            .iter()
            .filter(|c| c.channel_type == channel_type)
            .map(|c| c.clone())
            .collect()
    }

    /// Channels whose names a pattern would match - the operator preview
    /// for subscription patterns, using the same matcher as dispatch.
    #[must_use]
    pub fn find_by_pattern(&self, pattern: &TopicPattern) -> Vec<Channel> {
        self.channels
            .iter()
            .filter(|c| pattern.matches(&c.name))
            .map(|c| c.clone())
            .collect()
    }

    /// Replace a channel with the merge of itself and `update`, after full
    /// re-validation of the merged record.
    ///
    /// # Errors
    ///
    /// - `ChannelError::NotFound` if the channel is missing
    /// - validation errors from the merged record (stored record untouched)
    pub fn update(&self, name: &str, update: &ChannelUpdate) -> Result<Channel, ChannelError> {
        match self.channels.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                let merged = occupied.get().merged(update);
                merged.validate()?;
                occupied.insert(merged.clone());
                debug!(channel = %name, "Channel updated");
                Ok(merged)
            }
            Entry::Vacant(_) => Err(ChannelError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Remove a channel.
    ///
    /// The owning broker cascades this to subscriptions bound to the name.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::NotFound` if the channel is missing.
    pub fn delete(&self, name: &str) -> Result<Channel, ChannelError> {
        match self.channels.remove(name) {
            Some((_, channel)) => {
                debug!(channel = %name, "Channel deleted");
                Ok(channel)
            }
            None => Err(ChannelError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Number of registered channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True when no channels are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
