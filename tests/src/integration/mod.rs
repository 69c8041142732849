//! Cross-crate integration flows.

mod channels;
mod durability;
mod federation;
mod pubsub;
mod reliability;

use fabric_types::Message;
use serde_json::Value;

/// Test message from a fixed agent sender.
pub(crate) fn message(channel: &str, payload: Value) -> Message {
    Message::new(channel, "ossa://agents/test-agent", "TestEvent", payload)
}
