//! Transport layer for the relay
//!
//! A [`RelayContext`] is one independent logical channel over the shared MQTT
//! socket. Each work item owns exactly one context and never has more than one
//! operation outstanding on it.

use crate::message::Message;

pub mod mqtt;

/// Request/response channel used by a single work item
///
/// Implemented by [`mqtt::MqttContext`] for the live socket and by
/// [`crate::testing::MockContext`] in tests.
#[async_trait::async_trait]
pub trait RelayContext: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Identifier used in log lines
    fn id(&self) -> usize;

    /// Wait for the next inbound PUBLISH delivered to this context
    async fn recv(&mut self) -> Result<Message, Self::Error>;

    /// Publish `msg`; resolves once the socket has accepted it
    async fn send(&mut self, msg: &Message) -> Result<(), Self::Error>;

    /// True when `error` means no further message will ever arrive
    fn is_terminal(&self, error: &Self::Error) -> bool {
        let _ = error;
        false
    }
}
