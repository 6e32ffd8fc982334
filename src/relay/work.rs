//! Per-work-item relay state machine
//!
//! ```text
//! INIT -> RECV -> WAIT -> SEND -> RECV -> ...
//! ```
//!
//! A work item owns one context and one message envelope and never has more
//! than one operation outstanding. RECV failures are logged and the receive
//! is reissued. SEND failures follow the configured [`SendPolicy`].

use crate::config::ClientConfig;
use crate::error::RelayError;
use crate::message::{Message, PacketType};
use crate::observability::metrics;
use crate::transport::mqtt::ReconnectConfig;
use crate::transport::RelayContext;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Work item states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Init,
    Recv,
    Wait,
    Send,
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkState::Init => "INIT",
            WorkState::Recv => "RECV",
            WorkState::Wait => "WAIT",
            WorkState::Send => "SEND",
        };
        f.write_str(name)
    }
}

/// What a work item does when a publish fails
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SendPolicy {
    /// First failure stops the relay
    #[default]
    Fatal,
    /// Retry up to `max_retries` times, sleeping per `backoff`
    Retry {
        max_retries: u32,
        backoff: ReconnectConfig,
    },
}

impl SendPolicy {
    /// `Fatal` for zero retries
    pub fn from_retries(max_retries: u32, backoff: ReconnectConfig) -> Self {
        if max_retries == 0 {
            SendPolicy::Fatal
        } else {
            SendPolicy::Retry {
                max_retries,
                backoff,
            }
        }
    }

    /// Delay before retry number `retry` (1-based), `None` once exhausted
    pub fn retry_delay(&self, retry: u32) -> Option<Duration> {
        match self {
            SendPolicy::Fatal => None,
            SendPolicy::Retry {
                max_retries,
                backoff,
            } => (retry <= *max_retries)
                .then(|| Duration::from_millis(backoff.calculate_backoff_delay(retry))),
        }
    }
}

/// Values every work item shares
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    pub relay_topic: String,
    pub relay_qos: u8,
    /// Zero only yields to the scheduler
    pub process_delay: Duration,
    pub send_policy: SendPolicy,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            relay_topic: crate::config::RELAY_TOPIC.to_string(),
            relay_qos: 0,
            process_delay: Duration::ZERO,
            send_policy: SendPolicy::Fatal,
        }
    }
}

impl RelaySettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        let relay = &config.tuning.relay;
        Self {
            relay_topic: relay.relay_topic.clone(),
            relay_qos: relay.relay_qos,
            process_delay: Duration::from_millis(relay.process_delay_ms),
            send_policy: SendPolicy::from_retries(
                relay.send_retries,
                ReconnectConfig::from(&config.tuning.reconnect),
            ),
        }
    }
}

/// One relay state machine bound to its own context
pub struct WorkItem<C: RelayContext> {
    ctx: C,
    state: WorkState,
    msg: Message,
    settings: RelaySettings,
}

impl<C: RelayContext> WorkItem<C> {
    pub fn new(ctx: C, settings: RelaySettings) -> Self {
        Self {
            ctx,
            state: WorkState::Init,
            msg: Message::new(),
            settings,
        }
    }

    pub fn id(&self) -> usize {
        self.ctx.id()
    }

    pub fn state(&self) -> WorkState {
        self.state
    }

    /// The envelope currently held
    pub fn message(&self) -> &Message {
        &self.msg
    }

    /// Perform one transition
    ///
    /// Returns `Ok(false)` once the context is closed for good.
    pub async fn step(&mut self) -> Result<bool, RelayError> {
        match self.state {
            WorkState::Init => {
                self.state = WorkState::Recv;
                Ok(true)
            }
            WorkState::Recv => self.on_recv().await,
            WorkState::Wait => {
                self.on_wait().await;
                Ok(true)
            }
            WorkState::Send => {
                self.on_send().await?;
                Ok(true)
            }
        }
    }

    /// Cycle until the context closes or a send fails fatally
    pub async fn run(mut self) -> Result<(), RelayError> {
        while self.step().await? {}
        debug!(work_id = self.id(), "Work item finished");
        Ok(())
    }

    async fn on_recv(&mut self) -> Result<bool, RelayError> {
        match self.ctx.recv().await {
            Ok(msg) => {
                metrics().message_received();
                info!(
                    work_id = self.id(),
                    topic = msg.topic(),
                    bytes = msg.payload().len(),
                    "RECV '{}' from topic '{}'",
                    String::from_utf8_lossy(msg.payload()),
                    msg.topic()
                );
                self.msg = msg;
                self.state = WorkState::Wait;
                Ok(true)
            }
            Err(e) if self.ctx.is_terminal(&e) => {
                debug!(work_id = self.id(), "Context closed: {}", e);
                Ok(false)
            }
            Err(e) => {
                metrics().receive_error();
                warn!(work_id = self.id(), "Receive failed, retrying: {}", e);
                tokio::task::yield_now().await;
                Ok(true)
            }
        }
    }

    async fn on_wait(&mut self) {
        if self.settings.process_delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.settings.process_delay).await;
        }

        let payload = Bytes::copy_from_slice(self.msg.payload());
        self.msg.clear();
        self.msg.set_packet_type(PacketType::Publish);
        self.msg.set_topic(&self.settings.relay_topic);
        self.msg.set_qos(self.settings.relay_qos);
        self.msg.set_payload(payload);
        self.state = WorkState::Send;
    }

    async fn on_send(&mut self) -> Result<(), RelayError> {
        let mut retry = 0u32;
        loop {
            match self.ctx.send(&self.msg).await {
                Ok(()) => {
                    metrics().message_relayed();
                    info!(
                        work_id = self.id(),
                        topic = self.msg.topic(),
                        "SEND '{}' to topic '{}'",
                        String::from_utf8_lossy(self.msg.payload()),
                        self.msg.topic()
                    );
                    self.state = WorkState::Recv;
                    return Ok(());
                }
                Err(e) => {
                    retry += 1;
                    match self.settings.send_policy.retry_delay(retry) {
                        Some(delay) => {
                            metrics().send_retry();
                            warn!(
                                work_id = self.id(),
                                retry,
                                delay_ms = delay.as_millis() as u64,
                                "Send failed, retrying: {}",
                                e
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            metrics().send_failure();
                            error!(work_id = self.id(), attempts = retry, "Send failed: {}", e);
                            self.msg.clear();
                            return Err(RelayError::send_failed(self.id(), retry, e));
                        }
                    }
                }
            }
        }
    }
}

impl<C: RelayContext> fmt::Debug for WorkItem<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("id", &self.id())
            .field("state", &self.state)
            .field("topic", &self.msg.topic())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RELAY_TOPIC;
    use crate::testing::MockBroker;

    fn fast_retry(max_retries: u32) -> SendPolicy {
        SendPolicy::Retry {
            max_retries,
            backoff: ReconnectConfig {
                max_attempts: None,
                backoff_pattern: vec![1],
                sustained_delay: 1,
            },
        }
    }

    #[tokio::test]
    async fn test_state_sequence_for_one_message() {
        let broker = MockBroker::new();
        broker.inject_publish("/nanomq/msg/1", b"hello");
        let mut item = WorkItem::new(broker.open_context(), RelaySettings::default());

        assert_eq!(item.state(), WorkState::Init);
        item.step().await.unwrap();
        assert_eq!(item.state(), WorkState::Recv);
        item.step().await.unwrap();
        assert_eq!(item.state(), WorkState::Wait);
        assert_eq!(item.message().topic(), "/nanomq/msg/1");

        item.step().await.unwrap();
        assert_eq!(item.state(), WorkState::Send);
        assert_eq!(item.message().topic(), RELAY_TOPIC);
        assert_eq!(item.message().packet_type(), Some(PacketType::Publish));
        assert_eq!(item.message().payload(), b"hello");

        item.step().await.unwrap();
        assert_eq!(item.state(), WorkState::Recv);
        assert_eq!(
            broker.get_published_messages().await,
            vec![(RELAY_TOPIC.to_string(), b"hello".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_receive_error_is_retried() {
        let broker = MockBroker::new();
        broker.inject_error();
        broker.inject_publish("/nanomq/msg/2", b"after error");
        broker.close();

        let item = WorkItem::new(broker.open_context(), RelaySettings::default());
        item.run().await.unwrap();

        let published = broker.get_published_messages().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1, b"after error".to_vec());
    }

    #[tokio::test]
    async fn test_fatal_send_stops_work_item() {
        let broker = MockBroker::new();
        broker.fail_all_sends();
        broker.inject_publish("/nanomq/msg/1", b"x");

        let item = WorkItem::new(broker.open_context(), RelaySettings::default());
        let err = item.run().await.unwrap_err();

        assert!(matches!(
            err,
            RelayError::SendFailed {
                work_id: 0,
                attempts: 1,
                ..
            }
        ));
        assert_eq!(broker.send_attempts(), 1);
    }

    #[tokio::test]
    async fn test_retry_policy_recovers() {
        let broker = MockBroker::new();
        broker.fail_next_sends(2);
        broker.inject_publish("/nanomq/msg/1", b"eventually");
        broker.close();

        let settings = RelaySettings {
            send_policy: fast_retry(3),
            ..RelaySettings::default()
        };
        WorkItem::new(broker.open_context(), settings)
            .run()
            .await
            .unwrap();

        assert_eq!(broker.send_attempts(), 3);
        assert_eq!(broker.get_published_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_policy_gives_up() {
        let broker = MockBroker::new();
        broker.fail_all_sends();
        broker.inject_publish("/nanomq/msg/1", b"never");

        let settings = RelaySettings {
            send_policy: fast_retry(2),
            ..RelaySettings::default()
        };
        let err = WorkItem::new(broker.open_context(), settings)
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::SendFailed { attempts: 3, .. }));
        assert_eq!(broker.send_attempts(), 3);
    }

    #[tokio::test]
    async fn test_relay_qos_and_topic_from_settings() {
        let broker = MockBroker::new();
        broker.inject_publish("/in", b"p");
        broker.close();

        let settings = RelaySettings {
            relay_topic: "/custom/out".to_string(),
            relay_qos: 2,
            process_delay: Duration::from_millis(1),
            ..RelaySettings::default()
        };
        WorkItem::new(broker.open_context(), settings)
            .run()
            .await
            .unwrap();

        let published = broker.get_published().await;
        assert_eq!(published[0].topic(), "/custom/out");
        assert_eq!(published[0].qos(), 2);
    }

    #[test]
    fn test_send_policy_from_retries() {
        assert_eq!(
            SendPolicy::from_retries(0, ReconnectConfig::default()),
            SendPolicy::Fatal
        );
        let policy = SendPolicy::from_retries(2, ReconnectConfig::default());
        assert_eq!(policy.retry_delay(1), Some(Duration::from_millis(25)));
        assert_eq!(policy.retry_delay(2), Some(Duration::from_millis(50)));
        assert_eq!(policy.retry_delay(3), None);
        assert_eq!(SendPolicy::Fatal.retry_delay(1), None);
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = ClientConfig::default();
        config.tuning.relay.send_retries = 4;
        config.tuning.relay.process_delay_ms = 10;

        let settings = RelaySettings::from_config(&config);
        assert_eq!(settings.relay_topic, RELAY_TOPIC);
        assert_eq!(settings.process_delay, Duration::from_millis(10));
        assert!(matches!(
            settings.send_policy,
            SendPolicy::Retry { max_retries: 4, .. }
        ));
    }
}
