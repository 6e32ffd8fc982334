//! Subscription manager
//!
//! Submits one multi-topic SUBSCRIBE and reports the matching SUBACK,
//! index-aligned with the request. Nothing is tracked after submission: a
//! request whose SUBACK never arrives is not retried, and nothing is
//! resubscribed after a reconnect.

use crate::config::TopicQos;
use crate::transport::mqtt::{MessageHandler, MqttError, Socket, SubAckPacket};
use tracing::{info, warn};

/// Ordered (topic, requested QoS) pairs submitted in one SUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    topics: Vec<TopicQos>,
}

impl SubscriptionRequest {
    /// `None` when `topics` is empty
    pub fn new(topics: Vec<TopicQos>) -> Option<Self> {
        if topics.is_empty() {
            None
        } else {
            Some(Self { topics })
        }
    }

    pub fn topics(&self) -> &[TopicQos] {
        &self.topics
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

/// Outcome for one requested topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicGrant {
    pub topic: String,
    pub requested_qos: u8,
    /// Granted QoS, or a failure code `>= 0x80`; `None` if the broker sent
    /// fewer codes than topics
    pub code: Option<u8>,
}

impl TopicGrant {
    pub fn is_granted(&self) -> bool {
        self.code.is_some_and(MessageHandler::is_granted)
    }
}

/// SUBACK codes paired with the topics they answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAckReport {
    pub packet_id: u16,
    pub grants: Vec<TopicGrant>,
}

impl SubAckReport {
    /// Pair `ack` codes with `request` topics by position
    pub fn from_suback(request: &SubscriptionRequest, ack: &SubAckPacket) -> Self {
        if ack.reason_codes.len() != request.len() {
            warn!(
                requested = request.len(),
                returned = ack.reason_codes.len(),
                "SUBACK code count does not match SUBSCRIBE"
            );
        }

        let grants = request
            .topics()
            .iter()
            .enumerate()
            .map(|(i, t)| TopicGrant {
                topic: t.topic.clone(),
                requested_qos: t.qos,
                code: ack.reason_codes.get(i).copied(),
            })
            .collect();

        Self {
            packet_id: ack.packet_id,
            grants,
        }
    }

    /// Codes in request order
    pub fn granted_codes(&self) -> Vec<Option<u8>> {
        self.grants.iter().map(|g| g.code).collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TopicGrant> {
        self.grants.iter().filter(|g| !g.is_granted())
    }

    pub fn all_granted(&self) -> bool {
        self.failures().next().is_none()
    }

    /// One log line per topic
    pub fn log(&self) {
        for grant in &self.grants {
            match grant.code {
                Some(code) if MessageHandler::is_granted(code) => info!(
                    topic = %grant.topic,
                    requested = grant.requested_qos,
                    granted = code,
                    "Subscribed"
                ),
                Some(code) => warn!(
                    topic = %grant.topic,
                    reason_code = code,
                    "Subscription rejected with reason code 0x{:02x}",
                    code
                ),
                None => warn!(topic = %grant.topic, "No SUBACK code for topic"),
            }
        }
    }
}

/// Submit `request` on `socket`
///
/// `on_report` runs once with the SUBACK report, or with `None` when the
/// request was abandoned before a SUBACK arrived. Returns once the SUBSCRIBE
/// is queued; it does not wait for the broker.
pub async fn subscribe_async<F>(
    socket: &Socket,
    request: SubscriptionRequest,
    on_report: F,
) -> Result<(), MqttError>
where
    F: FnOnce(Option<SubAckReport>) + Send + 'static,
{
    let topics = request.topics().to_vec();
    info!(topics = topics.len(), "Submitting SUBSCRIBE");

    socket
        .subscribe_with_callback(
            &topics,
            Box::new(move |ack: Option<SubAckPacket>| match ack {
                Some(ack) => {
                    if let Err(rejected) =
                        MessageHandler::validate_subscription_success(&ack.reason_codes)
                    {
                        warn!(rejected = ?rejected, "Broker rejected part of the SUBSCRIBE");
                    }
                    let report = SubAckReport::from_suback(&request, &ack);
                    report.log();
                    on_report(Some(report));
                }
                None => {
                    warn!("SUBSCRIBE abandoned before SUBACK, not retrying");
                    on_report(None);
                }
            }),
        )
        .await
}

/// [`subscribe_async`] that only logs the outcome
pub async fn subscribe_and_log(
    socket: &Socket,
    request: SubscriptionRequest,
) -> Result<(), MqttError> {
    subscribe_async(socket, request, |_| {}).await
}
