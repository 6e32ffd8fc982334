//! Pure message routing logic for MQTT events
//!
//! Both protocol versions surface different packet types from rumqttc. They are
//! folded into a single [`LinkEvent`] here so the driver loop and the callbacks
//! never have to care which version is on the wire.

use crate::message::Message;
use tracing::debug;

/// Reason code reported to the disconnect callback when the transport drops
/// without a DISCONNECT packet
pub const TRANSPORT_LOST_REASON: u8 = 0x80;

/// Version-independent routing decision for an incoming event
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// CONNACK received
    Connected { reason_code: u8, session_present: bool },
    /// PUBLISH received on a subscribed topic
    Publish(Message),
    /// SUBACK received; codes are index-aligned with the SUBSCRIBE request
    SubAck { packet_id: u16, reason_codes: Vec<u8> },
    /// Broker sent DISCONNECT
    Disconnected { reason_code: u8 },
    /// Ping responses, acks and other bookkeeping
    Infrastructure(String),
    /// Outgoing event (handled by rumqttc)
    Outgoing,
}

/// Pure routing decisions based on rumqttc events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT 3.1.1 event
    pub fn route_v4_event(event: &rumqttc::Event) -> LinkEvent {
        use rumqttc::{Event, Packet, SubscribeReasonCode};

        match event {
            Event::Incoming(Packet::ConnAck(connack)) => LinkEvent::Connected {
                reason_code: connack.code as u8,
                session_present: connack.session_present,
            },
            Event::Incoming(Packet::Publish(publish)) => LinkEvent::Publish(Message::publish(
                publish.topic.clone(),
                publish.payload.clone(),
                publish.qos as u8,
            )),
            Event::Incoming(Packet::SubAck(suback)) => LinkEvent::SubAck {
                packet_id: suback.pkid,
                reason_codes: suback
                    .return_codes
                    .iter()
                    .map(|code| match code {
                        SubscribeReasonCode::Success(qos) => *qos as u8,
                        SubscribeReasonCode::Failure => 0x80,
                    })
                    .collect(),
            },
            Event::Incoming(Packet::Disconnect) => LinkEvent::Disconnected { reason_code: 0 },
            Event::Incoming(other) => LinkEvent::Infrastructure(format!("{other:?}")),
            Event::Outgoing(_) => LinkEvent::Outgoing,
        }
    }

    /// Route an MQTT 5 event
    pub fn route_v5_event(event: &rumqttc::v5::Event) -> LinkEvent {
        use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
        use rumqttc::v5::Event;

        match event {
            Event::Incoming(Packet::ConnAck(connack)) => LinkEvent::Connected {
                reason_code: connack.code as u8,
                session_present: connack.session_present,
            },
            Event::Incoming(Packet::Publish(publish)) => {
                let topic = String::from_utf8_lossy(&publish.topic).into_owned();
                let mut msg =
                    Message::publish(topic, publish.payload.clone(), publish.qos as u8);
                msg.set_retain(publish.retain);
                LinkEvent::Publish(msg)
            }
            Event::Incoming(Packet::SubAck(suback)) => LinkEvent::SubAck {
                packet_id: suback.pkid,
                reason_codes: suback
                    .return_codes
                    .iter()
                    .map(|code| match code {
                        SubscribeReasonCode::Success(qos) => *qos as u8,
                        SubscribeReasonCode::Failure | SubscribeReasonCode::Unspecified => 0x80,
                        SubscribeReasonCode::ImplementationSpecific => 0x83,
                        SubscribeReasonCode::NotAuthorized => 0x87,
                        SubscribeReasonCode::TopicFilterInvalid => 0x8F,
                        SubscribeReasonCode::PkidInUse => 0x91,
                        SubscribeReasonCode::QuotaExceeded => 0x97,
                        SubscribeReasonCode::SharedSubscriptionsNotSupported => 0x9E,
                        SubscribeReasonCode::SubscriptionIdNotSupported => 0xA1,
                        SubscribeReasonCode::WildcardSubscriptionsNotSupported => 0xA2,
                    })
                    .collect(),
            },
            Event::Incoming(Packet::Disconnect(disconnect)) => LinkEvent::Disconnected {
                reason_code: disconnect.reason_code as u8,
            },
            Event::Incoming(other) => LinkEvent::Infrastructure(format!("{other:?}")),
            Event::Outgoing(_) => LinkEvent::Outgoing,
        }
    }

    /// Whether a SUBACK reason code grants the subscription
    pub fn is_granted(reason_code: u8) -> bool {
        reason_code < 0x80
    }

    /// Log-friendly summary of SUBACK codes; `Err` lists rejected indices
    pub fn validate_subscription_success(reason_codes: &[u8]) -> Result<(), Vec<usize>> {
        let rejected: Vec<usize> = reason_codes
            .iter()
            .enumerate()
            .filter(|(_, &code)| !Self::is_granted(code))
            .map(|(index, _)| index)
            .collect();

        if rejected.is_empty() {
            Ok(())
        } else {
            debug!("SUBACK rejected entries: {:?}", rejected);
            Err(rejected)
        }
    }
}
