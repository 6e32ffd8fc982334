//! Message envelope moved between the socket and the work items
//!
//! A received PUBLISH arrives as a [`Message`] owned by exactly one work item.
//! The work item clears the envelope and refills it as the outbound PUBLISH,
//! so only the payload copy is a fresh allocation.

use bytes::Bytes;
use std::fmt;

/// MQTT control packet kinds carried by relay envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Publish,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Publish => "PUBLISH",
        };
        f.write_str(name)
    }
}

/// A (topic, payload) envelope with an explicit packet type
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    packet_type: Option<PacketType>,
    topic: String,
    payload: Bytes,
    qos: u8,
    retain: bool,
}

impl Message {
    /// Empty envelope with no packet type
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a PUBLISH envelope
    pub fn publish<T, P>(topic: T, payload: P, qos: u8) -> Self
    where
        T: Into<String>,
        P: Into<Bytes>,
    {
        Self {
            packet_type: Some(PacketType::Publish),
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }

    pub fn packet_type(&self) -> Option<PacketType> {
        self.packet_type
    }

    pub fn set_packet_type(&mut self, packet_type: PacketType) {
        self.packet_type = Some(packet_type);
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn set_topic<T: AsRef<str>>(&mut self, topic: T) {
        self.topic.clear();
        self.topic.push_str(topic.as_ref());
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Shared handle to the payload bytes
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    pub fn set_payload<P: Into<Bytes>>(&mut self, payload: P) {
        self.payload = payload.into();
    }

    pub fn qos(&self) -> u8 {
        self.qos
    }

    pub fn set_qos(&mut self, qos: u8) {
        self.qos = qos.min(2);
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    pub fn set_retain(&mut self, retain: bool) {
        self.retain = retain;
    }

    /// Reset header and body, keeping the topic buffer for reuse
    pub fn clear(&mut self) {
        self.packet_type = None;
        self.topic.clear();
        self.payload = Bytes::new();
        self.qos = 0;
        self.retain = false;
    }
}
