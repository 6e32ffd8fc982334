//! Pure connection state management for the MQTT socket
//!
//! This module contains pure functions for broker URL parsing, CONNECT
//! construction and conversion into rumqttc options for both protocol
//! versions.

use crate::config::{ClientConfig, ProtocolVersion, ReconnectTuning};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state of the socket's single pipe
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Dialer started, no CONNACK yet
    Connecting,
    /// CONNACK received, pipe is up
    Connected,
    /// Pipe closed with reason
    Disconnected(String),
    /// Waiting before reconnection attempt (attempt count)
    Reconnecting(u32),
    /// Configured attempt limit reached
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,                      // Unlimited retries by default
            backoff_pattern: vec![25, 50, 100, 250], // 25ms, 50ms, 100ms, 250ms pattern
            sustained_delay: 250,                    // Stay at 250ms after pattern exhausted
        }
    }
}

impl From<&ReconnectTuning> for ReconnectConfig {
    fn from(tuning: &ReconnectTuning) -> Self {
        Self {
            max_attempts: tuning.max_attempts,
            backoff_pattern: tuning.backoff_ms.clone(),
            sustained_delay: tuning.sustained_delay_ms,
        }
    }
}

impl ReconnectConfig {
    /// Calculate the maximum total time for all reconnection attempts
    /// Returns None if unlimited retries are configured
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Calculate backoff delay for given attempt using the pattern
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = (attempt.saturating_sub(1)) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Dialer already started")]
    AlreadyStarted,
    #[error("Socket is not started - no dialer is running")]
    NotStarted,
    #[error("Dialer must be started from within a tokio runtime")]
    NoRuntime,
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),
    #[error("Socket closed")]
    Closed,
}

/// Host, port and transport security parsed from the broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtt-tcp://host:port` / `tls+mqtt-tcp://host:port` (and the common
/// `mqtt`, `tcp`, `mqtts`, `ssl` aliases)
pub fn parse_broker_url(raw: &str) -> Result<BrokerAddress, MqttError> {
    let url = Url::parse(raw).map_err(|_| MqttError::InvalidBrokerUrl(raw.to_string()))?;

    let tls = match url.scheme() {
        "mqtt-tcp" | "mqtt" | "tcp" => false,
        "tls+mqtt-tcp" | "mqtts" | "ssl" | "tls+tcp" => true,
        _ => return Err(MqttError::InvalidBrokerUrl(raw.to_string())),
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| MqttError::InvalidBrokerUrl(raw.to_string()))?;
    // IPv6 literals come back bracketed
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerAddress { host, port, tls })
}

/// CONNECT parameters, re-sent by the dialer on every (re)connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectMessage {
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub version: ProtocolVersion,
}

impl ConnectMessage {
    /// Keep-alive 60s, clean session, random client id
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            client_id: generate_client_id(),
            keep_alive: Duration::from_secs(crate::config::DEFAULT_KEEP_ALIVE_SECS),
            clean_session: true,
            version,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        let mut msg = Self::new(config.version);
        msg.keep_alive = Duration::from_secs(config.tuning.mqtt.keep_alive_secs);
        msg
    }
}

fn generate_client_id() -> String {
    format!("mqtt-async-{}", uuid::Uuid::new_v4().simple())
}

/// Pure function to build MQTT 3.1.1 options from the CONNECT parameters
pub fn configure_mqtt_options_v4(
    address: &BrokerAddress,
    connect: &ConnectMessage,
) -> rumqttc::MqttOptions {
    let mut options =
        rumqttc::MqttOptions::new(connect.client_id.clone(), address.host.clone(), address.port);
    options.set_keep_alive(connect.keep_alive);
    options.set_clean_session(connect.clean_session);
    options
}

/// Pure function to build MQTT 5 options from the CONNECT parameters
pub fn configure_mqtt_options_v5(
    address: &BrokerAddress,
    connect: &ConnectMessage,
) -> rumqttc::v5::MqttOptions {
    let mut options = rumqttc::v5::MqttOptions::new(
        connect.client_id.clone(),
        address.host.clone(),
        address.port,
    );
    options.set_keep_alive(connect.keep_alive);
    options.set_clean_start(connect.clean_session);
    options
}
