//! MQTT socket, dialer and contexts for the relay
//!
//! The module separates pure decision logic from I/O:
//!
//! - [`connection`] - broker URL parsing, CONNECT parameters, back-off
//! - [`message_handler`] - folding rumqttc events into [`LinkEvent`]s
//! - [`health_monitor`] - connection state transitions and reconnect decisions
//! - [`tls`] - rustls configuration from PEM material
//! - [`client`] - socket, dialer, driver task and per-work-item contexts
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_async_relay::config::ProtocolVersion;
//! use mqtt_async_relay::transport::mqtt::{Dialer, Socket};
//!
//! # tokio_test::block_on(async {
//! let socket = Socket::open(ProtocolVersion::V311);
//! socket.set_connect_cb(|rc| println!("connected: {rc}"));
//!
//! let dialer = Dialer::create(&socket, "mqtt-tcp://127.0.0.1:1883")?;
//! let handle = dialer.start()?;
//! # handle.stop(std::time::Duration::from_secs(1)).await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod tls;

pub use client::{
    Connection, Dialer, DialerHandle, LifecycleCallback, MqttContext, Socket, SubAckCallback,
    SubAckPacket,
};
pub use connection::{
    parse_broker_url, BrokerAddress, ConnectMessage, ConnectionState, MqttError, ReconnectConfig,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{LinkEvent, MessageHandler, TRANSPORT_LOST_REASON};
pub use tls::{init_dialer_tls, AuthMode, TlsError, TlsSettings};
