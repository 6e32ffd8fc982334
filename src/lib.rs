//! mqtt-async-relay
//!
//! An asynchronous MQTT client that subscribes to a set of topics and
//! republishes every message it receives, payload unchanged, to one relay
//! topic using a fixed pool of concurrent work items.
//!
//! # Overview
//!
//! - [`cli`] turns argv into a [`config::ClientConfig`]
//! - [`transport::mqtt`] opens the socket, configures TLS and starts the dialer
//! - [`subscription`] submits the SUBSCRIBE and reports the SUBACK
//! - [`relay`] runs the INIT/RECV/WAIT/SEND work items
//! - [`persistence`] buffers outbound messages on disk while the broker is away
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_async_relay::relay::{RelaySettings, WorkerPool};
//! use mqtt_async_relay::testing::MockBroker;
//!
//! # tokio_test::block_on(async {
//! let broker = MockBroker::new();
//! broker.inject_publish("/nanomq/msg/1", b"hello");
//! broker.close();
//!
//! let contexts = (0..4).map(|_| broker.open_context());
//! WorkerPool::new(contexts, &RelaySettings::default()).run().await.unwrap();
//!
//! let published = broker.get_published_messages().await;
//! assert_eq!(published[0].0, "/nanomq/msg/transfer");
//! assert_eq!(published[0].1, b"hello".to_vec());
//! # });
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod message;
pub mod observability;
pub mod persistence;
pub mod relay;
pub mod subscription;
pub mod testing;
pub mod transport;

pub use config::{ClientConfig, ProtocolVersion};
pub use error::{RelayError, RelayResult};
pub use message::{Message, PacketType};
pub use transport::mqtt::Connection;
pub use transport::RelayContext;
