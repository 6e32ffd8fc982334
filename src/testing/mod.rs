//! Testing utilities and mock implementations
//!
//! Lets the relay pipeline run without an MQTT broker.

pub mod mocks;

pub use mocks::*;
