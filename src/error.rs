//! Top-level error type for the relay client
//!
//! Module errors ([`ConfigError`], [`MqttError`], [`TlsError`],
//! [`PersistenceError`]) convert into [`RelayError`] with `?`. Anything that
//! reaches `main` as a `RelayError` terminates the process with exit status 1.

use crate::config::ConfigError;
use crate::persistence::PersistenceError;
use crate::transport::mqtt::{MqttError, TlsError};
use thiserror::Error;

/// Main error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Work item {work_id}: send failed after {attempts} attempt(s): {source}")]
    SendFailed {
        work_id: usize,
        attempts: u32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl RelayError {
    /// Create send failure error
    pub fn send_failed<E>(work_id: usize, attempts: u32, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::SendFailed {
            work_id,
            attempts,
            source: Box::new(source),
        }
    }

    /// Create invalid state error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState(message.into())
    }

    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        1
    }

    /// Single-line message for logs, truncated when nested sources run long
    pub fn log_message(&self) -> String {
        truncate_message(&self.to_string(), 500)
    }
}

fn truncate_message(message: &str, max_len: usize) -> String {
    let single_line = message.replace('\n', " ");
    if single_line.len() <= max_len {
        return single_line;
    }

    let suffix = "...[truncated]";
    let mut cut = max_len.saturating_sub(suffix.len());
    while !single_line.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &single_line[..cut], suffix)
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
