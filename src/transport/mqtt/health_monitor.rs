//! Pure reconnection logic for the dialer
//!
//! The driver loop feeds every pipe transition through [`HealthMonitor`] to
//! decide the next [`ConnectionState`] and whether another dial should happen.

use super::connection::{ConnectionState, ReconnectConfig};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted (pure function)
    /// Supports unlimited retries when max_attempts is None
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let backoff_delay = config.calculate_backoff_delay(current_attempts + 1);
        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay_ms: backoff_delay,
        }
    }

    /// Determine next state after connection event (pure function)
    pub fn determine_next_state(event: &ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived { reason_code: 0 } => ConnectionState::Connected,
            ConnectionEvent::ConnAckReceived { reason_code } => {
                ConnectionState::Disconnected(format!("CONNACK refused with code {reason_code:#04x}"))
            }
            ConnectionEvent::DisconnectedByBroker { reason_code } => {
                ConnectionState::Disconnected(format!("Broker disconnected with code {reason_code:#04x}"))
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error.clone()),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(*attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason.clone())
            }
        }
    }

    /// Check if connection state allows publishing straight to the broker
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Whether the pipe was up at the moment of the transition
    pub fn was_connected(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Log connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!("MQTT connection lost: {}", reason);
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!("Reconnection successful");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!("MQTT connection permanently failed: {}", reason);
            }
            _ => {
                info!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }

    /// Validate reconnection configuration (pure function)
    pub fn validate_connection_config(config: &ReconnectConfig) -> Result<(), String> {
        if let Some(max_attempts) = config.max_attempts {
            if max_attempts == 0 {
                return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
            }
        }

        if config.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// CONNACK received from broker
    ConnAckReceived { reason_code: u8 },
    /// Broker sent DISCONNECT
    DisconnectedByBroker { reason_code: u8 },
    /// Network or protocol error from the event loop
    NetworkError(String),
    /// Reconnection attempt started
    ReconnectionStarted(u32),
    /// No more retries
    PermanentFailure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_attempt_reconnection() {
        let config = ReconnectConfig::default();

        let decision = HealthMonitor::should_attempt_reconnection(0, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 25
            }
        );

        let decision = HealthMonitor::should_attempt_reconnection(0, &config, true);
        assert_eq!(decision, ReconnectionDecision::AbortShutdownRequested);

        // Sustained delay once the pattern is exhausted
        let decision = HealthMonitor::should_attempt_reconnection(5, &config, false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 6,
                delay_ms: 250
            }
        );

        let limited_config = ReconnectConfig {
            max_attempts: Some(5),
            ..ReconnectConfig::default()
        };
        let decision = HealthMonitor::should_attempt_reconnection(5, &limited_config, false);
        assert_eq!(decision, ReconnectionDecision::AbortMaxAttemptsExceeded);
    }

    #[test]
    fn test_determine_next_state() {
        assert_eq!(
            HealthMonitor::determine_next_state(&ConnectionEvent::ConnAckReceived {
                reason_code: 0
            }),
            ConnectionState::Connected
        );

        match HealthMonitor::determine_next_state(&ConnectionEvent::ConnAckReceived {
            reason_code: 0x87,
        }) {
            ConnectionState::Disconnected(reason) => assert!(reason.contains("0x87")),
            other => panic!("unexpected state {other:?}"),
        }

        assert_eq!(
            HealthMonitor::determine_next_state(&ConnectionEvent::NetworkError(
                "connection refused".to_string()
            )),
            ConnectionState::Disconnected("connection refused".to_string())
        );

        assert_eq!(
            HealthMonitor::determine_next_state(&ConnectionEvent::ReconnectionStarted(3)),
            ConnectionState::Reconnecting(3)
        );

        assert_eq!(
            HealthMonitor::determine_next_state(&ConnectionEvent::PermanentFailure(
                "gave up".to_string()
            )),
            ConnectionState::PermanentlyDisconnected("gave up".to_string())
        );
    }

    #[test]
    fn test_can_publish() {
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Reconnecting(1)));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Disconnected(
            "x".to_string()
        )));
    }

    #[test]
    fn test_validate_connection_config() {
        assert!(HealthMonitor::validate_connection_config(&ReconnectConfig::default()).is_ok());

        let zero_attempts = ReconnectConfig {
            max_attempts: Some(0),
            ..ReconnectConfig::default()
        };
        assert!(HealthMonitor::validate_connection_config(&zero_attempts).is_err());

        let zero_delay = ReconnectConfig {
            sustained_delay: 0,
            ..ReconnectConfig::default()
        };
        assert!(HealthMonitor::validate_connection_config(&zero_delay).is_err());
    }
}
