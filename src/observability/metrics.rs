//! Process-wide relay counters
//!
//! Atomic counters updated from the driver task and the work items. A
//! [`MetricsSnapshot`] is logged at shutdown.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics instance
pub static METRICS: Lazy<RelayMetrics> = Lazy::new(RelayMetrics::new);

/// Get reference to global relay metrics
pub fn metrics() -> &'static RelayMetrics {
    &METRICS
}

/// Thread-safe relay metrics
pub struct RelayMetrics {
    connected: AtomicBool,
    connections_established: AtomicU64,
    disconnections: AtomicU64,
    reconnect_attempts: AtomicU64,
    messages_received: AtomicU64,
    messages_relayed: AtomicU64,
    receive_errors: AtomicU64,
    send_failures: AtomicU64,
    send_retries: AtomicU64,
    messages_buffered: AtomicU64,
    messages_replayed: AtomicU64,
    start_time: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connections_established: AtomicU64::new(0),
            disconnections: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_relayed: AtomicU64::new(0),
            receive_errors: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            send_retries: AtomicU64::new(0),
            messages_buffered: AtomicU64::new(0),
            messages_replayed: AtomicU64::new(0),
            start_time: AtomicU64::new(unix_now()),
        }
    }

    pub fn connection_established(&self) {
        self.connected.store(true, Ordering::Relaxed);
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            self.disconnections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_relayed(&self) {
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_retry(&self) {
        self.send_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_buffered(&self) {
        self.messages_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_replayed(&self) {
        self.messages_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = unix_now();
        MetricsSnapshot {
            timestamp: now,
            uptime_seconds: now.saturating_sub(self.start_time.load(Ordering::Relaxed)),
            connected: self.connected.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            disconnections: self.disconnections.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            send_retries: self.send_retries.load(Ordering::Relaxed),
            messages_buffered: self.messages_buffered.load(Ordering::Relaxed),
            messages_replayed: self.messages_replayed.load(Ordering::Relaxed),
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub connected: bool,
    pub connections_established: u64,
    pub disconnections: u64,
    pub reconnect_attempts: u64,
    pub messages_received: u64,
    pub messages_relayed: u64,
    pub receive_errors: u64,
    pub send_failures: u64,
    pub send_retries: u64,
    pub messages_buffered: u64,
    pub messages_replayed: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let metrics = RelayMetrics::new();
        let snapshot = metrics.snapshot();
        assert!(!snapshot.connected);
        assert_eq!(snapshot.messages_received, 0);
        assert_eq!(snapshot.messages_relayed, 0);
        assert_eq!(snapshot.send_failures, 0);
    }

    #[test]
    fn test_relay_counters() {
        let metrics = RelayMetrics::new();
        metrics.message_received();
        metrics.message_received();
        metrics.message_relayed();
        metrics.receive_error();
        metrics.send_failure();
        metrics.send_retry();
        metrics.message_buffered();
        metrics.message_replayed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_received, 2);
        assert_eq!(snapshot.messages_relayed, 1);
        assert_eq!(snapshot.receive_errors, 1);
        assert_eq!(snapshot.send_failures, 1);
        assert_eq!(snapshot.send_retries, 1);
        assert_eq!(snapshot.messages_buffered, 1);
        assert_eq!(snapshot.messages_replayed, 1);
    }

    #[test]
    fn test_disconnect_counted_once_per_connection() {
        let metrics = RelayMetrics::new();
        metrics.connection_lost();
        assert_eq!(metrics.snapshot().disconnections, 0);

        metrics.connection_established();
        metrics.connection_lost();
        metrics.connection_lost();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_established, 1);
        assert_eq!(snapshot.disconnections, 1);
        assert!(!snapshot.connected);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(RelayMetrics::new().snapshot()).unwrap();
        assert_eq!(json["messages_relayed"], 0);
        assert_eq!(json["connected"], false);
    }
}
