//! Per-transport metrics collection
//!
//! Atomic counters for connection lifecycle and message flow, plus a
//! per-device table for registered devices. Each transport owns its own
//! collector; there is no process-wide instance.

use serde::Serialize;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Counters for one transport instance
#[derive(Debug)]
pub struct TransportMetrics {
    // Connection lifecycle
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connection_retries: AtomicU64,
    last_connected_at: AtomicU64,

    // Message flow
    messages_sent: AtomicU64,
    messages_confirmed: AtomicU64,
    messages_failed: AtomicU64,
    messages_rolled_back: AtomicU64,
    messages_received: AtomicU64,
    messages_rejected: AtomicU64,
    method_requests: AtomicU64,

    // Entries live while the device is registered
    device_stats: RefCell<BTreeMap<String, DeviceStats>>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DeviceStats {
    pub sent: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub received: u64,
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connection_retries: AtomicU64::new(0),
            last_connected_at: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_confirmed: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            messages_rolled_back: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            method_requests: AtomicU64::new(0),
            device_stats: RefCell::new(BTreeMap::new()),
        }
    }

    // Connection lifecycle
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.last_connected_at
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn connection_retry(&self) {
        self.connection_retries.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
    }

    // Message flow
    pub fn message_sent(&self, device_id: &str) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.with_device(device_id, |stats| stats.sent += 1);
    }

    pub fn message_confirmed(&self, device_id: &str) {
        self.messages_confirmed.fetch_add(1, Ordering::Relaxed);
        self.with_device(device_id, |stats| stats.confirmed += 1);
    }

    pub fn message_failed(&self, device_id: &str) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
        self.with_device(device_id, |stats| stats.failed += 1);
    }

    pub fn messages_rolled_back(&self, count: usize) {
        self.messages_rolled_back
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn message_received(&self, device_id: &str) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.with_device(device_id, |stats| stats.received += 1);
    }

    pub fn message_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn method_request(&self) {
        self.method_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop a device's stats once it is unregistered
    pub fn forget_device(&self, device_id: &str) {
        self.device_stats.borrow_mut().remove(device_id);
    }

    fn with_device(&self, device_id: &str, update: impl FnOnce(&mut DeviceStats)) {
        let mut stats = self.device_stats.borrow_mut();
        update(stats.entry(device_id.to_string()).or_default());
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let devices = self.device_stats.borrow().clone();

        MetricsSnapshot {
            timestamp: current_timestamp(),
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connection_retries: self.connection_retries.load(Ordering::Relaxed),
                last_connected_at: self.last_connected_at.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                sent: self.messages_sent.load(Ordering::Relaxed),
                confirmed: self.messages_confirmed.load(Ordering::Relaxed),
                failed: self.messages_failed.load(Ordering::Relaxed),
                rolled_back: self.messages_rolled_back.load(Ordering::Relaxed),
                received: self.messages_received.load(Ordering::Relaxed),
                rejected: self.messages_rejected.load(Ordering::Relaxed),
                method_requests: self.method_requests.load(Ordering::Relaxed),
            },
            devices,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub connection: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub devices: BTreeMap<String, DeviceStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connection_retries: u64,
    pub last_connected_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageMetrics {
    pub sent: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub rolled_back: u64,
    pub received: u64,
    pub rejected: u64,
    pub method_requests: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let metrics = TransportMetrics::new();
        metrics.connection_attempt();
        metrics.connection_established();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connection.connection_attempts, 1);
        assert_eq!(snapshot.connection.connections_established, 1);
        assert!(snapshot.connection.connected);

        metrics.connection_retry();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connection.connection_retries, 1);
        assert!(!snapshot.connection.connected);
    }

    #[test]
    fn test_per_device_stats() {
        let metrics = TransportMetrics::new();
        metrics.message_sent("a");
        metrics.message_sent("a");
        metrics.message_confirmed("a");
        metrics.message_failed("b");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages.sent, 2);
        assert_eq!(snapshot.devices["a"].sent, 2);
        assert_eq!(snapshot.devices["a"].confirmed, 1);
        assert_eq!(snapshot.devices["b"].failed, 1);

        metrics.forget_device("a");
        let snapshot = metrics.snapshot();
        assert!(!snapshot.devices.contains_key("a"));
        assert_eq!(snapshot.messages.sent, 2);
    }

    #[test]
    fn test_instances_are_independent() {
        let first = TransportMetrics::new();
        let second = TransportMetrics::new();
        first.method_request();

        assert_eq!(first.snapshot().messages.method_requests, 1);
        assert_eq!(second.snapshot().messages.method_requests, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = TransportMetrics::new();
        metrics.messages_rolled_back(3);

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["messages"]["rolled_back"], 3);
        assert!(json["devices"].is_object());
    }
}
