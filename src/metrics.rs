//! Per-exchanger counters.
//!
//! One `ShuffleMetrics` lives inside each `Exchanger`; workers and the flush
//! path bump it with relaxed atomics and callers read a coherent copy via
//! [`ShuffleMetrics::snapshot`] once the exchange has quiesced.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ShuffleMetrics {
    records_emitted: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    send_padding: AtomicU64,
    recv_padding: AtomicU64,
    exchange_rounds: AtomicU64,
    flush_requests: AtomicU64,
}

/// Plain-value copy of the counters at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub records_emitted: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_padding: u64,
    pub recv_padding: u64,
    pub exchange_rounds: u64,
    pub flush_requests: u64,
}

impl ShuffleMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_emitted(&self) {
        self.records_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_send_padding(&self, n: u64) {
        self.send_padding.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_recv_padding(&self, n: u64) {
        self.recv_padding.fetch_add(n, Ordering::Relaxed);
    }

    pub fn round_finished(&self) {
        self.exchange_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush_requested(&self) {
        self.flush_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_emitted: self.records_emitted.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_padding: self.send_padding.load(Ordering::Relaxed),
            recv_padding: self.recv_padding.load(Ordering::Relaxed),
            exchange_rounds: self.exchange_rounds.load(Ordering::Relaxed),
            flush_requests: self.flush_requests.load(Ordering::Relaxed),
        }
    }
}
