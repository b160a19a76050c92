//! Lock-free tunnel statistics.
//!
//! Counters sit on the request hot path, so everything is a plain atomic:
//! adds for the monotone counters, a CAS loop for the running minimum
//! (zero doubles as "uninitialised", so the first sample must win
//! unconditionally) and `fetch_max` for the maximum.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
pub struct TunnelStats {
    requests_served: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    reconnects: AtomicU64,
    total_latency_nanos: AtomicU64,
    min_latency_nanos: AtomicU64,
    max_latency_nanos: AtomicU64,
    connected_at_nanos: AtomicU64,
    connected: AtomicBool,
}

impl TunnelStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one served request and fold its latency into the aggregates.
    pub fn record_request(&self, latency: Duration) {
        let nanos = latency.as_nanos() as u64;
        self.requests_served.fetch_add(1, Ordering::Relaxed);
        self.total_latency_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.record_min(nanos);
        self.max_latency_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    fn record_min(&self, sample: u64) {
        let mut current = self.min_latency_nanos.load(Ordering::Relaxed);
        loop {
            if current != 0 && current <= sample {
                return;
            }
            match self.min_latency_nanos.compare_exchange_weak(
                current,
                sample,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn note_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_connected(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        self.connected_at_nanos.store(now, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TunnelStatsSnapshot {
        let requests_served = self.requests_served.load(Ordering::Relaxed);
        let total_latency_nanos = self.total_latency_nanos.load(Ordering::Relaxed);
        let connected_at_nanos = self.connected_at_nanos.load(Ordering::Relaxed);

        let uptime = if connected_at_nanos == 0 {
            Duration::ZERO
        } else {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64;
            Duration::from_nanos(now.saturating_sub(connected_at_nanos))
        };

        TunnelStatsSnapshot {
            requests_served,
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            total_latency_nanos,
            min_latency_nanos: self.min_latency_nanos.load(Ordering::Relaxed),
            max_latency_nanos: self.max_latency_nanos.load(Ordering::Relaxed),
            connected_at_nanos,
            connected: self.connected.load(Ordering::Relaxed),
            uptime,
        }
    }
}

/// A point-in-time copy of the counters plus derived values.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelStatsSnapshot {
    pub requests_served: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub reconnects: u64,
    pub total_latency_nanos: u64,
    pub min_latency_nanos: u64,
    pub max_latency_nanos: u64,
    pub connected_at_nanos: u64,
    pub connected: bool,
    pub uptime: Duration,
}

impl TunnelStatsSnapshot {
    pub fn avg_latency_ms(&self) -> f64 {
        if self.requests_served == 0 {
            return 0.0;
        }
        self.total_latency_nanos as f64 / self.requests_served as f64 / 1e6
    }

    pub fn min_latency_ms(&self) -> f64 {
        self.min_latency_nanos as f64 / 1e6
    }

    pub fn max_latency_ms(&self) -> f64 {
        self.max_latency_nanos as f64 / 1e6
    }
}

impl fmt::Display for TunnelStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requests={} in={}B out={}B reconnects={} latency(avg/min/max)={:.2}/{:.2}/{:.2}ms uptime={:?}",
            self.requests_served,
            self.bytes_in,
            self.bytes_out,
            self.reconnects,
            self.avg_latency_ms(),
            self.min_latency_ms(),
            self.max_latency_ms(),
            self.uptime,
        )
    }
}
