// ABOUTME: Per-server latency, error, throughput and uptime tracking
//
// Tracks:
// - Calls: total, success, failure, success rate
// - Latency: last 1000 samples (circular), min/max/avg/p50/p95/p99
// - Errors: counts for up to 32 distinct error types
// - Traffic: bytes and messages each way, throughput over the window
// - Connection: connects, reconnects, timeouts, uptime ratio
//
// Latency statistics are recomputed lazily when new samples arrived since
// the last computation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Latency samples kept per server
pub const LATENCY_HISTORY: usize = 1000;

/// Distinct error types tracked per server
pub const MAX_ERROR_TYPES: usize = 32;

/// Fixed-capacity ring of latency samples in microseconds
#[derive(Debug, Clone)]
struct LatencyWindow {
    samples: Vec<u64>,
    next: usize,
    capacity: usize,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            next: 0,
            capacity,
        }
    }

    fn push(&mut self, micros: u64) {
        if self.samples.len() < self.capacity {
            self.samples.push(micros);
        } else {
            self.samples[self.next] = micros;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.next = 0;
    }
}

/// Derived latency statistics, in microseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    /// Samples the statistics were computed from
    pub samples: usize,
    pub min_us: u64,
    pub max_us: u64,
    pub avg_us: f64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

impl LatencyStats {
    #[allow(clippy::cast_precision_loss)]
    fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let total: u128 = sorted.iter().map(|&s| u128::from(s)).sum();

        Self {
            samples: sorted.len(),
            min_us: sorted[0],
            max_us: sorted[sorted.len() - 1],
            avg_us: total as f64 / sorted.len() as f64,
            p50_us: percentile(&sorted, 0.50),
            p95_us: percentile(&sorted, 0.95),
            p99_us: percentile(&sorted, 0.99),
        }
    }
}

/// Value at index floor((n-1) * p) of an ascending slice
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn percentile(sorted: &[u64], p: f64) -> u64 {
    let index = ((sorted.len() - 1) as f64 * p) as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// Count of one error type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorTally {
    pub error_type: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

/// Immutable report of one server's metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub server: String,
    pub timestamp: DateTime<Utc>,

    pub latency: LatencyStats,

    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub success_rate: f64,

    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Bytes per second since the window started
    pub throughput_bps: f64,

    pub connections: u64,
    pub reconnections: u64,
    pub timeouts: u64,
    /// Fraction of the metrics lifetime spent connected
    pub uptime_ratio: f64,

    pub error_types: usize,
    pub top_error_type: Option<String>,
    pub top_error_count: u64,
}

/// Mutable metrics record for one server
#[derive(Debug, Clone)]
pub struct ServerMetrics {
    server: String,

    latencies: LatencyWindow,
    latency: LatencyStats,
    dirty: bool,

    errors: Vec<ErrorTally>,

    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    success_rate: f64,

    bytes_sent: u64,
    bytes_received: u64,
    messages_sent: u64,
    messages_received: u64,
    window_start: Instant,
    throughput_bps: f64,

    connections: u64,
    reconnections: u64,
    timeouts: u64,

    created_at: Instant,
    connected_at: Option<Instant>,
    uptime_ratio: f64,
}

impl ServerMetrics {
    #[must_use]
    pub fn new(server: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            server: server.into(),
            latencies: LatencyWindow::new(LATENCY_HISTORY),
            latency: LatencyStats::default(),
            dirty: false,
            errors: Vec::new(),
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            success_rate: 0.0,
            bytes_sent: 0,
            bytes_received: 0,
            messages_sent: 0,
            messages_received: 0,
            window_start: now,
            throughput_bps: 0.0,
            connections: 0,
            reconnections: 0,
            timeouts: 0,
            created_at: now,
            connected_at: None,
            uptime_ratio: 0.0,
        }
    }

    /// Server these metrics belong to
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Record one completed call
    #[allow(clippy::cast_precision_loss)]
    pub fn record_call(&mut self, latency: Duration, success: bool) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latencies.push(micros);
        self.dirty = true;

        self.total_calls += 1;
        if success {
            self.successful_calls += 1;
        } else {
            self.failed_calls += 1;
        }
        self.success_rate = self.successful_calls as f64 / self.total_calls as f64;
    }

    /// Count an occurrence of `error_type`; new types beyond the cap are dropped
    pub fn record_error(&mut self, error_type: &str) {
        let now = Utc::now();
        if let Some(tally) = self.errors.iter_mut().find(|t| t.error_type == error_type) {
            tally.count += 1;
            tally.last_seen = now;
            return;
        }

        if self.errors.len() < MAX_ERROR_TYPES {
            self.errors.push(ErrorTally {
                error_type: error_type.to_string(),
                count: 1,
                last_seen: now,
            });
        }
    }

    /// Add traffic; each direction with bytes counts as one message
    pub fn record_bytes(&mut self, sent: u64, received: u64) {
        self.bytes_sent += sent;
        self.bytes_received += received;
        if sent > 0 {
            self.messages_sent += 1;
        }
        if received > 0 {
            self.messages_received += 1;
        }
    }

    /// First connection established
    pub fn record_connected(&mut self) {
        self.connections += 1;
        self.connected_at = Some(Instant::now());
    }

    /// Connection re-established after a failure
    pub fn record_reconnection(&mut self) {
        self.reconnections += 1;
        self.connected_at = Some(Instant::now());
    }

    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
    }

    /// Bring derived statistics up to date
    pub fn update_stats(&mut self) {
        if self.dirty {
            self.latency = LatencyStats::from_samples(&self.latencies.samples);
            self.dirty = false;
        }

        let window = self.window_start.elapsed().as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let bytes = (self.bytes_sent + self.bytes_received) as f64;
        self.throughput_bps = if window > 0.0 { bytes / window } else { 0.0 };

        let lifetime = self.created_at.elapsed().as_secs_f64();
        self.uptime_ratio = match self.connected_at {
            Some(at) if lifetime > 0.0 => (at.elapsed().as_secs_f64() / lifetime).min(1.0),
            _ => 0.0,
        };
    }

    /// Latency statistics, recomputed first if samples changed
    pub fn latency(&mut self) -> &LatencyStats {
        if self.dirty {
            self.update_stats();
        }
        &self.latency
    }

    /// Tally for the most frequent error type
    #[must_use]
    pub fn top_error(&self) -> Option<&ErrorTally> {
        self.errors.iter().max_by_key(|t| t.count)
    }

    /// Tallies for every tracked error type
    #[must_use]
    pub fn errors(&self) -> &[ErrorTally] {
        &self.errors
    }

    /// Update and copy out every statistic
    pub fn snapshot(&mut self) -> MetricsSnapshot {
        self.update_stats();
        let top = self.top_error();

        MetricsSnapshot {
            server: self.server.clone(),
            timestamp: Utc::now(),
            latency: self.latency.clone(),
            total_calls: self.total_calls,
            successful_calls: self.successful_calls,
            failed_calls: self.failed_calls,
            success_rate: self.success_rate,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            throughput_bps: self.throughput_bps,
            connections: self.connections,
            reconnections: self.reconnections,
            timeouts: self.timeouts,
            uptime_ratio: self.uptime_ratio,
            error_types: self.errors.len(),
            top_error_type: top.map(|t| t.error_type.clone()),
            top_error_count: top.map_or(0, |t| t.count),
        }
    }

    /// Clear samples and counters; keeps creation and connection times
    pub fn reset(&mut self) {
        self.latencies.clear();
        self.latency = LatencyStats::default();
        self.dirty = false;
        self.errors.clear();
        self.total_calls = 0;
        self.successful_calls = 0;
        self.failed_calls = 0;
        self.success_rate = 0.0;
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.messages_sent = 0;
        self.messages_received = 0;
        self.window_start = Instant::now();
        self.throughput_bps = 0.0;
        self.connections = 0;
        self.reconnections = 0;
        self.timeouts = 0;
    }
}

/// Metrics for every server of one client
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    servers: Mutex<HashMap<String, ServerMetrics>>,
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against a server's record, creating it on first use
    pub fn with_server<R>(&self, server: &str, f: impl FnOnce(&mut ServerMetrics) -> R) -> R {
        let mut servers = self
            .servers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let metrics = servers
            .entry(server.to_string())
            .or_insert_with(|| ServerMetrics::new(server));
        f(metrics)
    }

    /// Snapshot of one server, if anything was recorded for it
    pub fn snapshot(&self, server: &str) -> Option<MetricsSnapshot> {
        self.servers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get_mut(server)
            .map(ServerMetrics::snapshot)
    }

    /// Snapshots of every server, sorted by name
    pub fn snapshot_all(&self) -> Vec<MetricsSnapshot> {
        let mut snapshots: Vec<_> = self
            .servers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values_mut()
            .map(ServerMetrics::snapshot)
            .collect();
        snapshots.sort_by(|a, b| a.server.cmp(&b.server));
        snapshots
    }

    /// Reset one server's counters
    pub fn reset(&self, server: &str) {
        if let Some(metrics) = self
            .servers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get_mut(server)
        {
            metrics.reset();
        }
    }
}
