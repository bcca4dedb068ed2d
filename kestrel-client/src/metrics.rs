//! Counters shared by the write stream, its channels and the connection pool

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Write stream metrics collector
///
/// One instance is shared by every component of a [`crate::WriteStream`].
/// All counters are monotonic; read them through [`ClientMetrics::snapshot`].
#[derive(Debug, Default)]
pub struct ClientMetrics {
    pub records_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub batches_sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub retries: AtomicU64,
    pub reroutes: AtomicU64,
    pub produce_latency_sum_us: AtomicU64,
    pub produce_latency_count: AtomicU64,

    pub transactions_committed: AtomicU64,
    pub transactions_aborted: AtomicU64,
    pub transactions_failed: AtomicU64,

    pub connections_created: AtomicU64,
    pub connections_failed: AtomicU64,
}

impl ClientMetrics {
    /// Record one acknowledged batch
    pub fn record_send(&self, record_count: u64, byte_count: u64, latency: Duration) {
        self.records_sent.fetch_add(record_count, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.produce_latency_sum_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.produce_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one batch whose records were failed
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// A batch left its channel because the partition's leader moved
    pub fn record_reroute(&self) {
        self.reroutes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transaction_end(&self, committed: bool, succeeded: bool) {
        let counter = match (succeeded, committed) {
            (false, _) => &self.transactions_failed,
            (true, true) => &self.transactions_committed,
            (true, false) => &self.transactions_aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Mean produce round trip in microseconds, 0 before the first ack
    pub fn average_produce_latency_us(&self) -> f64 {
        let count = self.produce_latency_count.load(Ordering::Relaxed);
        match count {
            0 => 0.0,
            n => self.produce_latency_sum_us.load(Ordering::Relaxed) as f64 / n as f64,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            records_sent: load(&self.records_sent),
            bytes_sent: load(&self.bytes_sent),
            batches_sent: load(&self.batches_sent),
            send_errors: load(&self.send_errors),
            retries: load(&self.retries),
            reroutes: load(&self.reroutes),
            average_produce_latency_us: self.average_produce_latency_us(),
            transactions_committed: load(&self.transactions_committed),
            transactions_aborted: load(&self.transactions_aborted),
            transactions_failed: load(&self.transactions_failed),
            connections_created: load(&self.connections_created),
            connections_failed: load(&self.connections_failed),
        }
    }
}

/// Point-in-time copy of [`ClientMetrics`]
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub records_sent: u64,
    pub bytes_sent: u64,
    pub batches_sent: u64,
    pub send_errors: u64,
    pub retries: u64,
    pub reroutes: u64,
    pub average_produce_latency_us: f64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    pub transactions_failed: u64,
    pub connections_created: u64,
    pub connections_failed: u64,
}

/// Measures one produce round trip
pub(crate) struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = ClientMetrics::default();
        metrics.record_send(10, 1000, Duration::from_micros(200));
        metrics.record_send(5, 500, Duration::from_micros(400));
        metrics.record_send_error();
        metrics.record_retry();
        metrics.record_reroute();
        metrics.record_connection_created();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_sent, 15);
        assert_eq!(snapshot.bytes_sent, 1500);
        assert_eq!(snapshot.batches_sent, 2);
        assert_eq!(snapshot.send_errors, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.reroutes, 1);
        assert_eq!(snapshot.connections_created, 1);
        assert_eq!(snapshot.average_produce_latency_us, 300.0);
    }

    #[test]
    fn test_transaction_outcomes() {
        let metrics = ClientMetrics::default();
        metrics.record_transaction_end(true, true);
        metrics.record_transaction_end(false, true);
        metrics.record_transaction_end(true, false);
        metrics.record_transaction_end(false, false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transactions_committed, 1);
        assert_eq!(snapshot.transactions_aborted, 1);
        assert_eq!(snapshot.transactions_failed, 2);
    }

    #[test]
    fn test_empty_average() {
        assert_eq!(ClientMetrics::default().average_produce_latency_us(), 0.0);
    }
}
