use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::message::ExchangeTimings;
use crate::stats::{StatsAccumulator, StatsSnapshot};

/// Every timing and counter the node server keeps. Timings are in milliseconds.
pub struct ServerStats {
    pub(crate) pre_response_wait: StatsAccumulator,
    pub(crate) receive: StatsAccumulator,
    pub(crate) response_generation: StatsAccumulator,
    pub(crate) send: StatsAccumulator,
    pub(crate) post_response_teardown: StatsAccumulator,
    pub(crate) total_overhead: StatsAccumulator,
    pub(crate) message_queue_wait: StatsAccumulator,
    pub(crate) handler: StatsAccumulator,
    accepted: AtomicU64,
    dropped: AtomicU64,
    severed: AtomicU64,
    malformed: AtomicU64,
    io_failures: AtomicU64,
    dispatch_failures: AtomicU64,
    discarded_on_close: AtomicU64,
    handler_panics: Arc<AtomicU64>,
    exchange_panics: Arc<AtomicU64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServerStatsSnapshot {
    pub pre_response_wait: StatsSnapshot,
    pub receive: StatsSnapshot,
    pub response_generation: StatsSnapshot,
    pub send: StatsSnapshot,
    pub post_response_teardown: StatsSnapshot,
    pub total_overhead: StatsSnapshot,
    pub message_queue_wait: StatsSnapshot,
    pub handler: StatsSnapshot,
    pub accepted_connections: u64,
    pub dropped_connections: u64,
    pub severed_connections: u64,
    pub malformed_messages: u64,
    pub io_failures: u64,
    pub dispatch_failures: u64,
    /// Messages dequeued after the handler pool had already been shut down.
    pub discarded_on_close: u64,
    pub handler_panics: u64,
    pub exchange_panics: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            pre_response_wait: StatsAccumulator::new("PreResponseWaitTime"),
            receive: StatsAccumulator::new("ReceiveTime"),
            response_generation: StatsAccumulator::new("ResponseGenTime"),
            send: StatsAccumulator::new("SendTime"),
            post_response_teardown: StatsAccumulator::new("PostResponseTime"),
            total_overhead: StatsAccumulator::new("TotalOverheadTime"),
            message_queue_wait: StatsAccumulator::new("MessageQueueWaitTime"),
            handler: StatsAccumulator::new("HandleTime"),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            severed: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            io_failures: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            discarded_on_close: AtomicU64::new(0),
            handler_panics: Arc::new(AtomicU64::new(0)),
            exchange_panics: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared with the handler pool so caught panics land here directly.
    pub(crate) fn handler_panic_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.handler_panics)
    }

    /// Panics raised by the messenger on socket workers.
    pub(crate) fn exchange_panic_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.exchange_panics)
    }

    pub(crate) fn record_exchange(
        &self,
        waited: Duration,
        timings: &ExchangeTimings,
        teardown: Duration,
    ) {
        self.pre_response_wait.add_duration(waited);
        self.receive.add_duration(timings.receive);
        self.response_generation
            .add_duration(timings.response_generation);
        self.send.add_duration(timings.send);
        self.post_response_teardown.add_duration(teardown);
        self.total_overhead
            .add_duration(waited + timings.total() + teardown);
    }

    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_severed(&self) {
        self.severed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_io_failure(&self) {
        self.io_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded_on_close(&self) {
        self.discarded_on_close.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatch_failures(&self) -> u64 {
        self.dispatch_failures.load(Ordering::Relaxed)
    }

    pub fn dropped_connections(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn severed_connections(&self) -> u64 {
        self.severed.load(Ordering::Relaxed)
    }

    pub fn malformed_messages(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        for accumulator in self.accumulators() {
            accumulator.clear();
        }
        for counter in [
            &self.accepted,
            &self.dropped,
            &self.severed,
            &self.malformed,
            &self.io_failures,
            &self.dispatch_failures,
            &self.discarded_on_close,
            &*self.handler_panics,
            &*self.exchange_panics,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            pre_response_wait: self.pre_response_wait.snapshot(),
            receive: self.receive.snapshot(),
            response_generation: self.response_generation.snapshot(),
            send: self.send.snapshot(),
            post_response_teardown: self.post_response_teardown.snapshot(),
            total_overhead: self.total_overhead.snapshot(),
            message_queue_wait: self.message_queue_wait.snapshot(),
            handler: self.handler.snapshot(),
            accepted_connections: self.accepted.load(Ordering::Relaxed),
            dropped_connections: self.dropped.load(Ordering::Relaxed),
            severed_connections: self.severed.load(Ordering::Relaxed),
            malformed_messages: self.malformed.load(Ordering::Relaxed),
            io_failures: self.io_failures.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            discarded_on_close: self.discarded_on_close.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            exchange_panics: self.exchange_panics.load(Ordering::Relaxed),
        }
    }

    fn accumulators(&self) -> [&StatsAccumulator; 8] {
        [
            &self.pre_response_wait,
            &self.receive,
            &self.response_generation,
            &self.send,
            &self.post_response_teardown,
            &self.total_overhead,
            &self.message_queue_wait,
            &self.handler,
        ]
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::message::ExchangeTimings;

    use super::ServerStats;

    #[test]
    fn total_overhead_sums_every_phase() {
        let stats = ServerStats::new();
        let timings = ExchangeTimings {
            receive: Duration::from_millis(2),
            response_generation: Duration::from_millis(3),
            send: Duration::from_millis(4),
        };
        stats.record_exchange(Duration::from_millis(1), &timings, Duration::from_millis(5));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_overhead.n, 1);
        assert!((snapshot.total_overhead.sum - 15.0).abs() < 1e-9);
        assert!((snapshot.send.sum - 4.0).abs() < 1e-9);
    }

    #[test]
    fn clear_zeroes_counters_including_shared_panic_count() {
        let stats = ServerStats::new();
        stats.record_dropped();
        stats.record_malformed();
        stats.handler_panic_counter().fetch_add(2, Ordering::Relaxed);
        stats.handler.add(1.0);

        stats.clear();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.dropped_connections, 0);
        assert_eq!(snapshot.malformed_messages, 0);
        assert_eq!(snapshot.handler_panics, 0);
        assert_eq!(snapshot.handler.n, 0);
    }
}
