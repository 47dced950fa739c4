use std::sync::atomic::{AtomicU64, Ordering};

/// Abstract metrics sink (spec §6): counters, histograms, and gauges, with a
/// no-op default so embedding applications aren't forced onto a specific
/// metrics backend.
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &'static str, by: u64);
    fn record_histogram(&self, name: &'static str, value: f64);
    fn set_gauge(&self, name: &'static str, value: f64);
}

/// Default sink: discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn incr_counter(&self, _name: &'static str, _by: u64) {}
    fn record_histogram(&self, _name: &'static str, _value: f64) {}
    fn set_gauge(&self, _name: &'static str, _value: f64) {}
}

/// A concrete in-process snapshot of the counters the engine tracks
/// internally regardless of which `MetricsSink` is wired in, returned by
/// `VsmEngine::metrics()` for introspection/tests.
#[derive(Debug, Default)]
pub struct CoreMetrics {
    events_ingested: AtomicU64,
    events_evicted: AtomicU64,
    events_rejected_retired: AtomicU64,
    detections_emitted: AtomicU64,
    algedonic_signals_emitted: AtomicU64,
    emergency_bypasses: AtomicU64,
    dropped_events: AtomicU64,
    handler_evictions: AtomicU64,
}

/// Point-in-time copy of `CoreMetrics`, safe to hand out by value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreMetricsSnapshot {
    pub events_ingested: u64,
    pub events_evicted: u64,
    pub events_rejected_retired: u64,
    pub detections_emitted: u64,
    pub algedonic_signals_emitted: u64,
    pub emergency_bypasses: u64,
    pub dropped_events: u64,
    pub handler_evictions: u64,
}

impl CoreMetrics {
    pub fn record_ingest(&self) {
        self.events_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.events_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retired_rejection(&self) {
        self.events_rejected_retired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_detection(&self) {
        self.detections_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_algedonic_signal(&self) {
        self.algedonic_signals_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emergency_bypass(&self) {
        self.emergency_bypasses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_eviction(&self) {
        self.handler_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CoreMetricsSnapshot {
        CoreMetricsSnapshot {
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            events_evicted: self.events_evicted.load(Ordering::Relaxed),
            events_rejected_retired: self.events_rejected_retired.load(Ordering::Relaxed),
            detections_emitted: self.detections_emitted.load(Ordering::Relaxed),
            algedonic_signals_emitted: self.algedonic_signals_emitted.load(Ordering::Relaxed),
            emergency_bypasses: self.emergency_bypasses.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            handler_evictions: self.handler_evictions.load(Ordering::Relaxed),
        }
    }
}
