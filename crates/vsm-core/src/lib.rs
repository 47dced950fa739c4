//! Temporal event processing core for a VSM-based cybernetic control
//! system: HLC-ordered ingestion, windowed storage, pattern detection, and
//! algedonic (pain/pleasure) signal integration.
//!
//! [`VsmEngine`] wires the five components together:
//! - [`clock`] — hybrid logical clock for causal ordering
//! - [`store`] — bounded, HLC-ordered event retention
//! - [`bus`] — in-process pub/sub with ordered delivery and an algedonic
//!   bypass fast path
//! - [`detector`] — temporal pattern detection over the store's recent window
//! - [`integrator`] — classification of detections into pain/pleasure signals

pub mod bus;
pub mod clock;
pub mod config;
pub mod detector;
pub mod error;
pub mod event;
pub mod integrator;
pub mod metrics;
pub mod numeric;
pub mod snapshot;
pub mod store;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use vsm_types::{EventId, Subsystem};

pub use bus::{EventBus, SubscribeOptions, ALGEDONIC_BYPASS_TOPIC, HANDLER_EVICTED_TOPIC};
pub use clock::{HlcTimestamp, HybridLogicalClock};
pub use config::VsmConfig;
pub use detector::{Detection, DetectorKind, PatternDetector, PatternSpec, Severity};
pub use error::CoreError;
pub use event::{Event, Payload, Window};
pub use integrator::{AlgedonicCategory, AlgedonicIntegrator, AlgedonicKind, AlgedonicSignal};
pub use metrics::{CoreMetrics, CoreMetricsSnapshot, MetricsSink, NoopMetricsSink};
pub use store::{CorrelationRule, Draft, EventStore, Sequence, SequenceQuery, StoreStats};

/// Topic detections are published to once classified (outside the
/// algedonic bypass topic, which carries only emergency signals).
pub const DETECTIONS_TOPIC: &str = "pattern_detected";

/// Topic every algedonic signal (pain or pleasure, emergency or not) is
/// published to. Emergency pain signals are additionally published to
/// [`ALGEDONIC_BYPASS_TOPIC`].
pub const ALGEDONIC_SIGNALS_TOPIC: &str = "algedonic_signal";

struct EngineInner {
    clock: Arc<HybridLogicalClock>,
    bus: EventBus,
    store: EventStore,
    detector: PatternDetector,
    integrator: AlgedonicIntegrator,
    metrics: Arc<CoreMetrics>,
    config: VsmConfig,
    scan_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(handle) = self.scan_task.lock().expect("scan task mutex poisoned").take() {
            handle.abort();
        }
    }
}

/// Top-level handle to the temporal event processing core. Cheap to clone —
/// internally an `Arc`; cloning shares the same background scan task,
/// store, and bus.
#[derive(Clone)]
pub struct VsmEngine {
    inner: Arc<EngineInner>,
}

impl VsmEngine {
    /// Builds an engine with a [`NoopMetricsSink`]. If `config.data_dir` is
    /// set and holds a prior snapshot, the store is warmed from it before
    /// the engine starts accepting events.
    pub async fn new(config: VsmConfig) -> Result<Self, CoreError> {
        Self::with_metrics_sink(config, Arc::new(NoopMetricsSink)).await
    }

    pub async fn with_metrics_sink(config: VsmConfig, sink: Arc<dyn MetricsSink>) -> Result<Self, CoreError> {
        let clock = Arc::new(HybridLogicalClock::new(config.clock.node_id));
        let metrics = Arc::new(CoreMetrics::default());
        let store = EventStore::new(config.store, clock.clone(), metrics.clone(), sink.clone());
        let bus = EventBus::new(config.bus, metrics.clone(), sink.clone());
        let detector = PatternDetector::new(
            store.clone(),
            clock.clone(),
            config.detector,
            config.vsm_scales,
            metrics.clone(),
            sink.clone(),
        );
        let integrator = AlgedonicIntegrator::new(config.integrator, metrics.clone(), sink.clone());

        if let Some(dir) = &config.data_dir {
            if let Some(snapshot) = snapshot::StoreSnapshot::load(dir).await? {
                let mut restored = 0usize;
                for event in snapshot.events {
                    let draft = Draft::new(event.event_type, event.subsystem)
                        .with_urgency(event.urgency())
                        .with_valence(event.valence())
                        .with_payload(event.payload)
                        .with_timestamp(event.timestamp);
                    if store.ingest(draft).await.is_ok() {
                        restored += 1;
                    }
                }
                tracing::info!(restored, "store rehydrated from snapshot");
            }
        }

        let inner = Arc::new(EngineInner {
            clock,
            bus,
            store,
            detector,
            integrator,
            metrics,
            config,
            scan_task: std::sync::Mutex::new(None),
        });

        let engine = Self { inner };
        engine.spawn_scan_task();
        Ok(engine)
    }

    fn spawn_scan_task(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = Duration::from_millis(self.inner.config.detector.scan_interval_ms);
        let window_ms = self.inner.config.detector.scan_window_ms;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                let events = inner.store.recent(None, window_ms).await;
                if events.is_empty() {
                    continue;
                }
                let detections = inner.detector.detect(&events).await;
                for detection in detections {
                    publish_detection(&inner, &detection);
                    let signal = inner.integrator.integrate(&detection).await;
                    publish_signal(&inner, &signal);
                }
            }
        });
        *self.inner.scan_task.lock().expect("scan task mutex poisoned") = Some(handle);
    }

    /// Ingests a new event: fills in id/timestamp via the clock if absent,
    /// stores it, and publishes it to the bus under its `event_type` topic
    /// (and additionally to [`ALGEDONIC_BYPASS_TOPIC`] if its subsystem is
    /// [`Subsystem::Algedonic`]).
    pub async fn ingest(&self, mut draft: Draft) -> Result<Event, CoreError> {
        if draft.id.is_none() {
            draft.id = Some(EventId::default());
        }
        if draft.timestamp.is_none() {
            draft.timestamp = Some(self.inner.clock.now()?);
        }
        let id = draft.id.clone().expect("id filled above");
        let timestamp = draft.timestamp.expect("timestamp filled above");
        let event_type = draft.event_type.clone();
        let subsystem = draft.subsystem;
        let urgency = draft.urgency;
        let valence = draft.valence;
        let payload = draft.payload.clone();

        self.inner.store.ingest(draft).await?;

        let event = Event::new(id, timestamp, event_type, subsystem, urgency, valence, payload);
        let _ = self.inner.bus.publish(&event.event_type, event.clone());
        if subsystem == Subsystem::Algedonic {
            let _ = self.inner.bus.publish(ALGEDONIC_BYPASS_TOPIC, event.clone());
        }
        Ok(event)
    }

    pub async fn ingest_batch(&self, drafts: Vec<Draft>) -> usize {
        let mut accepted = 0;
        for draft in drafts {
            if self.ingest(draft).await.is_ok() {
                accepted += 1;
            }
        }
        accepted
    }

    pub fn register_pattern(&self, spec: PatternSpec) -> Result<(), CoreError> {
        self.inner.detector.register(spec)
    }

    pub fn unregister_pattern(&self, name: &vsm_types::PatternName) {
        self.inner.detector.unregister(name)
    }

    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn Fn(&Event) + Send + Sync>,
        options: SubscribeOptions,
    ) -> vsm_types::SubscriptionId {
        self.inner.bus.subscribe(topic, handler, options)
    }

    pub fn unsubscribe(&self, id: &vsm_types::SubscriptionId) {
        self.inner.bus.unsubscribe(id)
    }

    pub fn clock(&self) -> &HybridLogicalClock {
        &self.inner.clock
    }

    pub fn store(&self) -> &EventStore {
        &self.inner.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn detector(&self) -> &PatternDetector {
        &self.inner.detector
    }

    pub fn integrator(&self) -> &AlgedonicIntegrator {
        &self.inner.integrator
    }

    pub fn metrics(&self) -> CoreMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Dumps the store's current contents to `config.data_dir`. No-op
    /// (returns `Ok`) if no data directory is configured.
    pub async fn snapshot(&self) -> Result<(), CoreError> {
        let Some(dir) = &self.inner.config.data_dir else { return Ok(()) };
        let stats = self.inner.store.stats().await;
        let Some(newest) = stats.newest else { return Ok(()) };
        let window = Window::new(
            HlcTimestamp { physical: 0, logical: 0, node_id: self.inner.clock.node_id() },
            HlcTimestamp { physical: u64::MAX, logical: u32::MAX, node_id: self.inner.clock.node_id() },
        );
        let events = self.inner.store.query_window(&window).await;
        let snapshot = snapshot::StoreSnapshot::new(self.inner.clock.node_id(), newest, events);
        snapshot.save(dir).await
    }
}

fn publish_detection(inner: &Arc<EngineInner>, detection: &Detection) {
    let severity_urgency = match detection.severity {
        Severity::Minimal => 0.2,
        Severity::Low => 0.4,
        Severity::Medium => 0.6,
        Severity::High => 0.8,
        Severity::Critical => 1.0,
    };
    let mut payload = Payload::new();
    payload.insert("pattern_name".into(), serde_json::json!(detection.pattern_name.0));
    payload.insert("kind".into(), serde_json::json!(detection.kind.as_str()));
    payload.insert("severity".into(), serde_json::json!(format!("{:?}", detection.severity)));
    let subsystem = detection.affected_subsystems.first().copied().unwrap_or(Subsystem::Unknown);
    let event = Event::new(
        EventId::default(),
        detection.timestamp,
        "pattern_detected",
        subsystem,
        severity_urgency,
        0.0,
        payload,
    );
    let _ = inner.bus.publish(DETECTIONS_TOPIC, event);
}

fn publish_signal(inner: &Arc<EngineInner>, signal: &AlgedonicSignal) {
    let valence = match signal.category {
        AlgedonicCategory::Pain => -signal.intensity,
        AlgedonicCategory::Pleasure => signal.intensity,
    };
    let mut payload = Payload::new();
    payload.insert("pattern_name".into(), serde_json::json!(signal.pattern_name.0));
    payload.insert("kind".into(), serde_json::json!(signal.kind.as_str()));
    payload.insert("prescribed_action".into(), serde_json::json!(signal.prescribed_action));
    let event = Event::new(
        EventId::default(),
        signal.timestamp,
        signal.kind.as_str(),
        Subsystem::Algedonic,
        signal.intensity,
        valence,
        payload,
    );
    let _ = inner.bus.publish(ALGEDONIC_SIGNALS_TOPIC, event.clone());
    if signal.emergency {
        let _ = inner.bus.publish(ALGEDONIC_BYPASS_TOPIC, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vsm_types::NodeId;

    #[tokio::test]
    async fn ingest_assigns_id_and_publishes_to_bus() {
        let engine = VsmEngine::new(VsmConfig::new(NodeId(1))).await.unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        engine.subscribe(
            "request",
            Arc::new(move |_: &Event| {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
            SubscribeOptions::default(),
        );

        let event = engine
            .ingest(Draft::new("request", Subsystem::S1).with_urgency(0.5))
            .await
            .unwrap();
        assert_eq!(event.subsystem, Subsystem::S1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let stats = engine.store().stats().await;
        assert_eq!(stats.event_count, 1);
    }

    #[tokio::test]
    async fn algedonic_subsystem_events_also_bypass() {
        let engine = VsmEngine::new(VsmConfig::new(NodeId(1))).await.unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        engine.subscribe(
            ALGEDONIC_BYPASS_TOPIC,
            Arc::new(move |_: &Event| {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
            SubscribeOptions::default(),
        );

        engine
            .ingest(Draft::new("pain_signal", Subsystem::Algedonic).with_valence(-0.9))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registered_pattern_detects_and_publishes_emergency_signal() {
        let mut config = VsmConfig::new(NodeId(1));
        config.detector.scan_interval_ms = 20;
        config.detector.scan_window_ms = 60_000;
        let engine = VsmEngine::new(config).await.unwrap();

        let bypass_count = Arc::new(AtomicUsize::new(0));
        let bypass_count2 = bypass_count.clone();
        engine.subscribe(
            ALGEDONIC_BYPASS_TOPIC,
            Arc::new(move |_: &Event| {
                bypass_count2.fetch_add(1, Ordering::SeqCst);
            }),
            SubscribeOptions::default(),
        );

        engine
            .register_pattern(
                PatternSpec::new("cascade_test", DetectorKind::ErrorCascade)
                    .with_target_subsystems(vec![Subsystem::S1, Subsystem::S2]),
            )
            .unwrap();

        for i in 0..4u64 {
            engine
                .ingest(
                    Draft::new("error", if i % 2 == 0 { Subsystem::S1 } else { Subsystem::S2 })
                        .with_urgency(0.9),
                )
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        let metrics = engine.metrics();
        assert!(metrics.detections_emitted >= 1);
        assert!(metrics.algedonic_signals_emitted >= 1);
    }

    #[tokio::test]
    async fn snapshot_save_and_rehydrate_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut config = VsmConfig::new(NodeId(1));
            config.data_dir = Some(dir.path().to_path_buf());
            let engine = VsmEngine::new(config).await.unwrap();
            for i in 0..3u64 {
                engine
                    .ingest(Draft::new("test", Subsystem::S1).with_urgency(i as f64 / 10.0))
                    .await
                    .unwrap();
            }
            engine.snapshot().await.unwrap();
        }

        let mut config = VsmConfig::new(NodeId(1));
        config.data_dir = Some(dir.path().to_path_buf());
        let engine = VsmEngine::new(config).await.unwrap();
        let stats = engine.store().stats().await;
        assert_eq!(stats.event_count, 3);
    }
}
