use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use vsm_types::{EventId, Subsystem};

use crate::clock::{HlcTimestamp, HybridLogicalClock};
use crate::config::StoreConfig;
use crate::error::CoreError;
use crate::event::{Event, Payload, Window};
use crate::metrics::{CoreMetrics, MetricsSink};

/// An event not yet assigned an id or timestamp (spec §4.3: `ingest`
/// "fills missing HLC from local clock, assigns id if absent").
pub struct Draft {
    pub id: Option<EventId>,
    pub timestamp: Option<HlcTimestamp>,
    pub event_type: String,
    pub subsystem: Subsystem,
    pub urgency: f64,
    pub valence: f64,
    pub payload: Payload,
}

impl Draft {
    pub fn new(event_type: impl Into<String>, subsystem: Subsystem) -> Self {
        Self {
            id: None,
            timestamp: None,
            event_type: event_type.into(),
            subsystem,
            urgency: 0.0,
            valence: 0.0,
            payload: Payload::new(),
        }
    }

    pub fn with_urgency(mut self, urgency: f64) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn with_valence(mut self, valence: f64) -> Self {
        self.valence = valence;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_timestamp(mut self, timestamp: HlcTimestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

struct StoredRecord {
    event: Event,
    /// Present iff the original payload exceeded `compression_threshold`;
    /// the live `event.payload` is then empty and this holds the gzip blob.
    compressed_payload: Option<Vec<u8>>,
}

impl StoredRecord {
    /// Reconstitutes the full event, decompressing the payload transparently.
    fn materialize(&self) -> Event {
        match &self.compressed_payload {
            None => self.event.clone(),
            Some(blob) => {
                let mut decoder = GzDecoder::new(&blob[..]);
                let mut raw = Vec::new();
                let mut event = self.event.clone();
                if decoder.read_to_end(&mut raw).is_ok() {
                    if let Ok(payload) = serde_json::from_slice::<Payload>(&raw) {
                        event.payload = payload;
                    }
                }
                event
            }
        }
    }
}

fn compress_payload(payload: &Payload) -> Option<Vec<u8>> {
    let raw = serde_json::to_vec(payload).ok()?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw).ok()?;
    encoder.finish().ok()
}

/// Match rule for [`EventStore::correlate`] (spec §4.3).
pub enum CorrelationRule {
    SameSubsystem,
    CausalBefore,
    TypePair(String, String),
    Custom(Arc<dyn Fn(&Event, &Event) -> bool + Send + Sync>),
}

impl CorrelationRule {
    fn matches(&self, source: &Event, candidate: &Event) -> bool {
        match self {
            CorrelationRule::SameSubsystem => source.subsystem == candidate.subsystem,
            CorrelationRule::CausalBefore => candidate.timestamp < source.timestamp,
            CorrelationRule::TypePair(a, b) => {
                (source.event_type == *a && candidate.event_type == *b)
                    || (source.event_type == *b && candidate.event_type == *a)
            }
            CorrelationRule::Custom(f) => f(source, candidate),
        }
    }
}

/// Query parameters for [`EventStore::find_sequences`]. Kept store-local
/// (rather than taking the detector's `PatternSpec` directly) so the store
/// crate module has no dependency on the detector module.
#[derive(Clone, Debug)]
pub struct SequenceQuery {
    pub sequence_length: usize,
    pub max_gap_ms: u64,
    pub subsystem: Option<Subsystem>,
    pub event_type: Option<String>,
    pub window_ms: u64,
}

/// A contiguous run of events with inter-event gaps within `max_gap_ms`.
#[derive(Clone, Debug)]
pub struct Sequence {
    pub events: Vec<Event>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StoreStats {
    pub event_count: usize,
    pub oldest: Option<HlcTimestamp>,
    pub newest: Option<HlcTimestamp>,
    pub approx_memory_bytes: usize,
}

struct StoreInner {
    config: StoreConfig,
    clock: Arc<HybridLogicalClock>,
    arena: DashMap<EventId, StoredRecord>,
    primary: RwLock<BTreeSet<(HlcTimestamp, EventId)>>,
    by_subsystem: DashMap<Subsystem, BTreeSet<(HlcTimestamp, EventId)>>,
    pattern_cache: DashMap<(Subsystem, String), EventId>,
    approx_memory_bytes: AtomicU64,
    metrics: Arc<CoreMetrics>,
    sink: Arc<dyn MetricsSink>,
}

/// Bounded, HLC-ordered event store (spec §4.3). Cheap to clone — internally
/// an `Arc`.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<StoreInner>,
}

impl EventStore {
    pub fn new(
        config: StoreConfig,
        clock: Arc<HybridLogicalClock>,
        metrics: Arc<CoreMetrics>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let store = Self {
            inner: Arc::new(StoreInner {
                config,
                clock,
                arena: DashMap::new(),
                primary: RwLock::new(BTreeSet::new()),
                by_subsystem: DashMap::new(),
                pattern_cache: DashMap::new(),
                approx_memory_bytes: AtomicU64::new(0),
                metrics,
                sink,
            }),
        };
        store.spawn_cleanup_task();
        store
    }

    fn spawn_cleanup_task(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let interval_ms = self.inner.config.cleanup_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                Self::run_cleanup(&inner).await;
            }
        })
    }

    async fn run_cleanup(inner: &Arc<StoreInner>) {
        let Ok(now) = inner.clock.now() else {
            tracing::warn!("cleanup cycle skipped: clock unavailable");
            return;
        };
        let retention_ms = inner.config.retention_ms;
        let cutoff = now.physical.saturating_sub(retention_ms);
        let expired: Vec<(HlcTimestamp, EventId)> = {
            let primary = inner.primary.read().await;
            primary
                .iter()
                .take_while(|(ts, _)| ts.physical < cutoff)
                .cloned()
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        let mut primary = inner.primary.write().await;
        for key in &expired {
            primary.remove(key);
            Self::evict_key(inner, key);
        }
        tracing::info!(evicted = expired.len(), "retention cleanup evicted events");
    }

    fn evict_key(inner: &StoreInner, key: &(HlcTimestamp, EventId)) {
        let (ts, id) = key;
        if let Some((_, record)) = inner.arena.remove(id) {
            let size = record.compressed_payload.as_ref().map(|b| b.len()).unwrap_or(0)
                + record.event.approx_payload_size();
            inner.approx_memory_bytes.fetch_sub(size as u64, Ordering::Relaxed);
            if let Some(mut set) = inner.by_subsystem.get_mut(&record.event.subsystem) {
                set.remove(&(*ts, id.clone()));
            }
            inner.pattern_cache.retain(|_, cached_id| *cached_id != *id);
        }
        inner.metrics.record_eviction();
        inner.sink.incr_counter("store.events_evicted", 1);
    }

    /// Inserts `draft`, filling in id/timestamp from the clock if absent and
    /// compressing the payload if it exceeds `compression_threshold` bytes.
    pub async fn ingest(&self, draft: Draft) -> Result<EventId, CoreError> {
        let inner = &self.inner;
        let timestamp = match draft.timestamp {
            Some(ts) => ts,
            None => inner.clock.now()?,
        };
        let now = inner.clock.now()?;
        if now.physical.saturating_sub(timestamp.physical) > inner.config.retention_ms {
            inner.metrics.record_retired_rejection();
            return Err(CoreError::Retired { event_id: format!("{}", timestamp) });
        }

        let id = draft.id.unwrap_or_default();
        let event = Event::new(
            id.clone(),
            timestamp,
            draft.event_type,
            draft.subsystem,
            draft.urgency,
            draft.valence,
            draft.payload,
        );

        let approx_size = event.approx_payload_size();
        let (stored_event, compressed) = if approx_size > inner.config.compression_threshold {
            match compress_payload(&event.payload) {
                Some(blob) => {
                    let mut stripped = event.clone();
                    stripped.payload = Payload::new();
                    (stripped, Some(blob))
                }
                None => (event.clone(), None),
            }
        } else {
            (event.clone(), None)
        };

        // Brief exclusive section: check the cap and evict the oldest entry
        // immediately (drop-head) if ingest would exceed it, then insert.
        {
            let mut primary = inner.primary.write().await;
            if primary.len() >= inner.config.max_events {
                if let Some(key) = primary.iter().next().cloned() {
                    primary.remove(&key);
                    Self::evict_key(inner, &key);
                }
            }
            primary.insert((timestamp, id.clone()));
        }

        let key = (timestamp, id.clone());
        inner
            .by_subsystem
            .entry(event.subsystem)
            .or_default()
            .insert(key);
        inner
            .pattern_cache
            .insert((event.subsystem, event.event_type.clone()), id.clone());
        inner.approx_memory_bytes.fetch_add(
            (approx_size + compressed.as_ref().map(|b| b.len()).unwrap_or(0)) as u64,
            Ordering::Relaxed,
        );
        inner.arena.insert(
            id.clone(),
            StoredRecord { event: stored_event, compressed_payload: compressed },
        );

        inner.metrics.record_ingest();
        inner.sink.incr_counter("store.events_ingested", 1);
        tracing::debug!(event_id = %id, "event ingested");
        Ok(id)
    }

    /// Bulk ingest. Returns the count accepted (drafts rejected as `Retired`
    /// are skipped, logged, and don't stop the rest of the batch).
    pub async fn ingest_batch(&self, drafts: Vec<Draft>) -> usize {
        let mut accepted = 0;
        for draft in drafts {
            match self.ingest(draft).await {
                Ok(_) => accepted += 1,
                Err(CoreError::Retired { event_id }) => {
                    tracing::warn!(event_id, "rejected retired event during batch ingest");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to ingest event during batch ingest");
                }
            }
        }
        accepted
    }

    /// Events whose HLC falls in `window`, matching its filters, ascending
    /// HLC order. Returned eagerly as a `Vec` (Rust has no generator
    /// expression equivalent to a lazy sequence without a runtime).
    pub async fn query_window(&self, window: &Window) -> Vec<Event> {
        let primary = self.inner.primary.read().await;
        let mut out = Vec::new();
        for (ts, id) in primary.range((window.start, EventId(uuid::Uuid::nil()))..) {
            if *ts >= window.end {
                break;
            }
            if let Some(record) = self.inner.arena.get(id) {
                let event = record.materialize();
                if window.matches(&event) {
                    out.push(event);
                }
            }
        }
        out
    }

    /// Events from `now - window_ms` to `now`, optionally filtered by subsystem.
    pub async fn recent(&self, subsystem: Option<Subsystem>, window_ms: u64) -> Vec<Event> {
        let Ok(now) = self.inner.clock.now() else { return Vec::new() };
        let start = HlcTimestamp {
            physical: now.physical.saturating_sub(window_ms),
            logical: 0,
            node_id: now.node_id,
        };
        let mut window = Window::new(start, now);
        if let Some(s) = subsystem {
            window = window.with_subsystem(s);
        }
        self.query_window(&window).await
    }

    /// Yields runs of `>= sequence_length` events with consecutive HLC gaps
    /// `<= max_gap_ms`, within the last `query.window_ms`.
    pub async fn find_sequences(&self, query: &SequenceQuery) -> Vec<Sequence> {
        let events: Vec<Event> = self
            .recent(query.subsystem, query.window_ms)
            .await
            .into_iter()
            .filter(|e| query.event_type.as_ref().map(|t| t == &e.event_type).unwrap_or(true))
            .collect();

        let mut sequences = Vec::new();
        let mut current: Vec<Event> = Vec::new();
        for event in events {
            match current.last() {
                Some(prev) if event.timestamp.physical.saturating_sub(prev.timestamp.physical) <= query.max_gap_ms => {
                    current.push(event);
                }
                Some(_) => {
                    if current.len() >= query.sequence_length {
                        sequences.push(Sequence { events: std::mem::take(&mut current) });
                    } else {
                        current.clear();
                    }
                    current.push(event);
                }
                None => current.push(event),
            }
        }
        if current.len() >= query.sequence_length {
            sequences.push(Sequence { events: current });
        }
        sequences
    }

    /// Events within `±window_ms` of `source_event_id` satisfying any of `rules`.
    pub async fn correlate(
        &self,
        source_event_id: &EventId,
        rules: &[CorrelationRule],
        window_ms: u64,
    ) -> Vec<Event> {
        let Some(source_record) = self.inner.arena.get(source_event_id) else {
            return Vec::new();
        };
        let source = source_record.materialize();
        drop(source_record);

        let lo = HlcTimestamp {
            physical: source.timestamp.physical.saturating_sub(window_ms),
            logical: 0,
            node_id: source.timestamp.node_id,
        };
        let hi = HlcTimestamp {
            physical: source.timestamp.physical.saturating_add(window_ms),
            logical: u32::MAX,
            node_id: source.timestamp.node_id,
        };
        let window = Window::new(lo, hi);
        self.query_window(&window)
            .await
            .into_iter()
            .filter(|candidate| candidate.id != source.id)
            .filter(|candidate| rules.iter().any(|r| r.matches(&source, candidate)))
            .collect()
    }

    pub async fn stats(&self) -> StoreStats {
        let primary = self.inner.primary.read().await;
        StoreStats {
            event_count: primary.len(),
            oldest: primary.iter().next().map(|(ts, _)| *ts),
            newest: primary.iter().next_back().map(|(ts, _)| *ts),
            approx_memory_bytes: self.inner.approx_memory_bytes.load(Ordering::Relaxed) as usize,
        }
    }

    /// Most recent event for `(subsystem, type)`, via the bounded pattern cache.
    pub fn pattern_cache_lookup(&self, subsystem: Subsystem, event_type: &str) -> Option<Event> {
        let id = self.inner.pattern_cache.get(&(subsystem, event_type.to_string()))?;
        self.inner.arena.get(&*id).map(|r| r.materialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsm_types::NodeId;

    fn store() -> EventStore {
        let clock = Arc::new(HybridLogicalClock::new(NodeId(1)));
        EventStore::new(
            StoreConfig::default(),
            clock,
            Arc::new(CoreMetrics::default()),
            Arc::new(crate::metrics::NoopMetricsSink),
        )
    }

    #[tokio::test]
    async fn ingest_assigns_id_and_timestamp_when_absent() {
        let store = store();
        let id = store.ingest(Draft::new("test", Subsystem::S1)).await.unwrap();
        let stats = store.stats().await;
        assert_eq!(stats.event_count, 1);
        assert!(store.inner.arena.contains_key(&id));
    }

    #[tokio::test]
    async fn query_window_returns_ascending_hlc_order() {
        let store = store();
        let clock = Arc::new(HybridLogicalClock::new(NodeId(1)));
        for physical in [300, 100, 200] {
            let ts = HlcTimestamp { physical, logical: 0, node_id: NodeId(1) };
            store
                .ingest(Draft::new("test", Subsystem::S1).with_timestamp(ts))
                .await
                .unwrap();
        }
        let _ = clock;
        let window = Window::new(
            HlcTimestamp { physical: 0, logical: 0, node_id: NodeId(1) },
            HlcTimestamp { physical: 1000, logical: 0, node_id: NodeId(1) },
        );
        let events = store.query_window(&window).await;
        let physicals: Vec<u64> = events.iter().map(|e| e.timestamp.physical).collect();
        assert_eq!(physicals, vec![100, 200, 300]);
    }

    #[tokio::test]
    async fn ingest_rejects_events_older_than_retention() {
        let mut config = StoreConfig::default();
        config.retention_ms = 1000;
        let clock = Arc::new(HybridLogicalClock::new(NodeId(1)));
        let store = EventStore::new(config, clock.clone(), Arc::new(CoreMetrics::default()), Arc::new(crate::metrics::NoopMetricsSink));
        let now = clock.now().unwrap();
        let ancient = HlcTimestamp { physical: now.physical.saturating_sub(5000), logical: 0, node_id: NodeId(1) };
        let result = store.ingest(Draft::new("test", Subsystem::S1).with_timestamp(ancient)).await;
        assert!(matches!(result, Err(CoreError::Retired { .. })));
    }

    #[tokio::test]
    async fn max_events_evicts_oldest() {
        let mut config = StoreConfig::default();
        config.max_events = 2;
        let clock = Arc::new(HybridLogicalClock::new(NodeId(1)));
        let store = EventStore::new(config, clock, Arc::new(CoreMetrics::default()), Arc::new(crate::metrics::NoopMetricsSink));
        for physical in [100, 200, 300] {
            let ts = HlcTimestamp { physical, logical: 0, node_id: NodeId(1) };
            store.ingest(Draft::new("test", Subsystem::S1).with_timestamp(ts)).await.unwrap();
        }
        let stats = store.stats().await;
        assert_eq!(stats.event_count, 2);
        assert_eq!(stats.oldest.unwrap().physical, 200);
    }

    #[tokio::test]
    async fn payload_above_threshold_is_compressed_and_transparent() {
        let mut config = StoreConfig::default();
        config.compression_threshold = 16;
        let clock = Arc::new(HybridLogicalClock::new(NodeId(1)));
        let store = EventStore::new(config, clock, Arc::new(CoreMetrics::default()), Arc::new(crate::metrics::NoopMetricsSink));
        let mut payload = Payload::new();
        payload.insert("big_field".into(), serde_json::json!("x".repeat(200)));
        let draft = Draft::new("test", Subsystem::S1).with_payload(payload.clone());
        let id = store.ingest(draft).await.unwrap();
        let window = Window::new(
            HlcTimestamp { physical: 0, logical: 0, node_id: NodeId(1) },
            HlcTimestamp { physical: u64::MAX, logical: 0, node_id: NodeId(1) },
        );
        let events = store.query_window(&window).await;
        let found = events.iter().find(|e| e.id == id).unwrap();
        assert_eq!(found.payload.get("big_field"), payload.get("big_field"));
    }

    #[tokio::test]
    async fn find_sequences_groups_by_gap() {
        let store = store();
        for physical in [0, 500, 1000, 5000, 5500] {
            let ts = HlcTimestamp { physical, logical: 0, node_id: NodeId(1) };
            store.ingest(Draft::new("test", Subsystem::S1).with_timestamp(ts)).await.unwrap();
        }
        let query = SequenceQuery {
            sequence_length: 2,
            max_gap_ms: 1000,
            subsystem: Some(Subsystem::S1),
            event_type: None,
            window_ms: 100_000,
        };
        let sequences = store.find_sequences(&query).await;
        assert_eq!(sequences.len(), 2);
        assert_eq!(sequences[0].events.len(), 3);
        assert_eq!(sequences[1].events.len(), 2);
    }

    #[tokio::test]
    async fn correlate_matches_same_subsystem() {
        let store = store();
        let ts1 = HlcTimestamp { physical: 1000, logical: 0, node_id: NodeId(1) };
        let id1 = store.ingest(Draft::new("a", Subsystem::S2).with_timestamp(ts1)).await.unwrap();
        let ts2 = HlcTimestamp { physical: 1050, logical: 0, node_id: NodeId(1) };
        store.ingest(Draft::new("b", Subsystem::S2).with_timestamp(ts2)).await.unwrap();
        let ts3 = HlcTimestamp { physical: 1050, logical: 0, node_id: NodeId(1) };
        store.ingest(Draft::new("c", Subsystem::S3).with_timestamp(ts3)).await.unwrap();

        let related = store.correlate(&id1, &[CorrelationRule::SameSubsystem], 500).await;
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].event_type, "b");
    }
}
