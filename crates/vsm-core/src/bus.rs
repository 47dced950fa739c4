use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use vsm_types::SubscriptionId;

use crate::clock::HlcTimestamp;
use crate::config::BusConfig;
use crate::error::CoreError;
use crate::event::Event;
use crate::metrics::{CoreMetrics, MetricsSink};

/// Topic consumed by `Integrator::emit` for emergency bypass signals (spec §6).
/// Subscriptions on this topic skip the reorder buffer entirely and use
/// reject-publish backpressure instead of drop-head.
pub const ALGEDONIC_BYPASS_TOPIC: &str = "emergency_algedonic_bypass";

/// Topic the bus publishes to when it auto-evicts a faulting subscription.
pub const HANDLER_EVICTED_TOPIC: &str = "handler_evicted";

fn is_algedonic_topic(topic: &str) -> bool {
    topic == ALGEDONIC_BYPASS_TOPIC
}

/// Per-subscriber delivery policy (spec §4.2).
#[derive(Clone, Copy, Debug)]
pub struct SubscribeOptions {
    pub ordered_delivery: bool,
    pub buffer_window_ms: u64,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { ordered_delivery: false, buffer_window_ms: 100 }
    }
}

type SingleHandler = Arc<dyn Fn(&Event) + Send + Sync>;
type BatchHandler = Arc<dyn Fn(&[Event]) + Send + Sync>;

enum Handler {
    Single(SingleHandler),
    /// `batch` option (spec §4.2): delivered as a sequence ordered by HLC,
    /// accumulated per dispatch tick rather than one handler call per event.
    Batch(BatchHandler),
}

struct BoundedQueue {
    inner: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl BoundedQueue {
    fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))), capacity }
    }

    /// Ordinary-topic backpressure: drop the oldest queued event if full.
    /// Returns `true` if an event was dropped.
    fn push_drop_head(&self, event: Event) -> bool {
        let mut guard = self.inner.lock().expect("bus queue mutex poisoned");
        let dropped = if guard.len() >= self.capacity {
            guard.pop_front();
            true
        } else {
            false
        };
        guard.push_back(event);
        dropped
    }

    /// Algedonic-topic backpressure: reject the publish outright if full.
    fn try_push_reject(&self, event: Event) -> Result<(), CoreError> {
        let mut guard = self.inner.lock().expect("bus queue mutex poisoned");
        if guard.len() >= self.capacity {
            return Err(CoreError::QueueFull);
        }
        guard.push_back(event);
        Ok(())
    }

    fn try_pop(&self) -> Option<Event> {
        self.inner.lock().expect("bus queue mutex poisoned").pop_front()
    }

    fn drain_all(&self) -> Vec<Event> {
        let mut guard = self.inner.lock().expect("bus queue mutex poisoned");
        guard.drain(..).collect()
    }
}

struct Subscription {
    id: SubscriptionId,
    topic: String,
    handler: Handler,
    queue: BoundedQueue,
    ordered: bool,
    buffer_window_ms: u64,
    handler_deadline_ms: u64,
    fault_threshold: u32,
    reorder: Mutex<BTreeMap<HlcTimestamp, (Event, Instant)>>,
    high_water_mark: Mutex<Option<HlcTimestamp>>,
    fault_count: AtomicU32,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    /// Feed one event into the subscription, applying the reorder buffer and
    /// the algedonic fast path.
    fn accept(&self, event: Event, algedonic: bool, metrics: &CoreMetrics) {
        if algedonic {
            if self.queue.try_push_reject(event).is_err() {
                metrics.record_dropped_event();
            }
            return;
        }
        if self.ordered {
            let hwm = *self.high_water_mark.lock().expect("hwm mutex poisoned");
            if hwm.map(|h| event.timestamp < h).unwrap_or(false) {
                // Late arrival: the handler has already advanced past this
                // timestamp. Deliver immediately, out of order (spec §4.2).
                if self.queue.push_drop_head(event) {
                    metrics.record_dropped_event();
                }
                return;
            }
            let mut buf = self.reorder.lock().expect("reorder mutex poisoned");
            buf.insert(event.timestamp, (event, Instant::now()));
        } else if self.queue.push_drop_head(event) {
            metrics.record_dropped_event();
        }
    }

    /// Release every buffered event whose `buffer_window_ms` has elapsed, in
    /// ascending HLC order, and advance the high-water mark.
    fn release_ready(&self, metrics: &CoreMetrics) {
        if !self.ordered {
            return;
        }
        let window = Duration::from_millis(self.buffer_window_ms);
        let now = Instant::now();
        let mut ready: Vec<(HlcTimestamp, Event)> = Vec::new();
        {
            let mut buf = self.reorder.lock().expect("reorder mutex poisoned");
            let ready_keys: Vec<HlcTimestamp> = buf
                .iter()
                .filter(|(_, (_, arrived))| now.duration_since(*arrived) >= window)
                .map(|(ts, _)| *ts)
                .collect();
            for ts in ready_keys {
                if let Some((event, _)) = buf.remove(&ts) {
                    ready.push((ts, event));
                }
            }
        }
        if ready.is_empty() {
            return;
        }
        ready.sort_by_key(|(ts, _)| *ts);
        let mut hwm = self.high_water_mark.lock().expect("hwm mutex poisoned");
        for (ts, event) in ready {
            if self.queue.push_drop_head(event) {
                metrics.record_dropped_event();
            }
            if hwm.map(|h| ts > h).unwrap_or(true) {
                *hwm = Some(ts);
            }
        }
    }
}

struct EventBusInner {
    topics: DashMap<String, Vec<SubscriptionId>>,
    subscriptions: DashMap<SubscriptionId, Arc<Subscription>>,
    config: BusConfig,
    metrics: Arc<CoreMetrics>,
    sink: Arc<dyn MetricsSink>,
}

/// In-process pub/sub bus (spec §4.2). Cheap to clone — internally an `Arc`.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    pub fn new(config: BusConfig, metrics: Arc<CoreMetrics>, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                topics: DashMap::new(),
                subscriptions: DashMap::new(),
                config,
                metrics,
                sink,
            }),
        }
    }

    /// Enqueues `event` to every current subscriber of `topic`. Returns
    /// after enqueue, not after delivery (spec §4.2). Publishing to
    /// [`ALGEDONIC_BYPASS_TOPIC`] uses reject-publish semantics: if any
    /// subscriber's queue is full, this returns `QueueFull` (spec §5), the
    /// caller may retry.
    pub fn publish(&self, topic: &str, event: Event) -> Result<(), CoreError> {
        let algedonic = is_algedonic_topic(topic);
        let Some(ids) = self.inner.topics.get(topic) else {
            return Ok(());
        };
        let mut full = false;
        for id in ids.iter() {
            if let Some(sub) = self.inner.subscriptions.get(id) {
                if algedonic {
                    if sub.queue.try_push_reject(event.clone()).is_err() {
                        full = true;
                    }
                } else {
                    sub.accept(event.clone(), false, &self.inner.metrics);
                }
            }
        }
        self.inner.sink.incr_counter("bus.events_published", 1);
        if algedonic && full {
            self.inner.sink.incr_counter("bus.algedonic_queue_full", 1);
            return Err(CoreError::QueueFull);
        }
        Ok(())
    }

    /// Registers a per-event handler. Returns the `SubscriptionId` used by
    /// [`EventBus::unsubscribe`].
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: SingleHandler,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        self.register(topic.into(), Handler::Single(handler), options)
    }

    /// Registers a batch handler: invoked once per dispatch tick with every
    /// event accumulated (in HLC order if `ordered_delivery` is set) since
    /// the previous tick.
    pub fn subscribe_batch(
        &self,
        topic: impl Into<String>,
        handler: BatchHandler,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        self.register(topic.into(), Handler::Batch(handler), options)
    }

    fn register(&self, topic: String, handler: Handler, options: SubscribeOptions) -> SubscriptionId {
        let id = SubscriptionId::new();
        let algedonic = is_algedonic_topic(&topic);
        let sub = Arc::new(Subscription {
            id: id.clone(),
            topic: topic.clone(),
            handler,
            queue: BoundedQueue::new(self.inner.config.queue_capacity),
            ordered: options.ordered_delivery && !algedonic,
            buffer_window_ms: options.buffer_window_ms,
            handler_deadline_ms: self.inner.config.handler_deadline_ms,
            fault_threshold: self.inner.config.handler_fault_threshold,
            reorder: Mutex::new(BTreeMap::new()),
            high_water_mark: Mutex::new(None),
            fault_count: AtomicU32::new(0),
            task: Mutex::new(None),
        });

        self.inner
            .topics
            .entry(topic)
            .or_default()
            .push(id.clone());
        self.inner.subscriptions.insert(id.clone(), sub.clone());

        let weak_inner = Arc::downgrade(&self.inner);
        let tick = Duration::from_millis(self.inner.config.dispatch_tick_ms);
        let handle = tokio::spawn(run_subscription(sub.clone(), weak_inner, tick));
        *sub.task.lock().expect("task mutex poisoned") = Some(handle);

        tracing::debug!(subscription_id = %id, "subscription registered");
        id
    }

    /// Removes a subscription and stops its dispatch task.
    pub fn unsubscribe(&self, id: &SubscriptionId) {
        if let Some((_, sub)) = self.inner.subscriptions.remove(id) {
            if let Some(mut entry) = self.inner.topics.get_mut(&sub.topic) {
                entry.retain(|sub_id| sub_id != id);
            }
            if let Some(handle) = sub.task.lock().expect("task mutex poisoned").take() {
                handle.abort();
            }
            tracing::debug!(subscription_id = %id, "subscription removed");
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }
}

async fn run_subscription(sub: Arc<Subscription>, bus: Weak<EventBusInner>, tick: Duration) {
    let mut ticker = tokio::time::interval(tick);
    loop {
        ticker.tick().await;
        let Some(inner) = bus.upgrade() else { return };

        if sub.ordered {
            sub.release_ready(&inner.metrics);
        }

        match &sub.handler {
            Handler::Single(f) => {
                while let Some(event) = sub.queue.try_pop() {
                    invoke_single(&sub, &bus, f.clone(), event).await;
                }
            }
            Handler::Batch(f) => {
                let batch = sub.queue.drain_all();
                if !batch.is_empty() {
                    invoke_batch(&sub, &bus, f.clone(), batch).await;
                }
            }
        }
    }
}

async fn invoke_single(sub: &Arc<Subscription>, bus: &Weak<EventBusInner>, f: SingleHandler, event: Event) {
    let deadline = Duration::from_millis(sub.handler_deadline_ms);
    let result = tokio::time::timeout(deadline, tokio::task::spawn_blocking(move || f(&event))).await;
    handle_invocation_result(sub, bus, result).await;
}

async fn invoke_batch(sub: &Arc<Subscription>, bus: &Weak<EventBusInner>, f: BatchHandler, batch: Vec<Event>) {
    let deadline = Duration::from_millis(sub.handler_deadline_ms);
    let mut ordered = batch;
    ordered.sort_by_key(|e| e.timestamp);
    let result = tokio::time::timeout(deadline, tokio::task::spawn_blocking(move || f(&ordered))).await;
    handle_invocation_result(sub, bus, result).await;
}

async fn handle_invocation_result(
    sub: &Arc<Subscription>,
    bus: &Weak<EventBusInner>,
    result: Result<Result<(), tokio::task::JoinError>, tokio::time::error::Elapsed>,
) {
    match result {
        Ok(Ok(())) => {
            sub.fault_count.store(0, Ordering::Relaxed);
        }
        Ok(Err(join_err)) => {
            tracing::warn!(subscription_id = %sub.id, error = %join_err, "handler panicked");
            record_fault(sub, bus).await;
        }
        Err(_elapsed) => {
            tracing::warn!(subscription_id = %sub.id, "handler exceeded deadline, event skipped");
            record_fault(sub, bus).await;
        }
    }
}

async fn record_fault(sub: &Arc<Subscription>, bus: &Weak<EventBusInner>) {
    let faults = sub.fault_count.fetch_add(1, Ordering::Relaxed) + 1;
    let Some(inner) = bus.upgrade() else { return };
    inner.sink.incr_counter("bus.handler_faults", 1);
    if faults >= sub.fault_threshold {
        inner.subscriptions.remove(&sub.id);
        if let Some(mut entry) = inner.topics.get_mut(&sub.topic) {
            entry.retain(|id| id != &sub.id);
        }
        inner.metrics.record_handler_eviction();
        tracing::error!(subscription_id = %sub.id, "handler evicted after repeated faults");

        let bus_for_notice = EventBus { inner };
        let mut payload = crate::event::Payload::new();
        payload.insert("evicted_subscription".into(), serde_json::json!(sub.id.0.to_string()));
        let notice = Event::new(
            vsm_types::EventId::new(),
            sub_notice_timestamp(&sub),
            "handler_evicted",
            vsm_types::Subsystem::Unknown,
            0.0,
            0.0,
            payload,
        );
        let _ = bus_for_notice.publish(HANDLER_EVICTED_TOPIC, notice);
    }
}

fn sub_notice_timestamp(sub: &Subscription) -> HlcTimestamp {
    sub.high_water_mark
        .lock()
        .expect("hwm mutex poisoned")
        .unwrap_or(HlcTimestamp { physical: 0, logical: 0, node_id: vsm_types::NodeId(0) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetricsSink;
    use std::sync::atomic::AtomicUsize;
    use vsm_types::{NodeId, Subsystem};

    fn ts(physical: u64) -> HlcTimestamp {
        HlcTimestamp { physical, logical: 0, node_id: NodeId(1) }
    }

    fn bus() -> EventBus {
        EventBus::new(BusConfig::default(), Arc::new(CoreMetrics::default()), Arc::new(NoopMetricsSink))
    }

    fn sample_event(physical: u64) -> Event {
        Event::new(
            vsm_types::EventId::new(),
            ts(physical),
            "test",
            Subsystem::S1,
            0.5,
            0.0,
            crate::event::Payload::new(),
        )
    }

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe(
            "topic",
            Arc::new(move |_: &Event| {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
            SubscribeOptions::default(),
        );
        bus.publish("topic", sample_event(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let id = bus.subscribe(
            "topic",
            Arc::new(move |_: &Event| {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
            SubscribeOptions::default(),
        );
        bus.unsubscribe(&id);
        bus.publish("topic", sample_event(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ordered_delivery_releases_in_hlc_order() {
        let bus = bus();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order2 = order.clone();
        bus.subscribe(
            "ordered",
            Arc::new(move |e: &Event| {
                order2.lock().unwrap().push(e.timestamp.physical);
            }),
            SubscribeOptions { ordered_delivery: true, buffer_window_ms: 30 },
        );
        bus.publish("ordered", sample_event(300)).unwrap();
        bus.publish("ordered", sample_event(100)).unwrap();
        bus.publish("ordered", sample_event(200)).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*order.lock().unwrap(), vec![100, 200, 300]);
    }

    #[tokio::test]
    async fn algedonic_topic_bypasses_reorder_buffer() {
        let bus = bus();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order2 = order.clone();
        bus.subscribe(
            ALGEDONIC_BYPASS_TOPIC,
            Arc::new(move |e: &Event| {
                order2.lock().unwrap().push(e.timestamp.physical);
            }),
            SubscribeOptions { ordered_delivery: true, buffer_window_ms: 10_000 },
        );
        bus.publish(ALGEDONIC_BYPASS_TOPIC, sample_event(300)).unwrap();
        bus.publish(ALGEDONIC_BYPASS_TOPIC, sample_event(100)).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Delivered in publish order, not HLC order — no reorder buffering.
        assert_eq!(*order.lock().unwrap(), vec![300, 100]);
    }

    #[tokio::test]
    async fn algedonic_publish_rejects_when_queue_full() {
        let mut config = BusConfig::default();
        config.queue_capacity = 1;
        let bus = EventBus::new(config, Arc::new(CoreMetrics::default()), Arc::new(NoopMetricsSink));
        // No subscriber drains the queue, so the second publish must see it full.
        bus.subscribe(ALGEDONIC_BYPASS_TOPIC, Arc::new(|_: &Event| {
            std::thread::sleep(Duration::from_millis(200));
        }), SubscribeOptions::default());
        bus.publish(ALGEDONIC_BYPASS_TOPIC, sample_event(1)).unwrap();
        bus.publish(ALGEDONIC_BYPASS_TOPIC, sample_event(2)).unwrap();
        let result = bus.publish(ALGEDONIC_BYPASS_TOPIC, sample_event(3));
        assert!(matches!(result, Err(CoreError::QueueFull)));
    }

    #[tokio::test]
    async fn ordinary_topic_drops_oldest_when_full() {
        let mut config = BusConfig::default();
        config.queue_capacity = 1;
        config.dispatch_tick_ms = 10_000; // don't drain during the test
        let metrics = Arc::new(CoreMetrics::default());
        let bus = EventBus::new(config, metrics.clone(), Arc::new(NoopMetricsSink));
        bus.subscribe("topic", Arc::new(|_: &Event| {}), SubscribeOptions::default());
        bus.publish("topic", sample_event(1)).unwrap();
        bus.publish("topic", sample_event(2)).unwrap();
        assert_eq!(metrics.snapshot().dropped_events, 1);
    }
}
