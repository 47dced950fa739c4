use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use vsm_core::config::StoreConfig;
use vsm_core::{CoreMetrics, Draft, Event, EventStore, HlcTimestamp, HybridLogicalClock, NoopMetricsSink, Payload, Window};
use vsm_types::{NodeId, Subsystem};

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

fn new_store(max_events: usize) -> EventStore {
    let mut config = StoreConfig::default();
    config.max_events = max_events;
    let clock = Arc::new(HybridLogicalClock::new(NodeId(1)));
    EventStore::new(config, clock, Arc::new(CoreMetrics::default()), Arc::new(NoopMetricsSink))
}

fn ingest(c: &mut Criterion) {
    let runtime = rt();
    let _guard = runtime.enter();
    let mut group = c.benchmark_group("store_ingest");
    group.bench_function("small_payload", |b| {
        let store = new_store(1_000_000);
        b.iter(|| {
            runtime.block_on(store.ingest(Draft::new("metric", Subsystem::S1).with_urgency(0.3)))
        });
    });
    group.bench_function("compressed_payload", |b| {
        let store = new_store(1_000_000);
        let mut payload = Payload::new();
        payload.insert("blob".into(), serde_json::json!("x".repeat(4_096)));
        b.iter(|| {
            runtime.block_on(
                store.ingest(Draft::new("metric", Subsystem::S1).with_payload(payload.clone())),
            )
        });
    });
    group.finish();
}

fn query_window(c: &mut Criterion) {
    let runtime = rt();
    let _guard = runtime.enter();
    let mut group = c.benchmark_group("store_query_window");
    for size in [1_000usize, 10_000, 100_000] {
        let store = new_store(size + 10);
        runtime.block_on(async {
            for physical in 0..size as u64 {
                store
                    .ingest(
                        Draft::new("metric", Subsystem::S1)
                            .with_timestamp(HlcTimestamp { physical, logical: 0, node_id: NodeId(1) }),
                    )
                    .await
                    .unwrap();
            }
        });
        let window = Window::new(
            HlcTimestamp { physical: 0, logical: 0, node_id: NodeId(1) },
            HlcTimestamp { physical: size as u64, logical: 0, node_id: NodeId(1) },
        );
        group.bench_with_input(BenchmarkId::new("query_window_full_range", size), &store, |b, store| {
            b.iter(|| -> Vec<Event> { runtime.block_on(store.query_window(&window)) });
        });
    }
    group.finish();
}

criterion_group!(benches, ingest, query_window);
criterion_main!(benches);
