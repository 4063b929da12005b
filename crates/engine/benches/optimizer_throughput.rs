//! Optimizer and retrieval benchmarks
//!
//! Measures the two hot paths of a publishing worker:
//! - folding many events of one identity through an optimization batch
//! - a full retrieve cycle against the in-memory store (lease, optimize, persist)

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;
use uuid::Uuid;

use docevents_engine::prelude::*;
use docevents_engine::{OptimizationBatch, Payload};

fn loaded(document: Arc<dyn DocumentEvent>) -> Event {
    let record = EventRecord::new(document.event_type(), document.parameters(), 0)
        .with_id(Uuid::now_v7());
    Event::loaded(record, Payload::Document(document))
}

/// Benchmark folding duplicates and mergeable changes into one batch
fn bench_offer(c: &mut Criterion) {
    let mut group = c.benchmark_group("optimizer/offer");

    for size in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));

        let duplicates: Vec<Event> = (0..size)
            .map(|_| loaded(Arc::new(StringEvent::new("x"))))
            .collect();
        group.bench_with_input(
            BenchmarkId::new("duplicates", size),
            &duplicates,
            |b, events| {
                b.iter(|| {
                    let now = Utc::now();
                    let mut batch = OptimizationBatch::new(events[0].identity());
                    for event in events.iter().cloned() {
                        batch.offer(event, now);
                    }
                    batch.take_updates()
                });
            },
        );

        let changes: Vec<Event> = (0..size)
            .map(|i| {
                loaded(Arc::new(EntityChangeEvent::new(
                    "doc-1",
                    i as u64,
                    [format!("field-{}", i % 16)],
                )))
            })
            .collect();
        group.bench_with_input(BenchmarkId::new("merges", size), &changes, |b, events| {
            b.iter(|| {
                let now = Utc::now();
                let mut batch = OptimizationBatch::new(events[0].identity());
                for event in events.iter().cloned() {
                    batch.offer(event, now);
                }
                batch.take_updates()
            });
        });
    }

    group.finish();
}

/// Benchmark a full retrieve cycle over distinct identities
fn bench_retrieve(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("repository/retrieve");

    for identities in [1usize, 10, 50] {
        group.throughput(Throughput::Elements(identities as u64));
        group.bench_with_input(
            BenchmarkId::new("identities", identities),
            &identities,
            |b, &identities| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let mut total = Duration::ZERO;

                    for _ in 0..iters {
                        let store = Arc::new(InMemoryDocumentEventStore::new());
                        let repository = DocumentEventRepository::new(
                            store.clone(),
                            store.clone(),
                            Arc::new(EventTypeRegistry::new().with::<StringEvent>()),
                            RepositoryConfig::default().with_batch_size(identities * 2),
                        );

                        // Two duplicates per identity
                        for i in 0..identities * 2 {
                            repository
                                .submit(Arc::new(StringEvent::new(format!("v-{}", i / 2))), 0)
                                .await
                                .unwrap();
                        }

                        let start = Instant::now();
                        let events = repository.retrieve_up_to(identities).await.unwrap();
                        total += start.elapsed();
                        assert_eq!(events.len(), identities);
                    }

                    total
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_offer, bench_retrieve);

criterion_main!(benches);
