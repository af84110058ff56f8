//! Benchmarks for the poison-message tracker hot path.
//!
//! Every received message passes through `should_deliver`, so the first
//! delivery path must stay close to free and redeliveries must not degrade as
//! the encounter cache fills up.

use std::{collections::BTreeMap, hint::black_box, sync::Arc};

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use sluice::{
    delivery::poison::{MessageMover, TrackerSettings},
    ActionTable, Destination, Message, PoisonMessageTracker, PropertyValue,
};
use sluice_core::{ManualClock, NoOpEventHandler};
use sluice_testing::MessageBuilder;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

struct DiscardingMover;

#[async_trait]
impl MessageMover for DiscardingMover {
    async fn copy_and_send(
        &mut self,
        _original: &Message,
        _target: &Destination,
        _stamp: &BTreeMap<String, PropertyValue>,
    ) -> sluice_core::Result<()> {
        Ok(())
    }

    async fn redirect(
        &mut self,
        _original: &Message,
        _target: &Destination,
        _stamp: &BTreeMap<String, PropertyValue>,
    ) -> sluice_core::Result<()> {
        Ok(())
    }
}

fn tracker(spec: &str, lookback: usize) -> PoisonMessageTracker {
    let origin = Destination::queue("orders");
    PoisonMessageTracker::new(
        origin.clone(),
        ActionTable::parse(spec, &origin).unwrap(),
        TrackerSettings { lookback, ..TrackerSettings::default() },
        Arc::new(ManualClock::new()),
        Arc::new(NoOpEventHandler),
    )
}

/// First deliveries bypass the encounter cache entirely.
fn bench_first_delivery(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let tracker = tracker("5:move(queue:dlq)", 5000);
    let stopping = CancellationToken::new();

    c.bench_function("should_deliver/first_delivery", |b| {
        b.to_async(&rt).iter_batched(
            || MessageBuilder::new(Destination::queue("orders")).body("payload").build(),
            |mut message| {
                let tracker = &tracker;
                let stopping = &stopping;
                async move {
                    let mut mover = DiscardingMover;
                    black_box(tracker.should_deliver(&mut mover, &mut message, stopping).await)
                }
            },
            BatchSize::SmallInput,
        );
    });
}

/// Redeliveries of distinct ids at several lookback sizes, so generation
/// rotation is part of the measurement.
fn bench_redelivery_churn(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let stopping = CancellationToken::new();

    let mut group = c.benchmark_group("should_deliver/redelivery_churn");
    for lookback in [100, 5000, 50_000] {
        let tracker = tracker("3:move(queue:dlq)", lookback);
        let mut next_id = 0u64;

        group.bench_with_input(BenchmarkId::from_parameter(lookback), &lookback, |b, _| {
            b.to_async(&rt).iter_batched(
                || {
                    next_id += 1;
                    MessageBuilder::new(Destination::queue("orders"))
                        .id(format!("msg-{next_id}"))
                        .redelivered(1)
                        .build()
                },
                |mut message| {
                    let tracker = &tracker;
                    let stopping = &stopping;
                    async move {
                        let mut mover = DiscardingMover;
                        black_box(tracker.should_deliver(&mut mover, &mut message, stopping).await)
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

/// One id redelivered until it is moved, then forgotten by the next round.
fn bench_move_path(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let tracker = tracker("2:move(queue:$.dlq)", 5000);
    let stopping = CancellationToken::new();
    let mut round = 0u64;

    c.bench_function("should_deliver/move_after_two", |b| {
        b.to_async(&rt).iter_batched(
            || {
                round += 1;
                MessageBuilder::new(Destination::queue("orders"))
                    .id(format!("poison-{round}"))
                    .redelivered(1)
                    .property("sluice.state.attempts", 1i64)
                    .build()
            },
            |mut message| {
                let tracker = &tracker;
                let stopping = &stopping;
                async move {
                    let mut mover = DiscardingMover;
                    let first = tracker.should_deliver(&mut mover, &mut message, stopping).await;
                    let second = tracker.should_deliver(&mut mover, &mut message, stopping).await;
                    black_box((first, second))
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_first_delivery, bench_redelivery_churn, bench_move_path);
criterion_main!(benches);
