use chrono::{Duration, Utc};
use common::{HolderId, ItemId, Money};
use criterion::{Criterion, criterion_group, criterion_main};
use item_store::{InMemoryStore, ItemStore, NewItem};
use reservation::ReservationEngine;

fn seeded_engine(rt: &tokio::runtime::Runtime, count: usize) -> (ReservationEngine<InMemoryStore>, Vec<ItemId>) {
    let store = InMemoryStore::new();
    let ids: Vec<ItemId> = (0..count).map(|n| ItemId::new(format!("ITEM-{n}"))).collect();
    rt.block_on(async {
        for id in &ids {
            store
                .upsert_item(
                    NewItem::new(id.clone(), "Bench item", Money::from_cents(1000)),
                    Utc::now(),
                )
                .await
                .unwrap();
        }
    });
    (ReservationEngine::new(store), ids)
}

fn bench_reserve_release_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (engine, ids) = seeded_engine(&rt, 5);
    let holder = HolderId::new("bench-holder");

    c.bench_function("reservation/reserve_release_5", |b| {
        b.iter(|| {
            rt.block_on(async {
                engine
                    .try_reserve(&ids, &holder, Duration::hours(1))
                    .await
                    .unwrap();
                engine.release(&ids, &holder).await.unwrap();
            });
        });
    });
}

fn bench_conflicting_reserve(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (engine, ids) = seeded_engine(&rt, 5);
    rt.block_on(async {
        engine
            .try_reserve(&ids, &HolderId::new("owner"), Duration::hours(1))
            .await
            .unwrap();
    });
    let rival = HolderId::new("rival");

    c.bench_function("reservation/conflict_5", |b| {
        b.iter(|| {
            rt.block_on(async {
                engine
                    .try_reserve(&ids, &rival, Duration::hours(1))
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_sweep(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (engine, _) = seeded_engine(&rt, 1000);

    c.bench_function("reservation/sweep_1000_idle", |b| {
        b.iter(|| {
            rt.block_on(async {
                engine.release_expired().await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_reserve_release_cycle,
    bench_conflicting_reserve,
    bench_sweep
);
criterion_main!(benches);
