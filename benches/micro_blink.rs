//! Micro benchmarks for the B-link tree index.
#![forbid(unsafe_code)]
#![allow(missing_docs)]

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sombra_blink::primitives::bytes::ord;
use sombra_blink::{FieldType, IndexOptions, IndexStore, OpenMode, PageId, SearchMode};

const INSERT_COUNT: u64 = 16_384;
const LOOKUP_SAMPLES: usize = 4_096;
const RANGE_WIDTH: usize = 512;

fn micro_blink(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/blink");
    group.sample_size(20);

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("sequential_insert", |b| {
        b.iter_batched(
            FreshIndex::new,
            |index| {
                index.insert_keys(0..INSERT_COUNT);
                black_box(index.root);
            },
            BatchSize::SmallInput,
        );
    });

    let mut random_keys: Vec<u64> = (0..INSERT_COUNT).collect();
    random_keys.shuffle(&mut ChaCha8Rng::seed_from_u64(0xBEEF_F00D));
    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("random_insert", |b| {
        b.iter_batched(
            FreshIndex::new,
            |index| {
                index.insert_keys(random_keys.iter().copied());
                black_box(index.root);
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("bulk_load", |b| {
        b.iter_batched(
            FreshIndex::new,
            |index| {
                let tx = index.store.begin();
                let mut loader = index
                    .store
                    .indexes()
                    .open_loader(&tx, index.root)
                    .expect("loader");
                for k in 0..INSERT_COUNT {
                    loader
                        .push(&ord::encode_u64(k), &k.to_le_bytes())
                        .expect("push");
                }
                black_box(loader.finish());
                index.store.commit(&tx).expect("commit");
            },
            BatchSize::SmallInput,
        );
    });

    group.throughput(Throughput::Elements(INSERT_COUNT));
    group.bench_function("delete_random", |b| {
        b.iter_batched(
            || {
                let index = FreshIndex::new();
                index.insert_keys(0..INSERT_COUNT);
                index
            },
            |index| {
                let tx = index.store.begin();
                for k in &random_keys {
                    index
                        .store
                        .indexes()
                        .delete(&tx, index.root, &ord::encode_u64(*k), None)
                        .expect("delete");
                }
                index.store.commit(&tx).expect("commit");
            },
            BatchSize::SmallInput,
        );
    });

    let loaded = FreshIndex::new();
    loaded.insert_keys(0..INSERT_COUNT);
    let mut rng = ChaCha8Rng::seed_from_u64(0xFEED_FACE);

    group.throughput(Throughput::Elements(LOOKUP_SAMPLES as u64));
    group.bench_function(BenchmarkId::new("point_read", LOOKUP_SAMPLES), |b| {
        b.iter(|| {
            let tx = loaded.store.begin();
            for _ in 0..LOOKUP_SAMPLES {
                let k = rng.gen_range(0..INSERT_COUNT);
                black_box(
                    loaded
                        .store
                        .indexes()
                        .read(&tx, loaded.root, &ord::encode_u64(k))
                        .expect("read"),
                );
            }
        });
    });

    for mode in [SearchMode::GreaterOrEqual, SearchMode::LessOrEqual] {
        group.throughput(Throughput::Elements(RANGE_WIDTH as u64));
        group.bench_function(BenchmarkId::new(format!("range_{mode:?}"), RANGE_WIDTH), |b| {
            b.iter(|| {
                let tx = loaded.store.begin();
                let start = rng.gen_range(RANGE_WIDTH as u64..INSERT_COUNT - RANGE_WIDTH as u64);
                let mut iter = loaded
                    .store
                    .indexes()
                    .open(
                        &tx,
                        loaded.root,
                        mode,
                        &ord::encode_u64(start),
                        None,
                        OpenMode::Read,
                        None,
                    )
                    .expect("open");
                for _ in 0..RANGE_WIDTH {
                    black_box(iter.next().expect("next"));
                }
            });
        });
    }

    group.finish();
}

struct FreshIndex {
    store: IndexStore,
    root: PageId,
}

impl FreshIndex {
    fn new() -> Self {
        let store = IndexStore::new(IndexOptions::default().flush_on_commit(false)).expect("store");
        let tx = store.begin();
        let root = store
            .indexes()
            .create_index(&tx, 1, FieldType::U64, FieldType::Bytes, true, false)
            .expect("create");
        store.commit(&tx).expect("commit");
        Self { store, root }
    }

    fn insert_keys(&self, keys: impl Iterator<Item = u64>) {
        let tx = self.store.begin();
        for k in keys {
            self.store
                .indexes()
                .insert(&tx, self.root, &ord::encode_u64(k), &k.to_le_bytes())
                .expect("insert");
        }
        self.store.commit(&tx).expect("commit");
    }
}

criterion_group!(benches, micro_blink);
criterion_main!(benches);
