use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use integrator::core::BigMap;
use integrator::tracking::{DuplicateKeyTracker, KeyMetadata};

// =============================================================================
// BigMap
// =============================================================================

fn bench_big_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("big_map");

    for shard_size in [1_000usize, 100_000, 2_000_000] {
        group.bench_with_input(
            BenchmarkId::new("insert_100k", shard_size),
            &shard_size,
            |b, &shard_size| {
                b.iter(|| {
                    let mut map = BigMap::new(shard_size);
                    for i in 0..100_000u32 {
                        map.insert(i, i);
                    }
                    black_box(map.len())
                })
            },
        );
    }

    let mut map = BigMap::new(10_000);
    for i in 0..100_000u32 {
        map.insert(format!("key-{}", i), i);
    }
    group.bench_function("get_hit", |b| {
        b.iter(|| black_box(map.get(black_box("key-73105"))))
    });
    group.bench_function("get_miss", |b| {
        b.iter(|| black_box(map.get(black_box("missing"))))
    });

    group.finish();
}

// =============================================================================
// DuplicateKeyTracker
// =============================================================================

fn bench_duplicate_key_tracker(c: &mut Criterion) {
    let mut group = c.benchmark_group("duplicate_key_tracker");

    group.bench_function("register_10k", |b| {
        b.iter(|| {
            let tracker = DuplicateKeyTracker::new();
            for i in 0..10_000 {
                let key = format!("acme-user-{}", i);
                let metadata = KeyMetadata::new(&key, "acme_user");
                tracker.register_key(&key, metadata).ok();
            }
            black_box(tracker.len())
        })
    });

    group.bench_function("register_10k_normalized", |b| {
        b.iter(|| {
            let tracker = DuplicateKeyTracker::with_normalization(|key| key.to_lowercase());
            for i in 0..10_000 {
                let key = format!("ACME-USER-{}", i);
                let metadata = KeyMetadata::new(&key, "acme_user");
                tracker.register_key(&key, metadata).ok();
            }
            black_box(tracker.len())
        })
    });

    let tracker = DuplicateKeyTracker::new();
    for i in 0..100_000 {
        let key = format!("acme-user-{}", i);
        tracker
            .register_key(&key, KeyMetadata::new(&key, "acme_user"))
            .ok();
    }
    group.bench_function("has_key", |b| {
        b.iter(|| black_box(tracker.has_key(black_box("acme-user-4242"))))
    });

    group.finish();
}

criterion_group!(benches, bench_big_map, bench_duplicate_key_tracker);
criterion_main!(benches);
