//! Benchmarks for merging shard-local result lists.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use reef_query::{ScoredItem, merge_ranked};
use reef_types::ItemId;

fn shard_lists(shards: usize, per_shard: usize) -> Vec<Vec<ScoredItem>> {
    (0..shards)
        .map(|s| {
            (0..per_shard)
                .map(|i| {
                    // Overlapping ids and repeated scores exercise dedupe and tie-breaks.
                    let id = (s * per_shard / 2 + i) % (shards * per_shard);
                    ScoredItem::combine(ItemId::new(format!("item-{id:06}")), (i % 17) as f32 / 17.0, 0.0, 1.0)
                })
                .collect()
        })
        .collect()
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_ranked");
    for &shards in &[3usize, 16, 64] {
        let lists = shard_lists(shards, 200);
        group.bench_with_input(BenchmarkId::from_parameter(shards), &lists, |b, lists| {
            b.iter(|| merge_ranked(lists.iter().cloned(), 10));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_merge);
criterion_main!(benches);
