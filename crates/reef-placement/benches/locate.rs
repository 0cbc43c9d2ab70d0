//! Benchmarks for ring lookups.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use reef_placement::HashRing;
use reef_types::NodeId;

fn bench_locate(c: &mut Criterion) {
    let node_counts: &[usize] = &[3, 10, 100];

    let mut group = c.benchmark_group("ring_locate");
    for &nodes in node_counts {
        let mut ring = HashRing::new(150);
        for i in 0..nodes {
            ring.add_node(NodeId::new(format!("node-{i}")));
        }
        let keys: Vec<String> = (0..1024).map(|i| format!("item-{i}")).collect();
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &keys, |b, keys| {
            b.iter(|| {
                for key in keys {
                    let _ = ring.locate(key, 3);
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_locate);
criterion_main!(benches);
