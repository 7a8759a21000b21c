//! Consistent hash ring lookup overhead benchmarking.

use std::fmt;
use std::time::Duration;

use gigarecon::ring::ConsistentHashRing;
use gigarecon::NodeId;

use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion,
};

static POOL_SIZES: [usize; 4] = [5, 20, 100, 500];
static VNODES: [usize; 3] = [1, 16, 128];
static NUM_NAMES: usize = 1000;

struct BenchId(pub usize, pub usize);

impl fmt::Display for BenchId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}v", self.0, self.1)
    }
}

fn build_ring(pool_size: usize, vnodes: usize) -> ConsistentHashRing {
    let nodes = (0..pool_size).filter_map(|i| {
        format!("AR{}", i).parse::<NodeId>().ok()
    });
    ConsistentHashRing::new(nodes, 3, vnodes, false, 1)
}

fn lookup_names(ring: &ConsistentHashRing, names: &[String]) -> usize {
    names
        .iter()
        .map(|name| black_box(ring.replicated_servers(name)).len())
        .sum()
}

fn ring_bench_group(c: &mut Criterion) {
    let names: Vec<String> =
        (0..NUM_NAMES).map(|i| format!("name-{}", i)).collect();

    let mut group = c.benchmark_group("ring_lookup");
    group
        .sample_size(50)
        .warm_up_time(Duration::from_millis(100))
        .measurement_time(Duration::from_secs(4));

    for size in POOL_SIZES {
        for vnodes in VNODES {
            let ring = build_ring(size, vnodes);
            group.bench_with_input(
                BenchmarkId::from_parameter(BenchId(size, vnodes)),
                &ring,
                |b, ring| {
                    b.iter(|| lookup_names(ring, &names));
                },
            );
        }
    }
    group.finish();

    let mut group = c.benchmark_group("ring_build");
    group
        .sample_size(20)
        .warm_up_time(Duration::from_millis(100))
        .measurement_time(Duration::from_secs(4));

    for size in POOL_SIZES {
        group.bench_with_input(
            BenchmarkId::from_parameter(BenchId(size, 16)),
            &size,
            |b, &size| {
                b.iter(|| build_ring(black_box(size), 16));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, ring_bench_group);
criterion_main!(benches);
