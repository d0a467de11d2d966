//! Criterion benchmarks for neighbour search.
//!
//! Run with:
//!   cargo bench
//!   cargo bench --features parallel
//!
//! Results are saved to target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use electrode_nav::layout::unit_grid;
use electrode_nav::neighbours::{Direction, NeighbourResolver, ResolverConfig};

/// Single-direction lookup from the centre of grids of varying size.
fn bench_find_neighbour(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_neighbour");
    let resolver = NeighbourResolver::default();

    for side in [8usize, 16, 32, 64].iter() {
        let layout = unit_grid(*side, *side);
        let mid = side / 2;
        let id = format!("e{}_{}", mid, mid);
        let id = if layout.contains(&id) {
            id
        } else {
            format!("e{}{}", mid, mid)
        };
        group.throughput(Throughput::Elements(layout.len() as u64));

        group.bench_with_input(BenchmarkId::new("right", side), &layout, |b, layout| {
            b.iter(|| {
                black_box(
                    resolver
                        .find_neighbour(layout, &id, Direction::Right, 0.5)
                        .ok()
                        .flatten(),
                )
            });
        });
    }

    group.finish();
}

/// Ray count is the main knob on lookup cost.
fn bench_num_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("num_steps");
    let layout = unit_grid(8, 8);

    for steps in [16usize, 20, 40, 80].iter() {
        let resolver = NeighbourResolver::new(ResolverConfig::default().with_num_steps(*steps));
        group.bench_with_input(BenchmarkId::from_parameter(steps), steps, |b, _| {
            b.iter(|| black_box(resolver.find_all_neighbours(&layout, "e44", 0.5).ok()));
        });
    }

    group.finish();
}

/// Whole-layout table, sequential or on rayon with `--features parallel`.
fn bench_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("neighbour_table");
    group.sample_size(20);
    let resolver = NeighbourResolver::default();

    for side in [8usize, 16, 32].iter() {
        let layout = unit_grid(*side, *side);
        group.throughput(Throughput::Elements(layout.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(side), &layout, |b, layout| {
            b.iter(|| black_box(resolver.neighbour_table(layout, 0.5).len()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_find_neighbour, bench_num_steps, bench_table);
criterion_main!(benches);
