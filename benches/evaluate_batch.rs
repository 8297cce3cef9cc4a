//! Batch regression scoring benchmarks.
//!
//! - Batch width scaling in direct and residual mode
//! - Buyer width scaling in direct mode
//! - Sequential vs parallel scoring

mod common;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use common::{random_buyer, random_seller};
use joinsketch::search::{BatchRegressionEvaluator, FitMode};
use joinsketch::Parallelism;

const DOMAIN: usize = 2_000;

// =============================================================================
// Batch Width
// =============================================================================

fn bench_batch_width(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate/batch_width");
    let buyer = random_buyer(DOMAIN, 3, 7);

    for width in [16, 128, 1_024] {
        let seller = random_seller(DOMAIN, width, 42);
        group.throughput(Throughput::Elements(width as u64));

        for (label, mode) in [("direct", FitMode::Direct), ("residual", FitMode::Residual)] {
            let evaluator = BatchRegressionEvaluator::new(mode, Parallelism::Sequential);
            group.bench_with_input(BenchmarkId::new(label, width), &seller, |b, seller| {
                b.iter(|| black_box(evaluator.evaluate(black_box(seller), &buyer, 0)))
            });
        }
    }

    group.finish();
}

// =============================================================================
// Buyer Width
// =============================================================================

fn bench_buyer_width(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate/buyer_width");
    let seller = random_seller(DOMAIN, 256, 42);
    let evaluator = BatchRegressionEvaluator::new(FitMode::Direct, Parallelism::Sequential);

    for columns in [1, 4, 8] {
        let buyer = random_buyer(DOMAIN, columns, 7);
        group.bench_with_input(BenchmarkId::new("direct", columns), &buyer, |b, buyer| {
            b.iter(|| black_box(evaluator.evaluate(&seller, black_box(buyer), columns - 1)))
        });
    }

    group.finish();
}

// =============================================================================
// Parallelism
// =============================================================================

fn bench_parallelism(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate/parallelism");
    let seller = random_seller(DOMAIN, 1_024, 42);
    let buyer = random_buyer(DOMAIN, 4, 7);

    for (label, parallelism) in [
        ("sequential", Parallelism::Sequential),
        ("parallel", Parallelism::Parallel),
    ] {
        let evaluator = BatchRegressionEvaluator::new(FitMode::Direct, parallelism);
        group.bench_function(label, |b| {
            b.iter(|| black_box(evaluator.evaluate(&seller, &buyer, 1)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_batch_width, bench_buyer_width, bench_parallelism);
criterion_main!(benches);
