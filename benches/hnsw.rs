//! HNSW benchmarks, including the recall property on gaussian data.
//!
//! Run with: cargo bench --bench hnsw

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use myvector::distance::Distance;
use myvector::index::hnsw::Graph;
use myvector::index::{QueryRef, VectorElems};
use myvector::payload::VectorKind;
use myvector::simd;

/// Standard-normal samples via Box-Muller.
fn gaussian_vector(dim: usize, rng: &mut StdRng) -> Vec<f32> {
    (0..dim)
        .map(|_| {
            let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
            let u2: f64 = rng.gen();
            ((-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()) as f32
        })
        .collect()
}

fn build_graph(vectors: &[Vec<f32>], m: usize, ef: usize, seed: u64) -> Graph {
    let dim = vectors[0].len();
    let mut graph = Graph::with_seed(
        VectorKind::Float32,
        dim,
        Distance::L2,
        vectors.len(),
        m,
        ef,
        seed,
    );
    for (i, v) in vectors.iter().enumerate() {
        graph.insert(&VectorElems::F32(v.clone()), i as u64).unwrap();
    }
    graph
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("hnsw_insert");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));

    for num_vectors in [100usize, 500, 1000] {
        let mut rng = StdRng::seed_from_u64(1000 + num_vectors as u64);
        let vectors: Vec<_> = (0..num_vectors)
            .map(|_| gaussian_vector(128, &mut rng))
            .collect();

        group.bench_with_input(
            BenchmarkId::from_parameter(num_vectors),
            &num_vectors,
            |b, _| b.iter(|| black_box(build_graph(&vectors, 16, 100, 42).len())),
        );
    }

    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let num_vectors = 5000;
    let mut rng = StdRng::seed_from_u64(4242);
    let vectors: Vec<_> = (0..num_vectors)
        .map(|_| gaussian_vector(128, &mut rng))
        .collect();
    let graph = build_graph(&vectors, 16, 100, 42);

    let mut group = c.benchmark_group("hnsw_search");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(3));

    for ef in [20usize, 50, 100] {
        let mut query_rng = StdRng::seed_from_u64(ef as u64 + 5000);
        let query = gaussian_vector(128, &mut query_rng);

        group.bench_with_input(BenchmarkId::from_parameter(ef), &ef, |b, &ef| {
            b.iter(|| black_box(graph.search_knn(QueryRef::F32(&query), 10, ef).unwrap()))
        });
    }

    group.finish();
}

/// recall@10 ≥ 0.95 on gaussian data, dim 128, M=16, ef=100,
/// ef_search=64, 10k vectors. Asserted once before timing the searches.
fn bench_recall(c: &mut Criterion) {
    let num_vectors = 10_000;
    let dim = 128;
    let k = 10;
    let ef_search = 64;

    let mut rng = StdRng::seed_from_u64(7777);
    let vectors: Vec<_> = (0..num_vectors)
        .map(|_| gaussian_vector(dim, &mut rng))
        .collect();
    let graph = build_graph(&vectors, 16, 100, 42);

    let queries: Vec<_> = (0..50).map(|_| gaussian_vector(dim, &mut rng)).collect();

    let mut found = 0usize;
    for query in &queries {
        let mut truth: Vec<(usize, f32)> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, simd::l2_squared(query, v)))
            .collect();
        truth.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        let truth_ids: std::collections::HashSet<u64> =
            truth.iter().take(k).map(|&(i, _)| i as u64).collect();

        let hits = graph.search_knn(QueryRef::F32(query), k, ef_search).unwrap();
        found += hits.iter().filter(|(id, _)| truth_ids.contains(id)).count();
    }
    let recall = found as f64 / (queries.len() * k) as f64;
    assert!(recall >= 0.95, "recall@{k} = {recall:.3} below 0.95");
    println!("recall@{k} = {recall:.3} over {} queries", queries.len());

    let mut group = c.benchmark_group("hnsw_recall_search");
    group.sample_size(50);
    group.bench_function("ef64_k10", |b| {
        b.iter(|| black_box(graph.search_knn(QueryRef::F32(&queries[0]), k, ef_search).unwrap()))
    });
    group.finish();
}

criterion_group!(benches, bench_insert, bench_search, bench_recall);
criterion_main!(benches);
