//! Benchmarks for distance kernels and vec0 KNN queries

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;
use rusqlite::Connection;
use sqlite_vec::{DistanceMetric, Vector};

fn random_vector(dim: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn bench_cosine_distance(c: &mut Criterion) {
    let mut group = c.benchmark_group("cosine_distance");

    for dim in [128, 256, 512, 1024] {
        let a = Vector::Float32(random_vector(dim));
        let b = Vector::Float32(random_vector(dim));

        group.bench_with_input(BenchmarkId::from_parameter(dim), &dim, |bench, _| {
            bench.iter(|| DistanceMetric::Cosine.distance(black_box(&a), black_box(&b)));
        });
    }

    group.finish();
}

fn bench_l2_distance(c: &mut Criterion) {
    let mut group = c.benchmark_group("l2_distance");

    for dim in [128, 256, 512, 1024] {
        let a = Vector::Float32(random_vector(dim));
        let b = Vector::Float32(random_vector(dim));

        group.bench_with_input(BenchmarkId::from_parameter(dim), &dim, |bench, _| {
            bench.iter(|| DistanceMetric::L2.distance(black_box(&a), black_box(&b)));
        });
    }

    group.finish();
}

fn bench_hamming_distance(c: &mut Criterion) {
    let mut group = c.benchmark_group("hamming_distance");
    let mut rng = rand::thread_rng();

    for bits in [128, 1024] {
        let a = Vector::Bit((0..bits / 8).map(|_| rng.gen()).collect());
        let b = Vector::Bit((0..bits / 8).map(|_| rng.gen()).collect());

        group.bench_with_input(BenchmarkId::from_parameter(bits), &bits, |bench, _| {
            bench.iter(|| DistanceMetric::Hamming.distance(black_box(&a), black_box(&b)));
        });
    }

    group.finish();
}

fn bench_vec0_knn(c: &mut Criterion) {
    let mut group = c.benchmark_group("vec0_knn");
    group.sample_size(20);

    let dim = 128;
    let k = 10;

    for size in [1_000, 10_000] {
        let conn = Connection::open_in_memory().unwrap();
        sqlite_vec::register(&conn).unwrap();
        conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE items USING vec0(embedding float[{dim}])"
        ))
        .unwrap();

        {
            let tx = conn.unchecked_transaction().unwrap();
            let mut insert = tx
                .prepare("INSERT INTO items(embedding) VALUES (?1)")
                .unwrap();
            for _ in 0..size {
                insert
                    .execute([Vector::Float32(random_vector(dim)).to_blob()])
                    .unwrap();
            }
            drop(insert);
            tx.commit().unwrap();
        }

        let query = Vector::Float32(random_vector(dim)).to_blob();
        let mut stmt = conn
            .prepare("SELECT rowid, distance FROM items WHERE embedding MATCH ?1 AND k = ?2")
            .unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |bench, _| {
            bench.iter(|| {
                let rows: Vec<(i64, f64)> = stmt
                    .query_map(rusqlite::params![black_box(&query), k], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .unwrap()
                    .collect::<rusqlite::Result<_>>()
                    .unwrap();
                rows
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_cosine_distance,
    bench_l2_distance,
    bench_hamming_distance,
    bench_vec0_knn
);
criterion_main!(benches);
