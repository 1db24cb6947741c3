//! Put/get throughput over a scratch database.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use paildb::Db;

fn bench_sequential_put(c: &mut Criterion) {
    c.bench_function("put_1k_sequential", |b| {
        b.iter_with_setup(
            || {
                let dir = TempDir::new().unwrap();
                let db = Db::new();
                db.open(dir.path().join("bench.db"), 0o666).unwrap();
                db.create_bucket("bench").unwrap();
                (dir, db)
            },
            |(_dir, db)| {
                let mut txn = db.begin_rw().unwrap();
                for i in 0..1000u32 {
                    let key = format!("key{i:08}");
                    txn.put("bench", key.as_bytes(), &[0u8; 64]).unwrap();
                }
                txn.commit().unwrap();
            },
        );
    });
}

fn bench_random_get(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = Db::new();
    db.open(dir.path().join("bench.db"), 0o666).unwrap();
    db.create_bucket("bench").unwrap();

    let mut txn = db.begin_rw().unwrap();
    for i in 0..10_000u32 {
        let key = format!("key{i:08}");
        txn.put("bench", key.as_bytes(), &[7u8; 64]).unwrap();
    }
    txn.commit().unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    c.bench_function("get_random_of_10k", |b| {
        let txn = db.begin().unwrap();
        let bucket = txn.bucket("bench").unwrap();
        b.iter(|| {
            let i = rng.gen_range(0..10_000u32);
            let key = format!("key{i:08}");
            black_box(bucket.get(key.as_bytes()));
        });
    });
}

criterion_group!(benches, bench_sequential_put, bench_random_get);
criterion_main!(benches);
