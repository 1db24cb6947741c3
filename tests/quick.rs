//! Randomized property tests: the engine against a model map, and the
//! freelist merge against plain sorting.

use quickcheck::TestResult;
use quickcheck_macros::quickcheck;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use tempfile::TempDir;

use paildb::freelist::merge;
use paildb::Db;

// merge(a, b) on sorted inputs is exactly sort(a ++ b).
#[quickcheck]
fn prop_merge_matches_sort(mut a: Vec<u64>, mut b: Vec<u64>) -> bool {
    a.sort_unstable();
    b.sort_unstable();
    let merged = merge(&a, &b);

    let mut expected = a;
    expected.extend_from_slice(&b);
    expected.sort_unstable();
    merged == expected
}

// For any sequence of puts and deletes, a get returns the last write.
#[quickcheck]
fn prop_put_delete_get(ops: Vec<(bool, Vec<u8>, Vec<u8>)>) -> TestResult {
    if ops.is_empty() || ops.len() > 200 {
        return TestResult::discard();
    }

    let dir = TempDir::new().unwrap();
    let db = Db::new();
    db.open(dir.path().join("data.db"), 0o666).unwrap();
    db.create_bucket("b").unwrap();

    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut txn = db.begin_rw().unwrap();
    for (is_put, key, value) in &ops {
        if key.is_empty() {
            continue;
        }
        if *is_put {
            txn.put("b", key, value).unwrap();
            model.insert(key.clone(), value.clone());
        } else {
            txn.delete("b", key).unwrap();
            model.remove(key);
        }
    }
    txn.commit().unwrap();

    for (is_put, key, _) in &ops {
        if key.is_empty() {
            continue;
        }
        let got = db.get("b", key).unwrap();
        if got.as_ref() != model.get(key) {
            return TestResult::error(format!(
                "mismatch for key {key:?} after {}",
                if *is_put { "put" } else { "delete" }
            ));
        }
    }

    // A full scan yields the model in key order.
    let txn = db.begin().unwrap();
    let bucket = txn.bucket("b").unwrap();
    let mut cursor = bucket.cursor();
    let mut scanned: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut item = cursor.first();
    while let Some((k, v)) = item {
        scanned.push((k.to_vec(), v.to_vec()));
        item = cursor.next();
    }
    let expected: Vec<(Vec<u8>, Vec<u8>)> =
        model.into_iter().collect();
    TestResult::from_bool(scanned == expected)
}

// Seeded bulk workload across many transactions, verified against the
// model before and after a reopen.
#[test]
fn test_randomized_workload_durable() {
    let mut rng = StdRng::seed_from_u64(0xDB_0001);
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data.db");

    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    {
        let db = Db::new();
        db.open(&path, 0o666).unwrap();
        db.create_bucket("b").unwrap();

        for _ in 0..30 {
            let mut txn = db.begin_rw().unwrap();
            for _ in 0..50 {
                let key: Vec<u8> =
                    (0..rng.gen_range(1..=32)).map(|_| rng.gen_range(b'a'..=b'p')).collect();
                if rng.gen_bool(0.8) {
                    let value: Vec<u8> =
                        (0..rng.gen_range(0..=256)).map(|_| rng.gen::<u8>()).collect();
                    txn.put("b", &key, &value).unwrap();
                    model.insert(key, value);
                } else {
                    txn.delete("b", &key).unwrap();
                    model.remove(&key);
                }
            }
            txn.commit().unwrap();
        }

        for (key, value) in &model {
            assert_eq!(db.get("b", key).unwrap().as_ref(), Some(value));
        }
        db.close();
    }

    let db = Db::new();
    db.open(&path, 0o666).unwrap();
    for (key, value) in &model {
        assert_eq!(db.get("b", key).unwrap().as_ref(), Some(value), "lost {key:?} on reopen");
    }

    // Scan order matches the model.
    let txn = db.begin().unwrap();
    let bucket = txn.bucket("b").unwrap();
    let mut cursor = bucket.cursor();
    let mut count = 0;
    let mut prev: Option<Vec<u8>> = None;
    let mut item = cursor.first();
    while let Some((k, _)) = item {
        if let Some(p) = &prev {
            assert!(p.as_slice() < k, "cursor out of order");
        }
        assert!(model.contains_key(k));
        prev = Some(k.to_vec());
        count += 1;
        item = cursor.next();
    }
    assert_eq!(count, model.len());
}
