//! Scenario-level checks for the store's durability and ordering guarantees,
//! run against a fresh file per test via `tempfile`.

use bstore::{Key128, Store, LS_ASYNC_COMMIT};
use rand::{thread_rng, Rng};
use std::collections::HashMap;

fn scratch() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.bin");
    (dir, path)
}

/// S1: insert a batch of random keys plus a marker key, reopen read-only,
/// and confirm the marker's payload survived intact.
#[test]
fn insert_then_reopen_marker() {
    let (_dir, path) = scratch();
    let mut rng = thread_rng();
    {
        let store = Store::create(&path).unwrap();
        for _ in 0..1024 {
            let key = Key128::new(rng.gen(), rng.gen());
            let value: [u8; 8] = rng.gen();
            // A random draw might collide with a prior key; that's fine, a
            // `KeyExisted` here doesn't invalidate the scenario.
            let _ = store.put(key, value.as_slice());
        }
        store
            .put(Key128::new(0, 13739), [1u8, 2, 3, 4, 5, 6, 7, 8].as_slice())
            .unwrap();
    }

    let store = Store::open(&path, false).unwrap();
    let got = store.get(Key128::new(0, 13739)).unwrap().read_to_vec().unwrap();
    assert_eq!(got, vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

/// S2: progressive consistency — after each `Put`, `Count` and every prior
/// `Get` must already reflect it.
#[test]
fn progressive_consistency() {
    let (_dir, path) = scratch();
    let store = Store::create(&path).unwrap();

    for i in 0u64..256 {
        store.put(Key128::new(0, i), i.to_be_bytes().as_slice()).unwrap();
        assert_eq!(store.count(), i + 1);
        for j in 0..=i {
            let got = store.get(Key128::new(0, j)).unwrap().read_to_vec().unwrap();
            assert_eq!(got, j.to_be_bytes());
        }
    }
}

/// S3: under async commit, a `Walk` after every `Put` must see exactly the
/// keys inserted so far, regardless of how recently `Commit` ran.
#[test]
fn async_commit_walk_matches_ground_truth() {
    let (_dir, path) = scratch();
    let store = Store::create(&path).unwrap();
    store.set_flag(LS_ASYNC_COMMIT);

    for i in 0u64..256 {
        store.put(Key128::new(0, i), i.to_be_bytes().as_slice()).unwrap();
        if i % 10 == 0 {
            store.commit().unwrap();
        }

        let mut ground_truth = HashMap::new();
        for j in 0..=i {
            let got = store.get(Key128::new(0, j)).unwrap().read_to_vec().unwrap();
            ground_truth.insert(j, got);
        }

        let mut walked = HashMap::new();
        store
            .walk(|key, reader| {
                walked.insert(key.lo, reader.read_to_vec()?);
                Ok(())
            })
            .unwrap();

        assert_eq!(walked, ground_truth);
    }
}

/// S4: a duplicate `Put` fails and leaves the original value untouched.
#[test]
fn duplicate_insert_keeps_original_value() {
    let (_dir, path) = scratch();
    let store = Store::create(&path).unwrap();
    let key = Key128::new(1, 1);

    store.put(key, b"first".as_slice()).unwrap();
    let err = store.put(key, b"second".as_slice()).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);

    let got = store.get(key).unwrap().read_to_vec().unwrap();
    assert_eq!(got, b"first");
    assert_eq!(store.count(), 1);
}

/// S5 / boundary: exactly `MAX_ITEMS` keys keep the root a single leaf;
/// one more forces a split and a second tree level.
#[test]
fn root_stays_leaf_until_max_items_then_splits() {
    const MAX_ITEMS: u64 = 63;

    let (_dir, path) = scratch();
    let store = Store::create(&path).unwrap();
    for lo in 0..MAX_ITEMS {
        store.put(Key128::new(0, lo), lo.to_be_bytes().as_slice()).unwrap();
    }
    for lo in 0..MAX_ITEMS {
        let got = store.get(Key128::new(0, lo)).unwrap().read_to_vec().unwrap();
        assert_eq!(got, lo.to_be_bytes());
    }

    store
        .put(Key128::new(0, MAX_ITEMS), MAX_ITEMS.to_be_bytes().as_slice())
        .unwrap();
    for lo in 0..=MAX_ITEMS {
        let got = store.get(Key128::new(0, lo)).unwrap().read_to_vec().unwrap();
        assert_eq!(got, lo.to_be_bytes());
    }
}

/// Boundary: 256 strictly ascending keys, checked incrementally.
#[test]
fn ascending_keys_are_all_reachable_incrementally() {
    let (_dir, path) = scratch();
    let store = Store::create(&path).unwrap();
    for i in 0u64..256 {
        store.put(Key128::new(0, i), i.to_be_bytes().as_slice()).unwrap();
        for j in 0..=i {
            let got = store.get(Key128::new(0, j)).unwrap().read_to_vec().unwrap();
            assert_eq!(got, j.to_be_bytes());
        }
    }
}

/// Two successive `Commit()` calls under async mode are equivalent to one:
/// the second is a no-op over an already-clean dirty-set.
#[test]
fn double_commit_is_idempotent() {
    let (_dir, path) = scratch();
    let store = Store::create(&path).unwrap();
    store.set_flag(LS_ASYNC_COMMIT);
    store.put(Key128::new(0, 1), b"x".as_slice()).unwrap();

    store.commit().unwrap();
    let root_after_first = store.root_offset();
    store.commit().unwrap();
    assert_eq!(store.root_offset(), root_after_first);

    let got = store.get(Key128::new(0, 1)).unwrap().read_to_vec().unwrap();
    assert_eq!(got, b"x");
}
