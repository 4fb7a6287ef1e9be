#![allow(missing_docs)]

use std::collections::BTreeMap;

use proptest::prelude::*;
use sombra_blink::primitives::bytes::ord;
use sombra_blink::{
    FieldType, IndexOptions, IndexStore, OpenMode, PageId, Result, SearchMode, SplitPolicy,
};

#[derive(Clone, Debug)]
enum Op {
    Put(u16, u8),
    Delete(u16),
    Commit,
    Rollback,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0u16..160, any::<u8>()).prop_map(|(k, v)| Op::Put(k, v)),
        3 => (0u16..160).prop_map(Op::Delete),
        1 => Just(Op::Commit),
        1 => Just(Op::Rollback),
    ]
}

fn key(k: u16) -> Vec<u8> {
    ord::encode_u64(u64::from(k)).to_vec()
}

fn value(k: u16, v: u8) -> Vec<u8> {
    // Some values are long enough to leave the page.
    let len = if v % 7 == 0 { 120 } else { 1 + (v as usize % 20) };
    let mut out = vec![v; len];
    out.extend_from_slice(&k.to_be_bytes());
    out
}

fn contents(store: &IndexStore, root: PageId) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    let tx = store.begin();
    let mut iter = store
        .indexes()
        .open(&tx, root, SearchMode::First, &[], None, OpenMode::Read, None)?;
    let mut out = BTreeMap::new();
    let mut last: Option<Vec<u8>> = None;
    while let Some((k, v)) = iter.next()? {
        assert!(last.as_ref().map_or(true, |prev| *prev < k), "scan not strictly ascending");
        last = Some(k.clone());
        out.insert(k, v);
    }
    drop(iter);
    store.commit(&tx)?;
    Ok(out)
}

/// Applies `ops` in a series of transactions. Returns the committed state.
fn run(
    store: &IndexStore,
    root: PageId,
    ops: &[Op],
) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    let mut committed: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut working = committed.clone();
    let mut tx = store.begin();
    for op in ops {
        match op {
            Op::Put(k, v) => {
                let (k, v) = (key(*k), value(*k, *v));
                if working.contains_key(&k) {
                    store.indexes().update(&tx, root, &k, &v, None)?;
                } else {
                    store.indexes().insert(&tx, root, &k, &v)?;
                }
                working.insert(k, v);
            }
            Op::Delete(k) => {
                let k = key(*k);
                let present = working.remove(&k).is_some();
                assert_eq!(store.indexes().delete(&tx, root, &k, None).is_ok(), present);
            }
            Op::Commit => {
                store.commit(&tx)?;
                committed = working.clone();
                tx = store.begin();
            }
            Op::Rollback => {
                store.rollback(&tx)?;
                working = committed.clone();
                tx = store.begin();
            }
        }
    }
    store.rollback(&tx)?;
    Ok(committed)
}

fn options(compact: bool) -> IndexOptions {
    let policy = if compact {
        SplitPolicy::Compact
    } else {
        SplitPolicy::Balanced
    };
    IndexOptions::default()
        .page_size(512)
        .max_entries_per_page(5)
        .split_policy(policy)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn transactions_match_reference(
        ops in prop::collection::vec(op_strategy(), 1..200),
        compact in any::<bool>(),
    ) {
        let store = IndexStore::new(options(compact)).expect("store");
        let tx = store.begin();
        let root = store
            .indexes()
            .create_index(&tx, 1, FieldType::U64, FieldType::Bytes, true, false)
            .expect("create");
        store.commit(&tx).expect("commit");

        let committed = run(&store, root, &ops).expect("run");
        prop_assert_eq!(contents(&store, root).expect("scan"), committed.clone());
        let report = store.indexes().verify(root).expect("verify");
        prop_assert_eq!(report.entries, committed.len());
        prop_assert!(store.tree().meta(root).is_ok());
        let externalized = committed.values().filter(|v| v.len() > 100).count();
        prop_assert_eq!(store.blobs().len(), externalized);
    }

    #[test]
    fn recovery_restores_committed_state(
        ops in prop::collection::vec(op_strategy(), 1..160),
        checkpoint in any::<bool>(),
    ) {
        let store = IndexStore::new(options(false)).expect("store");
        let tx = store.begin();
        let root = store
            .indexes()
            .create_index(&tx, 1, FieldType::U64, FieldType::Bytes, true, false)
            .expect("create");
        store.commit(&tx).expect("commit");

        let mut committed = BTreeMap::new();
        let mut working = BTreeMap::new();
        let tx = store.begin();
        let split = ops.len() / 2;
        for (idx, op) in ops.iter().enumerate() {
            if idx == split {
                store.commit(&tx).expect("commit");
                committed = working.clone();
                break;
            }
            match op {
                Op::Put(k, v) => {
                    let (k, v) = (key(*k), value(*k, *v));
                    if working.contains_key(&k) {
                        store.indexes().update(&tx, root, &k, &v, None).expect("update");
                    } else {
                        store.indexes().insert(&tx, root, &k, &v).expect("insert");
                    }
                    working.insert(k, v);
                }
                Op::Delete(k) => {
                    let k = key(*k);
                    if working.remove(&k).is_some() {
                        store.indexes().delete(&tx, root, &k, None).expect("delete");
                    }
                }
                Op::Commit | Op::Rollback => {}
            }
        }
        let loser = store.begin();
        for op in &ops[split..] {
            match op {
                Op::Put(k, v) => {
                    let (k, v) = (key(*k), value(*k, *v));
                    if working.contains_key(&k) {
                        store.indexes().update(&loser, root, &k, &v, None).expect("update");
                    } else {
                        store.indexes().insert(&loser, root, &k, &v).expect("insert");
                    }
                    working.insert(k, v);
                }
                Op::Delete(k) => {
                    let k = key(*k);
                    if working.remove(&k).is_some() {
                        store.indexes().delete(&loser, root, &k, None).expect("delete");
                    }
                }
                Op::Commit | Op::Rollback => {}
            }
        }
        if checkpoint {
            store.checkpoint().expect("checkpoint");
        }

        let restarted = store.simulate_crash().expect("crash");
        restarted.recover().expect("recover");
        prop_assert_eq!(contents(&restarted, root).expect("scan"), committed.clone());
        prop_assert_eq!(restarted.indexes().verify(root).expect("verify").entries, committed.len());
    }
}
