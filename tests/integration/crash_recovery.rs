#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::{Arc, Once};

use sombra_blink::primitives::bytes::ord;
use sombra_blink::primitives::wal::Wal;
use sombra_blink::storage::lock::NoLocking;
use sombra_blink::{
    FieldType, IndexOptions, IndexStore, OpenMode, PageId, Result, SearchMode, Transaction,
    TxState,
};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sombra_blink::storage=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn key(v: u64) -> Vec<u8> {
    ord::encode_u64(v).to_vec()
}

fn options() -> IndexOptions {
    IndexOptions::default()
        .page_size(512)
        .max_entries_per_page(5)
}

fn contents(store: &IndexStore, root: PageId) -> Result<BTreeMap<u64, Vec<u8>>> {
    let tx = store.begin();
    let mut iter = store
        .indexes()
        .open(&tx, root, SearchMode::First, &[], None, OpenMode::Read, None)?;
    let mut out = BTreeMap::new();
    while let Some((k, v)) = iter.next()? {
        out.insert(ord::decode_u64(&k)?, v);
    }
    drop(iter);
    store.commit(&tx)?;
    Ok(out)
}

/// Creates an index holding `0..count` with values derived from the key,
/// committed by its own transaction.
fn seeded(store: &IndexStore, count: u64) -> Result<(PageId, BTreeMap<u64, Vec<u8>>)> {
    let tx = store.begin();
    let root = store
        .indexes()
        .create_index(&tx, 1, FieldType::U64, FieldType::Bytes, true, false)?;
    let mut expected = BTreeMap::new();
    for k in 0..count {
        let value = format!("value-{k}").into_bytes();
        store.indexes().insert(&tx, root, &key(k), &value)?;
        expected.insert(k, value);
    }
    store.commit(&tx)?;
    Ok((root, expected))
}

/// Inserts past the seeded range, deletes from its front, and updates in the
/// middle, forcing splits and merges along the way.
fn churn(store: &IndexStore, tx: &Transaction, root: PageId, count: u64) -> Result<()> {
    for k in count..count * 3 {
        store.indexes().insert(tx, root, &key(k), b"loser")?;
    }
    for k in 0..count / 2 {
        store.indexes().delete(tx, root, &key(k), None)?;
    }
    store
        .indexes()
        .update(tx, root, &key(count - 1), b"changed", None)?;
    Ok(())
}

/// Inserts and updates only. Nothing here forces the log.
fn grow(store: &IndexStore, tx: &Transaction, root: PageId, count: u64) -> Result<()> {
    for k in count..count * 2 {
        store.indexes().insert(tx, root, &key(k), b"loser")?;
    }
    store
        .indexes()
        .update(tx, root, &key(count - 1), b"changed", None)?;
    Ok(())
}

#[test]
fn rollback_restores_committed_state() -> Result<()> {
    let store = IndexStore::new(options())?;
    let (root, expected) = seeded(&store, 40)?;
    let tx = store.begin();
    churn(&store, &tx, root, 40)?;
    let undone = store.rollback(&tx)?;
    assert!(undone >= 40 * 2 + 20 + 1);
    assert_eq!(tx.state(), TxState::Aborted);
    assert_eq!(contents(&store, root)?, expected);
    store.indexes().verify(root)?;
    assert!(store.rollback(&tx).is_err());
    Ok(())
}

#[test]
fn committed_work_survives_crash() -> Result<()> {
    let store = IndexStore::new(options())?;
    let (root, expected) = seeded(&store, 60)?;
    let restarted = store.simulate_crash()?;
    let report = restarted.recover()?;
    assert!(report.losers.is_empty());
    assert!(report.redone > 0);
    assert_eq!(contents(&restarted, root)?, expected);
    restarted.indexes().verify(root)?;
    Ok(())
}

#[test]
fn unflushed_work_is_lost_without_trace() -> Result<()> {
    let store = IndexStore::new(options())?;
    let (root, expected) = seeded(&store, 30)?;
    let tx = store.begin();
    grow(&store, &tx, root, 30)?;
    assert!(store.wal().flushed_lsn() < tx.last_lsn());
    let restarted = store.simulate_crash()?;
    let report = restarted.recover()?;
    assert!(report.losers.is_empty());
    assert_eq!(contents(&restarted, root)?, expected);
    Ok(())
}

#[test]
fn durable_loser_is_rolled_back() -> Result<()> {
    init_tracing();
    let store = IndexStore::new(options())?;
    let (root, expected) = seeded(&store, 30)?;
    let tx = store.begin();
    churn(&store, &tx, root, 30)?;
    store.checkpoint()?;
    let restarted = store.simulate_crash()?;
    let report = restarted.recover()?;
    assert_eq!(report.losers, vec![tx.id()]);
    assert_eq!(report.max_tx, Some(tx.id()));
    assert!(report.undone > 0);
    assert_eq!(contents(&restarted, root)?, expected);
    restarted.indexes().verify(root)?;
    assert!(restarted.begin().id() > tx.id());
    Ok(())
}

#[test]
fn recovery_is_idempotent() -> Result<()> {
    init_tracing();
    let store = IndexStore::new(options())?;
    let (root, expected) = seeded(&store, 25)?;
    let tx = store.begin();
    churn(&store, &tx, root, 25)?;
    store.wal().flush()?;

    let first = store.simulate_crash()?;
    let report = first.recover()?;
    assert_eq!(report.losers.len(), 1);
    assert_eq!(contents(&first, root)?, expected);

    let second = first.simulate_crash()?;
    let again = second.recover()?;
    assert!(again.losers.is_empty());
    assert_eq!(again.undone, 0);
    assert_eq!(contents(&second, root)?, expected);

    let third = second.simulate_crash()?;
    third.recover()?;
    assert_eq!(contents(&third, root)?, expected);
    Ok(())
}

#[test]
fn online_rollback_is_replayed_after_crash() -> Result<()> {
    let store = IndexStore::new(options())?;
    let (root, expected) = seeded(&store, 20)?;
    let tx = store.begin();
    churn(&store, &tx, root, 20)?;
    store.rollback(&tx)?;
    store.wal().flush()?;
    let restarted = store.simulate_crash()?;
    let report = restarted.recover()?;
    assert!(report.losers.is_empty());
    assert_eq!(report.undone, 0);
    assert_eq!(contents(&restarted, root)?, expected);
    restarted.indexes().verify(root)?;
    Ok(())
}

#[test]
fn file_log_replays_after_restart() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("index.wal");
    let (root, expected, last_tx) = {
        let store = IndexStore::open(options(), Wal::open(&path)?, Arc::new(NoLocking))?;
        let (root, expected) = seeded(&store, 50)?;
        let tx = store.begin();
        store.indexes().insert(&tx, root, &key(999), b"never committed")?;
        (root, expected, tx.id())
    };

    let store = IndexStore::open(options(), Wal::open(&path)?, Arc::new(NoLocking))?;
    let report = store.recover()?;
    assert!(report.losers.is_empty());
    assert!(report.redone > 0);
    assert_eq!(contents(&store, root)?, expected);
    store.indexes().verify(root)?;
    assert!(report.max_tx < Some(last_tx));

    let tx = store.begin();
    store.indexes().insert(&tx, root, &key(1000), b"after restart")?;
    store.commit(&tx)?;
    drop(store);

    let store = IndexStore::open(options(), Wal::open(&path)?, Arc::new(NoLocking))?;
    store.recover()?;
    let mut expected = expected;
    expected.insert(1000, b"after restart".to_vec());
    assert_eq!(contents(&store, root)?, expected);
    Ok(())
}

#[test]
fn undo_restores_externalized_values() -> Result<()> {
    let store = IndexStore::new(options())?;
    let tx = store.begin();
    let root = store
        .indexes()
        .create_index(&tx, 1, FieldType::U64, FieldType::Bytes, true, false)?;
    let big = vec![0x5au8; 400];
    let other = vec![0x33u8; 300];
    store.indexes().insert(&tx, root, &key(1), &big)?;
    store.indexes().insert(&tx, root, &key(2), &big)?;
    store.commit(&tx)?;
    assert_eq!(store.blobs().len(), 2);

    let tx = store.begin();
    store.indexes().delete(&tx, root, &key(1), None)?;
    store.indexes().update(&tx, root, &key(2), &other, None)?;
    store.indexes().insert(&tx, root, &key(3), &other)?;
    store.rollback(&tx)?;

    assert_eq!(store.blobs().len(), 2);
    let tx = store.begin();
    assert_eq!(store.indexes().read(&tx, root, &key(1))?, Some(big.clone()));
    assert_eq!(store.indexes().read(&tx, root, &key(2))?, Some(big.clone()));
    assert_eq!(store.indexes().read(&tx, root, &key(3))?, None);
    store.commit(&tx)?;

    let tx = store.begin();
    store.indexes().delete(&tx, root, &key(2), None)?;
    store.wal().flush()?;
    let restarted = store.simulate_crash()?;
    restarted.recover()?;
    let tx = restarted.begin();
    assert_eq!(restarted.indexes().read(&tx, root, &key(2))?, Some(big));
    Ok(())
}

#[test]
fn rolled_back_index_creation_is_swept() -> Result<()> {
    let store = IndexStore::new(options())?;
    let (kept, expected) = seeded(&store, 10)?;
    let tx = store.begin();
    let doomed = store
        .indexes()
        .create_index(&tx, 1, FieldType::U64, FieldType::Bytes, true, false)?;
    for k in 0..3 {
        store.indexes().insert(&tx, doomed, &key(k), b"gone")?;
    }
    store.wal().flush()?;
    let restarted = store.simulate_crash()?;
    let report = restarted.recover()?;
    assert_eq!(report.losers, vec![tx.id()]);
    assert_eq!(report.swept, 1);
    assert!(restarted.tree().meta(doomed).is_err());
    assert_eq!(contents(&restarted, kept)?, expected);
    Ok(())
}
