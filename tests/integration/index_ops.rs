#![allow(missing_docs)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sombra_blink::primitives::bytes::ord;
use sombra_blink::primitives::wal::Wal;
use sombra_blink::storage::lock::{LockRequest, LockService, LockUnit};
use sombra_blink::{
    BlinkError, FieldType, IndexOptions, IndexStore, OpenMode, PageId, Result, SearchMode,
    SplitPolicy, TxState,
};

fn key(v: u64) -> Vec<u8> {
    ord::encode_u64(v).to_vec()
}

/// Refuses the first conditional request for each key and remembers every
/// blocking grant.
#[derive(Default)]
struct Contended {
    granted: Mutex<HashSet<Vec<u8>>>,
    refused: AtomicUsize,
    waited: AtomicUsize,
    range_requests: AtomicUsize,
}

impl Contended {
    fn decide(&self, req: &LockRequest<'_>) -> Result<bool> {
        if req.unit == LockUnit::Range {
            self.range_requests.fetch_add(1, Ordering::Relaxed);
        }
        let mut granted = self.granted.lock();
        if !req.conditional {
            self.waited.fetch_add(1, Ordering::Relaxed);
            granted.insert(req.key.to_vec());
            return Ok(true);
        }
        if granted.contains(req.key) {
            return Ok(true);
        }
        self.refused.fetch_add(1, Ordering::Relaxed);
        Ok(false)
    }
}

impl LockService for Contended {
    fn lock_read(&self, req: &LockRequest<'_>) -> Result<bool> {
        self.decide(req)
    }

    fn lock_insert(&self, req: &LockRequest<'_>) -> Result<bool> {
        self.decide(req)
    }

    fn lock_delete(&self, req: &LockRequest<'_>) -> Result<bool> {
        self.decide(req)
    }

    fn lock_update(&self, req: &LockRequest<'_>) -> Result<bool> {
        self.decide(req)
    }
}

/// Refuses everything, blocking requests included.
struct Deadlocked;

impl LockService for Deadlocked {
    fn lock_read(&self, _req: &LockRequest<'_>) -> Result<bool> {
        Ok(false)
    }

    fn lock_insert(&self, _req: &LockRequest<'_>) -> Result<bool> {
        Ok(false)
    }

    fn lock_delete(&self, _req: &LockRequest<'_>) -> Result<bool> {
        Ok(false)
    }

    fn lock_update(&self, _req: &LockRequest<'_>) -> Result<bool> {
        Ok(false)
    }
}

#[test]
fn refused_locks_are_waited_for_and_retried() -> Result<()> {
    let locks = Arc::new(Contended::default());
    let store = IndexStore::open(IndexOptions::default(), Wal::in_memory(), locks.clone())?;
    let tx = store.begin();
    let root = store
        .indexes()
        .create_index(&tx, 3, FieldType::U64, FieldType::Bytes, true, false)?;
    for k in 1..=4 {
        store.indexes().insert(&tx, root, &key(k), b"v")?;
    }
    assert_eq!(locks.refused.load(Ordering::Relaxed), 4);
    assert_eq!(locks.waited.load(Ordering::Relaxed), 4);

    assert_eq!(store.indexes().read(&tx, root, &key(9))?, None);
    assert!(locks.range_requests.load(Ordering::Relaxed) >= 1);
    assert_eq!(store.indexes().read(&tx, root, &key(2))?, Some(b"v".to_vec()));
    store.commit(&tx)?;
    Ok(())
}

#[test]
fn bulk_load_takes_no_locks() -> Result<()> {
    let locks = Arc::new(Contended::default());
    let store = IndexStore::open(
        IndexOptions::default().page_size(512),
        Wal::in_memory(),
        locks.clone(),
    )?;
    let tx = store.begin();
    let root = store
        .indexes()
        .create_index(&tx, 3, FieldType::U64, FieldType::Bytes, true, false)?;
    let mut loader = store.indexes().open_loader(&tx, root)?;
    for k in 0..500 {
        loader.push(&key(k), &k.to_be_bytes())?;
    }
    assert_eq!(loader.loaded(), 500);
    loader.finish();
    assert_eq!(locks.refused.load(Ordering::Relaxed), 0);
    assert_eq!(locks.waited.load(Ordering::Relaxed), 0);
    let report = store.indexes().verify(root)?;
    assert_eq!(report.entries, 500);
    assert!(report.height >= 1);
    Ok(())
}

#[test]
fn refused_blocking_request_surfaces_as_error() -> Result<()> {
    let store = IndexStore::open(IndexOptions::default(), Wal::in_memory(), Arc::new(Deadlocked))?;
    let tx = store.begin();
    let root = store
        .indexes()
        .create_index(&tx, 3, FieldType::U64, FieldType::Bytes, true, false)?;
    let err = store.indexes().insert(&tx, root, &key(1), b"v");
    assert!(matches!(err, Err(BlinkError::LockNotGranted { root: r }) if r == root));
    assert!(matches!(
        store.indexes().read(&tx, root, &key(1)),
        Err(BlinkError::LockNotGranted { .. })
    ));
    assert!(store.indexes().verify(root)?.entries == 0);
    Ok(())
}

#[test]
fn options_parse_from_toml() -> Result<()> {
    let options = IndexOptions::from_toml_str(
        r#"
            page_size = 1024
            max_entries_per_page = 16
            split_policy = "compact"
            page_hints = false
        "#,
    )?;
    assert_eq!(options.page_size, 1024);
    assert_eq!(options.max_entries_per_page, Some(16));
    assert_eq!(options.split_policy, SplitPolicy::Compact);
    assert!(!options.page_hints);
    assert_eq!(options.externalize_percent, 25);
    let rendered = options.to_toml_string()?;
    assert_eq!(IndexOptions::from_toml_str(&rendered)?, options);

    assert!(IndexOptions::from_toml_str("page_size = 7").is_err());
    assert!(matches!(
        IndexOptions::from_toml_str("page_size = \"big\""),
        Err(BlinkError::Config(_))
    ));
    Ok(())
}

#[test]
fn indexes_share_one_page_space() -> Result<()> {
    let store = IndexStore::new(IndexOptions::default().page_size(512).max_entries_per_page(4))?;
    let tx = store.begin();
    let indexes = store.indexes();
    let by_id = indexes.create_index(&tx, 5, FieldType::U64, FieldType::Utf8, true, false)?;
    let by_name = indexes.create_index(&tx, 5, FieldType::Utf8, FieldType::U64, false, false)?;
    assert_ne!(by_id, by_name);
    let names = ["ada", "grace", "edsger", "barbara", "ken", "dennis", "alan"];
    for (id, name) in names.iter().enumerate() {
        let id = id as u64;
        indexes.insert(&tx, by_id, &key(id), name.as_bytes())?;
        indexes.insert(&tx, by_name, name.as_bytes(), &key(id))?;
    }
    store.commit(&tx)?;

    let tx = store.begin();
    let mut iter = indexes.open(&tx, by_name, SearchMode::GreaterOrEqual, b"b", None, OpenMode::Read, None)?;
    let mut ordered = Vec::new();
    while let Some((name, _)) = iter.next()? {
        ordered.push(String::from_utf8_lossy(&name).into_owned());
    }
    assert_eq!(ordered, ["barbara", "dennis", "edsger", "grace", "ken"]);
    assert_eq!(indexes.read(&tx, by_id, &key(2))?, Some(b"edsger".to_vec()));
    assert_eq!(indexes.verify(by_id)?.entries, names.len());
    assert_eq!(indexes.verify(by_name)?.entries, names.len());
    assert_eq!((by_id.container, by_name.container), (5, 5));
    Ok(())
}

#[test]
fn commit_forces_the_log() -> Result<()> {
    let store = IndexStore::new(IndexOptions::default())?;
    let tx = store.begin();
    let root = store
        .indexes()
        .create_index(&tx, 1, FieldType::U64, FieldType::Bytes, true, false)?;
    store.indexes().insert(&tx, root, &key(1), b"v")?;
    let before = store.wal().flushed_lsn();
    let lsn = store.commit(&tx)?;
    assert_eq!(tx.state(), TxState::Committed);
    assert!(lsn > before);
    assert_eq!(store.wal().flushed_lsn(), lsn);
    assert!(store.wal_stats().flushes >= 1);
    assert!(store.commit(&tx).is_err());
    Ok(())
}

#[test]
fn lazy_commit_leaves_the_log_unforced() -> Result<()> {
    let store = IndexStore::new(IndexOptions::default().flush_on_commit(false))?;
    let tx = store.begin();
    let root = store
        .indexes()
        .create_index(&tx, 1, FieldType::U64, FieldType::Bytes, true, false)?;
    store.indexes().insert(&tx, root, &key(1), b"v")?;
    let lsn = store.commit(&tx)?;
    assert!(store.wal().flushed_lsn() < lsn);
    assert_eq!(store.checkpoint()?, lsn);
    assert_eq!(store.wal().flushed_lsn(), lsn);
    Ok(())
}

#[test]
fn unknown_root_is_an_error() -> Result<()> {
    let store = IndexStore::new(IndexOptions::default())?;
    let tx = store.begin();
    let missing = PageId::new(1, 42);
    assert!(store.indexes().read(&tx, missing, &key(1)).is_err());
    assert!(store.indexes().insert(&tx, missing, &key(1), b"v").is_err());
    Ok(())
}
