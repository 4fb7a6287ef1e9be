#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use sombra_blink::primitives::bytes::ord;
use sombra_blink::{
    FieldType, IndexOptions, IndexStore, OpenMode, PageId, Result, SearchMode,
};

const NUM_THREADS: u64 = 6;
const KEYS_PER_THREAD: u64 = 250;

fn key(v: u64) -> Vec<u8> {
    ord::encode_u64(v).to_vec()
}

fn store() -> Result<(Arc<IndexStore>, PageId)> {
    capped_store(6)
}

fn capped_store(max_entries: usize) -> Result<(Arc<IndexStore>, PageId)> {
    let store = IndexStore::new(
        IndexOptions::default()
            .page_size(512)
            .max_entries_per_page(max_entries),
    )?;
    let tx = store.begin();
    let root = store
        .indexes()
        .create_index(&tx, 1, FieldType::U64, FieldType::Bytes, true, false)?;
    store.commit(&tx)?;
    Ok((Arc::new(store), root))
}

fn scan(store: &IndexStore, root: PageId, mode: SearchMode, from: u64) -> Result<Vec<u64>> {
    let tx = store.begin();
    let mut iter = store
        .indexes()
        .open(&tx, root, mode, &key(from), None, OpenMode::Read, None)?;
    let mut out = Vec::new();
    while let Some((k, _)) = iter.next()? {
        out.push(ord::decode_u64(&k)?);
    }
    drop(iter);
    store.commit(&tx)?;
    Ok(out)
}

#[test]
fn interleaved_inserts_from_many_threads() -> Result<()> {
    let (store, root) = store()?;
    let barrier = Arc::new(Barrier::new(NUM_THREADS as usize));
    let mut handles = Vec::new();
    for thread_id in 0..NUM_THREADS {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            barrier.wait();
            let tx = store.begin();
            for i in 0..KEYS_PER_THREAD {
                let k = i * NUM_THREADS + thread_id;
                store.indexes().insert(&tx, root, &key(k), &k.to_be_bytes())?;
            }
            store.commit(&tx)?;
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().expect("writer thread panicked")?;
    }

    let total = NUM_THREADS * KEYS_PER_THREAD;
    assert_eq!(
        scan(&store, root, SearchMode::First, 0)?,
        (0..total).collect::<Vec<_>>()
    );
    let report = store.indexes().verify(root)?;
    assert_eq!(report.entries as u64, total);
    let tx = store.begin();
    for k in (0..total).step_by(37) {
        assert_eq!(
            store.indexes().read(&tx, root, &key(k))?,
            Some(k.to_be_bytes().to_vec())
        );
    }
    Ok(())
}

#[test]
fn concurrent_deletes_and_inserts_keep_tree_consistent() -> Result<()> {
    let (store, root) = store()?;
    let total = NUM_THREADS * KEYS_PER_THREAD;
    let tx = store.begin();
    for k in 0..total {
        store.indexes().insert(&tx, root, &key(k), b"seed")?;
    }
    store.commit(&tx)?;

    let barrier = Arc::new(Barrier::new(NUM_THREADS as usize));
    let mut handles = Vec::new();
    for thread_id in 0..NUM_THREADS {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            barrier.wait();
            let tx = store.begin();
            for i in 0..KEYS_PER_THREAD {
                let k = i * NUM_THREADS + thread_id;
                if thread_id % 2 == 0 {
                    store.indexes().delete(&tx, root, &key(k), None)?;
                } else {
                    store.indexes().insert(&tx, root, &key(total + k), b"grown")?;
                }
            }
            store.commit(&tx)?;
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().expect("worker thread panicked")?;
    }

    let expected: Vec<u64> = (0..total)
        .filter(|k| (k % NUM_THREADS) % 2 == 1)
        .chain((0..total).filter(|k| (k % NUM_THREADS) % 2 == 1).map(|k| total + k))
        .collect();
    assert_eq!(scan(&store, root, SearchMode::First, 0)?, expected);
    assert_eq!(store.indexes().verify(root)?.entries, expected.len());
    Ok(())
}

#[test]
fn scans_see_stable_keys_while_pages_split() -> Result<()> {
    let (store, root) = store()?;
    let stable: Vec<u64> = (0..400).map(|k| k * 2).collect();
    let tx = store.begin();
    for k in &stable {
        store.indexes().insert(&tx, root, &key(*k), b"stable")?;
    }
    store.commit(&tx)?;

    let done = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for reader in 0..2u64 {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        let stable = stable.clone();
        readers.push(thread::spawn(move || -> Result<usize> {
            let mut scans = 0;
            while !done.load(Ordering::Acquire) || scans == 0 {
                let (mode, from) = if reader == 0 {
                    (SearchMode::GreaterOrEqual, 0)
                } else {
                    (SearchMode::LessOrEqual, u64::MAX)
                };
                let mut seen = scan(&store, root, mode, from)?;
                if reader == 1 {
                    assert!(seen.windows(2).all(|w| w[0] > w[1]), "descending scan out of order");
                    seen.reverse();
                } else {
                    assert!(seen.windows(2).all(|w| w[0] < w[1]), "ascending scan out of order");
                }
                let evens: Vec<u64> = seen.into_iter().filter(|k| k % 2 == 0).collect();
                assert_eq!(evens, stable, "stable keys missing from a concurrent scan");
                scans += 1;
            }
            Ok(scans)
        }));
    }

    let mut writers = Vec::new();
    for thread_id in 0..2u64 {
        let store = Arc::clone(&store);
        writers.push(thread::spawn(move || -> Result<()> {
            let tx = store.begin();
            for i in 0..200u64 {
                let k = (i * 2 + thread_id) * 2 + 1;
                store.indexes().insert(&tx, root, &key(k), b"odd")?;
            }
            store.commit(&tx)?;
            Ok(())
        }));
    }
    for writer in writers {
        writer.join().expect("writer thread panicked")?;
    }
    done.store(true, Ordering::Release);
    for reader in readers {
        assert!(reader.join().expect("reader thread panicked")? > 0);
    }
    assert_eq!(store.indexes().verify(root)?.entries, 800);
    Ok(())
}

#[test]
fn rollback_runs_alongside_other_writers() -> Result<()> {
    let (store, root) = store()?;
    let loser = {
        let store = Arc::clone(&store);
        thread::spawn(move || -> Result<()> {
            let tx = store.begin();
            for k in 0..300u64 {
                store.indexes().insert(&tx, root, &key(k * 2), b"loser")?;
            }
            store.rollback(&tx)?;
            Ok(())
        })
    };
    let winner = {
        let store = Arc::clone(&store);
        thread::spawn(move || -> Result<()> {
            let tx = store.begin();
            for k in 0..300u64 {
                store.indexes().insert(&tx, root, &key(k * 2 + 1), b"winner")?;
            }
            store.commit(&tx)?;
            Ok(())
        })
    };
    loser.join().expect("loser thread panicked")?;
    winner.join().expect("winner thread panicked")?;
    assert_eq!(
        scan(&store, root, SearchMode::First, 0)?,
        (0..300u64).map(|k| k * 2 + 1).collect::<Vec<_>>()
    );
    store.indexes().verify(root)?;
    Ok(())
}

#[test]
fn toggling_keys_while_pages_split_and_merge() -> Result<()> {
    const ROUNDS: u64 = 8;
    const KEYS: u64 = 600;
    let (store, root) = capped_store(4)?;
    let barrier = Arc::new(Barrier::new(NUM_THREADS as usize));
    let done = Arc::new(AtomicBool::new(false));

    let mut scanners = Vec::new();
    for mode in [SearchMode::First, SearchMode::LessOrEqual] {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        scanners.push(thread::spawn(move || -> Result<()> {
            while !done.load(Ordering::Acquire) {
                let seen = scan(&store, root, mode, u64::MAX)?;
                let ordered = if mode == SearchMode::First {
                    seen.windows(2).all(|w| w[0] < w[1])
                } else {
                    seen.windows(2).all(|w| w[0] > w[1])
                };
                assert!(ordered, "scan out of order");
            }
            Ok(())
        }));
    }

    let mut workers = Vec::new();
    for thread_id in 0..NUM_THREADS {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        workers.push(thread::spawn(move || -> Result<BTreeSet<u64>> {
            barrier.wait();
            let mut present = BTreeSet::new();
            for round in 0..ROUNDS {
                let tx = store.begin();
                for k in (thread_id..KEYS).step_by(NUM_THREADS as usize) {
                    if round > 0 && (k + round) % 3 == 0 {
                        continue;
                    }
                    if present.remove(&k) {
                        store.indexes().delete(&tx, root, &key(k), None)?;
                    } else {
                        store.indexes().insert(&tx, root, &key(k), &k.to_be_bytes())?;
                        present.insert(k);
                    }
                }
                store.commit(&tx)?;
            }
            Ok(present)
        }));
    }
    let mut expected = BTreeSet::new();
    for worker in workers {
        expected.extend(worker.join().expect("worker thread panicked")?);
    }
    done.store(true, Ordering::Release);
    for scanner in scanners {
        scanner.join().expect("scanner thread panicked")?;
    }

    let expected: Vec<u64> = expected.into_iter().collect();
    assert_eq!(scan(&store, root, SearchMode::First, 0)?, expected);
    let mut descending = scan(&store, root, SearchMode::LessOrEqual, u64::MAX)?;
    descending.reverse();
    assert_eq!(descending, expected);
    assert_eq!(store.indexes().verify(root)?.entries, expected.len());
    let tx = store.begin();
    for k in 0..KEYS {
        let found = store.indexes().read(&tx, root, &key(k))?;
        assert_eq!(found.is_some(), expected.binary_search(&k).is_ok(), "key {k}");
    }
    store.commit(&tx)?;
    Ok(())
}
