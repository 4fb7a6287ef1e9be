use std::sync::Arc;

use tracing::info;

use crate::primitives::pager::{BufferManager, Pager, PagerStats};
use crate::primitives::wal::{Wal, WalStats};
use crate::storage::blink::{BlinkStatsSnapshot, BlinkTree};
use crate::storage::blob::{BlobStore, MemBlobStore};
use crate::storage::index::IndexManager;
use crate::storage::lock::{LockService, NoLocking};
use crate::storage::options::IndexOptions;
use crate::storage::recovery::{self, RecoveryReport};
use crate::storage::txn::{Transaction, TxManager};
use crate::types::{Lsn, Result};

/// Container the default blob store allocates ids in.
pub const BLOB_CONTAINER: u32 = u32::MAX;

/// Wires a buffer manager, log, blob store, lock service, and transaction
/// manager around one engine.
pub struct IndexStore {
    options: IndexOptions,
    pager: Arc<Pager>,
    wal: Arc<Wal>,
    blobs: Arc<dyn BlobStore>,
    locks: Arc<dyn LockService>,
    txns: TxManager,
    indexes: IndexManager,
}

impl IndexStore {
    /// Store with an in-memory log, an in-memory blob store, and no key-range
    /// locking.
    pub fn new(options: IndexOptions) -> Result<Self> {
        Self::open(options, Wal::in_memory(), Arc::new(NoLocking))
    }

    /// Store over an existing log. Pages are rebuilt from the log only by
    /// [`IndexStore::recover`], which should run before new work starts.
    pub fn open(options: IndexOptions, wal: Wal, locks: Arc<dyn LockService>) -> Result<Self> {
        let wal = Arc::new(wal);
        let pager = Arc::new(Pager::new(options.page_size, Arc::clone(&wal)));
        let blobs: Arc<dyn BlobStore> = Arc::new(MemBlobStore::new(BLOB_CONTAINER));
        let store = Self::assemble(options, pager, wal, blobs, locks)?;
        info!(
            page_size = store.options.page_size,
            records = store.wal.last_lsn().0,
            "store.open"
        );
        Ok(store)
    }

    fn assemble(
        options: IndexOptions,
        pager: Arc<Pager>,
        wal: Arc<Wal>,
        blobs: Arc<dyn BlobStore>,
        locks: Arc<dyn LockService>,
    ) -> Result<Self> {
        let buffers: Arc<dyn BufferManager> = pager.clone();
        let tree = BlinkTree::new(
            buffers,
            Arc::clone(&wal),
            Arc::clone(&blobs),
            Arc::clone(&locks),
            options.clone(),
        )?;
        let txns = TxManager::new(Arc::clone(&wal), 1, options.flush_on_commit);
        Ok(Self {
            options,
            pager,
            wal,
            blobs,
            locks,
            txns,
            indexes: IndexManager::new(Arc::new(tree)),
        })
    }

    /// Configured options.
    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// Index operations.
    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    /// The engine.
    pub fn tree(&self) -> &Arc<BlinkTree> {
        self.indexes.tree()
    }

    /// Buffer manager.
    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    /// Write-ahead log.
    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    /// Blob store holding externalized values.
    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Starts a transaction.
    pub fn begin(&self) -> Arc<Transaction> {
        self.txns.begin()
    }

    /// Commits a transaction.
    pub fn commit(&self, tx: &Transaction) -> Result<Lsn> {
        self.txns.commit(tx)
    }

    /// Rolls a transaction back. Returns the number of actions compensated.
    pub fn rollback(&self, tx: &Transaction) -> Result<usize> {
        recovery::rollback(self.tree(), tx)
    }

    /// Repeats history from the log and rolls back every transaction that
    /// neither committed nor ended.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let report = recovery::recover(self.tree())?;
        if let Some(max) = report.max_tx {
            self.txns.advance_past(max);
        }
        Ok(report)
    }

    /// Forces the log, then writes every resident page back.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let lsn = self.wal.flush()?;
        self.pager.flush_all()?;
        info!(%lsn, "store.checkpoint");
        self.tree().emit_stats();
        Ok(lsn)
    }

    /// The store a restarted process would find: written-back pages and the
    /// durable log prefix. Blobs and the lock service carry over. Recovery is
    /// left to the caller.
    pub fn simulate_crash(&self) -> Result<IndexStore> {
        let wal = Arc::new(self.wal.crash()?);
        let pager = Arc::new(self.pager.crash(Arc::clone(&wal)));
        info!(
            durable = wal.last_lsn().0,
            lost = self.wal.last_lsn().0.saturating_sub(wal.last_lsn().0),
            "store.crash"
        );
        Self::assemble(
            self.options.clone(),
            pager,
            wal,
            Arc::clone(&self.blobs),
            Arc::clone(&self.locks),
        )
    }

    /// Engine counters.
    pub fn stats(&self) -> BlinkStatsSnapshot {
        self.tree().stats_snapshot()
    }

    /// Log counters.
    pub fn wal_stats(&self) -> WalStats {
        self.wal.stats()
    }

    /// Buffer manager counters.
    pub fn pager_stats(&self) -> PagerStats {
        self.pager.stats()
    }
}
