use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::wal::Wal;
use crate::storage::blink::log::{LogBody, LogRecord};
use crate::types::{BlinkError, Lsn, Result, TxId};

/// Lifecycle state of a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxState {
    /// Accepting operations.
    Active,
    /// Commit record written.
    Committed,
    /// Rolled back.
    Aborted,
}

/// A transaction: an id plus the head of its backward log chain.
pub struct Transaction {
    id: TxId,
    last_lsn: Mutex<Lsn>,
    state: Mutex<TxState>,
}

impl Transaction {
    pub(crate) fn new(id: TxId) -> Self {
        Self::resume(id, Lsn::ZERO)
    }

    /// Re-creates a transaction found in the log so its undo can be logged.
    pub(crate) fn resume(id: TxId, last_lsn: Lsn) -> Self {
        Self {
            id,
            last_lsn: Mutex::new(last_lsn),
            state: Mutex::new(TxState::Active),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TxId {
        self.id
    }

    /// LSN of the most recent record the transaction wrote.
    pub fn last_lsn(&self) -> Lsn {
        *self.last_lsn.lock()
    }

    /// Current state.
    pub fn state(&self) -> TxState {
        *self.state.lock()
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.state() {
            TxState::Active => Ok(()),
            _ => Err(BlinkError::Invalid("transaction is not active")),
        }
    }

    pub(crate) fn set_state(&self, state: TxState) {
        *self.state.lock() = state;
    }

    /// Appends a record chained to the previous one and returns its LSN.
    pub(crate) fn log(&self, wal: &Wal, body: LogBody) -> Result<Lsn> {
        let mut last = self.last_lsn.lock();
        let record = LogRecord {
            tx: self.id,
            prev_lsn: *last,
            body,
        };
        let lsn = wal.append(&record.encode())?;
        *last = lsn;
        Ok(lsn)
    }

    /// Closes a structure modification begun when the chain head was `saved`:
    /// the dummy CLR makes undo skip every record written since.
    pub(crate) fn end_nested(&self, wal: &Wal, saved: Lsn) -> Result<Lsn> {
        self.log(
            wal,
            LogBody::Compensation {
                undo_next: saved,
                action: None,
            },
        )
    }
}

/// Hands out transaction ids and writes commit records.
pub struct TxManager {
    next: AtomicU64,
    wal: Arc<Wal>,
    flush_on_commit: bool,
}

impl TxManager {
    /// Creates a manager whose first transaction id is `first`.
    pub fn new(wal: Arc<Wal>, first: u64, flush_on_commit: bool) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
            wal,
            flush_on_commit,
        }
    }

    /// Starts a transaction.
    pub fn begin(&self) -> Arc<Transaction> {
        let id = TxId(self.next.fetch_add(1, AtomicOrdering::Relaxed));
        debug!(tx = %id, "txn.begin");
        Arc::new(Transaction::new(id))
    }

    /// Makes sure ids handed out later are greater than `seen`, so restarted
    /// stores never reuse an id found in the log.
    pub fn advance_past(&self, seen: TxId) {
        self.next.fetch_max(seen.0 + 1, AtomicOrdering::Relaxed);
    }

    /// Writes the commit record, forcing the WAL when configured.
    pub fn commit(&self, tx: &Transaction) -> Result<Lsn> {
        tx.ensure_active()?;
        let lsn = tx.log(&self.wal, LogBody::Commit)?;
        if self.flush_on_commit {
            self.wal.flush_to(lsn)?;
        }
        tx.set_state(TxState::Committed);
        debug!(tx = %tx.id(), %lsn, "txn.commit");
        Ok(lsn)
    }
}
