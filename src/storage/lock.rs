use crate::types::{PageId, Result, TxId};

/// Granularity of a key-range lock request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LockUnit {
    /// A single entry (point read or write).
    Key,
    /// The gap up to the next entry, taken by range scans.
    Range,
}

/// Arguments of a lock-service call. `next_key`/`next_value` name the entry
/// following the locked one on the leaf, for next-key locking.
#[derive(Clone, Copy, Debug)]
pub struct LockRequest<'a> {
    /// Requesting transaction.
    pub tx: TxId,
    /// Lock granularity.
    pub unit: LockUnit,
    /// Index root.
    pub root: PageId,
    /// Key locked.
    pub key: &'a [u8],
    /// Value locked (non-unique indexes).
    pub value: Option<&'a [u8]>,
    /// Key of the following entry, when known.
    pub next_key: Option<&'a [u8]>,
    /// Value of the following entry, when known.
    pub next_value: Option<&'a [u8]>,
    /// Conditional requests must not block; they return `false` instead.
    pub conditional: bool,
}

impl<'a> LockRequest<'a> {
    /// Point request for `key`.
    pub fn new(tx: TxId, root: PageId, key: &'a [u8]) -> Self {
        Self {
            tx,
            unit: LockUnit::Key,
            root,
            key,
            value: None,
            next_key: None,
            next_value: None,
            conditional: true,
        }
    }

    /// Same request as a blocking call.
    pub fn unconditional(mut self) -> Self {
        self.conditional = false;
        self
    }
}

/// Key-range lock service consulted by the index for phantom protection.
///
/// The engine calls it conditionally while holding a leaf latch. A refused
/// conditional request makes the engine release its latches, repeat the
/// request unconditionally, and restart the operation.
pub trait LockService: Send + Sync + 'static {
    /// Lock for reading.
    fn lock_read(&self, req: &LockRequest<'_>) -> Result<bool>;
    /// Lock for inserting.
    fn lock_insert(&self, req: &LockRequest<'_>) -> Result<bool>;
    /// Lock for deleting.
    fn lock_delete(&self, req: &LockRequest<'_>) -> Result<bool>;
    /// Lock for updating in place.
    fn lock_update(&self, req: &LockRequest<'_>) -> Result<bool>;
}

/// Lock service that grants everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoLocking;

impl LockService for NoLocking {
    fn lock_read(&self, _req: &LockRequest<'_>) -> Result<bool> {
        Ok(true)
    }

    fn lock_insert(&self, _req: &LockRequest<'_>) -> Result<bool> {
        Ok(true)
    }

    fn lock_delete(&self, _req: &LockRequest<'_>) -> Result<bool> {
        Ok(true)
    }

    fn lock_update(&self, _req: &LockRequest<'_>) -> Result<bool> {
        Ok(true)
    }
}
