use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::types::{BlinkError, PageId, Result, TxId};

/// Store for values too large to keep inline on a leaf page.
///
/// The index treats it as an opaque id -> bytes map with its own concurrency
/// control and durability.
pub trait BlobStore: Send + Sync + 'static {
    /// Allocates a blob holding `bytes` and returns its id.
    fn create(&self, tx: TxId, bytes: &[u8]) -> Result<PageId>;
    /// Replaces the contents of an existing blob.
    fn write(&self, tx: TxId, id: PageId, bytes: &[u8]) -> Result<()>;
    /// Reads a blob.
    fn read(&self, tx: TxId, id: PageId) -> Result<Vec<u8>>;
    /// Drops a blob. Dropping an absent blob succeeds, so redo may repeat it.
    fn drop_blob(&self, tx: TxId, id: PageId) -> Result<()>;
    /// Whether the blob exists.
    fn contains(&self, id: PageId) -> bool;
    /// Number of live blobs.
    fn len(&self) -> usize;
    /// True when no blob is live.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory blob store addressed by page ids in a dedicated container.
pub struct MemBlobStore {
    container: u32,
    next: AtomicU32,
    blobs: Mutex<FxHashMap<PageId, Vec<u8>>>,
}

impl MemBlobStore {
    /// Creates an empty store allocating ids in `container`.
    pub fn new(container: u32) -> Self {
        Self {
            container,
            next: AtomicU32::new(1),
            blobs: Mutex::new(FxHashMap::default()),
        }
    }
}

impl BlobStore for MemBlobStore {
    fn create(&self, tx: TxId, bytes: &[u8]) -> Result<PageId> {
        let page = self.next.fetch_add(1, AtomicOrdering::Relaxed);
        let id = PageId::new(self.container, page);
        self.blobs.lock().insert(id, bytes.to_vec());
        trace!(%tx, blob = %id, len = bytes.len(), "blob.create");
        Ok(id)
    }

    fn write(&self, _tx: TxId, id: PageId, bytes: &[u8]) -> Result<()> {
        match self.blobs.lock().get_mut(&id) {
            Some(slot) => {
                slot.clear();
                slot.extend_from_slice(bytes);
                Ok(())
            }
            None => Err(BlinkError::BlobNotFound(id)),
        }
    }

    fn read(&self, _tx: TxId, id: PageId) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .get(&id)
            .cloned()
            .ok_or(BlinkError::BlobNotFound(id))
    }

    fn drop_blob(&self, tx: TxId, id: PageId) -> Result<()> {
        if self.blobs.lock().remove(&id).is_some() {
            trace!(%tx, blob = %id, "blob.drop");
        }
        Ok(())
    }

    fn contains(&self, id: PageId) -> bool {
        self.blobs.lock().contains_key(&id)
    }

    fn len(&self) -> usize {
        self.blobs.lock().len()
    }
}
