//! Concurrent B-link tree engine.
//!
//! Every index lives in the page space of one [`BufferManager`] and is named
//! by its root page id, which never changes for the life of the index. The
//! engine holds no per-index state: callers pass the root with each call and
//! index-wide properties are read from the root page header.
//!
//! Latching follows the B-link discipline: a thread holds at most two page
//! latches, and when it holds two they were taken left to right or parent to
//! child. Every page mutation is logged before it is applied, and every
//! structure modification is closed by a dummy compensation record so that
//! rollback never undoes a completed split or merge.

mod delete;
mod descend;
mod insert;
mod read;
mod undo;
mod value;

use std::sync::Arc;

use tracing::{debug, warn};

pub(crate) use descend::Probe;
pub(crate) use value::blob_id;

use super::handle::{LatchMode, PageHandle};
use super::log::{IndexOp, LogBody, PageAction};
use super::page::{FieldType, Header, HeaderImage, PageRef, PageType, SLOT_LEN};
use super::stats::{BlinkStats, BlinkStatsSnapshot};
use crate::primitives::pager::BufferManager;
use crate::primitives::wal::Wal;
use crate::storage::blob::BlobStore;
use crate::storage::lock::{LockRequest, LockService, LockUnit};
use crate::storage::options::IndexOptions;
use crate::storage::txn::Transaction;
use crate::types::{BlinkError, Lsn, PageId, Result, TxId};

/// How an iterator or mutation was opened.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum OpenMode {
    /// Reads under read locks.
    #[default]
    Read,
    /// Reads under update locks.
    Update,
    /// Ascending bulk load: no key-range locks, compact splits at the right edge.
    Load,
}

/// Index-wide properties, read from the root page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IndexMeta {
    /// Keys are unique.
    pub unique: bool,
    /// Leaf values may be compressed.
    pub compressed: bool,
    /// Key type descriptor.
    pub key_type: FieldType,
    /// Value type descriptor.
    pub value_type: FieldType,
    /// Height of the root above the leaves.
    pub height: u8,
}

/// Whether a page mutation is a forward action or the compensation of one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Logging {
    Forward,
    Undo(Lsn),
}

/// Kind of key-range lock requested.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LockKind {
    Read,
    Insert,
    Delete,
    Update,
}

/// A refused conditional lock request, kept in owned form so it can be
/// repeated as a blocking call after the caller has released its latches.
#[derive(Debug)]
pub(crate) struct PendingLock {
    kind: LockKind,
    unit: LockUnit,
    tx: TxId,
    root: PageId,
    key: Vec<u8>,
    value: Option<Vec<u8>>,
    next: Option<(Vec<u8>, Vec<u8>)>,
}

/// The B-link tree engine shared by every index of a store.
pub struct BlinkTree {
    pager: Arc<dyn BufferManager>,
    wal: Arc<Wal>,
    blobs: Arc<dyn BlobStore>,
    locks: Arc<dyn LockService>,
    options: IndexOptions,
    pub(crate) stats: Arc<BlinkStats>,
}

impl BlinkTree {
    /// Builds an engine over the given services.
    pub fn new(
        pager: Arc<dyn BufferManager>,
        wal: Arc<Wal>,
        blobs: Arc<dyn BlobStore>,
        locks: Arc<dyn LockService>,
        options: IndexOptions,
    ) -> Result<Self> {
        options.validate()?;
        if pager.page_size() != options.page_size {
            return Err(BlinkError::Config(format!(
                "buffer manager page size {} does not match configured {}",
                pager.page_size(),
                options.page_size
            )));
        }
        Ok(Self {
            pager,
            wal,
            blobs,
            locks,
            options,
            stats: Arc::new(BlinkStats::default()),
        })
    }

    /// Configured options.
    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// Live statistics counters.
    pub fn stats(&self) -> Arc<BlinkStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot of the statistics counters.
    pub fn stats_snapshot(&self) -> BlinkStatsSnapshot {
        self.stats.snapshot()
    }

    /// Emits the statistics to the tracing sink.
    pub fn emit_stats(&self) {
        self.stats.emit_tracing();
    }

    pub(crate) fn pager(&self) -> &Arc<dyn BufferManager> {
        &self.pager
    }

    pub(crate) fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    /// Creates an empty index: a single leaf that is also the root.
    pub fn create_index(
        &self,
        tx: &Transaction,
        container: u32,
        key_type: FieldType,
        value_type: FieldType,
        unique: bool,
        compressed: bool,
    ) -> Result<PageId> {
        let root = self.pager.allocate_page(container)?;
        let mut page = self.latch_fresh(root)?;
        let before = page.view().image()?;
        let after = HeaderImage {
            page_type: PageType::Leaf,
            key_type,
            value_type,
            unique,
            compressed: compressed && unique,
            root: Some(root),
            ..HeaderImage::free()
        };
        self.log_apply(
            tx,
            &mut page,
            root,
            true,
            IndexOp::Format { before, after },
            Logging::Forward,
        )?;
        debug!(%root, unique, compressed, "blink.create_index");
        Ok(root)
    }

    /// Reads the index-wide properties stored on the root page.
    pub fn meta(&self, root: PageId) -> Result<IndexMeta> {
        let page = self.latch_root(root, LatchMode::S)?;
        let header = page.header()?;
        Ok(IndexMeta {
            unique: header.unique(),
            compressed: header.compressed(),
            key_type: header.key_type,
            value_type: header.value_type,
            height: header.height,
        })
    }

    /// Latches the root of an index, failing when `root` does not name one.
    pub(crate) fn latch_root(&self, root: PageId, mode: LatchMode) -> Result<PageHandle> {
        let frame = self
            .pager
            .fix_page(root)
            .map_err(|err| err.access(root, root, "fix root"))?;
        let page = PageHandle::acquire(&frame, mode);
        let header = page.header()?;
        if header.page_type == PageType::Free || header.root != Some(root) {
            return Err(BlinkError::RootMismatch {
                page: root,
                expected: root,
                found: header.root,
            });
        }
        self.check_version(&header, root, root)?;
        Ok(page)
    }

    /// Fixes and latches a page reached through a pointer. Returns `None` when
    /// the page has been released since the pointer was read, or now belongs
    /// to another index; callers restart from a stable point.
    pub(crate) fn enter(
        &self,
        id: PageId,
        root: PageId,
        mode: LatchMode,
    ) -> Result<Option<PageHandle>> {
        let frame = match self.pager.fix_page(id) {
            Ok(frame) => frame,
            Err(BlinkError::PageNotFound { .. }) => return Ok(None),
            Err(err) => return Err(err.access(id, root, "fix")),
        };
        let page = PageHandle::acquire(&frame, mode);
        let header = page.header()?;
        if header.page_type == PageType::Free || header.root != Some(root) {
            return Ok(None);
        }
        self.check_version(&header, id, root)?;
        Ok(Some(page))
    }

    /// Exclusive latch on a page just handed out by the allocator.
    pub(crate) fn latch_fresh(&self, id: PageId) -> Result<PageHandle> {
        let frame = self.pager.fix_page(id)?;
        Ok(PageHandle::acquire(&frame, LatchMode::X))
    }

    fn check_version(&self, header: &Header, page: PageId, root: PageId) -> Result<()> {
        if header.version != self.options.format_version {
            return Err(BlinkError::Access {
                page,
                root,
                op: "version check",
                source: Box::new(BlinkError::Corruption("page format version mismatch")),
            });
        }
        Ok(())
    }

    /// Logs `op` against the latched page, applies it, and stamps the page
    /// LSN. Returns the LSN of the record.
    pub(crate) fn log_apply(
        &self,
        tx: &Transaction,
        page: &mut PageHandle,
        root: PageId,
        structural: bool,
        op: IndexOp,
        logging: Logging,
    ) -> Result<Lsn> {
        let action = PageAction {
            page: page.id,
            root,
            structural,
            op: op.clone(),
        };
        let body = match logging {
            Logging::Forward => LogBody::Action(action),
            Logging::Undo(undo_next) => LogBody::Compensation {
                undo_next,
                action: Some(action),
            },
        };
        let lsn = tx.log(&self.wal, body)?;
        let mut bytes = page.page_mut()?;
        if let Err(err) = op.apply(&mut bytes, self.options.format_version) {
            warn!(page = %page.id, %lsn, error = %err, "blink.apply_failed");
            return Err(BlinkError::Protocol {
                lsn,
                page: page.id,
                reason: "logged mutation did not apply",
            });
        }
        bytes.set_lsn(lsn);
        Ok(lsn)
    }

    /// Whether a slot holding `record` more key and value bytes fits.
    pub(crate) fn fits(&self, view: &PageRef<'_>, record: usize) -> bool {
        let under_cap = self
            .options
            .max_entries_per_page
            .map_or(true, |max| view.count() < max);
        under_cap && view.reclaimable() >= SLOT_LEN + record
    }

    /// A non-root page that is not last-in-level has underflowed once a leaf
    /// keeps at most one entry or a branch keeps none.
    pub(crate) fn underflowed(&self, header: &Header) -> bool {
        if header.last_in_level() {
            return false;
        }
        match header.page_type {
            PageType::Leaf => header.count <= 1,
            PageType::Branch => header.count == 0,
            PageType::Free => false,
        }
    }

    /// Conditionally locks `key` with next-key information taken from slot
    /// `next` of `view`. Returns the request in owned form when refused.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn lock_at(
        &self,
        kind: LockKind,
        unit: LockUnit,
        tx: TxId,
        root: PageId,
        key: &[u8],
        value: Option<&[u8]>,
        view: &PageRef<'_>,
        next: usize,
    ) -> Result<Option<PendingLock>> {
        let next = if next < view.count() {
            Some(view.slot(next)?)
        } else {
            None
        };
        let req = LockRequest {
            tx,
            unit,
            root,
            key,
            value,
            next_key: next.map(|slot| slot.key),
            next_value: next.map(|slot| slot.value),
            conditional: true,
        };
        if self.request_lock(kind, &req)? {
            return Ok(None);
        }
        Ok(Some(PendingLock {
            kind,
            unit,
            tx,
            root,
            key: key.to_vec(),
            value: value.map(<[u8]>::to_vec),
            next: next.map(|slot| (slot.key.to_vec(), slot.value.to_vec())),
        }))
    }

    /// Repeats a refused request as a blocking call. Latches must be released.
    pub(crate) fn wait_for(&self, pending: PendingLock) -> Result<()> {
        let req = LockRequest {
            tx: pending.tx,
            unit: pending.unit,
            root: pending.root,
            key: &pending.key,
            value: pending.value.as_deref(),
            next_key: pending.next.as_ref().map(|(key, _)| key.as_slice()),
            next_value: pending.next.as_ref().map(|(_, value)| value.as_slice()),
            conditional: false,
        };
        debug!(tx = %pending.tx, root = %pending.root, kind = ?pending.kind, "blink.lock_wait");
        if self.request_lock(pending.kind, &req)? {
            Ok(())
        } else {
            Err(BlinkError::LockNotGranted { root: pending.root })
        }
    }

    fn request_lock(&self, kind: LockKind, req: &LockRequest<'_>) -> Result<bool> {
        match kind {
            LockKind::Read => self.locks.lock_read(req),
            LockKind::Insert => self.locks.lock_insert(req),
            LockKind::Delete => self.locks.lock_delete(req),
            LockKind::Update => self.locks.lock_update(req),
        }
    }
}
