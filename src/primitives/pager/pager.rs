use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use super::frame::Frame;
use crate::primitives::wal::Wal;
use crate::types::{BlinkError, PageId, Result};

/// Buffer manager contract consumed by the index engine.
///
/// The manager owns page memory and latches; the engine never caches a frame
/// across a latch release.
pub trait BufferManager: Send + Sync + 'static {
    /// Physical page size in bytes.
    fn page_size(&self) -> usize;
    /// Allocates a zero-filled page in `container`.
    fn allocate_page(&self, container: u32) -> Result<PageId>;
    /// Fixes a resident page.
    fn fix_page(&self, id: PageId) -> Result<Arc<Frame>>;
    /// Fixes a page, materializing a zero-filled image when it does not exist.
    /// Used by redo to re-create pages whose allocation never reached disk.
    fn fix_or_create(&self, id: PageId) -> Result<Arc<Frame>>;
    /// Deallocates a page. The WAL is forced first so the record that freed it
    /// is durable before the page disappears.
    fn delete_page(&self, id: PageId) -> Result<()>;
    /// Writes one page image back to the persistent image set.
    fn flush_page(&self, id: PageId) -> Result<()>;
    /// Writes every resident page back.
    fn flush_all(&self) -> Result<()>;
    /// Ids of every resident page, sorted.
    fn page_ids(&self) -> Vec<PageId>;
}

/// Counters describing pager activity.
#[derive(Clone, Copy, Debug, Default)]
pub struct PagerStats {
    /// Number of successful fixes.
    pub fixes: u64,
    /// Number of pages allocated.
    pub allocations: u64,
    /// Number of pages deallocated.
    pub deletions: u64,
    /// Number of page images written back.
    pub writebacks: u64,
}

#[derive(Default)]
struct PagerCounters {
    fixes: AtomicU64,
    allocations: AtomicU64,
    deletions: AtomicU64,
    writebacks: AtomicU64,
}

/// In-process buffer manager.
///
/// Resident frames are the working set; `disk` holds the images as of the last
/// write-back and is what survives [`Pager::crash`].
pub struct Pager {
    page_size: usize,
    wal: Arc<Wal>,
    frames: Mutex<FxHashMap<PageId, Arc<Frame>>>,
    disk: Mutex<FxHashMap<PageId, Box<[u8]>>>,
    next_page: Mutex<FxHashMap<u32, u32>>,
    counters: PagerCounters,
}

impl Pager {
    /// Creates an empty pager whose write-backs are ordered after `wal` flushes.
    pub fn new(page_size: usize, wal: Arc<Wal>) -> Self {
        Self {
            page_size,
            wal,
            frames: Mutex::new(FxHashMap::default()),
            disk: Mutex::new(FxHashMap::default()),
            next_page: Mutex::new(FxHashMap::default()),
            counters: PagerCounters::default(),
        }
    }

    /// Simulates a crash: a new pager holding only written-back images,
    /// attached to the WAL that survived the same crash.
    pub fn crash(&self, wal: Arc<Wal>) -> Pager {
        let disk = self.disk.lock().clone();
        let mut next_page: FxHashMap<u32, u32> = FxHashMap::default();
        let mut frames = FxHashMap::default();
        for (id, image) in disk.iter() {
            let next = next_page.entry(id.container).or_insert(1);
            *next = (*next).max(id.page + 1);
            frames.insert(*id, Arc::new(Frame::from_image(*id, image.clone())));
        }
        debug!(pages = frames.len(), "pager.crash");
        Pager {
            page_size: self.page_size,
            wal,
            frames: Mutex::new(frames),
            disk: Mutex::new(disk),
            next_page: Mutex::new(next_page),
            counters: PagerCounters::default(),
        }
    }

    /// Snapshot of the pager counters.
    pub fn stats(&self) -> PagerStats {
        PagerStats {
            fixes: self.counters.fixes.load(AtomicOrdering::Relaxed),
            allocations: self.counters.allocations.load(AtomicOrdering::Relaxed),
            deletions: self.counters.deletions.load(AtomicOrdering::Relaxed),
            writebacks: self.counters.writebacks.load(AtomicOrdering::Relaxed),
        }
    }

    fn bump_next(&self, id: PageId) {
        let mut next_page = self.next_page.lock();
        let next = next_page.entry(id.container).or_insert(1);
        *next = (*next).max(id.page + 1);
    }
}

impl BufferManager for Pager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocate_page(&self, container: u32) -> Result<PageId> {
        let id = {
            let mut next_page = self.next_page.lock();
            let next = next_page.entry(container).or_insert(1);
            let page = *next;
            *next = page
                .checked_add(1)
                .ok_or(BlinkError::Invalid("container exhausted"))?;
            PageId::new(container, page)
        };
        self.frames
            .lock()
            .insert(id, Arc::new(Frame::new(id, self.page_size)));
        self.counters.allocations.fetch_add(1, AtomicOrdering::Relaxed);
        trace!(page = %id, "pager.allocate");
        Ok(id)
    }

    fn fix_page(&self, id: PageId) -> Result<Arc<Frame>> {
        let frame = self
            .frames
            .lock()
            .get(&id)
            .cloned()
            .ok_or(BlinkError::PageNotFound { page: id })?;
        self.counters.fixes.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(frame)
    }

    fn fix_or_create(&self, id: PageId) -> Result<Arc<Frame>> {
        let frame = self
            .frames
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(Frame::new(id, self.page_size)))
            .clone();
        self.bump_next(id);
        self.counters.fixes.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(frame)
    }

    fn delete_page(&self, id: PageId) -> Result<()> {
        self.wal.flush()?;
        let removed = self.frames.lock().remove(&id);
        if removed.is_none() {
            return Err(BlinkError::PageNotFound { page: id });
        }
        self.disk.lock().remove(&id);
        self.counters.deletions.fetch_add(1, AtomicOrdering::Relaxed);
        trace!(page = %id, "pager.delete");
        Ok(())
    }

    fn flush_page(&self, id: PageId) -> Result<()> {
        let frame = self.fix_page(id)?;
        self.wal.flush()?;
        let image = frame.snapshot();
        self.disk.lock().insert(id, image);
        self.counters.writebacks.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        for id in self.page_ids() {
            match self.flush_page(id) {
                Ok(()) | Err(BlinkError::PageNotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn page_ids(&self) -> Vec<PageId> {
        let mut ids: Vec<PageId> = self.frames.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
