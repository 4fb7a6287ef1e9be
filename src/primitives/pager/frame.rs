use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockUpgradableReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::sync::Arc;

use crate::types::PageId;

/// Shared latch on a page image; many readers may hold it at once.
pub type SharedLatch = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;
/// Update latch: coexists with shared holders and can be upgraded to exclusive.
pub type UpdateLatch = ArcRwLockUpgradableReadGuard<RawRwLock, Box<[u8]>>;
/// Exclusive latch; required to mutate the page image.
pub type ExclusiveLatch = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

/// A resident page image guarded by its S/U/X latch.
pub struct Frame {
    /// Page this frame holds.
    pub id: PageId,
    buf: Arc<RwLock<Box<[u8]>>>,
}

impl Frame {
    /// Creates a zero-filled frame.
    pub fn new(id: PageId, page_size: usize) -> Self {
        Self::from_image(id, vec![0u8; page_size].into_boxed_slice())
    }

    /// Creates a frame holding a copy of a persisted image.
    pub fn from_image(id: PageId, image: Box<[u8]>) -> Self {
        Self {
            id,
            buf: Arc::new(RwLock::new(image)),
        }
    }

    /// Blocks until a shared latch is granted.
    pub fn latch_s(&self) -> SharedLatch {
        self.buf.read_arc()
    }

    /// Blocks until an update latch is granted.
    pub fn latch_u(&self) -> UpdateLatch {
        self.buf.upgradable_read_arc()
    }

    /// Blocks until an exclusive latch is granted.
    pub fn latch_x(&self) -> ExclusiveLatch {
        self.buf.write_arc()
    }

    /// Conditional shared latch.
    pub fn try_latch_s(&self) -> Option<SharedLatch> {
        self.buf.try_read_arc()
    }

    /// Conditional exclusive latch.
    pub fn try_latch_x(&self) -> Option<ExclusiveLatch> {
        self.buf.try_write_arc()
    }

    /// Copies the current image under a shared latch.
    pub fn snapshot(&self) -> Box<[u8]> {
        self.buf.read().clone()
    }
}

/// Upgrades an update latch to exclusive, waiting for shared holders to drain.
pub fn upgrade(latch: UpdateLatch) -> ExclusiveLatch {
    ArcRwLockUpgradableReadGuard::upgrade(latch)
}

/// Downgrades an exclusive latch to shared without releasing the page.
pub fn downgrade(latch: ExclusiveLatch) -> SharedLatch {
    ArcRwLockWriteGuard::downgrade(latch)
}

/// Downgrades an update latch to shared (the `downS` probe taken before release).
pub fn down_s(latch: UpdateLatch) -> SharedLatch {
    ArcRwLockUpgradableReadGuard::downgrade(latch)
}
