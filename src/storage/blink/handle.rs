use crate::primitives::pager::{
    down_s, downgrade, upgrade, ExclusiveLatch, Frame, SharedLatch, UpdateLatch,
};
use crate::storage::blink::page::{Header, PageMut, PageRef};
use crate::types::{BlinkError, PageId, Result};

/// Latch mode requested when fixing a page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LatchMode {
    /// Shared.
    S,
    /// Update: admits readers, excludes writers, upgradeable.
    U,
    /// Exclusive.
    X,
}

enum Latch {
    Shared(SharedLatch),
    Update(UpdateLatch),
    Exclusive(ExclusiveLatch),
}

/// A fixed, latched page. Dropping the handle releases the latch, so every
/// early return unwinds the latches it holds.
pub struct PageHandle {
    /// Page held.
    pub id: PageId,
    latch: Latch,
}

impl PageHandle {
    /// Latches `frame` in `mode`, blocking until granted.
    pub fn acquire(frame: &Frame, mode: LatchMode) -> Self {
        let latch = match mode {
            LatchMode::S => Latch::Shared(frame.latch_s()),
            LatchMode::U => Latch::Update(frame.latch_u()),
            LatchMode::X => Latch::Exclusive(frame.latch_x()),
        };
        Self {
            id: frame.id,
            latch,
        }
    }

    /// Raw page image.
    pub fn bytes(&self) -> &[u8] {
        match &self.latch {
            Latch::Shared(guard) => &guard[..],
            Latch::Update(guard) => &guard[..],
            Latch::Exclusive(guard) => &guard[..],
        }
    }

    /// Read view.
    pub fn view(&self) -> PageRef<'_> {
        PageRef::new(self.bytes())
    }

    /// Decoded header.
    pub fn header(&self) -> Result<Header> {
        self.view().header()
    }

    /// Mutable view; only available under an exclusive latch.
    pub fn page_mut(&mut self) -> Result<PageMut<'_>> {
        match &mut self.latch {
            Latch::Exclusive(guard) => Ok(PageMut::new(&mut guard[..])),
            _ => Err(BlinkError::Invalid("page mutation requires an exclusive latch")),
        }
    }

    /// Current latch mode.
    pub fn mode(&self) -> LatchMode {
        match self.latch {
            Latch::Shared(_) => LatchMode::S,
            Latch::Update(_) => LatchMode::U,
            Latch::Exclusive(_) => LatchMode::X,
        }
    }

    /// U -> X. A shared latch cannot be upgraded without deadlock risk.
    pub fn upgrade(self) -> Result<Self> {
        let latch = match self.latch {
            Latch::Update(guard) => Latch::Exclusive(upgrade(guard)),
            Latch::Exclusive(guard) => Latch::Exclusive(guard),
            Latch::Shared(_) => {
                return Err(BlinkError::Invalid("shared latch cannot be upgraded"));
            }
        };
        Ok(Self { id: self.id, latch })
    }

    /// X or U -> S without letting go of the page.
    pub fn downgrade(self) -> Self {
        let latch = match self.latch {
            Latch::Exclusive(guard) => Latch::Shared(downgrade(guard)),
            Latch::Update(guard) => Latch::Shared(down_s(guard)),
            shared => shared,
        };
        Self { id: self.id, latch }
    }
}
