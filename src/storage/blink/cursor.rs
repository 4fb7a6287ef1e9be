use tracing::trace;

use super::handle::{LatchMode, PageHandle};
use super::page::{SearchMode, Target};
use super::tree::{BlinkTree, LockKind, OpenMode, PendingLock, Probe};
use crate::storage::lock::LockUnit;
use crate::types::{BlinkError, Lsn, PageId, Result, TxId};

/// Remembered iterator position: a leaf and the LSN it had when an entry was
/// read from it. Reopening with a hint skips the descent when the page is
/// unchanged and the target lands strictly inside it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PageHint {
    /// Leaf page.
    pub page: PageId,
    /// LSN the page had.
    pub lsn: Lsn,
}

#[derive(Clone, Debug)]
struct Position {
    page: PageId,
    lsn: Lsn,
    index: usize,
    key: Vec<u8>,
    order: Vec<u8>,
}

enum State {
    Start {
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        hint: Option<PageHint>,
    },
    At(Position),
    Done,
}

enum Step {
    Entry(Vec<u8>, Vec<u8>, Position),
    Wait(PendingLock),
    End,
}

/// Iterator over the entries of one index in the direction of its search
/// mode.
///
/// No latch is held between calls to [`IndexIterator::next`]. Each call
/// re-latches the leaf of the last entry and continues in place when the
/// page LSN is unchanged; otherwise it descends again to the first entry
/// past the last one returned.
pub struct IndexIterator<'t> {
    tree: &'t BlinkTree,
    tx: TxId,
    root: PageId,
    mode: SearchMode,
    open: OpenMode,
    state: State,
}

impl<'t> IndexIterator<'t> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tree: &'t BlinkTree,
        tx: TxId,
        root: PageId,
        mode: SearchMode,
        key: &[u8],
        value: Option<&[u8]>,
        open: OpenMode,
        hint: Option<PageHint>,
    ) -> Self {
        Self {
            tree,
            tx,
            root,
            mode,
            open,
            state: State::Start {
                key: key.to_vec(),
                value: value.map(<[u8]>::to_vec),
                hint,
            },
        }
    }

    /// Search mode the iterator was opened with.
    pub fn mode(&self) -> SearchMode {
        self.mode
    }

    /// Position of the last entry returned, for reopening a later iterator.
    pub fn hint(&self) -> Option<PageHint> {
        match &self.state {
            State::At(pos) => Some(PageHint {
                page: pos.page,
                lsn: pos.lsn,
            }),
            _ => None,
        }
    }

    /// Returns the next entry, or `None` once the index is exhausted in the
    /// iterator's direction. Random iterators return a single entry.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let step = match &self.state {
                State::Done => return Ok(None),
                State::Start { key, value, hint } => {
                    let (key, value, hint) = (key.clone(), value.clone(), *hint);
                    self.first(&key, value.as_deref(), hint)?
                }
                State::At(pos) => {
                    let pos = pos.clone();
                    self.advance(&pos)?
                }
            };
            match step {
                Step::Entry(key, value, pos) => {
                    self.state = State::At(pos);
                    return Ok(Some((key, value)));
                }
                Step::Wait(pending) => self.tree.wait_for(pending)?,
                Step::End => {
                    self.state = State::Done;
                    return Ok(None);
                }
            }
        }
    }

    /// Ends the iteration. No latch outlives a call to [`IndexIterator::next`],
    /// so closing only drops the remembered position.
    pub fn close(self) {
        trace!(root = %self.root, "blink.iterator_close");
    }

    fn descending(&self) -> bool {
        self.mode.descending()
    }

    fn first(&self, key: &[u8], value: Option<&[u8]>, hint: Option<PageHint>) -> Result<Step> {
        if self.mode == SearchMode::Random {
            let page = self.tree.descend_random(self.root)?;
            let count = page.view().count();
            if count == 0 {
                return Ok(Step::End);
            }
            let index = rand::Rng::gen_range(&mut rand::thread_rng(), 0..count);
            return self.produce(page, index);
        }
        let target = Target {
            key,
            value,
            side: self.mode.side(),
        };
        if let Some(hint) = hint.filter(|_| self.tree.options().page_hints) {
            if let Some(step) = self.try_hint(hint, &target)? {
                self.tree.stats.inc_hint_hits();
                return Ok(step);
            }
            self.tree.stats.inc_hint_misses();
            trace!(page = %hint.page, "blink.hint_miss");
        }
        let probe = if self.mode == SearchMode::Less {
            Probe::below(target)
        } else {
            Probe::at(target)
        };
        let page = self.tree.descend(self.root, &probe, 0, false)?;
        self.scan(page, self.mode, &target)
    }

    fn try_hint(&self, hint: PageHint, target: &Target<'_>) -> Result<Option<Step>> {
        let Some(page) = self.tree.enter(hint.page, self.root, LatchMode::S)? else {
            return Ok(None);
        };
        let view = page.view();
        if view.lsn() != hint.lsn || !page.header()?.is_leaf() {
            return Ok(None);
        }
        let count = view.count();
        match view.search(self.mode, target)?.index {
            Some(idx) if idx > 0 && idx + 1 < count => Ok(Some(self.produce(page, idx)?)),
            _ => Ok(None),
        }
    }

    fn advance(&self, pos: &Position) -> Result<Step> {
        if self.mode == SearchMode::Random {
            return Ok(Step::End);
        }
        let target = Target::exact(&pos.key, Some(&pos.order));
        let search = if self.descending() {
            SearchMode::Less
        } else {
            SearchMode::Greater
        };
        if let Some(page) = self.tree.enter(pos.page, self.root, LatchMode::S)? {
            let view = page.view();
            if view.lsn() == pos.lsn {
                let count = view.count();
                if pos.index >= count {
                    return Err(BlinkError::InvalidPosition {
                        page: pos.page,
                        root: self.root,
                        pos: pos.index,
                    });
                }
                let next = if self.descending() {
                    pos.index.checked_sub(1)
                } else {
                    Some(pos.index + 1).filter(|idx| *idx < count)
                };
                return match next {
                    Some(idx) => self.produce(page, idx),
                    None => self.scan(page, search, &target),
                };
            }
        }
        let probe = if self.descending() {
            Probe::below(target)
        } else {
            Probe::at(target)
        };
        let page = self.tree.descend(self.root, &probe, 0, false)?;
        self.scan(page, search, &target)
    }

    /// Searches `page` and then its neighbours in the iterator's direction
    /// until an entry qualifies or the level ends.
    fn scan(&self, mut page: PageHandle, search: SearchMode, target: &Target<'_>) -> Result<Step> {
        loop {
            if let Some(idx) = page.view().search(search, target)?.index {
                return self.produce(page, idx);
            }
            let header = page.header()?;
            if self.descending() {
                match self.step_left(page, header.previous, target)? {
                    Some(left) => page = left,
                    None => return Ok(Step::End),
                }
            } else {
                let Some(next) = header.next else {
                    return Ok(Step::End);
                };
                drop(page);
                page = match self.tree.enter(next, self.root, LatchMode::S)? {
                    Some(page) => page,
                    None => self.tree.descend(self.root, &Probe::at(*target), 0, false)?,
                };
            }
        }
    }

    /// Moves to the left neighbour of `page`. The back link is trusted only
    /// when the page it names still links forward to `page`; otherwise the
    /// neighbour is found by descending to the point just below the page's
    /// low bound.
    fn step_left(
        &self,
        page: PageHandle,
        previous: Option<PageId>,
        target: &Target<'_>,
    ) -> Result<Option<PageHandle>> {
        let current = page.id;
        drop(page);
        if let Some(prev) = previous {
            if let Some(left) = self.tree.enter(prev, self.root, LatchMode::S)? {
                if left.header()?.next == Some(current) {
                    return Ok(Some(left));
                }
            }
        }
        let (landing, low) = self
            .tree
            .descend_with_low(self.root, &Probe::below(*target), 0)?;
        if landing.id != current {
            return Ok(Some(landing));
        }
        drop(landing);
        let Some(low) = low else {
            return Ok(None);
        };
        let (left, _) = self
            .tree
            .descend_with_low(self.root, &Probe::below(low.target()), 0)?;
        if left.id == current {
            return Err(BlinkError::Corruption("left neighbour search did not move"));
        }
        Ok(Some(left))
    }

    /// Locks and returns slot `idx` of `page`.
    fn produce(&self, page: PageHandle, idx: usize) -> Result<Step> {
        let view = page.view();
        let slot = view.slot(idx)?;
        let order = view.order_of(&slot)?;
        let unique = page.header()?.unique();
        if self.open != OpenMode::Load {
            let kind = match self.open {
                OpenMode::Update => LockKind::Update,
                _ => LockKind::Read,
            };
            let pending = self.tree.lock_at(
                kind,
                LockUnit::Range,
                self.tx,
                self.root,
                slot.key,
                (!unique).then_some(order),
                &view,
                idx + 1,
            )?;
            if let Some(pending) = pending {
                return Ok(Step::Wait(pending));
            }
        }
        let value = self.tree.decode_value(self.tx, &slot)?;
        let pos = Position {
            page: page.id,
            lsn: view.lsn(),
            index: idx,
            key: slot.key.to_vec(),
            order: if unique { Vec::new() } else { order.to_vec() },
        };
        Ok(Step::Entry(slot.key.to_vec(), value, pos))
    }
}
