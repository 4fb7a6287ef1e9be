use std::cmp::Ordering;

use rand::Rng;
use tracing::trace;

use super::BlinkTree;
use crate::storage::blink::handle::{LatchMode, PageHandle};
use crate::storage::blink::page::{compare, Bound, PageRef, Target};
use crate::types::{BlinkError, PageId, Result};

/// Where a descent is headed.
///
/// `at` finds the page whose range holds the target. `below` finds the page
/// holding the point just below the target, i.e. the page whose high key is
/// the first bound at or above it; descending iterators and underflow
/// handling use it to step to the left neighbour of a known page.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Probe<'a> {
    pub target: Target<'a>,
    pub below: bool,
}

impl<'a> Probe<'a> {
    pub fn at(target: Target<'a>) -> Self {
        Self {
            target,
            below: false,
        }
    }

    pub fn below(target: Target<'a>) -> Self {
        Self {
            target,
            below: true,
        }
    }

    /// Index of the branch slot routing this probe; `None` for the low child.
    fn slot(&self, view: &PageRef<'_>) -> Result<Option<usize>> {
        let idx = if self.below {
            view.lower_bound(&self.target)?
        } else {
            view.upper_bound(&self.target)?
        };
        Ok(idx.checked_sub(1))
    }

    /// True when the page's high key says the probe belongs to a right sibling.
    fn past(&self, view: &PageRef<'_>, unique: bool) -> Result<bool> {
        let Some(high) = view.high_key()? else {
            return Ok(false);
        };
        let cmp = compare(&high.key, &high.value, unique, &self.target);
        Ok(if self.below {
            cmp == Ordering::Less
        } else {
            cmp != Ordering::Greater
        })
    }
}

enum Step {
    Done(PageHandle, Option<Bound>),
    Retry,
}

impl BlinkTree {
    /// Descends from `root` to the page at `height` covering `probe`.
    ///
    /// Readers take shared latches. Writers take an update latch at the
    /// target height and leave with it upgraded to exclusive. Only one latch
    /// is held at any time. A page released under the descent restarts it; the
    /// restart budget is bounded, after which the descent fails with an
    /// access error.
    pub(crate) fn descend(
        &self,
        root: PageId,
        probe: &Probe<'_>,
        height: u8,
        write: bool,
    ) -> Result<PageHandle> {
        self.descend_bounded(root, probe, height, write, false)
            .map(|(page, _)| page)
    }

    /// Like [`BlinkTree::descend`], also returning the landing page's low
    /// bound (the high key of its left neighbour); `None` for the leftmost
    /// page of its level.
    pub(crate) fn descend_with_low(
        &self,
        root: PageId,
        probe: &Probe<'_>,
        height: u8,
    ) -> Result<(PageHandle, Option<Bound>)> {
        self.descend_bounded(root, probe, height, false, true)
    }

    fn descend_bounded(
        &self,
        root: PageId,
        probe: &Probe<'_>,
        height: u8,
        write: bool,
        track_low: bool,
    ) -> Result<(PageHandle, Option<Bound>)> {
        for attempt in 0..self.options.descend_attempts {
            match self.try_descend(root, probe, height, write, track_low)? {
                Step::Done(page, low) => return Ok((page, low)),
                Step::Retry => {
                    self.stats.inc_descend_retries();
                    trace!(%root, attempt, "blink.descend_retry");
                }
            }
        }
        Err(BlinkError::Access {
            page: root,
            root,
            op: "descend",
            source: Box::new(BlinkError::Invalid(
                "descent kept reaching released pages",
            )),
        })
    }

    fn try_descend(
        &self,
        root: PageId,
        probe: &Probe<'_>,
        height: u8,
        write: bool,
        track_low: bool,
    ) -> Result<Step> {
        let mut page = self.latch_root(root, if write { LatchMode::U } else { LatchMode::S })?;
        let top = page.header()?;
        if height > top.height {
            return Err(BlinkError::Invalid("descent target is above the root"));
        }
        let unique = top.unique();
        let mut low: Option<Bound> = None;
        loop {
            let header = page.header()?;
            let view = page.view();
            if probe.past(&view, unique)? {
                let next = header
                    .next
                    .ok_or(BlinkError::Corruption("high key without right sibling"))?;
                if track_low {
                    low = view.high_key()?;
                }
                let mode = page.mode();
                drop(page);
                self.stats.inc_move_rights();
                page = match self.enter(next, root, mode)? {
                    Some(page) => page,
                    None => return Ok(Step::Retry),
                };
                continue;
            }
            if header.height == height {
                if header.is_leaf() {
                    self.stats.inc_leaf_searches();
                }
                let page = if write { page.upgrade()? } else { page };
                return Ok(Step::Done(page, low));
            }
            self.stats.inc_branch_searches();
            // Past this level a writer only needs a shared probe.
            if page.mode() == LatchMode::U {
                page = page.downgrade();
            }
            let view = page.view();
            let child = match probe.slot(&view)? {
                Some(idx) => {
                    if track_low {
                        low = Some(view.bound_at(idx)?);
                    }
                    view.child_at(idx)?
                }
                None => header
                    .before
                    .ok_or(BlinkError::Corruption("branch page without low child"))?,
            };
            let mode = if write && header.height == height + 1 {
                LatchMode::U
            } else {
                LatchMode::S
            };
            drop(page);
            page = match self.enter(child, root, mode)? {
                Some(page) => page,
                None => return Ok(Step::Retry),
            };
        }
    }

    /// Descends to a uniformly chosen leaf by picking a random child at every
    /// level. Used for statistics sampling.
    pub(crate) fn descend_random(&self, root: PageId) -> Result<PageHandle> {
        let mut rng = rand::thread_rng();
        for _ in 0..self.options.descend_attempts {
            let mut page = self.latch_root(root, LatchMode::S)?;
            let landed = loop {
                let header = page.header()?;
                if header.is_leaf() {
                    break Some(page);
                }
                let children = page.view().children()?;
                let child = children[rng.gen_range(0..children.len())];
                drop(page);
                match self.enter(child, root, LatchMode::S)? {
                    Some(next) => page = next,
                    None => break None,
                }
            };
            match landed {
                Some(page) => return Ok(page),
                None => self.stats.inc_descend_retries(),
            }
        }
        Err(BlinkError::Access {
            page: root,
            root,
            op: "random descent",
            source: Box::new(BlinkError::Invalid(
                "descent kept reaching released pages",
            )),
        })
    }

    /// Leaf and slot of the first entry at or after `target`, moving right
    /// past pages whose entries all sort before it. The slot equals the page's
    /// count when nothing follows the target in the index.
    pub(crate) fn leaf_for(
        &self,
        root: PageId,
        target: &Target<'_>,
        write: bool,
    ) -> Result<(PageHandle, usize)> {
        let mode = if write { LatchMode::X } else { LatchMode::S };
        let probe = Probe::at(*target);
        let mut page = self.descend(root, &probe, 0, write)?;
        loop {
            let view = page.view();
            let idx = view.lower_bound(target)?;
            let next = page.header()?.next;
            match next {
                Some(next) if idx == view.count() => {
                    drop(page);
                    page = match self.enter(next, root, mode)? {
                        Some(page) => page,
                        None => self.descend(root, &probe, 0, write)?,
                    };
                }
                _ => return Ok((page, idx)),
            }
        }
    }
}
