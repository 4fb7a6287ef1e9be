use tracing::{debug, info};

use super::{blob_id, BlinkTree, LockKind, Logging, OpenMode, Probe};
use crate::storage::blink::handle::LatchMode;
use crate::storage::blink::log::IndexOp;
use crate::storage::blink::page::{
    branch_value, HeaderImage, PageRef, PageType, PointerField, StoredEntry, Target,
    SLOT_EXTERNALIZED,
};
use crate::storage::blink::walker::PageVisitor;
use crate::storage::lock::LockUnit;
use crate::storage::txn::Transaction;
use crate::types::{BlinkError, PageId, Result};

/// What rebalancing one page left behind.
enum Rebalanced {
    Done,
    /// The parent lost a separator and underflowed in turn.
    Parent(PageId),
    /// The root lost its last separator.
    EmptyRoot,
}

impl BlinkTree {
    /// Deletes `key`, or the pair `(key, value)` when a value is given. On a
    /// unique index a given value must match the stored one.
    pub fn delete(
        &self,
        tx: &Transaction,
        root: PageId,
        key: &[u8],
        value: Option<&[u8]>,
        mode: OpenMode,
    ) -> Result<()> {
        let meta = self.meta(root)?;
        let target = match value {
            Some(value) if !meta.unique => Target::exact(key, Some(value)),
            _ => Target::exact(key, None),
        };
        loop {
            let (mut leaf, idx) = self.leaf_for(root, &target, true)?;
            let view = leaf.view();
            if idx >= view.count() {
                return Err(BlinkError::NotFound);
            }
            let slot = view.slot(idx)?;
            let matches = slot.key == key
                && match value {
                    Some(value) if meta.unique => self.decode_value(tx.id(), &slot)? == value,
                    Some(value) => slot.value == value,
                    None => true,
                };
            if !matches {
                return Err(BlinkError::NotFound);
            }
            if mode != OpenMode::Load {
                let pending = self.lock_at(
                    LockKind::Delete,
                    LockUnit::Key,
                    tx.id(),
                    root,
                    key,
                    (!meta.unique).then_some(slot.value),
                    &view,
                    idx + 1,
                )?;
                if let Some(pending) = pending {
                    drop(leaf);
                    self.wait_for(pending)?;
                    continue;
                }
            }
            let entry = slot.to_stored();
            let restore = if slot.externalized() {
                Some(self.decode_value(tx.id(), &slot)?)
            } else {
                None
            };
            let op = IndexOp::Delete {
                entry: entry.clone(),
                restore,
            };
            let lsn = self.log_apply(tx, &mut leaf, root, false, op, Logging::Forward)?;
            let underflow = leaf.id != root && self.underflowed(&leaf.header()?);
            let page = leaf.id;
            drop(leaf);
            if entry.flags & SLOT_EXTERNALIZED != 0 {
                self.release_blob(tx, lsn, &entry.value)?;
            }
            if underflow {
                self.rebalance(tx, root, page)?;
            }
            return Ok(());
        }
    }

    /// Splices underflowed pages out of their levels, walking up while
    /// parents underflow, and collapses the root once it routes to a single
    /// child.
    pub(crate) fn rebalance(&self, tx: &Transaction, root: PageId, page: PageId) -> Result<()> {
        let mut current = page;
        loop {
            match self.rebalance_page(tx, root, current)? {
                Rebalanced::Done => return Ok(()),
                Rebalanced::Parent(parent) => current = parent,
                Rebalanced::EmptyRoot => return self.collapse_root(tx, root),
            }
        }
    }

    /// Removes the separator of an underflowed page from its parent and
    /// merges the page into its left neighbour. When the page is its parent's
    /// low child, which cannot lose its separator, its right sibling under the
    /// same parent is merged into it instead. A page with no separator yet is
    /// left alone, and a refused merge puts the separator back.
    fn rebalance_page(&self, tx: &Transaction, root: PageId, id: PageId) -> Result<Rebalanced> {
        if id == root {
            return Ok(Rebalanced::Done);
        }
        let (high, height, next) = {
            let Some(page) = self.enter(id, root, LatchMode::S)? else {
                return Ok(Rebalanced::Done);
            };
            let header = page.header()?;
            if !self.underflowed(&header) {
                return Ok(Rebalanced::Done);
            }
            let Some(high) = page.view().high_key()? else {
                return Ok(Rebalanced::Done);
            };
            (high, header.height, header.next)
        };

        let target = high.target();
        let mut parent = self.descend(root, &Probe::below(target), height + 1, true)?;
        let view = parent.view();
        let header = parent.header()?;
        let low_child = header
            .before
            .ok_or(BlinkError::Corruption("branch page without low child"))?;
        let (victim, left, bound, entry) = match view.lower_bound(&target)?.checked_sub(1) {
            Some(idx) if view.child_at(idx)? == id => {
                let left = match idx {
                    0 => low_child,
                    _ => view.child_at(idx - 1)?,
                };
                (id, left, view.bound_at(idx)?, view.slot(idx)?.to_stored())
            }
            None if low_child == id => match next {
                Some(next) if header.count > 0 && view.child_at(0)? == next => {
                    (next, id, view.bound_at(0)?, view.slot(0)?.to_stored())
                }
                _ => return Ok(Rebalanced::Done),
            },
            // No separator routes here yet: the split that created the page
            // still has to post it, and it must find the page alive.
            _ => return Ok(Rebalanced::Done),
        };

        let saved = tx.last_lsn();
        let op = IndexOp::Delete {
            entry,
            restore: None,
        };
        self.log_apply(tx, &mut parent, root, true, op, Logging::Forward)?;
        tx.end_nested(&self.wal, saved)?;
        let header = parent.header()?;
        let outcome = if parent.id == root {
            if header.count == 0 {
                Rebalanced::EmptyRoot
            } else {
                Rebalanced::Done
            }
        } else if self.underflowed(&header) {
            Rebalanced::Parent(parent.id)
        } else {
            Rebalanced::Done
        };
        drop(parent);
        if !self.unchain(tx, root, left, victim)? {
            // The page stays in its level, so it gets its separator back.
            debug!(page = %victim, "blink.unchain_refused");
            self.insert_separator(tx, root, height + 1, bound, victim)?;
            return Ok(Rebalanced::Done);
        }
        Ok(outcome)
    }

    /// Merges `victim` into its left neighbour, found by walking right from
    /// `start`, and releases it. Returns false, changing nothing, when the
    /// neighbour cannot be found or cannot absorb the victim.
    pub(crate) fn unchain(
        &self,
        tx: &Transaction,
        root: PageId,
        start: PageId,
        victim: PageId,
    ) -> Result<bool> {
        let mut cursor = start;
        let mut left = loop {
            if cursor == victim {
                return Ok(false);
            }
            let Some(page) = self.enter(cursor, root, LatchMode::X)? else {
                return Ok(false);
            };
            match page.header()?.next {
                Some(next) if next == victim => break page,
                Some(next) => cursor = next,
                None => return Ok(false),
            }
        };
        let Some(mut right) = self.enter(victim, root, LatchMode::X)? else {
            return Ok(false);
        };
        let left_header = left.header()?;
        let right_header = right.header()?;
        if left_header.page_type != right_header.page_type || left_header.height != right_header.height {
            return Ok(false);
        }
        let branch = right_header.page_type == PageType::Branch;
        let left_view = left.view();
        let right_view = right.view();
        let left_high = left_view.high_key()?;
        let pulled_down = match (branch, &left_high) {
            (true, Some(high)) => {
                let child = right_header
                    .before
                    .ok_or(BlinkError::Corruption("branch page without low child"))?;
                Some(StoredEntry {
                    key: high.key.clone(),
                    value: branch_value(child, &high.value),
                    flags: 0,
                })
            }
            (true, None) => return Err(BlinkError::Corruption("left sibling without high key")),
            (false, _) => None,
        };
        let separator = if branch { left_high.as_ref() } else { None };
        if !left_view.mergeable(&right_view, separator, self.options.max_entries_per_page)? {
            return Ok(false);
        }
        let entries = right_view.entries(0..right_header.count)?;
        let right_high = right_view.high_key()?;
        let right_image = right_view.image()?;

        let saved = tx.last_lsn();
        if !entries.is_empty() {
            let op = IndexOp::SeqDelete(entries.clone());
            self.log_apply(tx, &mut right, root, true, op, Logging::Forward)?;
        }
        if let Some(entry) = pulled_down {
            self.log_apply(tx, &mut left, root, true, IndexOp::Insert(entry), Logging::Forward)?;
        }
        if !entries.is_empty() {
            self.log_apply(tx, &mut left, root, true, IndexOp::SeqInsert(entries), Logging::Forward)?;
        }
        let op = IndexOp::HighKey {
            old: left_high,
            new: right_high,
        };
        self.log_apply(tx, &mut left, root, true, op, Logging::Forward)?;
        let op = IndexOp::Pointer {
            field: PointerField::Next,
            old: Some(victim),
            new: right_header.next,
        };
        self.log_apply(tx, &mut left, root, true, op, Logging::Forward)?;
        let op = IndexOp::Format {
            before: right_image,
            after: HeaderImage::free(),
        };
        self.log_apply(tx, &mut right, root, true, op, Logging::Forward)?;
        tx.end_nested(&self.wal, saved)?;
        self.stats.inc_unchains();
        let left_id = left.id;
        debug!(left = %left_id, %victim, height = right_header.height, "blink.unchain");
        drop(right);
        drop(left);

        self.pager.delete_page(victim)?;
        if let (false, Some(next)) = (branch, right_header.next) {
            self.relink_previous(tx, root, next, victim, left_id)?;
        }
        Ok(true)
    }

    /// While the root is a branch without separators whose only child has no
    /// right sibling, moves the child's contents into the root, lowering the
    /// tree by one level each time.
    pub(crate) fn collapse_root(&self, tx: &Transaction, root: PageId) -> Result<()> {
        loop {
            let mut top = self.latch_root(root, LatchMode::X)?;
            let header = top.header()?;
            if header.page_type != PageType::Branch || header.count != 0 {
                return Ok(());
            }
            let child_id = header
                .before
                .ok_or(BlinkError::Corruption("branch page without low child"))?;
            let Some(mut child) = self.enter(child_id, root, LatchMode::X)? else {
                return Ok(());
            };
            let child_header = child.header()?;
            if !child_header.last_in_level() {
                return Ok(());
            }
            let child_view = child.view();
            let entries = child_view.entries(0..child_header.count)?;
            let child_image = child_view.image()?;
            let top_image = top.view().image()?;

            let saved = tx.last_lsn();
            if !entries.is_empty() {
                let op = IndexOp::SeqDelete(entries.clone());
                self.log_apply(tx, &mut child, root, true, op, Logging::Forward)?;
            }
            let op = IndexOp::Format {
                before: child_image.clone(),
                after: HeaderImage::free(),
            };
            self.log_apply(tx, &mut child, root, true, op, Logging::Forward)?;
            let op = IndexOp::Format {
                before: top_image,
                after: HeaderImage {
                    root: Some(root),
                    next: None,
                    previous: None,
                    high_key: None,
                    ..child_image
                },
            };
            self.log_apply(tx, &mut top, root, true, op, Logging::Forward)?;
            if !entries.is_empty() {
                self.log_apply(tx, &mut top, root, true, IndexOp::SeqInsert(entries), Logging::Forward)?;
            }
            tx.end_nested(&self.wal, saved)?;
            self.stats.inc_root_collapses();
            info!(%root, height = child_header.height, "blink.root_collapse");
            drop(child);
            drop(top);
            self.pager.delete_page(child_id)?;
        }
    }

    /// Releases every page of an index and the blobs its leaves reference.
    ///
    /// The page releases form one nested top action, so rolling back the
    /// dropping transaction does not bring the index back. Callers make sure
    /// no other transaction uses the index.
    pub fn drop_index(&self, tx: &Transaction, root: PageId) -> Result<()> {
        let mut collector = PageCollector::default();
        self.walk(root, &mut collector)?;
        let saved = tx.last_lsn();
        for &id in collector.pages.iter().rev() {
            let Some(mut page) = self.enter(id, root, LatchMode::X)? else {
                continue;
            };
            let view = page.view();
            let count = view.count();
            let entries = view.entries(0..count)?;
            let image = view.image()?;
            if !entries.is_empty() {
                self.log_apply(tx, &mut page, root, true, IndexOp::SeqDelete(entries), Logging::Forward)?;
            }
            let op = IndexOp::Format {
                before: image,
                after: HeaderImage::free(),
            };
            self.log_apply(tx, &mut page, root, true, op, Logging::Forward)?;
        }
        let lsn = tx.end_nested(&self.wal, saved)?;
        self.wal.flush_to(lsn)?;
        for blob in &collector.blobs {
            self.blobs.drop_blob(tx.id(), *blob)?;
        }
        for page in &collector.pages {
            self.pager.delete_page(*page)?;
        }
        info!(
            %root,
            pages = collector.pages.len(),
            blobs = collector.blobs.len(),
            "blink.drop_index"
        );
        Ok(())
    }
}

/// Collects page ids and externalized blob ids in walk order.
#[derive(Default)]
struct PageCollector {
    pages: Vec<PageId>,
    blobs: Vec<PageId>,
}

impl PageVisitor for PageCollector {
    fn visit_branch(&mut self, page: PageId, _view: &PageRef<'_>) -> Result<()> {
        self.pages.push(page);
        Ok(())
    }

    fn visit_leaf(&mut self, page: PageId, view: &PageRef<'_>) -> Result<()> {
        self.pages.push(page);
        for idx in 0..view.count() {
            let slot = view.slot(idx)?;
            if slot.externalized() {
                self.blobs.push(blob_id(slot.value)?);
            }
        }
        Ok(())
    }
}
