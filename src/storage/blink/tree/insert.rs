use std::cmp::Ordering;

use tracing::{debug, info};

use super::{BlinkTree, IndexMeta, LockKind, Logging, OpenMode, Probe};
use crate::storage::blink::handle::{LatchMode, PageHandle};
use crate::storage::blink::log::{IndexOp, StoredValue};
use crate::storage::blink::page::{
    branch_value, decode_child, Bound, Header, HeaderImage, PageRef, PageType, PointerField,
    StoredEntry, Target, SLOT_EXTERNALIZED,
};
use crate::storage::lock::LockUnit;
use crate::storage::options::SplitPolicy;
use crate::storage::txn::Transaction;
use crate::types::{BlinkError, PageId, Result};

impl BlinkTree {
    /// Inserts `(key, value)`. Unique indexes reject a second entry for the
    /// key; non-unique indexes reject an identical pair.
    pub fn insert(
        &self,
        tx: &Transaction,
        root: PageId,
        key: &[u8],
        value: &[u8],
        mode: OpenMode,
    ) -> Result<()> {
        let meta = self.meta(root)?;
        let entry = self.encode_entry(tx, &meta, key, value)?;
        match self.insert_stored(tx, root, &meta, entry.clone(), mode, Logging::Forward) {
            Err(err @ BlinkError::Protocol { .. }) => Err(err),
            Err(err) => {
                self.discard_entry(tx, &entry)?;
                Err(err)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Links an entry already in stored form into its leaf, splitting full
    /// pages on the way. Undo of a delete re-enters here with compensation
    /// logging.
    pub(crate) fn insert_stored(
        &self,
        tx: &Transaction,
        root: PageId,
        meta: &IndexMeta,
        entry: StoredEntry,
        mode: OpenMode,
        logging: Logging,
    ) -> Result<()> {
        let target = Target::exact(&entry.key, (!meta.unique).then_some(&entry.value[..]));
        let locking = mode != OpenMode::Load && logging == Logging::Forward;
        loop {
            let mut leaf = self.descend(root, &Probe::at(target), 0, true)?;
            let view = leaf.view();
            let idx = view.lower_bound(&target)?;
            if idx < view.count() && view.compare_at(idx, &target)? == Ordering::Equal {
                return Err(BlinkError::Duplicate { root });
            }
            if locking {
                let value = (!meta.unique).then_some(&entry.value[..]);
                let pending = self.lock_at(
                    LockKind::Insert,
                    LockUnit::Key,
                    tx.id(),
                    root,
                    &entry.key,
                    value,
                    &view,
                    idx,
                )?;
                if let Some(pending) = pending {
                    drop(leaf);
                    self.wait_for(pending)?;
                    continue;
                }
            }
            if self.fits(&view, entry.key.len() + entry.value.len()) {
                self.log_apply(tx, &mut leaf, root, false, IndexOp::Insert(entry), logging)?;
                return Ok(());
            }
            self.split(tx, root, leaf, Some(&target), mode)?;
        }
    }

    /// Replaces the value stored under `key`. When `old` is given the current
    /// value must equal it. On non-unique indexes the update is a delete of
    /// `(key, old)` followed by an insert of `(key, value)`.
    pub fn update(
        &self,
        tx: &Transaction,
        root: PageId,
        key: &[u8],
        value: &[u8],
        old: Option<&[u8]>,
        mode: OpenMode,
    ) -> Result<()> {
        let meta = self.meta(root)?;
        if !meta.unique {
            let old = old.ok_or(BlinkError::Invalid(
                "updating a non-unique index needs the old value",
            ))?;
            self.delete(tx, root, key, Some(old), mode)?;
            return self.insert(tx, root, key, value, mode);
        }
        let entry = self.encode_entry(tx, &meta, key, value)?;
        let new = StoredValue {
            value: entry.value.clone(),
            flags: entry.flags,
        };
        match self.update_unique(tx, root, key, new, old, mode) {
            Err(err @ BlinkError::Protocol { .. }) => Err(err),
            Err(err) => {
                self.discard_entry(tx, &entry)?;
                Err(err)
            }
            Ok(()) => Ok(()),
        }
    }

    fn update_unique(
        &self,
        tx: &Transaction,
        root: PageId,
        key: &[u8],
        new: StoredValue,
        expected: Option<&[u8]>,
        mode: OpenMode,
    ) -> Result<()> {
        let target = Target::exact(key, None);
        loop {
            let mut leaf = self.descend(root, &Probe::at(target), 0, true)?;
            let view = leaf.view();
            let idx = view.find(&target)?.ok_or(BlinkError::NotFound)?;
            let slot = view.slot(idx)?;
            if let Some(expected) = expected {
                if self.decode_value(tx.id(), &slot)? != expected {
                    return Err(BlinkError::NotFound);
                }
            }
            if mode != OpenMode::Load {
                let pending = self.lock_at(
                    LockKind::Update,
                    LockUnit::Key,
                    tx.id(),
                    root,
                    key,
                    None,
                    &view,
                    idx + 1,
                )?;
                if let Some(pending) = pending {
                    drop(leaf);
                    self.wait_for(pending)?;
                    continue;
                }
            }
            let current_len = slot.key.len() + slot.value.len();
            if view.reclaimable() + current_len < key.len() + new.value.len() {
                self.split(tx, root, leaf, Some(&target), mode)?;
                continue;
            }
            let old = StoredValue {
                value: slot.value.to_vec(),
                flags: slot.flags,
            };
            let restore = if slot.externalized() {
                Some(self.decode_value(tx.id(), &slot)?)
            } else {
                None
            };
            let op = IndexOp::Update {
                key: key.to_vec(),
                old: old.clone(),
                new,
                restore,
            };
            let lsn = self.log_apply(tx, &mut leaf, root, false, op, Logging::Forward)?;
            drop(leaf);
            if old.flags & SLOT_EXTERNALIZED != 0 {
                self.release_blob(tx, lsn, &old.value)?;
            }
            return Ok(());
        }
    }

    /// Chooses the first slot that moves to the right half.
    ///
    /// Balanced splits cut at the byte midpoint. An insert appending past the
    /// last entry of a last-in-level page under the compact policy (or any
    /// load) keeps everything but the last entry on the left.
    pub(crate) fn split_position(
        &self,
        view: &PageRef<'_>,
        header: &Header,
        pending: Option<&Target<'_>>,
        mode: OpenMode,
    ) -> Result<usize> {
        let count = header.count;
        if count < 2 {
            return Err(BlinkError::Invalid("page too small to split"));
        }
        let compact = mode == OpenMode::Load || self.options.split_policy == SplitPolicy::Compact;
        if compact && header.last_in_level() {
            if let Some(pending) = pending {
                if view.compare_at(count - 1, pending)? == Ordering::Less {
                    return Ok(count - 1);
                }
            }
        }
        let sizes = (0..count)
            .map(|idx| view.entry_size(idx))
            .collect::<Result<Vec<_>>>()?;
        let total: usize = sizes.iter().sum();
        let mut acc = 0usize;
        let mut cut = count - 1;
        for (idx, size) in sizes.iter().enumerate() {
            acc += size;
            if acc * 2 >= total {
                cut = idx + 1;
                break;
            }
        }
        Ok(cut.clamp(1, count - 1))
    }

    /// Splits a full, exclusively latched page and posts the new separator.
    ///
    /// The split itself is one nested top action: the new right sibling is
    /// formatted and filled, the moved entries leave the page, the page takes
    /// the separator as its high key and links to the sibling. Relinking the
    /// old right neighbour's back pointer and posting the separator to the
    /// parent follow as separate nested actions; between them the sibling is
    /// reachable through the right link alone, which readers tolerate.
    pub(crate) fn split(
        &self,
        tx: &Transaction,
        root: PageId,
        mut page: PageHandle,
        pending: Option<&Target<'_>>,
        mode: OpenMode,
    ) -> Result<()> {
        let header = page.header()?;
        if page.id == root {
            return self.split_root(tx, root, page, &header, pending, mode);
        }
        let saved = tx.last_lsn();
        let view = page.view();
        let count = header.count;
        let cut = self.split_position(&view, &header, pending, mode)?;
        let branch = header.page_type == PageType::Branch;
        let separator = view.bound_at(cut)?;
        let (moved, right_before) = if branch {
            (view.entries(cut + 1..count)?, Some(view.child_at(cut)?))
        } else {
            (view.entries(cut..count)?, None)
        };
        let removed = view.entries(cut..count)?;
        let old_high = view.high_key()?;
        let image = view.image()?;

        let right_id = self.pager.allocate_page(root.container)?;
        {
            let mut right = self.latch_fresh(right_id)?;
            let before = right.view().image()?;
            let after = HeaderImage {
                before: right_before,
                next: header.next,
                previous: (!branch).then_some(page.id),
                high_key: old_high.clone(),
                ..image
            };
            self.log_apply(tx, &mut right, root, true, IndexOp::Format { before, after }, Logging::Forward)?;
            if !moved.is_empty() {
                self.log_apply(tx, &mut right, root, true, IndexOp::SeqInsert(moved), Logging::Forward)?;
            }
        }
        self.log_apply(tx, &mut page, root, true, IndexOp::SeqDelete(removed), Logging::Forward)?;
        self.log_apply(
            tx,
            &mut page,
            root,
            true,
            IndexOp::HighKey {
                old: old_high,
                new: Some(separator.clone()),
            },
            Logging::Forward,
        )?;
        self.log_apply(
            tx,
            &mut page,
            root,
            true,
            IndexOp::Pointer {
                field: PointerField::Next,
                old: header.next,
                new: Some(right_id),
            },
            Logging::Forward,
        )?;
        tx.end_nested(&self.wal, saved)?;
        if branch {
            self.stats.inc_branch_splits();
        } else {
            self.stats.inc_leaf_splits();
        }
        debug!(
            page = %page.id,
            right = %right_id,
            height = header.height,
            moved = count - cut,
            "blink.split"
        );
        let left_id = page.id;
        drop(page);

        if let (false, Some(next)) = (branch, header.next) {
            self.relink_previous(tx, root, next, left_id, right_id)?;
        }
        self.insert_separator(tx, root, header.height + 1, separator, right_id)
    }

    /// Root split: the root keeps its page id, so its entries move into two
    /// fresh children and the root becomes a branch one level higher.
    fn split_root(
        &self,
        tx: &Transaction,
        root: PageId,
        mut page: PageHandle,
        header: &Header,
        pending: Option<&Target<'_>>,
        mode: OpenMode,
    ) -> Result<()> {
        let saved = tx.last_lsn();
        let view = page.view();
        let count = header.count;
        let cut = self.split_position(&view, header, pending, mode)?;
        let branch = header.page_type == PageType::Branch;
        let separator = view.bound_at(cut)?;
        let all = view.entries(0..count)?;
        let left_entries = all[..cut].to_vec();
        let (right_before, right_entries) = if branch {
            (Some(view.child_at(cut)?), all[cut + 1..].to_vec())
        } else {
            (None, all[cut..].to_vec())
        };
        let image = view.image()?;

        let left_id = self.pager.allocate_page(root.container)?;
        let right_id = self.pager.allocate_page(root.container)?;
        let left_image = HeaderImage {
            next: Some(right_id),
            previous: None,
            high_key: Some(separator.clone()),
            ..image.clone()
        };
        let right_image = HeaderImage {
            before: right_before,
            next: None,
            previous: (!branch).then_some(left_id),
            high_key: None,
            ..image.clone()
        };
        self.populate(tx, root, left_id, left_image, left_entries)?;
        self.populate(tx, root, right_id, right_image, right_entries)?;

        self.log_apply(tx, &mut page, root, true, IndexOp::SeqDelete(all), Logging::Forward)?;
        let raised = HeaderImage {
            page_type: PageType::Branch,
            height: header.height + 1,
            before: Some(left_id),
            next: None,
            previous: None,
            high_key: None,
            ..image.clone()
        };
        self.log_apply(
            tx,
            &mut page,
            root,
            true,
            IndexOp::Format {
                before: image,
                after: raised,
            },
            Logging::Forward,
        )?;
        let entry = StoredEntry {
            value: branch_value(right_id, &separator.value),
            key: separator.key,
            flags: 0,
        };
        self.log_apply(tx, &mut page, root, true, IndexOp::Insert(entry), Logging::Forward)?;
        tx.end_nested(&self.wal, saved)?;
        self.stats.inc_root_splits();
        info!(%root, height = header.height + 1, left = %left_id, right = %right_id, "blink.root_split");
        Ok(())
    }

    fn populate(
        &self,
        tx: &Transaction,
        root: PageId,
        id: PageId,
        image: HeaderImage,
        entries: Vec<StoredEntry>,
    ) -> Result<()> {
        let mut page = self.latch_fresh(id)?;
        let before = page.view().image()?;
        self.log_apply(
            tx,
            &mut page,
            root,
            true,
            IndexOp::Format {
                before,
                after: image,
            },
            Logging::Forward,
        )?;
        if !entries.is_empty() {
            self.log_apply(tx, &mut page, root, true, IndexOp::SeqInsert(entries), Logging::Forward)?;
        }
        Ok(())
    }

    /// Points `right`'s back link at `new_left` if it still names `old_left`.
    /// Back links are hints: readers verify them against the forward link, so
    /// a neighbour that changed in the meantime is left alone.
    pub(crate) fn relink_previous(
        &self,
        tx: &Transaction,
        root: PageId,
        right: PageId,
        old_left: PageId,
        new_left: PageId,
    ) -> Result<()> {
        let saved = tx.last_lsn();
        let Some(mut page) = self.enter(right, root, LatchMode::X)? else {
            return Ok(());
        };
        if page.header()?.previous != Some(old_left) {
            return Ok(());
        }
        self.log_apply(
            tx,
            &mut page,
            root,
            true,
            IndexOp::Pointer {
                field: PointerField::Previous,
                old: Some(old_left),
                new: Some(new_left),
            },
            Logging::Forward,
        )?;
        tx.end_nested(&self.wal, saved)?;
        Ok(())
    }

    /// Posts `separator -> child` into the level at `height`, splitting the
    /// parent when it is full. An existing separator equal to the new one is
    /// repointed at `child` instead.
    pub(crate) fn insert_separator(
        &self,
        tx: &Transaction,
        root: PageId,
        height: u8,
        separator: Bound,
        child: PageId,
    ) -> Result<()> {
        let value = branch_value(child, &separator.value);
        let target = separator.target();
        loop {
            let mut parent = self.descend(root, &Probe::at(target), height, true)?;
            let view = parent.view();
            if let Some(idx) = view.find(&target)? {
                let slot = view.slot(idx)?;
                if decode_child(slot.value)? == child {
                    return Ok(());
                }
                let op = IndexOp::Update {
                    key: separator.key.clone(),
                    old: StoredValue {
                        value: slot.value.to_vec(),
                        flags: slot.flags,
                    },
                    new: StoredValue {
                        value,
                        flags: 0,
                    },
                    restore: None,
                };
                let saved = tx.last_lsn();
                self.log_apply(tx, &mut parent, root, true, op, Logging::Forward)?;
                tx.end_nested(&self.wal, saved)?;
                return Ok(());
            }
            if self.fits(&view, separator.key.len() + value.len()) {
                let entry = StoredEntry {
                    key: separator.key.clone(),
                    value,
                    flags: 0,
                };
                let saved = tx.last_lsn();
                self.log_apply(tx, &mut parent, root, true, IndexOp::Insert(entry), Logging::Forward)?;
                tx.end_nested(&self.wal, saved)?;
                return Ok(());
            }
            self.split(tx, root, parent, Some(&target), OpenMode::Update)?;
        }
    }
}
