use std::cmp::Ordering;

use super::{BlinkTree, Logging, OpenMode};
use crate::storage::blink::handle::{LatchMode, PageHandle};
use crate::storage::blink::log::{IndexOp, LogRecord, PageAction, StoredValue};
use crate::storage::blink::page::{StoredEntry, Target, SLOT_EXTERNALIZED};
use crate::storage::txn::Transaction;
use crate::types::{BlinkError, Lsn, PageId, Result};

impl BlinkTree {
    /// Reverses the forward action logged at `lsn` and writes its
    /// compensation record, chained past `record.prev_lsn`.
    ///
    /// Structural actions are reversed physically on the page they name.
    /// Content actions on leaves are reversed logically: the key is located
    /// afresh, since splits and merges by other transactions may have moved
    /// it since.
    pub(crate) fn undo_action(
        &self,
        tx: &Transaction,
        lsn: Lsn,
        record: &LogRecord,
        action: &PageAction,
    ) -> Result<()> {
        let undo_next = record.prev_lsn;
        if action.structural {
            return self.undo_physical(tx, lsn, action, undo_next);
        }
        match &action.op {
            IndexOp::Insert(entry) => self.undo_insert(tx, lsn, action.root, entry, undo_next),
            IndexOp::Delete { entry, restore } => {
                self.undo_delete(tx, lsn, action.root, entry, restore.as_deref(), undo_next)
            }
            IndexOp::Update {
                key, old, restore, ..
            } => self.undo_update(tx, lsn, action.root, key, old, restore.as_deref(), undo_next),
            _ => self.undo_physical(tx, lsn, action, undo_next),
        }
    }

    fn undo_physical(
        &self,
        tx: &Transaction,
        lsn: Lsn,
        action: &PageAction,
        undo_next: Lsn,
    ) -> Result<()> {
        let frame = self.pager.fix_page(action.page).map_err(|_| BlinkError::Protocol {
            lsn,
            page: action.page,
            reason: "page named by a structural record is gone",
        })?;
        let mut page = PageHandle::acquire(&frame, LatchMode::X);
        self.log_apply(
            tx,
            &mut page,
            action.root,
            true,
            action.op.inverse(),
            Logging::Undo(undo_next),
        )?;
        Ok(())
    }

    fn undo_insert(
        &self,
        tx: &Transaction,
        lsn: Lsn,
        root: PageId,
        entry: &StoredEntry,
        undo_next: Lsn,
    ) -> Result<()> {
        let meta = self.meta(root)?;
        let target = Target::exact(&entry.key, (!meta.unique).then_some(&entry.value[..]));
        let (mut leaf, idx) = self.leaf_for(root, &target, true)?;
        let view = leaf.view();
        if idx >= view.count() || view.compare_at(idx, &target)? != Ordering::Equal {
            return Err(BlinkError::Protocol {
                lsn,
                page: leaf.id,
                reason: "inserted entry missing during undo",
            });
        }
        let current = view.slot(idx)?.to_stored();
        let op = IndexOp::Delete {
            entry: current.clone(),
            restore: None,
        };
        let clr = self.log_apply(tx, &mut leaf, root, false, op, Logging::Undo(undo_next))?;
        drop(leaf);
        if current.flags & SLOT_EXTERNALIZED != 0 {
            self.release_blob(tx, clr, &current.value)?;
        }
        Ok(())
    }

    fn undo_delete(
        &self,
        tx: &Transaction,
        lsn: Lsn,
        root: PageId,
        entry: &StoredEntry,
        restore: Option<&[u8]>,
        undo_next: Lsn,
    ) -> Result<()> {
        let meta = self.meta(root)?;
        let stored = match restore {
            Some(value) => StoredEntry {
                key: entry.key.clone(),
                value: self.blobs.create(tx.id(), value)?.to_u64().to_be_bytes().to_vec(),
                flags: SLOT_EXTERNALIZED,
            },
            None => entry.clone(),
        };
        self.insert_stored(tx, root, &meta, stored, OpenMode::Update, Logging::Undo(undo_next))
            .map_err(|err| match err {
                BlinkError::Duplicate { root } => BlinkError::Protocol {
                    lsn,
                    page: root,
                    reason: "deleted entry reappeared before its undo",
                },
                other => other,
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn undo_update(
        &self,
        tx: &Transaction,
        lsn: Lsn,
        root: PageId,
        key: &[u8],
        old: &StoredValue,
        restore: Option<&[u8]>,
        undo_next: Lsn,
    ) -> Result<()> {
        let restored = match restore {
            Some(value) => StoredValue {
                value: self.blobs.create(tx.id(), value)?.to_u64().to_be_bytes().to_vec(),
                flags: SLOT_EXTERNALIZED,
            },
            None => old.clone(),
        };
        let target = Target::exact(key, None);
        loop {
            let (mut leaf, idx) = self.leaf_for(root, &target, true)?;
            let view = leaf.view();
            if idx >= view.count() || view.compare_at(idx, &target)? != Ordering::Equal {
                return Err(BlinkError::Protocol {
                    lsn,
                    page: leaf.id,
                    reason: "updated entry missing during undo",
                });
            }
            let slot = view.slot(idx)?;
            if view.reclaimable() + slot.key.len() + slot.value.len() < key.len() + restored.value.len() {
                self.split(tx, root, leaf, Some(&target), OpenMode::Update)?;
                continue;
            }
            let current = StoredValue {
                value: slot.value.to_vec(),
                flags: slot.flags,
            };
            let op = IndexOp::Update {
                key: key.to_vec(),
                old: current.clone(),
                new: restored,
                restore: None,
            };
            let clr = self.log_apply(tx, &mut leaf, root, false, op, Logging::Undo(undo_next))?;
            drop(leaf);
            if current.flags & SLOT_EXTERNALIZED != 0 {
                self.release_blob(tx, clr, &current.value)?;
            }
            return Ok(());
        }
    }
}
