use super::{BlinkTree, LockKind, OpenMode};
use crate::storage::blink::page::Target;
use crate::storage::lock::LockUnit;
use crate::types::{PageId, Result, TxId};

impl BlinkTree {
    /// Point read. Returns the value stored under `key`, or the first value
    /// of its group on a non-unique index, or `None` when the key is absent.
    ///
    /// A found entry is locked as a key; an absent key locks the gap up to
    /// the entry that follows it so a later insert of the key is a phantom
    /// the lock service can see.
    pub fn read(
        &self,
        tx: TxId,
        root: PageId,
        key: &[u8],
        mode: OpenMode,
    ) -> Result<Option<Vec<u8>>> {
        let target = Target::exact(key, None);
        loop {
            let (leaf, idx) = self.leaf_for(root, &target, false)?;
            let view = leaf.view();
            let found = idx < view.count() && view.slot(idx)?.key == key;
            if mode != OpenMode::Load {
                let kind = match mode {
                    OpenMode::Update => LockKind::Update,
                    _ => LockKind::Read,
                };
                let (unit, next) = if found {
                    (LockUnit::Key, idx + 1)
                } else {
                    (LockUnit::Range, idx)
                };
                if let Some(pending) = self.lock_at(kind, unit, tx, root, key, None, &view, next)? {
                    drop(leaf);
                    self.wait_for(pending)?;
                    continue;
                }
            }
            if !found {
                return Ok(None);
            }
            let slot = view.slot(idx)?;
            return self.decode_value(tx, &slot).map(Some);
        }
    }
}
