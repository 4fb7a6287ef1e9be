use tracing::trace;

use super::{BlinkTree, IndexMeta};
use crate::storage::blink::page::{
    Slot, StoredEntry, CHILD_LEN, SLOT_COMPRESSED, SLOT_EXTERNALIZED,
};
use crate::storage::txn::Transaction;
use crate::types::{BlinkError, Lsn, PageId, Result, TxId};

/// Values shorter than this are never worth compressing.
const MIN_COMPRESS_LEN: usize = 64;

/// Decodes the blob id held by an externalized slot.
pub(crate) fn blob_id(stored: &[u8]) -> Result<PageId> {
    let raw: [u8; 8] = stored
        .try_into()
        .map_err(|_| BlinkError::Corruption("externalized value is not a blob id"))?;
    PageId::from_u64(u64::from_be_bytes(raw)).ok_or(BlinkError::Corruption("null blob id"))
}

impl BlinkTree {
    /// Largest key plus stored value kept inline: an eighth of the usable page.
    pub(crate) fn max_inline(&self) -> usize {
        self.options.usable_page_bytes() / 8
    }

    fn externalize_threshold(&self) -> usize {
        self.options.usable_page_bytes() * self.options.externalize_percent as usize / 100
    }

    /// Keys must leave room for at least a blob id next to them.
    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() + CHILD_LEN > self.max_inline() {
            return Err(BlinkError::Invalid("key too large for the page size"));
        }
        Ok(())
    }

    /// Turns a logical entry into its stored form. On unique indexes a value
    /// may be compressed, and it moves to the blob store when it is over the
    /// externalization threshold or would push the entry past the inline bound.
    pub(crate) fn encode_entry(
        &self,
        tx: &Transaction,
        meta: &IndexMeta,
        key: &[u8],
        value: &[u8],
    ) -> Result<StoredEntry> {
        self.check_key(key)?;
        if !meta.unique {
            if key.len() + value.len() > self.max_inline() {
                return Err(BlinkError::Invalid("entry too large for a non-unique index"));
            }
            return Ok(StoredEntry {
                key: key.to_vec(),
                value: value.to_vec(),
                flags: 0,
            });
        }
        let mut stored = value.to_vec();
        let mut flags = 0u8;
        if meta.compressed && value.len() >= MIN_COMPRESS_LEN {
            let packed = snap::raw::Encoder::new()
                .compress_vec(value)
                .map_err(|_| BlinkError::Invalid("value cannot be compressed"))?;
            if packed.len() < value.len() {
                stored = packed;
                flags = SLOT_COMPRESSED;
            }
        }
        if stored.len() > self.externalize_threshold() || key.len() + stored.len() > self.max_inline()
        {
            let blob = self.blobs.create(tx.id(), value)?;
            self.stats.inc_externalized_values();
            trace!(tx = %tx.id(), %blob, len = value.len(), "blink.externalize");
            stored = blob.to_u64().to_be_bytes().to_vec();
            flags = SLOT_EXTERNALIZED;
        }
        Ok(StoredEntry {
            key: key.to_vec(),
            value: stored,
            flags,
        })
    }

    /// Logical value of a slot.
    pub(crate) fn decode_value(&self, tx: TxId, slot: &Slot<'_>) -> Result<Vec<u8>> {
        self.logical_value(tx, slot.value, slot.flags)
    }

    pub(crate) fn logical_value(&self, tx: TxId, stored: &[u8], flags: u8) -> Result<Vec<u8>> {
        if flags & SLOT_EXTERNALIZED != 0 {
            return self.blobs.read(tx, blob_id(stored)?);
        }
        if flags & SLOT_COMPRESSED != 0 {
            return snap::raw::Decoder::new()
                .decompress_vec(stored)
                .map_err(|_| BlinkError::Corruption("compressed value does not decode"));
        }
        Ok(stored.to_vec())
    }

    /// Drops the blob of an externalized value once the record that unlinked
    /// it is durable, so redo never resurrects a slot pointing at nothing.
    pub(crate) fn release_blob(&self, tx: &Transaction, lsn: Lsn, stored: &[u8]) -> Result<()> {
        self.wal.flush_to(lsn)?;
        self.blobs.drop_blob(tx.id(), blob_id(stored)?)
    }

    /// Drops the blob of an entry that was never linked into the tree.
    pub(crate) fn discard_entry(&self, tx: &Transaction, entry: &StoredEntry) -> Result<()> {
        if entry.flags & SLOT_EXTERNALIZED != 0 {
            self.blobs.drop_blob(tx.id(), blob_id(&entry.value)?)?;
        }
        Ok(())
    }
}
