//! Log records produced by index mutations.
//!
//! Every page mutation is expressed as an [`IndexOp`] on a named page. The
//! same `apply` routine serves the forward operation, redo, and physical undo,
//! so a record always describes exactly what happened to the page bytes.

use std::convert::TryFrom;

use super::page::{
    Bound, FieldType, HeaderImage, PageMut, PageRef, PageType, PointerField, StoredEntry, Target,
    CHILD_LEN,
};
use crate::primitives::bytes::{var, Reader};
use crate::types::{BlinkError, Lsn, PageId, Result, TxId};

const BODY_COMMIT: u8 = 1;
const BODY_END: u8 = 2;
const BODY_ACTION: u8 = 3;
const BODY_COMPENSATION: u8 = 4;

const OP_INSERT: u8 = 1;
const OP_DELETE: u8 = 2;
const OP_UPDATE: u8 = 3;
const OP_SEQ_INSERT: u8 = 4;
const OP_SEQ_DELETE: u8 = 5;
const OP_POINTER: u8 = 6;
const OP_HIGH_KEY: u8 = 7;
const OP_FORMAT: u8 = 8;

/// A stored value together with its slot flags.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredValue {
    /// Stored bytes.
    pub value: Vec<u8>,
    /// Slot flags.
    pub flags: u8,
}

/// One page mutation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IndexOp {
    /// Insert one slot.
    Insert(StoredEntry),
    /// Delete one slot. `restore` carries the logical value when the slot was
    /// externalized, since the blob is dropped with the slot.
    Delete {
        /// Slot removed.
        entry: StoredEntry,
        /// Logical value of an externalized slot.
        restore: Option<Vec<u8>>,
    },
    /// Overwrite the value of one slot.
    Update {
        /// Key of the slot.
        key: Vec<u8>,
        /// Value before.
        old: StoredValue,
        /// Value after.
        new: StoredValue,
        /// Logical old value when the old slot was externalized.
        restore: Option<Vec<u8>>,
    },
    /// Insert a sorted run of slots.
    SeqInsert(Vec<StoredEntry>),
    /// Delete a sorted run of slots.
    SeqDelete(Vec<StoredEntry>),
    /// Change a header pointer.
    Pointer {
        /// Field changed.
        field: PointerField,
        /// Value before.
        old: Option<PageId>,
        /// Value after.
        new: Option<PageId>,
    },
    /// Change the high key.
    HighKey {
        /// High key before.
        old: Option<Bound>,
        /// High key after.
        new: Option<Bound>,
    },
    /// Reset the header and clear every slot.
    Format {
        /// Header before.
        before: HeaderImage,
        /// Header after.
        after: HeaderImage,
    },
}

/// A mutation bound to the page it touched.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageAction {
    /// Page mutated.
    pub page: PageId,
    /// Root of the index the page belongs to.
    pub root: PageId,
    /// Structural actions are undone physically; content actions on leaves are
    /// undone logically by re-locating the key.
    pub structural: bool,
    /// The mutation.
    pub op: IndexOp,
}

/// Record body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogBody {
    /// Transaction committed.
    Commit,
    /// Transaction fully rolled back (or finished after commit).
    End,
    /// A forward page mutation.
    Action(PageAction),
    /// Compensation record. `action` is `None` for a dummy CLR that only moves
    /// the undo chain past a completed structure modification.
    Compensation {
        /// Next record of the transaction still to undo.
        undo_next: Lsn,
        /// Mutation performed by the undo step.
        action: Option<PageAction>,
    },
}

/// A WAL record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogRecord {
    /// Owning transaction.
    pub tx: TxId,
    /// Previous record of the same transaction.
    pub prev_lsn: Lsn,
    /// Body.
    pub body: LogBody,
}

impl IndexOp {
    /// The operation that reverses `self` on the same page.
    pub fn inverse(&self) -> IndexOp {
        match self {
            IndexOp::Insert(entry) => IndexOp::Delete {
                entry: entry.clone(),
                restore: None,
            },
            IndexOp::Delete { entry, .. } => IndexOp::Insert(entry.clone()),
            IndexOp::Update { key, old, new, .. } => IndexOp::Update {
                key: key.clone(),
                old: new.clone(),
                new: old.clone(),
                restore: None,
            },
            IndexOp::SeqInsert(entries) => IndexOp::SeqDelete(entries.clone()),
            IndexOp::SeqDelete(entries) => IndexOp::SeqInsert(entries.clone()),
            IndexOp::Pointer { field, old, new } => IndexOp::Pointer {
                field: *field,
                old: *new,
                new: *old,
            },
            IndexOp::HighKey { old, new } => IndexOp::HighKey {
                old: new.clone(),
                new: old.clone(),
            },
            IndexOp::Format { before, after } => IndexOp::Format {
                before: after.clone(),
                after: before.clone(),
            },
        }
    }

    /// Applies the mutation to a latched page image.
    pub fn apply(&self, page: &mut PageMut<'_>, version: u8) -> Result<()> {
        match self {
            IndexOp::Insert(entry) => insert_entry(page, entry),
            IndexOp::Delete { entry, .. } => delete_entry(page, &entry.key, &entry.value),
            IndexOp::Update { key, old, new, .. } => {
                let idx = locate(&page.as_ref(), key, &old.value)?
                    .ok_or(BlinkError::Corruption("updated slot missing"))?;
                if page.set_value_at(idx, &new.value, new.flags)? {
                    Ok(())
                } else {
                    Err(BlinkError::Corruption("updated value does not fit"))
                }
            }
            IndexOp::SeqInsert(entries) => entries.iter().try_for_each(|e| insert_entry(page, e)),
            IndexOp::SeqDelete(entries) => entries
                .iter()
                .try_for_each(|e| delete_entry(page, &e.key, &e.value)),
            IndexOp::Pointer { field, new, .. } => {
                page.set_pointer(*field, *new);
                Ok(())
            }
            IndexOp::HighKey { new, .. } => {
                if page.set_high_key(new.as_ref())? {
                    Ok(())
                } else {
                    Err(BlinkError::Corruption("high key does not fit"))
                }
            }
            IndexOp::Format { after, .. } => page.format(after, version),
        }
    }
}

/// Slot holding `(key, stored value)` on `page`, comparing by the page's
/// ordering rules.
pub fn locate(page: &PageRef<'_>, key: &[u8], value: &[u8]) -> Result<Option<usize>> {
    let order = ordering_part(page, value)?;
    page.find(&Target::exact(key, Some(order)))
}

fn ordering_part<'v>(page: &PageRef<'_>, value: &'v [u8]) -> Result<&'v [u8]> {
    if page.header()?.page_type == PageType::Branch {
        value
            .get(CHILD_LEN..)
            .ok_or(BlinkError::Corruption("branch value shorter than child pointer"))
    } else {
        Ok(value)
    }
}

fn insert_entry(page: &mut PageMut<'_>, entry: &StoredEntry) -> Result<()> {
    let view = page.as_ref();
    let order = ordering_part(&view, &entry.value)?;
    let idx = view.lower_bound(&Target::exact(&entry.key, Some(order)))?;
    if page.insert_at(idx, &entry.key, &entry.value, entry.flags)? {
        Ok(())
    } else {
        Err(BlinkError::Corruption("logged insert does not fit"))
    }
}

fn delete_entry(page: &mut PageMut<'_>, key: &[u8], value: &[u8]) -> Result<()> {
    let idx = locate(&page.as_ref(), key, value)?
        .ok_or(BlinkError::Corruption("deleted slot missing"))?;
    page.delete_at(idx)
}

fn put_page_id(id: Option<PageId>, out: &mut Vec<u8>) {
    var::encode_u64(id.map(PageId::to_u64).unwrap_or(0), out);
}

fn read_page_id(r: &mut Reader<'_>) -> Result<Option<PageId>> {
    Ok(PageId::from_u64(r.read_var_u64()?))
}

fn read_required_page(r: &mut Reader<'_>) -> Result<PageId> {
    read_page_id(r)?.ok_or(BlinkError::Corruption("null page id in log record"))
}

fn put_entry(entry: &StoredEntry, out: &mut Vec<u8>) {
    var::encode_bytes(&entry.key, out);
    var::encode_bytes(&entry.value, out);
    out.push(entry.flags);
}

fn read_entry(r: &mut Reader<'_>) -> Result<StoredEntry> {
    Ok(StoredEntry {
        key: r.read_bytes()?,
        value: r.read_bytes()?,
        flags: r.read_u8()?,
    })
}

fn put_entries(entries: &[StoredEntry], out: &mut Vec<u8>) {
    var::encode_u64(entries.len() as u64, out);
    for entry in entries {
        put_entry(entry, out);
    }
}

fn read_entries(r: &mut Reader<'_>) -> Result<Vec<StoredEntry>> {
    let n = r.read_var_u64()? as usize;
    if n > r.remaining() {
        return Err(BlinkError::Corruption("entry count exceeds record"));
    }
    (0..n).map(|_| read_entry(r)).collect()
}

fn put_bound(bound: Option<&Bound>, out: &mut Vec<u8>) {
    match bound {
        Some(bound) => {
            out.push(1);
            var::encode_bytes(&bound.key, out);
            var::encode_bytes(&bound.value, out);
        }
        None => out.push(0),
    }
}

fn read_bound(r: &mut Reader<'_>) -> Result<Option<Bound>> {
    match r.read_u8()? {
        0 => Ok(None),
        1 => Ok(Some(Bound {
            key: r.read_bytes()?,
            value: r.read_bytes()?,
        })),
        _ => Err(BlinkError::Corruption("invalid bound tag")),
    }
}

fn put_image(image: &HeaderImage, out: &mut Vec<u8>) {
    out.push(image.page_type as u8);
    out.push(image.key_type as u8);
    out.push(image.value_type as u8);
    out.push(image.unique as u8 | (image.compressed as u8) << 1);
    out.push(image.height);
    put_page_id(image.root, out);
    put_page_id(image.before, out);
    put_page_id(image.next, out);
    put_page_id(image.previous, out);
    put_bound(image.high_key.as_ref(), out);
}

fn read_image(r: &mut Reader<'_>) -> Result<HeaderImage> {
    let page_type = PageType::try_from(r.read_u8()?)?;
    let key_type = FieldType::try_from(r.read_u8()?)?;
    let value_type = FieldType::try_from(r.read_u8()?)?;
    let flags = r.read_u8()?;
    Ok(HeaderImage {
        page_type,
        key_type,
        value_type,
        unique: flags & 1 != 0,
        compressed: flags & 2 != 0,
        height: r.read_u8()?,
        root: read_page_id(r)?,
        before: read_page_id(r)?,
        next: read_page_id(r)?,
        previous: read_page_id(r)?,
        high_key: read_bound(r)?,
    })
}

fn put_op(op: &IndexOp, out: &mut Vec<u8>) {
    match op {
        IndexOp::Insert(entry) => {
            out.push(OP_INSERT);
            put_entry(entry, out);
        }
        IndexOp::Delete { entry, restore } => {
            out.push(OP_DELETE);
            put_entry(entry, out);
            var::encode_opt_bytes(restore.as_deref(), out);
        }
        IndexOp::Update {
            key,
            old,
            new,
            restore,
        } => {
            out.push(OP_UPDATE);
            var::encode_bytes(key, out);
            var::encode_bytes(&old.value, out);
            out.push(old.flags);
            var::encode_bytes(&new.value, out);
            out.push(new.flags);
            var::encode_opt_bytes(restore.as_deref(), out);
        }
        IndexOp::SeqInsert(entries) => {
            out.push(OP_SEQ_INSERT);
            put_entries(entries, out);
        }
        IndexOp::SeqDelete(entries) => {
            out.push(OP_SEQ_DELETE);
            put_entries(entries, out);
        }
        IndexOp::Pointer { field, old, new } => {
            out.push(OP_POINTER);
            out.push(match field {
                PointerField::Before => 0,
                PointerField::Next => 1,
                PointerField::Previous => 2,
            });
            put_page_id(*old, out);
            put_page_id(*new, out);
        }
        IndexOp::HighKey { old, new } => {
            out.push(OP_HIGH_KEY);
            put_bound(old.as_ref(), out);
            put_bound(new.as_ref(), out);
        }
        IndexOp::Format { before, after } => {
            out.push(OP_FORMAT);
            put_image(before, out);
            put_image(after, out);
        }
    }
}

fn read_op(r: &mut Reader<'_>) -> Result<IndexOp> {
    Ok(match r.read_u8()? {
        OP_INSERT => IndexOp::Insert(read_entry(r)?),
        OP_DELETE => IndexOp::Delete {
            entry: read_entry(r)?,
            restore: r.read_opt_bytes()?,
        },
        OP_UPDATE => IndexOp::Update {
            key: r.read_bytes()?,
            old: StoredValue {
                value: r.read_bytes()?,
                flags: r.read_u8()?,
            },
            new: StoredValue {
                value: r.read_bytes()?,
                flags: r.read_u8()?,
            },
            restore: r.read_opt_bytes()?,
        },
        OP_SEQ_INSERT => IndexOp::SeqInsert(read_entries(r)?),
        OP_SEQ_DELETE => IndexOp::SeqDelete(read_entries(r)?),
        OP_POINTER => IndexOp::Pointer {
            field: match r.read_u8()? {
                0 => PointerField::Before,
                1 => PointerField::Next,
                2 => PointerField::Previous,
                _ => return Err(BlinkError::Corruption("unknown pointer field")),
            },
            old: read_page_id(r)?,
            new: read_page_id(r)?,
        },
        OP_HIGH_KEY => IndexOp::HighKey {
            old: read_bound(r)?,
            new: read_bound(r)?,
        },
        OP_FORMAT => IndexOp::Format {
            before: read_image(r)?,
            after: read_image(r)?,
        },
        _ => return Err(BlinkError::Corruption("unknown index op")),
    })
}

fn put_action(action: &PageAction, out: &mut Vec<u8>) {
    put_page_id(Some(action.page), out);
    put_page_id(Some(action.root), out);
    out.push(action.structural as u8);
    put_op(&action.op, out);
}

fn read_action(r: &mut Reader<'_>) -> Result<PageAction> {
    Ok(PageAction {
        page: read_required_page(r)?,
        root: read_required_page(r)?,
        structural: r.read_u8()? != 0,
        op: read_op(r)?,
    })
}

impl LogRecord {
    /// Serializes the record.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        var::encode_u64(self.tx.0, &mut out);
        var::encode_u64(self.prev_lsn.0, &mut out);
        match &self.body {
            LogBody::Commit => out.push(BODY_COMMIT),
            LogBody::End => out.push(BODY_END),
            LogBody::Action(action) => {
                out.push(BODY_ACTION);
                put_action(action, &mut out);
            }
            LogBody::Compensation { undo_next, action } => {
                out.push(BODY_COMPENSATION);
                var::encode_u64(undo_next.0, &mut out);
                match action {
                    Some(action) => {
                        out.push(1);
                        put_action(action, &mut out);
                    }
                    None => out.push(0),
                }
            }
        }
        out
    }

    /// Parses a record produced by [`LogRecord::encode`].
    pub fn decode(src: &[u8]) -> Result<Self> {
        let mut r = Reader::new(src);
        let tx = TxId(r.read_var_u64()?);
        let prev_lsn = Lsn(r.read_var_u64()?);
        let body = match r.read_u8()? {
            BODY_COMMIT => LogBody::Commit,
            BODY_END => LogBody::End,
            BODY_ACTION => LogBody::Action(read_action(&mut r)?),
            BODY_COMPENSATION => {
                let undo_next = Lsn(r.read_var_u64()?);
                let action = match r.read_u8()? {
                    0 => None,
                    1 => Some(read_action(&mut r)?),
                    _ => return Err(BlinkError::Corruption("invalid compensation tag")),
                };
                LogBody::Compensation { undo_next, action }
            }
            _ => return Err(BlinkError::Corruption("unknown log body")),
        };
        r.finish()?;
        Ok(Self { tx, prev_lsn, body })
    }

    /// The page action carried by the record, if any.
    pub fn action(&self) -> Option<&PageAction> {
        match &self.body {
            LogBody::Action(action) => Some(action),
            LogBody::Compensation { action, .. } => action.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::blink::page::{branch_value, PageRef};

    const ROOT: PageId = PageId::new(1, 1);

    fn entry(key: &[u8], value: &[u8]) -> StoredEntry {
        StoredEntry {
            key: key.to_vec(),
            value: value.to_vec(),
            flags: 0,
        }
    }

    fn leaf(buf: &mut [u8]) -> Result<()> {
        let image = HeaderImage {
            page_type: PageType::Leaf,
            unique: true,
            root: Some(ROOT),
            ..HeaderImage::free()
        };
        PageMut::new(buf).format(&image, 1)
    }

    #[test]
    fn records_survive_encoding() -> Result<()> {
        let records = vec![
            LogRecord {
                tx: TxId(3),
                prev_lsn: Lsn(9),
                body: LogBody::Action(PageAction {
                    page: PageId::new(1, 4),
                    root: ROOT,
                    structural: true,
                    op: IndexOp::Format {
                        before: HeaderImage::free(),
                        after: HeaderImage {
                            page_type: PageType::Branch,
                            key_type: FieldType::I64,
                            height: 1,
                            root: Some(ROOT),
                            before: Some(PageId::new(1, 2)),
                            high_key: Some(Bound::new(b"k".to_vec(), b"v".to_vec())),
                            ..HeaderImage::free()
                        },
                    },
                }),
            },
            LogRecord {
                tx: TxId(3),
                prev_lsn: Lsn(10),
                body: LogBody::Compensation {
                    undo_next: Lsn(2),
                    action: None,
                },
            },
            LogRecord {
                tx: TxId(4),
                prev_lsn: Lsn(0),
                body: LogBody::Action(PageAction {
                    page: ROOT,
                    root: ROOT,
                    structural: false,
                    op: IndexOp::Update {
                        key: b"a".to_vec(),
                        old: StoredValue {
                            value: vec![0; 8],
                            flags: 1,
                        },
                        new: StoredValue {
                            value: b"new".to_vec(),
                            flags: 0,
                        },
                        restore: Some(b"old logical".to_vec()),
                    },
                }),
            },
            LogRecord {
                tx: TxId(4),
                prev_lsn: Lsn(12),
                body: LogBody::Commit,
            },
        ];
        for record in records {
            assert_eq!(LogRecord::decode(&record.encode())?, record);
        }
        Ok(())
    }

    #[test]
    fn truncated_record_is_corruption() {
        let record = LogRecord {
            tx: TxId(1),
            prev_lsn: Lsn(0),
            body: LogBody::Action(PageAction {
                page: ROOT,
                root: ROOT,
                structural: false,
                op: IndexOp::Insert(entry(b"key", b"value")),
            }),
        };
        let bytes = record.encode();
        assert!(matches!(
            LogRecord::decode(&bytes[..bytes.len() - 2]),
            Err(BlinkError::Corruption(_))
        ));
    }

    #[test]
    fn op_then_inverse_restores_page() -> Result<()> {
        let mut buf = vec![0u8; 512];
        leaf(&mut buf)?;
        let mut page = PageMut::new(&mut buf);
        IndexOp::SeqInsert(vec![entry(b"a", b"1"), entry(b"c", b"3")]).apply(&mut page, 1)?;
        let original = page.as_ref().entries(0..2)?;

        let ops = [
            IndexOp::Insert(entry(b"b", b"2")),
            IndexOp::Update {
                key: b"a".to_vec(),
                old: StoredValue {
                    value: b"1".to_vec(),
                    flags: 0,
                },
                new: StoredValue {
                    value: b"one".to_vec(),
                    flags: 0,
                },
                restore: None,
            },
            IndexOp::HighKey {
                old: None,
                new: Some(Bound::new(b"m".to_vec(), Vec::new())),
            },
            IndexOp::Pointer {
                field: PointerField::Next,
                old: None,
                new: Some(PageId::new(1, 7)),
            },
        ];
        for op in &ops {
            op.apply(&mut page, 1)?;
        }
        assert_eq!(page.as_ref().count(), 3);
        for op in ops.iter().rev() {
            op.inverse().apply(&mut page, 1)?;
        }
        let view = page.as_ref();
        assert_eq!(view.entries(0..view.count())?, original);
        assert_eq!(view.high_key()?, None);
        assert_eq!(view.header()?.next, None);
        Ok(())
    }

    #[test]
    fn branch_entries_locate_by_separator() -> Result<()> {
        let mut buf = vec![0u8; 512];
        let image = HeaderImage {
            page_type: PageType::Branch,
            height: 1,
            root: Some(ROOT),
            before: Some(PageId::new(1, 2)),
            ..HeaderImage::free()
        };
        let mut page = PageMut::new(&mut buf);
        page.format(&image, 1)?;
        let sep = StoredEntry {
            key: b"k".to_vec(),
            value: branch_value(PageId::new(1, 3), b"v1"),
            flags: 0,
        };
        IndexOp::Insert(sep.clone()).apply(&mut page, 1)?;
        let view = PageRef::new(&buf);
        assert_eq!(locate(&view, b"k", &sep.value)?, Some(0));
        assert_eq!(
            locate(&view, b"k", &branch_value(PageId::new(1, 9), b"v1"))?,
            Some(0)
        );
        assert_eq!(locate(&view, b"k", &branch_value(PageId::new(1, 3), b"v2"))?, None);
        Ok(())
    }
}
