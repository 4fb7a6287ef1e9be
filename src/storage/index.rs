use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::primitives::bytes::ord;
use crate::storage::blink::page::{Bound, FieldType, PageRef, SearchMode};
use crate::storage::blink::{BlinkTree, IndexIterator, OpenMode, PageHint, PageVisitor};
use crate::storage::txn::Transaction;
use crate::types::{BlinkError, PageId, Result, TxId};

/// Operation surface over the B-link engine.
///
/// Every call checks that the transaction is still active. Writes run in
/// update mode; reads take read locks unless an iterator is opened otherwise.
pub struct IndexManager {
    tree: Arc<BlinkTree>,
}

impl IndexManager {
    /// Wraps an engine.
    pub fn new(tree: Arc<BlinkTree>) -> Self {
        Self { tree }
    }

    /// The engine behind the façade.
    pub fn tree(&self) -> &Arc<BlinkTree> {
        &self.tree
    }

    /// Creates an index in `container` and returns its permanent root page.
    pub fn create_index(
        &self,
        tx: &Transaction,
        container: u32,
        key_type: FieldType,
        value_type: FieldType,
        unique: bool,
        compressed: bool,
    ) -> Result<PageId> {
        tx.ensure_active()?;
        self.tree
            .create_index(tx, container, key_type, value_type, unique, compressed)
    }

    /// Releases every page and blob of an index.
    pub fn drop_index(&self, tx: &Transaction, root: PageId) -> Result<()> {
        tx.ensure_active()?;
        self.tree.drop_index(tx, root)
    }

    /// Point read.
    pub fn read(&self, tx: &Transaction, root: PageId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        tx.ensure_active()?;
        self.tree.read(tx.id(), root, key, OpenMode::Read)
    }

    /// Inserts an entry.
    pub fn insert(&self, tx: &Transaction, root: PageId, key: &[u8], value: &[u8]) -> Result<()> {
        tx.ensure_active()?;
        self.tree.insert(tx, root, key, value, OpenMode::Update)
    }

    /// Replaces the value under `key`; `old`, when given, must match the
    /// current value. Non-unique indexes require `old`.
    pub fn update(
        &self,
        tx: &Transaction,
        root: PageId,
        key: &[u8],
        value: &[u8],
        old: Option<&[u8]>,
    ) -> Result<()> {
        tx.ensure_active()?;
        self.tree.update(tx, root, key, value, old, OpenMode::Update)
    }

    /// Deletes an entry. `value` selects the entry on non-unique indexes and
    /// must match the stored value when given on unique ones.
    pub fn delete(
        &self,
        tx: &Transaction,
        root: PageId,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        tx.ensure_active()?;
        self.tree.delete(tx, root, key, value, OpenMode::Update)
    }

    /// Opens an iterator positioned by `mode` relative to `(key, value)`.
    /// A hint from an earlier iterator lets the first call skip the descent.
    #[allow(clippy::too_many_arguments)]
    pub fn open<'a>(
        &'a self,
        tx: &Transaction,
        root: PageId,
        mode: SearchMode,
        key: &[u8],
        value: Option<&[u8]>,
        open: OpenMode,
        hint: Option<PageHint>,
    ) -> Result<IndexIterator<'a>> {
        tx.ensure_active()?;
        self.tree.meta(root)?;
        Ok(IndexIterator::new(
            &self.tree,
            tx.id(),
            root,
            mode,
            key,
            value,
            open,
            hint,
        ))
    }

    /// Starts an ascending bulk load into `root`.
    pub fn open_loader<'a>(&'a self, tx: &'a Transaction, root: PageId) -> Result<BulkLoader<'a>> {
        tx.ensure_active()?;
        let meta = self.tree.meta(root)?;
        Ok(BulkLoader {
            tree: &self.tree,
            tx,
            root,
            unique: meta.unique,
            last: None,
            loaded: 0,
        })
    }

    /// Visits every page of an index.
    pub fn walk(&self, root: PageId, visitor: &mut dyn PageVisitor) -> Result<()> {
        self.tree.walk(root, visitor)
    }

    /// Writes every leaf entry in key order, one per line, rendered by the
    /// index's key and value types. Returns the number of entries written.
    pub fn dump(&self, tx: &Transaction, root: PageId, out: &mut dyn io::Write) -> Result<usize> {
        let meta = self.tree.meta(root)?;
        writeln!(
            out,
            "index {root} unique={} compressed={} height={}",
            meta.unique, meta.compressed, meta.height
        )?;
        let mut dumper = Dumper {
            tree: &self.tree,
            tx: tx.id(),
            key_type: meta.key_type,
            value_type: meta.value_type,
            out,
            entries: 0,
        };
        self.tree.walk(root, &mut dumper)?;
        Ok(dumper.entries)
    }

    /// Checks ordering, high-key bounds, and that every separator and right
    /// link names a live page. Meant for an index with no writers running.
    pub fn verify(&self, root: PageId) -> Result<VerifyReport> {
        let mut verifier = Verifier::default();
        self.tree.walk(root, &mut verifier)?;
        debug!(%root, pages = verifier.report.pages, entries = verifier.report.entries, "index.verify");
        Ok(verifier.report)
    }
}

/// Loader for ascending input: no key-range locks, compact splits at the
/// right edge of each level.
pub struct BulkLoader<'a> {
    tree: &'a BlinkTree,
    tx: &'a Transaction,
    root: PageId,
    unique: bool,
    last: Option<(Vec<u8>, Vec<u8>)>,
    loaded: usize,
}

impl BulkLoader<'_> {
    /// Appends one entry. Keys must ascend strictly; non-unique indexes
    /// order equal keys by value.
    pub fn push(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if let Some((last_key, last_value)) = &self.last {
            let ascending = match key.cmp(last_key) {
                Ordering::Greater => true,
                Ordering::Equal => !self.unique && value > last_value.as_slice(),
                Ordering::Less => false,
            };
            if !ascending {
                return Err(BlinkError::Invalid("bulk load input must ascend strictly"));
            }
        }
        self.tree
            .insert(self.tx, self.root, key, value, OpenMode::Load)?;
        let order = if self.unique { Vec::new() } else { value.to_vec() };
        self.last = Some((key.to_vec(), order));
        self.loaded += 1;
        Ok(())
    }

    /// Entries loaded so far.
    pub fn loaded(&self) -> usize {
        self.loaded
    }

    /// Ends the load and returns the number of entries loaded.
    pub fn finish(self) -> usize {
        debug!(root = %self.root, loaded = self.loaded, "index.bulk_load");
        self.loaded
    }
}

/// Shape of an index as seen by [`IndexManager::verify`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Pages visited.
    pub pages: usize,
    /// Leaf pages visited.
    pub leaves: usize,
    /// Leaf entries.
    pub entries: usize,
    /// Height of the root above the leaves.
    pub height: u8,
}

struct Dumper<'a, 'w> {
    tree: &'a BlinkTree,
    tx: TxId,
    key_type: FieldType,
    value_type: FieldType,
    out: &'w mut dyn io::Write,
    entries: usize,
}

impl PageVisitor for Dumper<'_, '_> {
    fn visit_branch(&mut self, _page: PageId, _view: &PageRef<'_>) -> Result<()> {
        Ok(())
    }

    fn visit_leaf(&mut self, _page: PageId, view: &PageRef<'_>) -> Result<()> {
        for idx in 0..view.count() {
            let slot = view.slot(idx)?;
            let value = self.tree.decode_value(self.tx, &slot)?;
            writeln!(
                self.out,
                "{} -> {}",
                render(self.key_type, slot.key),
                render(self.value_type, &value)
            )?;
            self.entries += 1;
        }
        Ok(())
    }
}

fn render(field: FieldType, bytes: &[u8]) -> String {
    let text = match field {
        FieldType::U64 => ord::decode_u64(bytes).ok().map(|v| v.to_string()),
        FieldType::I64 => ord::decode_i64(bytes).ok().map(|v| v.to_string()),
        FieldType::Utf8 => std::str::from_utf8(bytes).ok().map(|s| format!("{s:?}")),
        FieldType::Bytes => None,
    };
    text.unwrap_or_else(|| {
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        format!("0x{hex}")
    })
}

/// Per level, the high key of the page visited last on it.
#[derive(Default)]
struct Verifier {
    report: VerifyReport,
    previous_high: BTreeMap<u8, Option<Bound>>,
}

impl Verifier {
    fn check(&mut self, view: &PageRef<'_>) -> Result<()> {
        let header = view.header()?;
        let count = view.count();
        self.report.pages += 1;
        self.report.height = self.report.height.max(header.height);
        for idx in 1..count {
            let prev = view.bound_at(idx - 1)?;
            if view.compare_at(idx, &prev.target())? != Ordering::Greater {
                return Err(BlinkError::Corruption("page entries out of order"));
            }
        }
        let high = view.high_key()?;
        if let (Some(high), true) = (&high, count > 0) {
            if view.compare_at(count - 1, &high.target())? == Ordering::Greater {
                return Err(BlinkError::Corruption("entry above its page high key"));
            }
        }
        if let Some(Some(left_high)) = self.previous_high.get(&header.height) {
            if count > 0 && view.compare_at(0, &left_high.target())? == Ordering::Less {
                return Err(BlinkError::Corruption("entry below its left neighbour's high key"));
            }
        }
        if high.is_none() != header.next.is_none() {
            return Err(BlinkError::Corruption("high key disagrees with right link"));
        }
        self.previous_high.insert(header.height, high);
        Ok(())
    }
}

impl PageVisitor for Verifier {
    fn visit_branch(&mut self, _page: PageId, view: &PageRef<'_>) -> Result<()> {
        self.check(view)
    }

    fn visit_leaf(&mut self, _page: PageId, view: &PageRef<'_>) -> Result<()> {
        self.check(view)?;
        self.report.leaves += 1;
        self.report.entries += view.count();
        Ok(())
    }

    fn visit_released(&mut self, from: PageId, page: PageId) -> Result<()> {
        warn!(%from, %page, "index.verify.dangling_reference");
        Err(BlinkError::Corruption("separator names a released page"))
    }
}
