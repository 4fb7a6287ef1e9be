use std::cmp::Ordering;
use std::convert::TryFrom;

use crate::types::{BlinkError, Lsn, PageId, Result};

/// Number of bytes in the fixed page header; the slot array follows it.
pub const PAGE_HEADER_LEN: usize = 56;
/// Size in bytes of a single slot (`off:u16 klen:u16 vlen:u16 flags:u8 pad:u8`).
pub const SLOT_LEN: usize = 8;
/// Smallest and largest page sizes the u16 heap offsets can address.
pub const MIN_PAGE_SIZE: usize = 512;
/// See [`MIN_PAGE_SIZE`].
pub const MAX_PAGE_SIZE: usize = 32 * 1024;

const FLAGS_OFFSET: usize = 0;
const PAGE_TYPE_OFFSET: usize = 1;
const KEY_TYPE_OFFSET: usize = 2;
const VALUE_TYPE_OFFSET: usize = 3;
const BEFORE_OFFSET: usize = 4;
const NEXT_OFFSET: usize = 12;
const PREVIOUS_OFFSET: usize = 20;
const LSN_OFFSET: usize = 28;
const ROOT_OFFSET: usize = 36;
const COUNT_OFFSET: usize = 44;
const HEIGHT_OFFSET: usize = 46;
const VERSION_OFFSET: usize = 47;
const HEAP_START_OFFSET: usize = 48;
const GARBAGE_OFFSET: usize = 50;
const HIGH_KEY_OFFSET: usize = 52;

/// Page-level flag: keys are unique.
pub const PAGE_UNIQUE: u8 = 0x01;
/// Page-level flag: leaf values may be snap-compressed.
pub const PAGE_COMPRESSED: u8 = 0x02;
/// Page-level flag: the page has no right sibling (mirrors "no high key").
pub const PAGE_LAST_IN_LEVEL: u8 = 0x04;
/// Page-level flag: at least one slot was externalized since the last format.
pub const PAGE_EXTERNALIZED: u8 = 0x08;

/// Slot flag: the value is an 8-byte blob id.
pub const SLOT_EXTERNALIZED: u8 = 0x01;
/// Slot flag: the value is snap-compressed.
pub const SLOT_COMPRESSED: u8 = 0x02;

/// Size of a branch slot's child pointer prefix.
pub const CHILD_LEN: usize = 8;

/// Kind of a page.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageType {
    /// Unformatted or released page.
    Free = 0,
    /// Leaf page holding index entries.
    Leaf = 1,
    /// Branch page holding separators and child pointers.
    Branch = 2,
}

impl TryFrom<u8> for PageType {
    type Error = BlinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PageType::Free),
            1 => Ok(PageType::Leaf),
            2 => Ok(PageType::Branch),
            _ => Err(BlinkError::Corruption("unknown page type")),
        }
    }
}

/// Type descriptor for keys and values; governs how `dump` renders them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FieldType {
    /// Opaque bytes.
    Bytes = 0,
    /// Big-endian u64.
    U64 = 1,
    /// Order-preserving i64.
    I64 = 2,
    /// UTF-8 text.
    Utf8 = 3,
}

impl TryFrom<u8> for FieldType {
    type Error = BlinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FieldType::Bytes),
            1 => Ok(FieldType::U64),
            2 => Ok(FieldType::I64),
            3 => Ok(FieldType::Utf8),
            _ => Err(BlinkError::Corruption("unknown field type")),
        }
    }
}

/// Which header pointer a pointer update touches.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PointerField {
    /// Low child of a branch page.
    Before,
    /// Right sibling.
    Next,
    /// Left sibling (leaf pages).
    Previous,
}

impl PointerField {
    fn offset(self) -> usize {
        match self {
            PointerField::Before => BEFORE_OFFSET,
            PointerField::Next => NEXT_OFFSET,
            PointerField::Previous => PREVIOUS_OFFSET,
        }
    }
}

/// An ordering point: a key plus, for non-unique indexes, the value that
/// breaks ties. Used for high keys and branch separators.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Bound {
    /// Key bytes.
    pub key: Vec<u8>,
    /// Ordering value (empty for unique indexes).
    pub value: Vec<u8>,
}

impl Bound {
    /// Builds a bound.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Search target sitting exactly on this bound.
    pub fn target(&self) -> Target<'_> {
        Target::exact(&self.key, Some(&self.value))
    }
}

/// One slot in its stored form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredEntry {
    /// Key bytes.
    pub key: Vec<u8>,
    /// Stored value bytes (blob id / compressed / child pointer as applicable).
    pub value: Vec<u8>,
    /// Slot flags.
    pub flags: u8,
}

/// Header state captured by format-change records.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeaderImage {
    /// Page kind.
    pub page_type: PageType,
    /// Key type descriptor.
    pub key_type: FieldType,
    /// Value type descriptor.
    pub value_type: FieldType,
    /// Unique index.
    pub unique: bool,
    /// Compressed leaf values.
    pub compressed: bool,
    /// Level above the leaves (0 for leaves).
    pub height: u8,
    /// Owning index.
    pub root: Option<PageId>,
    /// Low child (branch).
    pub before: Option<PageId>,
    /// Right sibling.
    pub next: Option<PageId>,
    /// Left sibling.
    pub previous: Option<PageId>,
    /// Exclusive upper bound of the page's key range.
    pub high_key: Option<Bound>,
}

impl HeaderImage {
    /// Image of an unformatted page.
    pub fn free() -> Self {
        Self {
            page_type: PageType::Free,
            key_type: FieldType::Bytes,
            value_type: FieldType::Bytes,
            unique: false,
            compressed: false,
            height: 0,
            root: None,
            before: None,
            next: None,
            previous: None,
            high_key: None,
        }
    }
}

/// Which end of a key group a value-less target sits on (non-unique indexes).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Side {
    /// Before every entry with the same key.
    Low,
    /// After every entry with the same key.
    High,
}

/// Search target: a key, an optional ordering value, and a side.
#[derive(Clone, Copy, Debug)]
pub struct Target<'a> {
    /// Key bytes.
    pub key: &'a [u8],
    /// Ordering value for non-unique indexes.
    pub value: Option<&'a [u8]>,
    /// Tie-break used when `value` is `None`.
    pub side: Side,
}

impl<'a> Target<'a> {
    /// Target on `(key, value)`; a missing value sits before the key group.
    pub fn exact(key: &'a [u8], value: Option<&'a [u8]>) -> Self {
        Self {
            key,
            value,
            side: Side::Low,
        }
    }

    /// Same target with a different side.
    pub fn with_side(mut self, side: Side) -> Self {
        self.side = side;
        self
    }
}

/// Compares a stored ordering point against a target.
pub fn compare(key: &[u8], order: &[u8], unique: bool, target: &Target<'_>) -> Ordering {
    match key.cmp(target.key) {
        Ordering::Equal if unique => Ordering::Equal,
        Ordering::Equal => match target.value {
            Some(value) => order.cmp(value),
            None => match target.side {
                Side::Low => Ordering::Greater,
                Side::High => Ordering::Less,
            },
        },
        other => other,
    }
}

/// Slot-level search policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SearchMode {
    /// The first entry of the index.
    First,
    /// Least entry greater than or equal to the target.
    GreaterOrEqual,
    /// Least entry strictly greater than the target.
    Greater,
    /// Greatest entry less than or equal to the target.
    LessOrEqual,
    /// Greatest entry strictly less than the target.
    Less,
    /// A uniformly chosen probe (statistics sampling).
    Random,
}

impl SearchMode {
    /// Descending modes continue to the left.
    pub fn descending(self) -> bool {
        matches!(self, SearchMode::LessOrEqual | SearchMode::Less)
    }

    /// Side a value-less target takes so the mode lands on the right end of a
    /// non-unique key group.
    pub fn side(self) -> Side {
        match self {
            SearchMode::Greater | SearchMode::LessOrEqual => Side::High,
            _ => Side::Low,
        }
    }
}

/// Outcome of a page search.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SearchResult {
    /// Slot the search landed on; `None` when no slot on this page qualifies.
    pub index: Option<usize>,
    /// Landed slot compared with the target. Without a slot: `Less` means the
    /// answer lies to the right, `Greater` that it lies to the left.
    pub cmp: Ordering,
}

/// Decoded fixed header.
#[derive(Clone, Debug)]
pub struct Header {
    /// Raw page flags.
    pub flags: u8,
    /// Page kind.
    pub page_type: PageType,
    /// Key type descriptor.
    pub key_type: FieldType,
    /// Value type descriptor.
    pub value_type: FieldType,
    /// Low child (branch).
    pub before: Option<PageId>,
    /// Right sibling.
    pub next: Option<PageId>,
    /// Left sibling.
    pub previous: Option<PageId>,
    /// LSN of the last record applied.
    pub lsn: Lsn,
    /// Owning index.
    pub root: Option<PageId>,
    /// Number of slots.
    pub count: usize,
    /// Level above the leaves.
    pub height: u8,
    /// Page format version.
    pub version: u8,
    heap_start: usize,
    garbage: usize,
    high_off: usize,
}

impl Header {
    /// Keys are unique.
    pub fn unique(&self) -> bool {
        self.flags & PAGE_UNIQUE != 0
    }

    /// Leaf values may be compressed.
    pub fn compressed(&self) -> bool {
        self.flags & PAGE_COMPRESSED != 0
    }

    /// No right sibling.
    pub fn last_in_level(&self) -> bool {
        self.high_off == 0
    }

    /// Leaf page.
    pub fn is_leaf(&self) -> bool {
        self.page_type == PageType::Leaf
    }
}

fn read_u16(buf: &[u8], off: usize) -> usize {
    u16::from_be_bytes([buf[off], buf[off + 1]]) as usize
}

fn write_u16(buf: &mut [u8], off: usize, value: usize) {
    buf[off..off + 2].copy_from_slice(&(value as u16).to_be_bytes());
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(raw)
}

fn write_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_be_bytes());
}

fn write_page_id(buf: &mut [u8], off: usize, id: Option<PageId>) {
    write_u64(buf, off, id.map(PageId::to_u64).unwrap_or(0));
}

/// Reads the header of any page image, including unformatted ones.
pub fn parse_header(buf: &[u8]) -> Result<Header> {
    if buf.len() < MIN_PAGE_SIZE || buf.len() > MAX_PAGE_SIZE {
        return Err(BlinkError::Corruption("page size out of range"));
    }
    let page_type = PageType::try_from(buf[PAGE_TYPE_OFFSET])?;
    let header = Header {
        flags: buf[FLAGS_OFFSET],
        page_type,
        key_type: FieldType::try_from(buf[KEY_TYPE_OFFSET])?,
        value_type: FieldType::try_from(buf[VALUE_TYPE_OFFSET])?,
        before: PageId::from_u64(read_u64(buf, BEFORE_OFFSET)),
        next: PageId::from_u64(read_u64(buf, NEXT_OFFSET)),
        previous: PageId::from_u64(read_u64(buf, PREVIOUS_OFFSET)),
        lsn: Lsn(read_u64(buf, LSN_OFFSET)),
        root: PageId::from_u64(read_u64(buf, ROOT_OFFSET)),
        count: read_u16(buf, COUNT_OFFSET),
        height: buf[HEIGHT_OFFSET],
        version: buf[VERSION_OFFSET],
        heap_start: read_u16(buf, HEAP_START_OFFSET),
        garbage: read_u16(buf, GARBAGE_OFFSET),
        high_off: read_u16(buf, HIGH_KEY_OFFSET),
    };
    if page_type != PageType::Free {
        let heap_start = if header.heap_start == 0 {
            buf.len()
        } else {
            header.heap_start
        };
        if PAGE_HEADER_LEN + header.count * SLOT_LEN > heap_start || heap_start > buf.len() {
            return Err(BlinkError::Corruption("slot array overlaps record heap"));
        }
        if header.high_off != 0 && (header.high_off < heap_start || header.high_off + 4 > buf.len())
        {
            return Err(BlinkError::Corruption("high key outside record heap"));
        }
    }
    Ok(header)
}

/// Read-only view of a page image.
#[derive(Clone, Copy)]
pub struct PageRef<'a> {
    buf: &'a [u8],
}

/// A slot as stored on the page.
#[derive(Clone, Copy, Debug)]
pub struct Slot<'a> {
    /// Key bytes.
    pub key: &'a [u8],
    /// Stored value bytes.
    pub value: &'a [u8],
    /// Slot flags.
    pub flags: u8,
}

impl Slot<'_> {
    /// Value lives in the blob store.
    pub fn externalized(&self) -> bool {
        self.flags & SLOT_EXTERNALIZED != 0
    }

    /// Copies the slot out.
    pub fn to_stored(&self) -> StoredEntry {
        StoredEntry {
            key: self.key.to_vec(),
            value: self.value.to_vec(),
            flags: self.flags,
        }
    }
}

impl<'a> PageRef<'a> {
    /// Wraps a page image.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Decodes the header.
    pub fn header(&self) -> Result<Header> {
        parse_header(self.buf)
    }

    /// Page LSN.
    pub fn lsn(&self) -> Lsn {
        Lsn(read_u64(self.buf, LSN_OFFSET))
    }

    /// Number of slots.
    pub fn count(&self) -> usize {
        read_u16(self.buf, COUNT_OFFSET)
    }

    fn page_type(&self) -> PageType {
        PageType::try_from(self.buf[PAGE_TYPE_OFFSET]).unwrap_or(PageType::Free)
    }

    fn unique(&self) -> bool {
        self.buf[FLAGS_OFFSET] & PAGE_UNIQUE != 0
    }

    fn heap_start(&self) -> usize {
        match read_u16(self.buf, HEAP_START_OFFSET) {
            0 => self.buf.len(),
            start => start,
        }
    }

    fn garbage(&self) -> usize {
        read_u16(self.buf, GARBAGE_OFFSET)
    }

    /// Reads slot `idx`.
    pub fn slot(&self, idx: usize) -> Result<Slot<'a>> {
        if idx >= self.count() {
            return Err(BlinkError::Corruption("slot index out of range"));
        }
        let base = PAGE_HEADER_LEN + idx * SLOT_LEN;
        let off = read_u16(self.buf, base);
        let klen = read_u16(self.buf, base + 2);
        let vlen = read_u16(self.buf, base + 4);
        let flags = self.buf[base + 6];
        let end = off + klen + vlen;
        if off < self.heap_start() || end > self.buf.len() {
            return Err(BlinkError::Corruption("slot record outside page"));
        }
        Ok(Slot {
            key: &self.buf[off..off + klen],
            value: &self.buf[off + klen..end],
            flags,
        })
    }

    /// Ordering value of a slot: the value on leaves, the bytes after the child
    /// pointer on branches.
    pub fn order_of(&self, slot: &Slot<'a>) -> Result<&'a [u8]> {
        match self.page_type() {
            PageType::Branch => slot
                .value
                .get(CHILD_LEN..)
                .ok_or(BlinkError::Corruption("branch slot shorter than child pointer")),
            _ => Ok(slot.value),
        }
    }

    /// Separator bound stored in branch slot `idx`, or the leaf entry as a bound.
    pub fn bound_at(&self, idx: usize) -> Result<Bound> {
        let slot = self.slot(idx)?;
        let order = if self.unique() {
            &[][..]
        } else {
            self.order_of(&slot)?
        };
        Ok(Bound::new(slot.key, order))
    }

    /// Child pointer of branch slot `idx`.
    pub fn child_at(&self, idx: usize) -> Result<PageId> {
        let slot = self.slot(idx)?;
        decode_child(slot.value)
    }

    /// High key, if the page is not last-in-level.
    pub fn high_key(&self) -> Result<Option<Bound>> {
        let off = read_u16(self.buf, HIGH_KEY_OFFSET);
        if off == 0 {
            return Ok(None);
        }
        let klen = read_u16(self.buf, off);
        let vlen = read_u16(self.buf, off + 2);
        let start = off + 4;
        if start + klen + vlen > self.buf.len() {
            return Err(BlinkError::Corruption("high key record truncated"));
        }
        Ok(Some(Bound::new(
            &self.buf[start..start + klen],
            &self.buf[start + klen..start + klen + vlen],
        )))
    }

    /// Compares slot `idx` with `target`.
    pub fn compare_at(&self, idx: usize, target: &Target<'_>) -> Result<Ordering> {
        let slot = self.slot(idx)?;
        let order = self.order_of(&slot)?;
        Ok(compare(slot.key, order, self.unique(), target))
    }

    /// True when `target` lies at or beyond the high key (the answer is on a
    /// right sibling).
    pub fn beyond_high_key(&self, target: &Target<'_>) -> Result<bool> {
        Ok(match self.high_key()? {
            Some(high) => compare(&high.key, &high.value, self.unique(), target) != Ordering::Greater,
            None => false,
        })
    }

    fn partition(&self, target: &Target<'_>, strict: bool) -> Result<usize> {
        let (mut lo, mut hi) = (0usize, self.count());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let cmp = self.compare_at(mid, target)?;
            let go_right = if strict {
                cmp != Ordering::Greater
            } else {
                cmp == Ordering::Less
            };
            if go_right {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// First slot whose entry is `>= target`.
    pub fn lower_bound(&self, target: &Target<'_>) -> Result<usize> {
        self.partition(target, false)
    }

    /// First slot whose entry is `> target`.
    pub fn upper_bound(&self, target: &Target<'_>) -> Result<usize> {
        self.partition(target, true)
    }

    /// Slot holding exactly `target`, if any.
    pub fn find(&self, target: &Target<'_>) -> Result<Option<usize>> {
        let idx = self.lower_bound(target)?;
        if idx < self.count() && self.compare_at(idx, target)? == Ordering::Equal {
            Ok(Some(idx))
        } else {
            Ok(None)
        }
    }

    /// Binary search honoring `mode`.
    pub fn search(&self, mode: SearchMode, target: &Target<'_>) -> Result<SearchResult> {
        let count = self.count();
        let index = match mode {
            SearchMode::First => (count > 0).then_some(0),
            SearchMode::GreaterOrEqual => Some(self.lower_bound(target)?).filter(|i| *i < count),
            SearchMode::Greater => Some(self.upper_bound(target)?).filter(|i| *i < count),
            SearchMode::LessOrEqual => self.upper_bound(target)?.checked_sub(1),
            SearchMode::Less => self.lower_bound(target)?.checked_sub(1),
            SearchMode::Random => {
                (count > 0).then(|| rand::Rng::gen_range(&mut rand::thread_rng(), 0..count))
            }
        };
        let cmp = match index {
            Some(_) if matches!(mode, SearchMode::First | SearchMode::Random) => Ordering::Equal,
            Some(idx) => self.compare_at(idx, target)?,
            None if mode.descending() => Ordering::Greater,
            None => Ordering::Less,
        };
        Ok(SearchResult { index, cmp })
    }

    /// Child a branch page routes `target` to: the last separator `<= target`,
    /// or the low child when every separator is greater.
    pub fn route(&self, target: &Target<'_>) -> Result<PageId> {
        match self.upper_bound(target)?.checked_sub(1) {
            Some(idx) => self.child_at(idx),
            None => self
                .header()?
                .before
                .ok_or(BlinkError::Corruption("branch page without low child")),
        }
    }

    /// Every child reference in key order, low child first.
    pub fn children(&self) -> Result<Vec<PageId>> {
        let header = self.header()?;
        let mut children = Vec::with_capacity(header.count + 1);
        children.push(
            header
                .before
                .ok_or(BlinkError::Corruption("branch page without low child"))?,
        );
        for idx in 0..header.count {
            children.push(self.child_at(idx)?);
        }
        Ok(children)
    }

    /// Copies slots `range` out in stored form.
    pub fn entries(&self, range: std::ops::Range<usize>) -> Result<Vec<StoredEntry>> {
        range.map(|idx| self.slot(idx).map(|s| s.to_stored())).collect()
    }

    /// Bytes slot `idx` occupies (slot + record).
    pub fn entry_size(&self, idx: usize) -> Result<usize> {
        let slot = self.slot(idx)?;
        Ok(SLOT_LEN + slot.key.len() + slot.value.len())
    }

    /// Bytes available for new slots once garbage is compacted away.
    pub fn reclaimable(&self) -> usize {
        let slots_end = PAGE_HEADER_LEN + self.count() * SLOT_LEN;
        self.heap_start().saturating_sub(slots_end) + self.garbage()
    }

    /// Whether this page can absorb every entry of `right`, plus the separator
    /// pulled down from the parent when merging branch pages, and take over
    /// `right`'s high key.
    pub fn mergeable(
        &self,
        right: &PageRef<'_>,
        separator: Option<&Bound>,
        max_entries: Option<usize>,
    ) -> Result<bool> {
        let mut needed = 0usize;
        for idx in 0..right.count() {
            needed += right.entry_size(idx)?;
        }
        let mut extra_entries = right.count();
        if let Some(sep) = separator {
            needed += SLOT_LEN + sep.key.len() + CHILD_LEN + sep.value.len();
            extra_entries += 1;
        }
        let own_high = self.high_key()?.map(|b| 4 + b.key.len() + b.value.len()).unwrap_or(0);
        let new_high = right.high_key()?.map(|b| 4 + b.key.len() + b.value.len()).unwrap_or(0);
        needed = (needed + new_high).saturating_sub(own_high);
        if let Some(max) = max_entries {
            if self.count() + extra_entries > max {
                return Ok(false);
            }
        }
        Ok(needed <= self.reclaimable())
    }

    /// Captures the header state for a format-change record.
    pub fn image(&self) -> Result<HeaderImage> {
        let header = self.header()?;
        Ok(HeaderImage {
            page_type: header.page_type,
            key_type: header.key_type,
            value_type: header.value_type,
            unique: header.unique(),
            compressed: header.compressed(),
            height: header.height,
            root: header.root,
            before: header.before,
            next: header.next,
            previous: header.previous,
            high_key: self.high_key()?,
        })
    }
}

/// Decodes the child pointer at the front of a branch slot value.
pub fn decode_child(value: &[u8]) -> Result<PageId> {
    if value.len() < CHILD_LEN {
        return Err(BlinkError::Corruption("branch slot shorter than child pointer"));
    }
    PageId::from_u64(read_u64(value, 0)).ok_or(BlinkError::Corruption("null child pointer"))
}

/// Builds a branch slot value: child pointer followed by the ordering value.
pub fn branch_value(child: PageId, order: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(CHILD_LEN + order.len());
    value.extend_from_slice(&child.to_u64().to_be_bytes());
    value.extend_from_slice(order);
    value
}

/// Mutable view of a page image. Callers hold the page's exclusive latch.
pub struct PageMut<'a> {
    buf: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    /// Wraps a page image.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    /// Read view of the same image.
    pub fn as_ref(&self) -> PageRef<'_> {
        PageRef::new(self.buf)
    }

    /// Stamps the page LSN.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        write_u64(self.buf, LSN_OFFSET, lsn.0);
    }

    /// Resets the header to `image` and clears every slot. The page LSN is kept.
    pub fn format(&mut self, image: &HeaderImage, version: u8) -> Result<()> {
        let lsn = self.as_ref().lsn();
        self.buf.fill(0);
        self.set_lsn(lsn);
        if image.page_type == PageType::Free {
            return Ok(());
        }
        let mut flags = 0u8;
        if image.unique {
            flags |= PAGE_UNIQUE;
        }
        if image.compressed {
            flags |= PAGE_COMPRESSED;
        }
        self.buf[FLAGS_OFFSET] = flags;
        self.buf[PAGE_TYPE_OFFSET] = image.page_type as u8;
        self.buf[KEY_TYPE_OFFSET] = image.key_type as u8;
        self.buf[VALUE_TYPE_OFFSET] = image.value_type as u8;
        write_page_id(self.buf, BEFORE_OFFSET, image.before);
        write_page_id(self.buf, NEXT_OFFSET, image.next);
        write_page_id(self.buf, PREVIOUS_OFFSET, image.previous);
        write_page_id(self.buf, ROOT_OFFSET, image.root);
        self.buf[HEIGHT_OFFSET] = image.height;
        self.buf[VERSION_OFFSET] = version;
        let len = self.buf.len();
        write_u16(self.buf, HEAP_START_OFFSET, len);
        if !self.set_high_key(image.high_key.as_ref())? {
            return Err(BlinkError::Invalid("high key larger than page"));
        }
        Ok(())
    }

    /// Sets one header pointer.
    pub fn set_pointer(&mut self, field: PointerField, id: Option<PageId>) {
        write_page_id(self.buf, field.offset(), id);
    }

    fn set_count(&mut self, count: usize) {
        write_u16(self.buf, COUNT_OFFSET, count);
    }

    fn add_garbage(&mut self, bytes: usize) {
        let garbage = self.as_ref().garbage() + bytes;
        write_u16(self.buf, GARBAGE_OFFSET, garbage);
    }

    /// Reserves `len` heap bytes leaving room for `extra_slots` more slots,
    /// compacting when fragmentation is in the way.
    fn reserve(&mut self, len: usize, extra_slots: usize) -> Option<usize> {
        let fits = |page: &PageRef<'_>| {
            let slots_end = PAGE_HEADER_LEN + (page.count() + extra_slots) * SLOT_LEN;
            page.heap_start() >= slots_end + len
        };
        if !fits(&self.as_ref()) {
            if self.as_ref().garbage() == 0 {
                return None;
            }
            self.compact();
            if !fits(&self.as_ref()) {
                return None;
            }
        }
        let start = self.as_ref().heap_start() - len;
        write_u16(self.buf, HEAP_START_OFFSET, start);
        Some(start)
    }

    /// Rewrites the heap without garbage.
    pub fn compact(&mut self) {
        let page = self.as_ref();
        let count = page.count();
        let mut records: Vec<(Vec<u8>, usize, usize)> = Vec::with_capacity(count);
        for idx in 0..count {
            if let Ok(slot) = page.slot(idx) {
                let mut record = slot.key.to_vec();
                record.extend_from_slice(slot.value);
                records.push((record, slot.key.len(), slot.value.len()));
            }
        }
        let high = match read_u16(self.buf, HIGH_KEY_OFFSET) {
            0 => None,
            off => {
                let len = 4 + read_u16(self.buf, off) + read_u16(self.buf, off + 2);
                Some(self.buf[off..off + len].to_vec())
            }
        };
        let mut top = self.buf.len();
        if let Some(high) = high {
            top -= high.len();
            self.buf[top..top + high.len()].copy_from_slice(&high);
            write_u16(self.buf, HIGH_KEY_OFFSET, top);
        }
        for (idx, (record, _, _)) in records.iter().enumerate() {
            top -= record.len();
            self.buf[top..top + record.len()].copy_from_slice(record);
            write_u16(self.buf, PAGE_HEADER_LEN + idx * SLOT_LEN, top);
        }
        write_u16(self.buf, HEAP_START_OFFSET, top);
        write_u16(self.buf, GARBAGE_OFFSET, 0);
    }

    /// Inserts a slot at `idx`; returns false (page untouched) when it does not fit.
    pub fn insert_at(&mut self, idx: usize, key: &[u8], value: &[u8], flags: u8) -> Result<bool> {
        let count = self.as_ref().count();
        if idx > count {
            return Err(BlinkError::Corruption("insert position out of range"));
        }
        let Some(off) = self.reserve(key.len() + value.len(), 1) else {
            return Ok(false);
        };
        self.buf[off..off + key.len()].copy_from_slice(key);
        self.buf[off + key.len()..off + key.len() + value.len()].copy_from_slice(value);
        let base = PAGE_HEADER_LEN + idx * SLOT_LEN;
        let end = PAGE_HEADER_LEN + count * SLOT_LEN;
        self.buf.copy_within(base..end, base + SLOT_LEN);
        write_u16(self.buf, base, off);
        write_u16(self.buf, base + 2, key.len());
        write_u16(self.buf, base + 4, value.len());
        self.buf[base + 6] = flags;
        self.buf[base + 7] = 0;
        if flags & SLOT_EXTERNALIZED != 0 {
            self.buf[FLAGS_OFFSET] |= PAGE_EXTERNALIZED;
        }
        self.set_count(count + 1);
        Ok(true)
    }

    /// Removes slot `idx`.
    pub fn delete_at(&mut self, idx: usize) -> Result<()> {
        let page = self.as_ref();
        let count = page.count();
        let slot = page.slot(idx)?;
        let freed = slot.key.len() + slot.value.len();
        let base = PAGE_HEADER_LEN + idx * SLOT_LEN;
        let end = PAGE_HEADER_LEN + count * SLOT_LEN;
        self.buf.copy_within(base + SLOT_LEN..end, base);
        self.buf[end - SLOT_LEN..end].fill(0);
        self.set_count(count - 1);
        self.add_garbage(freed);
        Ok(())
    }

    /// Replaces the value of slot `idx`; returns false (page untouched) when the
    /// new record does not fit.
    pub fn set_value_at(&mut self, idx: usize, value: &[u8], flags: u8) -> Result<bool> {
        let slot = self.as_ref().slot(idx)?;
        let key = slot.key.to_vec();
        let old_len = slot.key.len() + slot.value.len();
        if self.as_ref().reclaimable() + old_len < key.len() + value.len() {
            return Ok(false);
        }
        self.delete_at(idx)?;
        if !self.insert_at(idx, &key, value, flags)? {
            return Err(BlinkError::Corruption("value replacement lost its space"));
        }
        Ok(true)
    }

    /// Sets or clears the high key; returns false (page untouched) when it
    /// does not fit. Clearing it marks the page last-in-level.
    pub fn set_high_key(&mut self, high: Option<&Bound>) -> Result<bool> {
        let old_off = read_u16(self.buf, HIGH_KEY_OFFSET);
        let old_len = match old_off {
            0 => 0,
            off => 4 + read_u16(self.buf, off) + read_u16(self.buf, off + 2),
        };
        let Some(high) = high else {
            write_u16(self.buf, HIGH_KEY_OFFSET, 0);
            self.add_garbage(old_len);
            self.buf[FLAGS_OFFSET] |= PAGE_LAST_IN_LEVEL;
            return Ok(true);
        };
        let len = 4 + high.key.len() + high.value.len();
        if self.as_ref().reclaimable() + old_len < len {
            return Ok(false);
        }
        write_u16(self.buf, HIGH_KEY_OFFSET, 0);
        self.add_garbage(old_len);
        let Some(off) = self.reserve(len, 0) else {
            return Err(BlinkError::Corruption("high key lost its space"));
        };
        write_u16(self.buf, off, high.key.len());
        write_u16(self.buf, off + 2, high.value.len());
        self.buf[off + 4..off + 4 + high.key.len()].copy_from_slice(&high.key);
        self.buf[off + 4 + high.key.len()..off + len].copy_from_slice(&high.value);
        write_u16(self.buf, HIGH_KEY_OFFSET, off);
        self.buf[FLAGS_OFFSET] &= !PAGE_LAST_IN_LEVEL;
        Ok(true)
    }
}
