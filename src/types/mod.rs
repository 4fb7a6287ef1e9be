#![forbid(unsafe_code)]
//! Identifiers and the error taxonomy shared by every layer of the index.

use std::fmt;

pub mod checksum;

pub use checksum::{frame_crc32, Checksum, Crc32Fast};

/// Physical page address: a container number plus a page number inside it.
///
/// Page number `0` is never allocated, so the packed form `0` doubles as the
/// on-disk encoding of "no page".
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId {
    /// Container (file / tablespace) number.
    pub container: u32,
    /// Page number within the container, starting at 1.
    pub page: u32,
}

impl PageId {
    /// Builds a page id from its parts.
    pub const fn new(container: u32, page: u32) -> Self {
        Self { container, page }
    }

    /// Packs the id into the 8-byte on-page representation.
    pub const fn to_u64(self) -> u64 {
        ((self.container as u64) << 32) | self.page as u64
    }

    /// Unpacks an on-page pointer; `0` decodes to `None`.
    pub const fn from_u64(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self {
                container: (raw >> 32) as u32,
                page: raw as u32,
            })
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container, self.page)
    }
}

/// Log sequence number. `Lsn(0)` means "no record".
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The null LSN carried by freshly formatted pages and chain terminators.
    pub const ZERO: Lsn = Lsn(0);

    /// Returns true when this is the null LSN.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Errors surfaced by the index engine and its collaborators.
#[derive(thiserror::Error, Debug)]
pub enum BlinkError {
    /// Underlying I/O failure (WAL file sink).
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persistent bytes failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the index cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Options could not be parsed.
    #[error("config: {0}")]
    Config(String),
    /// Requested key or value is absent.
    #[error("not found")]
    NotFound,
    /// Unique index already holds the key.
    #[error("duplicate key in index {root}")]
    Duplicate {
        /// Root page of the index.
        root: PageId,
    },
    /// Page has no room for the entry; the caller must split first.
    #[error("page {page} of index {root} is full")]
    PageFull {
        /// Page that rejected the entry.
        page: PageId,
        /// Root page of the index.
        root: PageId,
    },
    /// Buffer manager has no such page.
    #[error("page {page} not found")]
    PageNotFound {
        /// Missing page.
        page: PageId,
    },
    /// Slot position outside the page's entry array.
    #[error("invalid position {pos} on page {page} of index {root}")]
    InvalidPosition {
        /// Page addressed.
        page: PageId,
        /// Root page of the index.
        root: PageId,
        /// Offending slot index.
        pos: usize,
    },
    /// Page belongs to a different index than the one being navigated.
    #[error("page {page} belongs to index {found:?}, expected {expected}")]
    RootMismatch {
        /// Page inspected.
        page: PageId,
        /// Root the caller navigates.
        expected: PageId,
        /// Root stamped on the page, if any.
        found: Option<PageId>,
    },
    /// An operation could not reach a page it needs.
    #[error("{op} failed on page {page} of index {root}: {source}")]
    Access {
        /// Page the operation failed on.
        page: PageId,
        /// Root page of the index.
        root: PageId,
        /// Operation name.
        op: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<BlinkError>,
    },
    /// Logging discipline was violated; recovery must stop.
    #[error("protocol violation at lsn {lsn} on page {page}: {reason}")]
    Protocol {
        /// Record being processed.
        lsn: Lsn,
        /// Page the record names.
        page: PageId,
        /// What went wrong.
        reason: &'static str,
    },
    /// A blocking lock request was refused by the lock service.
    #[error("lock not granted in index {root}")]
    LockNotGranted {
        /// Root page of the index.
        root: PageId,
    },
    /// Blob store has no such blob.
    #[error("blob {0} not found")]
    BlobNotFound(PageId),
}

impl BlinkError {
    /// Wraps `self` into an access error naming the page, root, and operation.
    pub fn access(self, page: PageId, root: PageId, op: &'static str) -> Self {
        match self {
            err @ BlinkError::Access { .. } => err,
            other => BlinkError::Access {
                page,
                root,
                op,
                source: Box::new(other),
            },
        }
    }
}

/// Convenience result alias used across the crate.
pub type Result<T> = std::result::Result<T, BlinkError>;
