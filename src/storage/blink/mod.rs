#![forbid(unsafe_code)]

//! Concurrent B-link tree index.

/// Slotted page layout, header fields, and in-page search.
pub mod page;

/// Page mutations and the log records that carry them.
pub mod log;
mod cursor;
pub(crate) mod handle;
mod stats;
mod tree;
mod walker;

pub use cursor::{IndexIterator, PageHint};
pub use page::{FieldType, SearchMode};
pub use stats::{BlinkStats, BlinkStatsSnapshot};
pub use tree::{BlinkTree, IndexMeta, OpenMode};
pub use walker::PageVisitor;
