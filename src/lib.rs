//! Transactional B-link tree indexes with write-ahead logging and ARIES-style
//! crash recovery.
//!
//! The engine lives in [`storage::blink`]; [`storage::IndexStore`] wires it to
//! an in-process buffer manager, a write-ahead log, a blob store, and a
//! transaction manager.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::blink::{
    BlinkTree, FieldType, IndexIterator, IndexMeta, OpenMode, PageHint, PageVisitor, SearchMode,
};
pub use storage::{
    BulkLoader, IndexManager, IndexOptions, IndexStore, RecoveryReport, SplitPolicy, Transaction,
    TxState, VerifyReport,
};
pub use types::{BlinkError, Lsn, PageId, Result, TxId};
