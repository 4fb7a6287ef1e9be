//! Transactional index storage.
//!
//! Hosts the B-link tree engine together with the services it consumes:
//! transactions, the blob store for externalized values, and the key-range
//! lock strategy. Recovery and the store bootstrap tie them to the pager and
//! write-ahead log from [`crate::primitives`].

/// B-link tree engine.
///
/// Page layout, log records, concurrent descent, splits, merges, and iteration.
pub mod blink;

/// Blob storage for values too large to keep on a leaf.
pub mod blob;

/// Key-range locking strategy consulted by index operations.
pub mod lock;

mod index;
mod options;
mod recovery;
mod store;
mod txn;

/// Index façade.
pub use index::{BulkLoader, IndexManager, VerifyReport};
/// Store configuration.
pub use options::{IndexOptions, SplitPolicy};
pub use recovery::RecoveryReport;
/// Store bootstrap.
pub use store::{IndexStore, BLOB_CONTAINER};
/// Transactions.
pub use txn::{Transaction, TxManager, TxState};
