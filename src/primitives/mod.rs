//! Low-level primitives for building the index engine.
//!
//! Includes byte utilities, the write-ahead log store, and the buffer
//! manager that owns page images and their latches.

/// Byte-level utilities and encoding/decoding.
///
/// Order-preserving key encoders, varints, and a fallible slice reader.
pub mod bytes;

/// Buffer manager and page latches.
///
/// Owns page memory, hands out S/U/X latches, and simulates write-back.
pub mod pager;

/// Write-ahead logging (WAL) for crash recovery.
///
/// Ensures durability through sequential logging of index mutations.
pub mod wal;
