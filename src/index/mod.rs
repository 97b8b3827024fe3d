//!
//! Chain topology, timestamps, and the persisted ledger.
//!

/// fork-aware in-memory chain
pub mod block_index;

/// key-value ledger store with memory and RocksDB backends
pub mod kv;

/// record sets and store traits
pub mod store;

/// transaction id to block timestamp lookup
pub mod timestamp_index;
