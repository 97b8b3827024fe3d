//!
//! # Introduction
//!
//! This library reconstructs a queryable Bitcoin ledger from raw blocks.
//!
//! It decodes block and transaction bytes, classifies output scripts
//! into addresses, follows the best chain through reorganizations, and
//! keeps an unspent output index with cached balances, per-block fee
//! statistics and address history.
//!
//! Blocks arrive either one at a time through
//! [`Indexer::push_new_block`], or in bulk from a directory of
//! `blk*.dat` files through [`ingest::catalog::ingest_directory`].
//!
//! ## Caveat
//!
//! No consensus validation is done: signatures, scripts and proof of
//! work are trusted.
//!
//! # Example
//!
//! ```rust
//! use bitcoin_ledger::{Indexer, IndexerConfig, KvLedger, RocksBackend};
//! use std::path::Path;
//!
//! let store = KvLedger::new(RocksBackend::open(Path::new("/var/lib/ledger")).unwrap());
//! let indexer = Indexer::open(store, IndexerConfig::default(), None).unwrap();
//!
//! println!("height: {:?}", indexer.get_blockchain_height().unwrap());
//! ```
//!

pub mod api;
pub mod config;
pub mod index;
pub mod ingest;
pub mod parser;

#[doc(inline)]
pub use crate::api::history::{InputView, MemoryBudget, OutputView, TxView};
#[doc(inline)]
pub use crate::api::service::QueryService;
#[doc(inline)]
pub use crate::api::{
    parse_script, FeeEstimate, Indexer, PushOutcome, ScriptSummary, Utxo, UtxoInsight,
};
pub use crate::config::IndexerConfig;
pub use crate::index::block_index::{AttachPlan, ChainIndex, ChainNode, HeadSelector, RevertOutcome};
#[cfg(feature = "rocksdb")]
pub use crate::index::kv::RocksBackend;
pub use crate::index::kv::{KvBackend, KvLedger, MemoryBackend};
pub use crate::index::store::{ChainSource, LedgerStore, SourceLocator};
pub use crate::parser::block::{BlockDecoder, BlockSource};
pub use crate::parser::errors::{OpError, OpErrorKind, OpResult};
pub use crate::parser::proto::{Block, BlockHeader, Transaction, TxIn, TxOut};
pub use crate::parser::script::{ScriptInfo, ScriptType};
pub use bitcoin::hashes::hex::{FromHex, ToHex};
pub use bitcoin::{BlockHash, Network, Txid};
