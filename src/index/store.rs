//!
//! The persisted record sets behind the indexer and the narrow set of
//! operations the indexer and the chain index need from them.
//!
use crate::parser::errors::OpResult;
use bitcoin::{BlockHash, Txid, Wtxid};
use serde::{Deserialize, Serialize};

/// Where a block was read from during bulk ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocator {
    pub file: String,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRow {
    pub id: u64,
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub prev_id: Option<u64>,
    pub timestamp: u32,
    pub first_tx_id: u64,
    pub tx_count: u32,
    pub source: Option<SourceLocator>,
}

impl BlockRow {
    /// Transaction ids of the block, in block order.
    pub fn tx_ids(&self) -> std::ops::Range<u64> {
        self.first_tx_id..self.first_tx_id + self.tx_count as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRow {
    pub id: u64,
    pub hash: Txid,
    /// Only stored when it differs from `hash`.
    pub wtxid: Option<Wtxid>,
    pub lock_time: u32,
    pub block_id: u64,
    pub index: u32,
    pub input_count: u32,
    pub output_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRow {
    pub id: u64,
    pub tx_id: u64,
    pub index: u32,
    /// `None` for coinbase inputs.
    pub prev_tx_id: Option<u64>,
    pub prev_vout: u32,
    pub output_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRow {
    pub id: u64,
    pub tx_id: u64,
    pub index: u32,
    pub value: u64,
    pub required_spenders: u32,
    /// Empty once the script has been classified.
    pub script: Vec<u8>,
    pub spent_by: Option<u64>,
}

/// One `(id, hash, previous hash)` triple of the persisted blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    pub id: u64,
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
}

///
/// What the chain index needs from a backing store: the block graph
/// and the declared head.
///
pub trait ChainSource {
    fn chain_links(&self) -> OpResult<Vec<ChainLink>>;

    fn declared_head(&self) -> OpResult<Option<BlockHash>>;

    fn set_declared_head(&mut self, head: Option<&BlockHash>) -> OpResult<()>;
}

/// Id sequences kept by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Block,
    Transaction,
    Input,
    Output,
    Address,
}

///
/// Durable storage of the ledger.
///
/// Mutations between `begin` and `commit` become visible to readers of
/// the store immediately but reach durable storage only on `commit`;
/// `rollback` discards them. Mutations outside a transaction are
/// written through.
///
pub trait LedgerStore: ChainSource + Send {
    fn begin(&mut self) -> OpResult<()>;
    fn commit(&mut self) -> OpResult<()>;
    fn rollback(&mut self) -> OpResult<()>;

    /// Reserve `count` consecutive ids, returning the first.
    fn allocate_ids(&mut self, kind: IdKind, count: u64) -> OpResult<u64>;

    fn insert_block(&mut self, row: &BlockRow) -> OpResult<()>;
    fn delete_block(&mut self, row: &BlockRow) -> OpResult<()>;
    fn get_block(&self, id: u64) -> OpResult<Option<BlockRow>>;
    fn find_block(&self, hash: &BlockHash) -> OpResult<Option<BlockRow>>;
    fn blocks(&self) -> OpResult<Vec<BlockRow>>;

    fn insert_tx(&mut self, row: &TxRow) -> OpResult<()>;
    fn delete_tx(&mut self, row: &TxRow) -> OpResult<()>;
    fn get_tx(&self, id: u64) -> OpResult<Option<TxRow>>;
    /// The most recently inserted transaction with this hash.
    fn find_tx(&self, hash: &Txid) -> OpResult<Option<TxRow>>;

    fn insert_input(&mut self, row: &InputRow) -> OpResult<()>;
    fn delete_input(&mut self, row: &InputRow) -> OpResult<()>;
    fn get_input(&self, id: u64) -> OpResult<Option<InputRow>>;
    /// Inputs of a transaction in index order.
    fn tx_inputs(&self, tx_id: u64) -> OpResult<Vec<InputRow>>;

    fn insert_output(&mut self, row: &OutputRow) -> OpResult<()>;
    fn update_output(&mut self, row: &OutputRow) -> OpResult<()>;
    fn delete_output(&mut self, row: &OutputRow) -> OpResult<()>;
    fn get_output(&self, id: u64) -> OpResult<Option<OutputRow>>;
    fn find_output(&self, tx_id: u64, index: u32) -> OpResult<Option<OutputRow>>;
    /// Outputs of a transaction in index order.
    fn tx_outputs(&self, tx_id: u64) -> OpResult<Vec<OutputRow>>;

    fn address_id(&self, text: &str) -> OpResult<Option<u64>>;
    fn address_text(&self, id: u64) -> OpResult<Option<String>>;
    /// Existing id, or a new row for a first-seen address.
    fn upsert_address(&mut self, text: &str) -> OpResult<u64>;

    fn link_address_output(&mut self, address_id: u64, output_id: u64) -> OpResult<()>;
    fn unlink_address_output(&mut self, address_id: u64, output_id: u64) -> OpResult<()>;
    fn output_addresses(&self, output_id: u64) -> OpResult<Vec<u64>>;
    fn address_outputs(&self, address_id: u64) -> OpResult<Vec<u64>>;

    fn link_address_tx(&mut self, address_id: u64, tx_id: u64) -> OpResult<()>;
    fn unlink_address_tx(&mut self, address_id: u64, tx_id: u64) -> OpResult<()>;
    fn tx_addresses(&self, tx_id: u64) -> OpResult<Vec<u64>>;
    fn address_txs(&self, address_id: u64) -> OpResult<Vec<u64>>;

    fn cached_balance(&self, address_id: u64) -> OpResult<Option<u64>>;
    fn set_cached_balance(&mut self, address_id: u64, value: u64) -> OpResult<()>;
    fn clear_cached_balance(&mut self, address_id: u64) -> OpResult<()>;
    fn clear_cached_balances(&mut self) -> OpResult<()>;

    fn set_block_fee(&mut self, block_id: u64, fee_per_kb: u64) -> OpResult<()>;
    fn block_fee(&self, block_id: u64) -> OpResult<Option<u64>>;
    fn delete_block_fee(&mut self, block_id: u64) -> OpResult<()>;

    fn processing_state(&self) -> OpResult<Option<u64>>;
    fn set_processing_state(&mut self, state: u64) -> OpResult<()>;
}
