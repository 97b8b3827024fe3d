//!
//! The indexer: applies blocks to the ledger and answers queries.
//!
//! All operations on one [`Indexer`] are serialized by a single lock.
//! `push_new_block` performs its reverts and the new block's insertion
//! as one store transaction; a failure anywhere leaves the ledger and
//! the chain exactly as they were.
//!
//! # Example
//!
//! ```rust
//! use bitcoin_ledger::{Indexer, IndexerConfig, KvLedger, PushOutcome};
//!
//! let indexer = Indexer::open(KvLedger::in_memory(), IndexerConfig::default(), None).unwrap();
//!
//! match indexer.push_new_block(&raw_block).unwrap() {
//!     PushOutcome::BlockRequired { block_required } => fetch(block_required),
//!     PushOutcome::Added { new_height, .. } => println!("height {}", new_height),
//! }
//! let balance = indexer.get_balance(&["1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".to_owned()]).unwrap();
//! ```
//!

pub mod history;
pub mod service;

use crate::api::history::{MemoryBudget, TxFetcher, TxView};
use crate::config::IndexerConfig;
use crate::index::block_index::{AttachPlan, ChainIndex, ChainNode, HeadSelector, RevertOutcome};
use crate::index::store::{
    BlockRow, IdKind, InputRow, LedgerStore, OutputRow, SourceLocator, TxRow,
};
use crate::index::timestamp_index::{TimestampIndex, TransactionOrder};
use crate::parser::block::BlockDecoder;
use crate::parser::errors::{OpError, OpErrorKind, OpResult};
use crate::parser::proto::Block;
use crate::parser::script::{evaluate_script, ScriptType};
use bitcoin::hashes::hex::{FromHex, ToHex};
use bitcoin::{BlockHash, Network};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

/// Result of `push_new_block`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PushOutcome {
    /// The predecessor is unknown and must be pushed first.
    BlockRequired { block_required: BlockHash },
    Added {
        db_id: u64,
        new_height: u64,
        /// Reverted blocks, former tip first.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        blocks_reverted: Vec<BlockHash>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub output_index: u32,
    pub value: u64,
    pub required_signers: u32,
}

/// A single-signature unspent output with its address attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoInsight {
    pub address: String,
    pub txid: String,
    pub vout: u32,
    pub satoshis: u64,
}

/// Fee bands in satoshis per 1000 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeEstimate {
    pub low: u64,
    pub normal: u64,
    pub high: u64,
}

/// Diagnostic classification of a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSummary {
    pub pattern: ScriptType,
    pub required_signers: u32,
    pub addresses: Vec<String>,
}

///
/// Classify a hex encoded output script. Unknown scripts are not an
/// error here, they come back as `NotRecognised`.
///
pub fn parse_script(script_pub_key: &str, network: Network) -> OpResult<ScriptSummary> {
    let bytes = Vec::<u8>::from_hex(script_pub_key)?;
    let info = evaluate_script(&bytes);
    let addresses = info
        .addresses
        .iter()
        .map(|a| a.encode(network))
        .collect::<OpResult<Vec<_>>>()?;
    Ok(ScriptSummary {
        pattern: info.pattern,
        required_signers: info.required_signers,
        addresses,
    })
}

struct IndexerState<S: LedgerStore> {
    store: S,
    chain: ChainIndex,
    timestamps: TimestampIndex,
    fees: Option<FeeEstimate>,
}

///
/// Ledger materializer over a [`LedgerStore`].
///
pub struct Indexer<S: LedgerStore> {
    config: IndexerConfig,
    decoder: BlockDecoder,
    state: Mutex<IndexerState<S>>,
}

impl<S: LedgerStore> Indexer<S> {
    ///
    /// Load the chain and timestamps from `store`.
    ///
    /// `selector` breaks ties when the stored blocks have several
    /// childless heads and no usable declared head.
    ///
    pub fn open(
        mut store: S,
        config: IndexerConfig,
        selector: Option<&HeadSelector>,
    ) -> OpResult<Indexer<S>> {
        let chain = ChainIndex::load(&mut store, selector)?;
        let timestamps = TimestampIndex::load(&store)?;
        info!(
            "indexer opened on {} at height {:?}",
            config.network,
            chain.get_height()
        );
        Ok(Indexer {
            decoder: BlockDecoder::new(config.network),
            config,
            state: Mutex::new(IndexerState {
                store,
                chain,
                timestamps,
                fees: None,
            }),
        })
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn decoder(&self) -> &BlockDecoder {
        &self.decoder
    }

    fn lock(&self) -> OpResult<MutexGuard<'_, IndexerState<S>>> {
        Ok(self.state.lock()?)
    }

    /// Consume the indexer, returning its store.
    pub fn into_store(self) -> OpResult<S> {
        Ok(self.state.into_inner()?.store)
    }

    ///
    /// Decode one unframed block and apply it to the ledger.
    ///
    /// If its predecessor is unknown nothing changes and the missing
    /// hash is returned. Otherwise blocks above the fork point are
    /// reverted, the new block is inserted, and its height returned.
    ///
    pub fn push_new_block(&self, raw: &[u8]) -> OpResult<PushOutcome> {
        let block = self.decoder.decode_submitted(raw)?;
        self.push_decoded_block(block, None)
    }

    /// Apply an already decoded block, optionally recording where it came from.
    pub fn push_decoded_block(
        &self,
        block: Block,
        source: Option<SourceLocator>,
    ) -> OpResult<PushOutcome> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let (revert, height) = match state.chain.try_add_new_block(block.prev_hash()) {
            AttachPlan::BlockRequired(missing) => {
                debug!("block {} needs predecessor {}", block.hash, missing);
                return Ok(PushOutcome::BlockRequired {
                    block_required: missing,
                });
            }
            AttachPlan::Attach { revert, height } => (revert, height),
        };

        state.store.begin()?;
        let checkpoint = state.chain.checkpoint(height as usize);
        let applied = state
            .apply(block, &revert, source, &self.config)
            .and_then(|row| {
                let timestamps = if revert.is_empty() {
                    None
                } else {
                    Some(TimestampIndex::load(&state.store)?)
                };
                state.store.commit()?;
                Ok((row, timestamps))
            });
        let (row, timestamps) = match applied {
            Ok(done) => done,
            Err(e) => {
                state.chain.restore(checkpoint);
                state.store.rollback()?;
                return Err(e);
            }
        };

        match timestamps {
            Some(reloaded) => state.timestamps = reloaded,
            None => state.timestamps.add_block(&row),
        }
        state.fees = None;
        if revert.is_empty() {
            debug!("block {} added at height {}", row.hash, height);
        } else {
            info!(
                "reorganized: {} blocks reverted, block {} at height {}",
                revert.len(),
                row.hash,
                height
            );
        }
        Ok(PushOutcome::Added {
            db_id: row.id,
            new_height: height,
            blocks_reverted: revert.into_iter().map(|n| n.hash).collect(),
        })
    }

    ///
    /// Unspent outputs per address, in output id order.
    /// Addresses never seen map to an empty list.
    ///
    pub fn get_utxo(&self, addresses: &[String]) -> OpResult<BTreeMap<String, Vec<Utxo>>> {
        let state = self.lock()?;
        let mut result = BTreeMap::new();
        for address in addresses {
            let mut utxos = Vec::new();
            if let Some(address_id) = state.store.address_id(address)? {
                for output in state.unspent_outputs(address_id)? {
                    let tx = state.tx_row(output.tx_id)?;
                    utxos.push(Utxo {
                        txid: tx.hash.to_hex(),
                        output_index: output.index,
                        value: output.value,
                        required_signers: output.required_spenders,
                    });
                }
            }
            result.insert(address.clone(), utxos);
        }
        Ok(result)
    }

    /// Single-signature unspent outputs of all addresses, flattened.
    pub fn get_utxo_insight(&self, addresses: &[String]) -> OpResult<Vec<UtxoInsight>> {
        let mut flat = Vec::new();
        for (address, utxos) in self.get_utxo(addresses)? {
            for utxo in utxos.into_iter().filter(|u| u.required_signers <= 1) {
                flat.push(UtxoInsight {
                    address: address.clone(),
                    txid: utxo.txid,
                    vout: utxo.output_index,
                    satoshis: utxo.value,
                });
            }
        }
        Ok(flat)
    }

    /// Sum of the balances of the distinct addresses given.
    pub fn get_balance(&self, addresses: &[String]) -> OpResult<u64> {
        Ok(self.get_balances(addresses)?.values().sum())
    }

    /// Balance per address, served from and filling the balance cache.
    pub fn get_balances(&self, addresses: &[String]) -> OpResult<BTreeMap<String, u64>> {
        let mut state = self.lock()?;
        let mut result = BTreeMap::new();
        for address in addresses {
            let balance = match state.store.address_id(address)? {
                Some(address_id) => state.balance(address_id)?,
                None => 0,
            };
            result.insert(address.clone(), balance);
        }
        Ok(result)
    }

    ///
    /// The most recent `max_txs` transactions touching any of the
    /// addresses, newest first, with their full input and output view.
    ///
    /// Fails with `ResourceLimit` once the views would exceed the
    /// configured memory limit.
    ///
    pub fn get_history(&self, addresses: &[String], max_txs: usize) -> OpResult<Vec<TxView>> {
        let state = self.lock()?;
        let mut tx_ids = BTreeSet::new();
        for address in addresses {
            if let Some(address_id) = state.store.address_id(address)? {
                tx_ids.extend(state.store.address_txs(address_id)?);
            }
        }
        let mut ordered: Vec<(TransactionOrder, u64)> = tx_ids
            .into_iter()
            .map(|id| (state.timestamps.get_timestamp(id), id))
            .collect();
        ordered.sort_by_key(|entry| Reverse(*entry));
        ordered.truncate(max_txs);

        let fetcher = TxFetcher {
            store: &state.store,
            chain: &state.chain,
            timestamps: &state.timestamps,
        };
        let mut budget = MemoryBudget::new(self.config.history_memory_limit);
        ordered
            .into_iter()
            .map(|(_, id)| fetcher.fetch(id, &mut budget))
            .collect()
    }

    ///
    /// Fee bands from the average per-block fee of the most recent
    /// blocks. Cached until the next successful push.
    ///
    pub fn get_fees(&self) -> OpResult<FeeEstimate> {
        let mut state = self.lock()?;
        if let Some(fees) = state.fees {
            return Ok(fees);
        }
        let mut total: u128 = 0;
        let mut count: u128 = 0;
        let recent = state.chain.nodes().iter().rev().take(self.config.fee_window);
        for node in recent {
            if let Some(fee) = state.store.block_fee(node.id)? {
                total += fee as u128;
                count += 1;
            }
        }
        let normal = if count == 0 { 0 } else { (total / count) as u64 };
        let fees = FeeEstimate {
            low: normal * 8 / 10,
            normal,
            high: normal * 12 / 10,
        };
        state.fees = Some(fees);
        Ok(fees)
    }

    /// Height of the tip, `None` while the chain is empty.
    pub fn get_blockchain_height(&self) -> OpResult<Option<u64>> {
        Ok(self.lock()?.chain.get_height())
    }

    pub fn get_block_by_height(&self, height: u64) -> OpResult<Option<BlockRow>> {
        let state = self.lock()?;
        match state.chain.node_at(height) {
            Some(node) => state.store.get_block(node.id),
            None => Ok(None),
        }
    }

    pub fn get_chain_node(&self, height: u64) -> OpResult<Option<ChainNode>> {
        Ok(self.lock()?.chain.node_at(height).cloned())
    }

    /// Resume point recorded by bulk ingestion.
    pub fn processing_state(&self) -> OpResult<Option<u64>> {
        self.lock()?.store.processing_state()
    }

    pub fn set_processing_state(&self, value: u64) -> OpResult<()> {
        self.lock()?.store.set_processing_state(value)
    }
}

impl<S: LedgerStore> IndexerState<S> {
    /// Everything between `begin` and `commit` of a push.
    fn apply(
        &mut self,
        mut block: Block,
        revert: &[ChainNode],
        source: Option<SourceLocator>,
        config: &IndexerConfig,
    ) -> OpResult<BlockRow> {
        for node in revert {
            self.revert_ledger(node.id)
                .map_err(|e| e.join_msg(&format!("reverting block {}", node.hash)))?;
            match self.chain.revert_block(&mut self.store, &node.hash)? {
                RevertOutcome::Reverted => {}
                outcome => {
                    return Err(OpError::new(OpErrorKind::ChainUsage)
                        .join_msg(&format!("revert of {} gave {:?}", node.hash, outcome)))
                }
            }
        }
        let row = self
            .materialize(&mut block, source, config)
            .map_err(|e| e.join_msg(&format!("block {}", block.hash)))?;
        self.chain
            .add_new_block(&mut self.store, &block.hash, block.prev_hash(), row.id)?;
        if !revert.is_empty() {
            self.store.clear_cached_balances()?;
        }
        Ok(row)
    }

    /// Undo the ledger effects of one block, last transaction first.
    fn revert_ledger(&mut self, block_id: u64) -> OpResult<()> {
        let block = self.store.get_block(block_id)?.ok_or_else(|| {
            OpError::new(OpErrorKind::StoreError).join_msg(&format!("block {} missing", block_id))
        })?;
        let mut touched = BTreeSet::new();
        for tx_id in block.tx_ids().rev() {
            let tx = self.tx_row(tx_id)?;
            for output in self.store.tx_outputs(tx_id)? {
                if output.spent_by.is_some() {
                    return Err(OpError::new(OpErrorKind::StoreError).join_msg(&format!(
                        "output {}:{} is spent outside the reverted blocks",
                        tx.hash, output.index
                    )));
                }
                for address_id in self.store.output_addresses(output.id)? {
                    self.store.unlink_address_output(address_id, output.id)?;
                    touched.insert(address_id);
                }
                self.store.delete_output(&output)?;
            }
            for input in self.store.tx_inputs(tx_id)? {
                if let Some(output_id) = input.output_id {
                    let mut spent = self.output_row(output_id)?;
                    spent.spent_by = None;
                    self.store.update_output(&spent)?;
                    touched.extend(self.store.output_addresses(output_id)?);
                }
                self.store.delete_input(&input)?;
            }
            for address_id in self.store.tx_addresses(tx_id)? {
                self.store.unlink_address_tx(address_id, tx_id)?;
            }
            self.store.delete_tx(&tx)?;
        }
        for address_id in touched {
            self.store.clear_cached_balance(address_id)?;
        }
        self.store.delete_block_fee(block.id)?;
        self.store.delete_block(&block)
    }

    /// Insert the block, its transactions, inputs, outputs and links.
    fn materialize(
        &mut self,
        block: &mut Block,
        source: Option<SourceLocator>,
        config: &IndexerConfig,
    ) -> OpResult<BlockRow> {
        let store = &mut self.store;
        let row = BlockRow {
            id: store.allocate_ids(IdKind::Block, 1)?,
            hash: block.hash,
            prev_hash: block.header.prev_blockhash,
            prev_id: self.chain.tip().map(|n| n.id),
            timestamp: block.header.time,
            first_tx_id: store.allocate_ids(IdKind::Transaction, block.txdata.len() as u64)?,
            tx_count: block.txdata.len() as u32,
            source,
        };
        store.insert_block(&row)?;

        let mut touched_block = BTreeSet::new();
        let (mut fee_in, mut fee_out, mut fee_size) = (0u128, 0u128, 0u128);
        for (position, tx) in block.txdata.iter_mut().enumerate() {
            let tx_id = row.first_tx_id + position as u64;
            let txid = tx.txid;
            store.insert_tx(&TxRow {
                id: tx_id,
                hash: txid,
                wtxid: if tx.is_segwit { Some(tx.wtxid) } else { None },
                lock_time: tx.lock_time,
                block_id: row.id,
                index: position as u32,
                input_count: tx.input.len() as u32,
                output_count: tx.output.len() as u32,
            })?;

            let mut touched_tx = BTreeSet::new();
            let mut input_value = 0u128;
            let first_input = store.allocate_ids(IdKind::Input, tx.input.len() as u64)?;
            for (index, txin) in tx.input.iter().enumerate() {
                let input_id = first_input + index as u64;
                let mut input = InputRow {
                    id: input_id,
                    tx_id,
                    index: index as u32,
                    prev_tx_id: None,
                    prev_vout: txin.prev_vout,
                    output_id: None,
                };
                if !txin.is_coinbase() {
                    let prev = store.find_tx(&txin.prev_txid)?.ok_or_else(|| {
                        OpError::new(OpErrorKind::StoreError).join_msg(&format!(
                            "input {} of {} spends unknown transaction {}",
                            index, txid, txin.prev_txid
                        ))
                    })?;
                    let mut spent = store.find_output(prev.id, txin.prev_vout)?.ok_or_else(|| {
                        OpError::new(OpErrorKind::StoreError).join_msg(&format!(
                            "input {} of {} spends unknown output {}:{}",
                            index, txid, txin.prev_txid, txin.prev_vout
                        ))
                    })?;
                    if spent.spent_by.is_some() {
                        return Err(OpError::new(OpErrorKind::StoreError).join_msg(&format!(
                            "input {} of {} spends already spent output {}:{}",
                            index, txid, txin.prev_txid, txin.prev_vout
                        )));
                    }
                    spent.spent_by = Some(input_id);
                    store.update_output(&spent)?;
                    input_value += spent.value as u128;
                    touched_tx.extend(store.output_addresses(spent.id)?);
                    input.prev_tx_id = Some(prev.id);
                    input.output_id = Some(spent.id);
                }
                store.insert_input(&input)?;
            }

            let mut output_value = 0u128;
            let first_output = store.allocate_ids(IdKind::Output, tx.output.len() as u64)?;
            for (index, txout) in tx.output.iter_mut().enumerate() {
                let output_id = first_output + index as u64;
                txout
                    .classify(config.tolerate_unknown_scripts)
                    .map_err(|e| e.join_msg(&format!("output {} of {}", index, txid)))?;
                if txout.pattern == Some(ScriptType::NotRecognised) {
                    warn!("output {}:{} has an unrecognised script", txid, index);
                }
                store.insert_output(&OutputRow {
                    id: output_id,
                    tx_id,
                    index: index as u32,
                    value: txout.value,
                    required_spenders: txout.required_signers,
                    script: txout.script_pubkey.clone(),
                    spent_by: None,
                })?;
                let mut linked = BTreeSet::new();
                for address in &txout.addresses {
                    let address_id = store.upsert_address(&address.encode(config.network)?)?;
                    if linked.insert(address_id) {
                        store.link_address_output(address_id, output_id)?;
                    }
                }
                touched_tx.extend(linked);
                output_value += txout.value as u128;
            }

            for address_id in &touched_tx {
                store.link_address_tx(*address_id, tx_id)?;
            }
            touched_block.extend(touched_tx);
            if !tx.is_coinbase() {
                fee_in += input_value;
                fee_out += output_value;
                fee_size += tx.size as u128;
            }
        }

        for address_id in touched_block {
            store.clear_cached_balance(address_id)?;
        }
        let fee_per_kb = if fee_size == 0 {
            0
        } else {
            (fee_in.saturating_sub(fee_out) * 1000 / fee_size) as u64
        };
        store.set_block_fee(row.id, fee_per_kb)?;
        Ok(row)
    }

    fn unspent_outputs(&self, address_id: u64) -> OpResult<Vec<OutputRow>> {
        let mut outputs = Vec::new();
        for output_id in self.store.address_outputs(address_id)? {
            let output = self.output_row(output_id)?;
            if output.spent_by.is_none() {
                outputs.push(output);
            }
        }
        Ok(outputs)
    }

    fn balance(&mut self, address_id: u64) -> OpResult<u64> {
        if let Some(cached) = self.store.cached_balance(address_id)? {
            return Ok(cached);
        }
        let balance = self
            .unspent_outputs(address_id)?
            .iter()
            .map(|o| o.value)
            .sum();
        self.store.set_cached_balance(address_id, balance)?;
        Ok(balance)
    }

    fn tx_row(&self, tx_id: u64) -> OpResult<TxRow> {
        self.store.get_tx(tx_id)?.ok_or_else(|| {
            OpError::new(OpErrorKind::StoreError).join_msg(&format!("transaction {} missing", tx_id))
        })
    }

    fn output_row(&self, output_id: u64) -> OpResult<OutputRow> {
        self.store.get_output(output_id)?.ok_or_else(|| {
            OpError::new(OpErrorKind::StoreError).join_msg(&format!("output {} missing", output_id))
        })
    }
}
