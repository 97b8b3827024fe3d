//!
//! Rebuild full transaction views for `get_history`, charging every
//! emitted field against a memory budget.
//!
use crate::index::block_index::ChainIndex;
use crate::index::store::{LedgerStore, TxRow};
use crate::index::timestamp_index::TimestampIndex;
use crate::parser::errors::{OpError, OpErrorKind, OpResult};
use bitcoin::hashes::hex::ToHex;
use serde::{Deserialize, Serialize};
use std::mem::size_of;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputView {
    pub txi_index: u32,
    pub value: u64,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputView {
    pub txo_index: u32,
    pub value: u64,
    pub required_spenders: u32,
    /// txid of the spending transaction
    pub spent_by: Option<String>,
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxView {
    pub hash: String,
    pub whash: Option<String>,
    pub locktime: u32,
    pub block_hash: String,
    pub block_height: Option<u64>,
    pub block_index: u32,
    pub timestamp: u32,
    /// coinbase inputs are omitted
    pub inputs: Vec<InputView>,
    pub outputs: Vec<OutputView>,
}

///
/// Bytes left for a query's output.
///
#[derive(Debug, Clone, Copy)]
pub struct MemoryBudget {
    remaining: u64,
}

impl MemoryBudget {
    pub fn new(limit: u64) -> Self {
        MemoryBudget { remaining: limit }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn charge(&mut self, bytes: usize) -> OpResult<()> {
        let bytes = bytes as u64;
        if bytes > self.remaining {
            return Err(OpError::new(OpErrorKind::ResourceLimit)
                .join_msg("history exceeds the memory budget"));
        }
        self.remaining -= bytes;
        Ok(())
    }

    fn charge_text(&mut self, text: &str) -> OpResult<()> {
        self.charge(size_of::<String>() + text.len())
    }
}

pub(crate) struct TxFetcher<'a, S: LedgerStore + ?Sized> {
    pub store: &'a S,
    pub chain: &'a ChainIndex,
    pub timestamps: &'a TimestampIndex,
}

impl<'a, S: LedgerStore + ?Sized> TxFetcher<'a, S> {
    pub fn fetch(&self, tx_id: u64, budget: &mut MemoryBudget) -> OpResult<TxView> {
        let tx = self.tx_row(tx_id)?;
        let block = self.store.get_block(tx.block_id)?.ok_or_else(|| {
            OpError::new(OpErrorKind::StoreError)
                .join_msg(&format!("block {} of tx {} missing", tx.block_id, tx.hash))
        })?;
        budget.charge(size_of::<TxView>())?;
        let hash = tx.hash.to_hex();
        budget.charge_text(&hash)?;
        let whash = tx.wtxid.map(|w| w.to_hex());
        if let Some(w) = &whash {
            budget.charge_text(w)?;
        }
        let block_hash = block.hash.to_hex();
        budget.charge_text(&block_hash)?;

        let mut inputs = Vec::new();
        for input in self.store.tx_inputs(tx_id)? {
            let output_id = match input.output_id {
                Some(id) => id,
                None => continue,
            };
            budget.charge(size_of::<InputView>())?;
            let output = self.store.get_output(output_id)?.ok_or_else(|| {
                OpError::new(OpErrorKind::StoreError)
                    .join_msg(&format!("output {} spent by {} missing", output_id, tx.hash))
            })?;
            inputs.push(InputView {
                txi_index: input.index,
                value: output.value,
                addresses: self.addresses(output_id, budget)?,
            });
        }

        let mut outputs = Vec::new();
        for output in self.store.tx_outputs(tx_id)? {
            budget.charge(size_of::<OutputView>())?;
            let spent_by = match output.spent_by {
                Some(input_id) => {
                    let txid = self.spender(input_id)?;
                    budget.charge_text(&txid)?;
                    Some(txid)
                }
                None => None,
            };
            outputs.push(OutputView {
                txo_index: output.index,
                value: output.value,
                required_spenders: output.required_spenders,
                spent_by,
                addresses: self.addresses(output.id, budget)?,
            });
        }

        Ok(TxView {
            hash,
            whash,
            locktime: tx.lock_time,
            block_hash,
            block_height: self.chain.height_of(&block.hash),
            block_index: tx.index,
            timestamp: self.timestamps.get_timestamp(tx_id).timestamp,
            inputs,
            outputs,
        })
    }

    fn tx_row(&self, tx_id: u64) -> OpResult<TxRow> {
        self.store.get_tx(tx_id)?.ok_or_else(|| {
            OpError::new(OpErrorKind::StoreError).join_msg(&format!("transaction {} missing", tx_id))
        })
    }

    fn addresses(&self, output_id: u64, budget: &mut MemoryBudget) -> OpResult<Vec<String>> {
        let mut texts = Vec::new();
        for address_id in self.store.output_addresses(output_id)? {
            if let Some(text) = self.store.address_text(address_id)? {
                budget.charge_text(&text)?;
                texts.push(text);
            }
        }
        Ok(texts)
    }

    fn spender(&self, input_id: u64) -> OpResult<String> {
        match self.store.get_input(input_id)? {
            Some(input) => Ok(self.tx_row(input.tx_id)?.hash.to_hex()),
            None => Err(OpError::new(OpErrorKind::StoreError)
                .join_msg(&format!("spending input {} missing", input_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exhaustion() {
        let mut budget = MemoryBudget::new(10);
        budget.charge(4).unwrap();
        budget.charge(6).unwrap();
        assert_eq!(budget.remaining(), 0);
        let err = budget.charge(1).unwrap_err();
        assert!(err.is_kind(OpErrorKind::ResourceLimit));
    }
}
