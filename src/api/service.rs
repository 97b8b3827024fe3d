//!
//! JSON surface for an embedding host.
//!
//! Each call returns a string borrowed from a buffer owned by the
//! service handle; the next call on the same handle overwrites it.
//! Use one handle per caller, they all share the same [`Indexer`].
//!
use crate::api::{Indexer, PushOutcome};
use crate::index::store::LedgerStore;
use crate::parser::errors::OpResult;
use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct HistoryRequest {
    addresses: Vec<String>,
    max_txs: usize,
}

/// Wire form of [`PushOutcome`]: reverted blocks go out as a count.
#[derive(Serialize)]
#[serde(untagged)]
enum PushResponse {
    BlockRequired {
        block_required: BlockHash,
    },
    Added {
        #[serde(skip_serializing_if = "is_zero")]
        blocks_reverted: usize,
        db_id: u64,
        new_height: u64,
    },
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl From<PushOutcome> for PushResponse {
    fn from(outcome: PushOutcome) -> Self {
        match outcome {
            PushOutcome::BlockRequired { block_required } => {
                PushResponse::BlockRequired { block_required }
            }
            PushOutcome::Added {
                db_id,
                new_height,
                blocks_reverted,
            } => PushResponse::Added {
                blocks_reverted: blocks_reverted.len(),
                db_id,
                new_height,
            },
        }
    }
}

#[derive(Serialize)]
struct UtxoEntry {
    value: String,
    txid: String,
    output_index: u32,
    min_sigs: u32,
}

#[derive(Serialize)]
struct InsightEntry {
    address: String,
    txid: String,
    vout: u32,
    satoshis: String,
}

#[derive(Serialize)]
struct Fees {
    low: String,
    normal: String,
    high: String,
}

pub struct QueryService<S: LedgerStore> {
    indexer: Arc<Indexer<S>>,
    buffer: String,
}

impl<S: LedgerStore> Clone for QueryService<S> {
    /// A fresh handle with its own buffer.
    fn clone(&self) -> Self {
        QueryService::new(self.indexer.clone())
    }
}

impl<S: LedgerStore> QueryService<S> {
    pub fn new(indexer: Arc<Indexer<S>>) -> Self {
        QueryService {
            indexer,
            buffer: String::new(),
        }
    }

    pub fn indexer(&self) -> &Arc<Indexer<S>> {
        &self.indexer
    }

    fn respond<T: Serialize>(&mut self, value: &T) -> OpResult<&str> {
        self.buffer = serde_json::to_string(value)?;
        Ok(&self.buffer)
    }

    /// `{"block_required": hash}` or `{"db_id", "new_height", "blocks_reverted"?}`
    /// where `blocks_reverted` counts the blocks undone by a reorganisation.
    pub fn push_new_block(&mut self, raw: &[u8]) -> OpResult<&str> {
        let outcome: PushOutcome = self.indexer.push_new_block(raw)?;
        self.respond(&PushResponse::from(outcome))
    }

    /// `["addr", ...]` to `{"addr": [{"value", "txid", "output_index", "min_sigs"}]}`
    pub fn get_utxo(&mut self, request: &str) -> OpResult<&str> {
        let addresses: Vec<String> = serde_json::from_str(request)?;
        let utxos: BTreeMap<String, Vec<UtxoEntry>> = self
            .indexer
            .get_utxo(&addresses)?
            .into_iter()
            .map(|(address, list)| {
                let entries = list
                    .into_iter()
                    .map(|u| UtxoEntry {
                        value: u.value.to_string(),
                        txid: u.txid,
                        output_index: u.output_index,
                        min_sigs: u.required_signers,
                    })
                    .collect();
                (address, entries)
            })
            .collect();
        self.respond(&utxos)
    }

    pub fn get_utxo_insight(&mut self, request: &str) -> OpResult<&str> {
        let addresses: Vec<String> = serde_json::from_str(request)?;
        let entries: Vec<InsightEntry> = self
            .indexer
            .get_utxo_insight(&addresses)?
            .into_iter()
            .map(|u| InsightEntry {
                address: u.address,
                txid: u.txid,
                vout: u.vout,
                satoshis: u.satoshis.to_string(),
            })
            .collect();
        self.respond(&entries)
    }

    pub fn get_balance(&mut self, request: &str) -> OpResult<&str> {
        let addresses: Vec<String> = serde_json::from_str(request)?;
        let total = self.indexer.get_balance(&addresses)?;
        self.respond(&total.to_string())
    }

    pub fn get_balances(&mut self, request: &str) -> OpResult<&str> {
        let addresses: Vec<String> = serde_json::from_str(request)?;
        let balances: BTreeMap<String, String> = self
            .indexer
            .get_balances(&addresses)?
            .into_iter()
            .map(|(address, value)| (address, value.to_string()))
            .collect();
        self.respond(&balances)
    }

    /// `{"addresses": [...], "max_txs": n}`
    pub fn get_history(&mut self, request: &str) -> OpResult<&str> {
        let request: HistoryRequest = serde_json::from_str(request)?;
        let history = self
            .indexer
            .get_history(&request.addresses, request.max_txs)?;
        self.respond(&history)
    }

    pub fn get_fees(&mut self) -> OpResult<&str> {
        let fees = self.indexer.get_fees()?;
        self.respond(&Fees {
            low: fees.low.to_string(),
            normal: fees.normal.to_string(),
            high: fees.high.to_string(),
        })
    }

    /// The tip height, `null` for an empty chain.
    pub fn get_blockchain_height(&mut self) -> OpResult<&str> {
        let height = self.indexer.get_blockchain_height()?;
        self.respond(&height)
    }
}
