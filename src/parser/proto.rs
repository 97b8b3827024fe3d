//!
//! Decoded block and transaction records.
//!
//! Hashes are computed while decoding and stored alongside the fields,
//! so nothing here ever re-serializes.
//!
use crate::parser::address::Address;
use crate::parser::errors::OpResult;
use crate::parser::script::{classify, ScriptType};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Txid, Wtxid};
use serde::{Deserialize, Serialize};

/// Where a block's framed bytes (magic through end of body) live in its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockLocation {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_blockhash: BlockHash,
    pub merkle_root: [u8; 32],
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub magic: u32,
    pub declared_length: u32,
    pub header: BlockHeader,
    pub hash: BlockHash,
    /// Empty when the decoder's output filter suppressed the body.
    pub txdata: Vec<Transaction>,
    pub location: BlockLocation,
}

impl Block {
    #[inline]
    pub fn prev_hash(&self) -> &BlockHash {
        &self.header.prev_blockhash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub input: Vec<TxIn>,
    pub output: Vec<TxOut>,
    pub lock_time: u32,
    pub is_segwit: bool,
    pub txid: Txid,
    /// Equal to `txid` for transactions without witness data.
    pub wtxid: Wtxid,
    /// Serialized size in bytes, witness included.
    pub size: u32,
    /// Position within the containing block.
    pub index: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.input.iter().any(|i| i.is_coinbase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prev_txid: Txid,
    pub prev_vout: u32,
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    /// An all-zero previous hash marks a coinbase input.
    #[inline]
    pub fn is_coinbase(&self) -> bool {
        self.prev_txid.as_inner() == &[0u8; 32]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
    pub addresses: Vec<Address>,
    pub required_signers: u32,
    pub pattern: Option<ScriptType>,
}

impl TxOut {
    pub fn new(value: u64, script_pubkey: Vec<u8>) -> Self {
        TxOut {
            value,
            script_pubkey,
            addresses: Vec::new(),
            required_signers: 1,
            pattern: None,
        }
    }

    ///
    /// Resolve addresses from the script. On success the script bytes
    /// are dropped, except for tolerated unrecognised scripts which keep
    /// them for later inspection.
    ///
    pub fn classify(&mut self, tolerate_unknown: bool) -> OpResult<&[Address]> {
        if self.pattern.is_none() {
            let info = classify(&self.script_pubkey, tolerate_unknown)?;
            if info.pattern != ScriptType::NotRecognised {
                self.script_pubkey = Vec::new();
            }
            self.addresses = info.addresses;
            self.required_signers = info.required_signers;
            self.pattern = Some(info.pattern);
        }
        Ok(&self.addresses)
    }
}
