//!
//! Builders for raw blocks and transactions used by the integration tests.
//!
#![allow(dead_code)]

use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Network, Txid};
use bitcoin_ledger::parser::address::{Address, AddressKind};
use bitcoin_ledger::parser::reader::write_varint;
use bitcoin_ledger::{Indexer, IndexerConfig, KvLedger, MemoryBackend};

pub const COIN: u64 = 100_000_000;

pub fn p2pkh(fill: u8) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(&[fill; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

pub fn address(fill: u8) -> String {
    Address::hash20(AddressKind::PubkeyHash, &[fill; 20])
        .encode(Network::Bitcoin)
        .unwrap()
}

pub fn compressed_key(fill: u8) -> Vec<u8> {
    let mut pk = vec![0x02];
    pk.extend_from_slice(&[fill; 32]);
    pk
}

/// `m` of the keys, bare multisig
pub fn multisig(m: u8, keys: &[Vec<u8>]) -> Vec<u8> {
    let mut script = vec![0x50 + m];
    for key in keys {
        script.push(key.len() as u8);
        script.extend_from_slice(key);
    }
    script.push(0x50 + keys.len() as u8);
    script.push(0xae);
    script
}

pub fn pubkey_address(key: &[u8]) -> String {
    let hash = bitcoin::hashes::hash160::Hash::hash(key);
    Address::hash20(AddressKind::Pubkey, &hash[..])
        .encode(Network::Bitcoin)
        .unwrap()
}

/// A legacy transaction and its txid.
#[derive(Debug, Clone)]
pub struct RawTx {
    pub bytes: Vec<u8>,
    pub txid: Txid,
}

impl RawTx {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

fn finish(inputs: &[(Txid, u32, Vec<u8>)], outputs: &[(u64, Vec<u8>)]) -> RawTx {
    let mut bytes = vec![1, 0, 0, 0];
    write_varint(&mut bytes, inputs.len() as u64);
    for (txid, vout, script_sig) in inputs {
        bytes.extend_from_slice(&txid[..]);
        bytes.extend_from_slice(&vout.to_le_bytes());
        write_varint(&mut bytes, script_sig.len() as u64);
        bytes.extend_from_slice(script_sig);
        bytes.extend_from_slice(&[0xff; 4]);
    }
    write_varint(&mut bytes, outputs.len() as u64);
    for (value, script) in outputs {
        bytes.extend_from_slice(&value.to_le_bytes());
        write_varint(&mut bytes, script.len() as u64);
        bytes.extend_from_slice(script);
    }
    bytes.extend_from_slice(&[0u8; 4]);
    let txid = Txid::hash(&bytes);
    RawTx { bytes, txid }
}

/// `tag` keeps coinbase txids distinct.
pub fn coinbase(tag: u32, outputs: &[(u64, Vec<u8>)]) -> RawTx {
    let zero = Txid::from_inner([0; 32]);
    finish(&[(zero, 0xffff_ffff, tag.to_le_bytes().to_vec())], outputs)
}

pub fn spend(inputs: &[(Txid, u32)], outputs: &[(u64, Vec<u8>)]) -> RawTx {
    let inputs: Vec<_> = inputs
        .iter()
        .map(|(txid, vout)| (*txid, *vout, vec![0x51]))
        .collect();
    finish(&inputs, outputs)
}

/// An unframed block and its hash.
#[derive(Debug, Clone)]
pub struct RawBlock {
    pub bytes: Vec<u8>,
    pub hash: BlockHash,
}

impl RawBlock {
    pub fn framed(&self, network: Network) -> Vec<u8> {
        let mut out = network.magic().to_le_bytes().to_vec();
        out.extend_from_slice(&(self.bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.bytes);
        out
    }
}

pub fn block(prev: &BlockHash, time: u32, txs: &[&RawTx]) -> RawBlock {
    let mut bytes = vec![1, 0, 0, 0];
    bytes.extend_from_slice(&prev[..]);
    bytes.extend_from_slice(&[0u8; 32]);
    bytes.extend_from_slice(&time.to_le_bytes());
    bytes.extend_from_slice(&[0xff, 0xff, 0x00, 0x1d]);
    bytes.extend_from_slice(&time.wrapping_mul(7).to_le_bytes());
    write_varint(&mut bytes, txs.len() as u64);
    for tx in txs {
        bytes.extend_from_slice(&tx.bytes);
    }
    let hash = BlockHash::hash(&bytes[..80]);
    RawBlock { bytes, hash }
}

pub fn genesis_prev() -> BlockHash {
    BlockHash::from_inner([0; 32])
}

pub type MemIndexer = Indexer<KvLedger<MemoryBackend>>;

pub fn memory_indexer() -> MemIndexer {
    memory_indexer_with(IndexerConfig::default())
}

pub fn memory_indexer_with(config: IndexerConfig) -> MemIndexer {
    Indexer::open(KvLedger::in_memory(), config, None).unwrap()
}

/// Chain A -> B -> C.
///
/// A pays 50 to address 1. B moves 30 of it to address 2, 19.9999 back
/// to address 1. C pays its coinbase to address 3.
pub struct Fixture {
    pub a: RawBlock,
    pub b: RawBlock,
    pub c: RawBlock,
    pub a_coinbase: RawTx,
    pub b_spend: RawTx,
    pub b_fee: u64,
}

pub fn fixture() -> Fixture {
    let a_coinbase = coinbase(0, &[(50 * COIN, p2pkh(1))]);
    let a = block(&genesis_prev(), 1_000, &[&a_coinbase]);

    let b_coinbase = coinbase(1, &[(50 * COIN, p2pkh(9))]);
    let b_spend = spend(
        &[(a_coinbase.txid, 0)],
        &[(30 * COIN, p2pkh(2)), (20 * COIN - 10_000, p2pkh(1))],
    );
    let b = block(&a.hash, 2_000, &[&b_coinbase, &b_spend]);

    let c_coinbase = coinbase(2, &[(50 * COIN, p2pkh(3))]);
    let c = block(&b.hash, 3_000, &[&c_coinbase]);
    Fixture {
        a,
        b,
        c,
        a_coinbase,
        b_spend,
        b_fee: 10_000,
    }
}
