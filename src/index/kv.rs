//!
//! [`LedgerStore`] over an ordered key-value backend.
//!
//! Every record set lives under its own one-byte key prefix. Ids are
//! written big-endian so that prefix scans return rows in id order.
//! Relations are stored in both directions.
//!
//! Transactions stage their writes in an ordered overlay which reads
//! consult first; `commit` hands the overlay to the backend as one
//! atomic batch.
//!
use crate::index::store::{
    BlockRow, ChainLink, ChainSource, IdKind, InputRow, LedgerStore, OutputRow, TxRow,
};
use crate::parser::errors::{OpError, OpErrorKind, OpResult};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Txid};
use byteorder::{BigEndian, ByteOrder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Bound;

const BLOCK: u8 = b'b';
const BLOCK_BY_HASH: u8 = b'h';
const TX: u8 = b't';
const TX_BY_HASH: u8 = b'T';
const INPUT: u8 = b'i';
const TX_INPUT: u8 = b'I';
const OUTPUT: u8 = b'o';
const TX_OUTPUT: u8 = b'O';
const ADDRESS: u8 = b'a';
const ADDRESS_BY_TEXT: u8 = b'A';
const ADDRESS_OUTPUT: u8 = b'l';
const OUTPUT_ADDRESS: u8 = b'L';
const ADDRESS_TX: u8 = b'm';
const TX_ADDRESS: u8 = b'M';
const BALANCE: u8 = b'c';
const BLOCK_FEE: u8 = b'f';
const SEQUENCE: u8 = b'n';
const DECLARED_HEAD: &[u8] = b"D";
const PROCESSING_STATE: &[u8] = b"S";

pub type KvWrite = (Vec<u8>, Option<Vec<u8>>);

///
/// Ordered key-value storage. `scan_prefix` returns pairs in key order;
/// `write_batch` applies all writes or none.
///
pub trait KvBackend: Send {
    fn get(&self, key: &[u8]) -> OpResult<Option<Vec<u8>>>;
    fn scan_prefix(&self, prefix: &[u8]) -> OpResult<Vec<(Vec<u8>, Vec<u8>)>>;
    fn write_batch(&mut self, writes: Vec<KvWrite>) -> OpResult<()>;
}

/// Volatile backend over a `BTreeMap`.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> OpResult<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> OpResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .map
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&mut self, writes: Vec<KvWrite>) -> OpResult<()> {
        for (key, value) in writes {
            match value {
                Some(v) => self.map.insert(key, v),
                None => self.map.remove(&key),
            };
        }
        Ok(())
    }
}

#[cfg(feature = "rocksdb")]
pub use rocks::RocksBackend;

#[cfg(feature = "rocksdb")]
mod rocks {
    use super::{KvBackend, KvWrite};
    use crate::parser::errors::OpResult;
    use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
    use std::path::Path;

    /// Durable backend on RocksDB.
    pub struct RocksBackend {
        db: DB,
    }

    impl RocksBackend {
        pub fn open(path: &Path) -> OpResult<RocksBackend> {
            let mut options = Options::default();
            options.create_if_missing(true);
            Ok(RocksBackend {
                db: DB::open(&options, path)?,
            })
        }
    }

    impl KvBackend for RocksBackend {
        fn get(&self, key: &[u8]) -> OpResult<Option<Vec<u8>>> {
            Ok(self.db.get(key)?)
        }

        fn scan_prefix(&self, prefix: &[u8]) -> OpResult<Vec<(Vec<u8>, Vec<u8>)>> {
            let mut out = Vec::new();
            for item in self
                .db
                .iterator(IteratorMode::From(prefix, Direction::Forward))
            {
                let (key, value) = item?;
                if !key.starts_with(prefix) {
                    break;
                }
                out.push((key.to_vec(), value.to_vec()));
            }
            Ok(out)
        }

        fn write_batch(&mut self, writes: Vec<KvWrite>) -> OpResult<()> {
            let mut batch = WriteBatch::default();
            for (key, value) in writes {
                match value {
                    Some(v) => batch.put(key, v),
                    None => batch.delete(key),
                }
            }
            Ok(self.db.write(batch)?)
        }
    }
}

/// The ledger on a key-value backend.
pub struct KvLedger<B: KvBackend> {
    backend: B,
    staged: Option<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl KvLedger<MemoryBackend> {
    pub fn in_memory() -> Self {
        KvLedger::new(MemoryBackend::new())
    }
}

impl<B: KvBackend> KvLedger<B> {
    pub fn new(backend: B) -> Self {
        KvLedger {
            backend,
            staged: None,
        }
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    fn get(&self, key: &[u8]) -> OpResult<Option<Vec<u8>>> {
        if let Some(staged) = &self.staged {
            if let Some(value) = staged.get(key) {
                return Ok(value.clone());
            }
        }
        self.backend.get(key)
    }

    fn scan(&self, prefix: &[u8]) -> OpResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let stored = self.backend.scan_prefix(prefix)?;
        let staged = match &self.staged {
            Some(staged) => staged,
            None => return Ok(stored),
        };
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = stored.into_iter().collect();
        let overlay = staged
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix));
        for (key, value) in overlay {
            match value {
                Some(v) => merged.insert(key.clone(), v.clone()),
                None => merged.remove(key),
            };
        }
        Ok(merged.into_iter().collect())
    }

    fn write(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) -> OpResult<()> {
        match &mut self.staged {
            Some(staged) => {
                staged.insert(key, value);
                Ok(())
            }
            None => self.backend.write_batch(vec![(key, value)]),
        }
    }

    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) -> OpResult<()> {
        self.write(key, Some(value))
    }

    fn delete(&mut self, key: Vec<u8>) -> OpResult<()> {
        self.write(key, None)
    }

    fn get_row<T: DeserializeOwned>(&self, key: &[u8]) -> OpResult<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_u64(&self, key: &[u8]) -> OpResult<Option<u64>> {
        match self.get(key)? {
            Some(bytes) if bytes.len() == 8 => Ok(Some(BigEndian::read_u64(&bytes))),
            Some(_) => Err(corrupt(key)),
            None => Ok(None),
        }
    }

    fn put_u64(&mut self, key: Vec<u8>, value: u64) -> OpResult<()> {
        self.put(key, value.to_be_bytes().to_vec())
    }

    /// Ids stored as the trailing 8 bytes of keys under `prefix`.
    fn scan_ids(&self, prefix: &[u8]) -> OpResult<Vec<u64>> {
        self.scan(prefix)?
            .into_iter()
            .map(|(key, _)| trailing_id(&key))
            .collect()
    }
}

impl<B: KvBackend> ChainSource for KvLedger<B> {
    fn chain_links(&self) -> OpResult<Vec<ChainLink>> {
        Ok(self
            .blocks()?
            .into_iter()
            .map(|row| ChainLink {
                id: row.id,
                hash: row.hash,
                prev_hash: row.prev_hash,
            })
            .collect())
    }

    fn declared_head(&self) -> OpResult<Option<BlockHash>> {
        match self.get(DECLARED_HEAD)? {
            Some(bytes) if bytes.len() == 32 => Ok(Some(BlockHash::from_slice(&bytes).map_err(
                |_| corrupt(DECLARED_HEAD),
            )?)),
            Some(_) => Err(corrupt(DECLARED_HEAD)),
            None => Ok(None),
        }
    }

    fn set_declared_head(&mut self, head: Option<&BlockHash>) -> OpResult<()> {
        self.write(DECLARED_HEAD.to_vec(), head.map(|h| h[..].to_vec()))
    }
}

impl<B: KvBackend> LedgerStore for KvLedger<B> {
    fn begin(&mut self) -> OpResult<()> {
        if self.staged.is_some() {
            return Err(OpError::new(OpErrorKind::StoreError).join_msg("transaction already open"));
        }
        self.staged = Some(BTreeMap::new());
        Ok(())
    }

    fn commit(&mut self) -> OpResult<()> {
        match self.staged.take() {
            Some(staged) => self.backend.write_batch(staged.into_iter().collect()),
            None => Err(OpError::new(OpErrorKind::StoreError).join_msg("no open transaction")),
        }
    }

    fn rollback(&mut self) -> OpResult<()> {
        self.staged = None;
        Ok(())
    }

    fn allocate_ids(&mut self, kind: IdKind, count: u64) -> OpResult<u64> {
        let tag = match kind {
            IdKind::Block => BLOCK,
            IdKind::Transaction => TX,
            IdKind::Input => INPUT,
            IdKind::Output => OUTPUT,
            IdKind::Address => ADDRESS,
        };
        let key = vec![SEQUENCE, tag];
        let first = self.get_u64(&key)?.unwrap_or(0);
        self.put_u64(key, first + count)?;
        Ok(first)
    }

    fn insert_block(&mut self, row: &BlockRow) -> OpResult<()> {
        self.put(key1(BLOCK, row.id), encode_row(row)?)?;
        self.put_u64(hash_key(BLOCK_BY_HASH, &row.hash[..]), row.id)
    }

    fn delete_block(&mut self, row: &BlockRow) -> OpResult<()> {
        self.delete(key1(BLOCK, row.id))?;
        self.delete(hash_key(BLOCK_BY_HASH, &row.hash[..]))
    }

    fn get_block(&self, id: u64) -> OpResult<Option<BlockRow>> {
        self.get_row(&key1(BLOCK, id))
    }

    fn find_block(&self, hash: &BlockHash) -> OpResult<Option<BlockRow>> {
        match self.get_u64(&hash_key(BLOCK_BY_HASH, &hash[..]))? {
            Some(id) => self.get_block(id),
            None => Ok(None),
        }
    }

    fn blocks(&self) -> OpResult<Vec<BlockRow>> {
        self.scan(&[BLOCK])?
            .iter()
            .map(|(_, v)| decode_row(v))
            .collect()
    }

    fn insert_tx(&mut self, row: &TxRow) -> OpResult<()> {
        self.put(key1(TX, row.id), encode_row(row)?)?;
        let mut by_hash = hash_key(TX_BY_HASH, &row.hash[..]);
        by_hash.extend_from_slice(&row.id.to_be_bytes());
        self.put(by_hash, Vec::new())
    }

    fn delete_tx(&mut self, row: &TxRow) -> OpResult<()> {
        self.delete(key1(TX, row.id))?;
        let mut by_hash = hash_key(TX_BY_HASH, &row.hash[..]);
        by_hash.extend_from_slice(&row.id.to_be_bytes());
        self.delete(by_hash)
    }

    fn get_tx(&self, id: u64) -> OpResult<Option<TxRow>> {
        self.get_row(&key1(TX, id))
    }

    fn find_tx(&self, hash: &Txid) -> OpResult<Option<TxRow>> {
        let ids = self.scan_ids(&hash_key(TX_BY_HASH, &hash[..]))?;
        match ids.last() {
            Some(id) => self.get_tx(*id),
            None => Ok(None),
        }
    }

    fn insert_input(&mut self, row: &InputRow) -> OpResult<()> {
        self.put(key1(INPUT, row.id), encode_row(row)?)?;
        self.put(key2(TX_INPUT, row.tx_id, row.id), Vec::new())
    }

    fn delete_input(&mut self, row: &InputRow) -> OpResult<()> {
        self.delete(key1(INPUT, row.id))?;
        self.delete(key2(TX_INPUT, row.tx_id, row.id))
    }

    fn get_input(&self, id: u64) -> OpResult<Option<InputRow>> {
        self.get_row(&key1(INPUT, id))
    }

    fn tx_inputs(&self, tx_id: u64) -> OpResult<Vec<InputRow>> {
        let mut rows = Vec::new();
        for id in self.scan_ids(&key1(TX_INPUT, tx_id))? {
            let row = self.get_input(id)?.ok_or_else(|| missing("input", id))?;
            rows.push(row);
        }
        rows.sort_by_key(|r| r.index);
        Ok(rows)
    }

    fn insert_output(&mut self, row: &OutputRow) -> OpResult<()> {
        self.put(key1(OUTPUT, row.id), encode_row(row)?)?;
        self.put_u64(key2(TX_OUTPUT, row.tx_id, row.index as u64), row.id)
    }

    fn update_output(&mut self, row: &OutputRow) -> OpResult<()> {
        self.put(key1(OUTPUT, row.id), encode_row(row)?)
    }

    fn delete_output(&mut self, row: &OutputRow) -> OpResult<()> {
        self.delete(key1(OUTPUT, row.id))?;
        self.delete(key2(TX_OUTPUT, row.tx_id, row.index as u64))
    }

    fn get_output(&self, id: u64) -> OpResult<Option<OutputRow>> {
        self.get_row(&key1(OUTPUT, id))
    }

    fn find_output(&self, tx_id: u64, index: u32) -> OpResult<Option<OutputRow>> {
        match self.get_u64(&key2(TX_OUTPUT, tx_id, index as u64))? {
            Some(id) => self.get_output(id),
            None => Ok(None),
        }
    }

    fn tx_outputs(&self, tx_id: u64) -> OpResult<Vec<OutputRow>> {
        let mut rows = Vec::new();
        for (key, value) in self.scan(&key1(TX_OUTPUT, tx_id))? {
            if value.len() != 8 {
                return Err(corrupt(&key));
            }
            let id = BigEndian::read_u64(&value);
            let row = self.get_output(id)?.ok_or_else(|| missing("output", id))?;
            rows.push(row);
        }
        Ok(rows)
    }

    fn address_id(&self, text: &str) -> OpResult<Option<u64>> {
        self.get_u64(&hash_key(ADDRESS_BY_TEXT, text.as_bytes()))
    }

    fn address_text(&self, id: u64) -> OpResult<Option<String>> {
        match self.get(&key1(ADDRESS, id))? {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes).map_err(|_| corrupt(&key1(ADDRESS, id)))?,
            )),
            None => Ok(None),
        }
    }

    fn upsert_address(&mut self, text: &str) -> OpResult<u64> {
        if let Some(id) = self.address_id(text)? {
            return Ok(id);
        }
        let id = self.allocate_ids(IdKind::Address, 1)?;
        self.put(key1(ADDRESS, id), text.as_bytes().to_vec())?;
        self.put_u64(hash_key(ADDRESS_BY_TEXT, text.as_bytes()), id)?;
        Ok(id)
    }

    fn link_address_output(&mut self, address_id: u64, output_id: u64) -> OpResult<()> {
        self.put(key2(ADDRESS_OUTPUT, address_id, output_id), Vec::new())?;
        self.put(key2(OUTPUT_ADDRESS, output_id, address_id), Vec::new())
    }

    fn unlink_address_output(&mut self, address_id: u64, output_id: u64) -> OpResult<()> {
        self.delete(key2(ADDRESS_OUTPUT, address_id, output_id))?;
        self.delete(key2(OUTPUT_ADDRESS, output_id, address_id))
    }

    fn output_addresses(&self, output_id: u64) -> OpResult<Vec<u64>> {
        self.scan_ids(&key1(OUTPUT_ADDRESS, output_id))
    }

    fn address_outputs(&self, address_id: u64) -> OpResult<Vec<u64>> {
        self.scan_ids(&key1(ADDRESS_OUTPUT, address_id))
    }

    fn link_address_tx(&mut self, address_id: u64, tx_id: u64) -> OpResult<()> {
        self.put(key2(ADDRESS_TX, address_id, tx_id), Vec::new())?;
        self.put(key2(TX_ADDRESS, tx_id, address_id), Vec::new())
    }

    fn unlink_address_tx(&mut self, address_id: u64, tx_id: u64) -> OpResult<()> {
        self.delete(key2(ADDRESS_TX, address_id, tx_id))?;
        self.delete(key2(TX_ADDRESS, tx_id, address_id))
    }

    fn tx_addresses(&self, tx_id: u64) -> OpResult<Vec<u64>> {
        self.scan_ids(&key1(TX_ADDRESS, tx_id))
    }

    fn address_txs(&self, address_id: u64) -> OpResult<Vec<u64>> {
        self.scan_ids(&key1(ADDRESS_TX, address_id))
    }

    fn cached_balance(&self, address_id: u64) -> OpResult<Option<u64>> {
        self.get_u64(&key1(BALANCE, address_id))
    }

    fn set_cached_balance(&mut self, address_id: u64, value: u64) -> OpResult<()> {
        self.put_u64(key1(BALANCE, address_id), value)
    }

    fn clear_cached_balance(&mut self, address_id: u64) -> OpResult<()> {
        self.delete(key1(BALANCE, address_id))
    }

    fn clear_cached_balances(&mut self) -> OpResult<()> {
        for (key, _) in self.scan(&[BALANCE])? {
            self.delete(key)?;
        }
        Ok(())
    }

    fn set_block_fee(&mut self, block_id: u64, fee_per_kb: u64) -> OpResult<()> {
        self.put_u64(key1(BLOCK_FEE, block_id), fee_per_kb)
    }

    fn block_fee(&self, block_id: u64) -> OpResult<Option<u64>> {
        self.get_u64(&key1(BLOCK_FEE, block_id))
    }

    fn delete_block_fee(&mut self, block_id: u64) -> OpResult<()> {
        self.delete(key1(BLOCK_FEE, block_id))
    }

    fn processing_state(&self) -> OpResult<Option<u64>> {
        self.get_u64(PROCESSING_STATE)
    }

    fn set_processing_state(&mut self, state: u64) -> OpResult<()> {
        self.put_u64(PROCESSING_STATE.to_vec(), state)
    }
}

fn key1(prefix: u8, id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(prefix);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn key2(prefix: u8, first: u64, second: u64) -> Vec<u8> {
    let mut key = key1(prefix, first);
    key.extend_from_slice(&second.to_be_bytes());
    key
}

fn hash_key(prefix: u8, bytes: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(bytes.len() + 1);
    key.push(prefix);
    key.extend_from_slice(bytes);
    key
}

fn trailing_id(key: &[u8]) -> OpResult<u64> {
    if key.len() < 9 {
        return Err(corrupt(key));
    }
    Ok(BigEndian::read_u64(&key[key.len() - 8..]))
}

fn corrupt(key: &[u8]) -> OpError {
    OpError::new(OpErrorKind::StoreError).join_msg(&format!("corrupt record under key {:?}", key))
}

fn missing(what: &str, id: u64) -> OpError {
    OpError::new(OpErrorKind::StoreError).join_msg(&format!("dangling reference to {} {}", what, id))
}

/// Rows are stored as bincode over their serde derives.
fn encode_row<T: Serialize>(row: &T) -> OpResult<Vec<u8>> {
    Ok(bincode::serialize(row)?)
}

fn decode_row<T: DeserializeOwned>(bytes: &[u8]) -> OpResult<T> {
    bincode::deserialize(bytes).map_err(|e| store_err(e.into()))
}

fn store_err(err: OpError) -> OpError {
    OpError::new(OpErrorKind::StoreError).join_msg(&format!("undecodable row: {}", err))
}
