//!
//! Decode raw block bytes into [`Block`] records.
//!
//! Blocks come either from a blk file, where they are framed by the
//! network magic and a length and may be separated by garbage or zero
//! padding, or from a live submission holding exactly one block.
//! Both go through the same decode path.
//!
use crate::parser::errors::{OpError, OpErrorKind, OpResult};
use crate::parser::proto::{Block, BlockHeader, BlockLocation, Transaction, TxIn, TxOut};
use crate::parser::reader::ByteCursor;
use bitcoin_hashes::{Hash, HashEngine};
use bitcoin::{BlockHash, Network, Txid, Wtxid};
use std::sync::Arc;

const HEADER_SIZE: usize = 80;

/// Decides from the header hash whether transactions are decoded.
pub type OutputFilter = Arc<dyn Fn(&BlockHash) -> bool + Send + Sync>;

/// Where block bytes come from.
#[derive(Debug, Clone, Copy)]
pub enum BlockSource<'a> {
    /// Concatenated framed blocks, `name` is used in diagnostics.
    File { name: &'a str, data: &'a [u8] },
    /// A single block without framing.
    Submitted(&'a [u8]),
}

#[derive(Clone)]
pub struct BlockDecoder {
    magic: u32,
    filter: Option<OutputFilter>,
}

impl BlockDecoder {
    pub fn new(network: Network) -> Self {
        BlockDecoder {
            magic: network.magic(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: OutputFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    /// Iterate over every block of a source.
    pub fn blocks<'a>(&'a self, source: BlockSource<'a>) -> BlockScanner<'a> {
        let (name, data, direct) = match source {
            BlockSource::File { name, data } => (name, data, false),
            BlockSource::Submitted(data) => ("submitted block", data, true),
        };
        BlockScanner {
            decoder: self,
            cursor: ByteCursor::new(data),
            name,
            direct,
            finished: false,
        }
    }

    /// Decode exactly one unframed block.
    pub fn decode_submitted(&self, data: &[u8]) -> OpResult<Block> {
        let mut cursor = ByteCursor::new(data);
        let location = BlockLocation {
            offset: 0,
            length: data.len() as u64,
        };
        self.decode_body(&mut cursor, self.magic, data.len() as u32, location)
    }

    ///
    /// Scan forward for the next framed block.
    ///
    /// Bytes that do not start a magic number are skipped one at a time.
    /// `Ok(None)` means the buffer holds no further block.
    ///
    pub fn next_block(&self, cursor: &mut ByteCursor) -> OpResult<Option<Block>> {
        loop {
            let start = cursor.offset();
            if cursor.remaining() < 4 {
                cursor.set_offset(cursor.len());
                return Ok(None);
            }
            if cursor.read_u32()? != self.magic {
                cursor.set_offset(start + 1);
                continue;
            }
            let length = cursor.read_u32()?;
            if length as usize > cursor.remaining() {
                return Err(OpError::new(OpErrorKind::ParseError).join_msg(&format!(
                    "declared block length {} exceeds the {} bytes left",
                    length,
                    cursor.remaining()
                )));
            }
            if (length as usize) < HEADER_SIZE {
                return Err(OpError::new(OpErrorKind::ParseError).join_msg(&format!(
                    "declared block length {} is shorter than a header",
                    length
                )));
            }
            let location = BlockLocation {
                offset: start as u64,
                length: 8 + length as u64,
            };
            return self
                .decode_body(cursor, self.magic, length, location)
                .map(Some);
        }
    }

    fn decode_body(
        &self,
        cursor: &mut ByteCursor,
        magic: u32,
        declared_length: u32,
        location: BlockLocation,
    ) -> OpResult<Block> {
        let body_start = cursor.offset();
        let body_end = body_start + declared_length as usize;
        let header_bytes = cursor.read_bytes(HEADER_SIZE)?;
        let hash = BlockHash::hash(header_bytes);
        let header = decode_header(header_bytes)?;

        let wants_body = match &self.filter {
            Some(filter) => filter(&hash),
            None => true,
        };
        let mut txdata = Vec::new();
        if wants_body {
            let count = cursor.read_varint()?;
            for index in 0..count {
                let tx = decode_transaction(cursor, index as u32).map_err(|e| {
                    e.join_msg(&format!("transaction {} of block {}", index, hash))
                })?;
                txdata.push(tx);
            }
            if cursor.offset() > body_end {
                return Err(OpError::new(OpErrorKind::ParseError).join_msg(&format!(
                    "transactions of block {} overrun its declared length",
                    hash
                )));
            }
        }
        cursor.set_offset(body_end);
        Ok(Block {
            magic,
            declared_length,
            header,
            hash,
            txdata,
            location,
        })
    }
}

fn decode_header(bytes: &[u8]) -> OpResult<BlockHeader> {
    let mut cursor = ByteCursor::new(bytes);
    Ok(BlockHeader {
        version: cursor.read_u32()?,
        prev_blockhash: BlockHash::from_inner(cursor.read_fixed_hash()?),
        merkle_root: cursor.read_fixed_hash()?,
        time: cursor.read_u32()?,
        bits: cursor.read_u32()?,
        nonce: cursor.read_u32()?,
    })
}

///
/// Decode one transaction at the cursor.
///
/// The txid covers version, inputs, outputs and lock time. The segwit
/// marker and witness stacks only enter the wtxid.
///
pub fn decode_transaction(cursor: &mut ByteCursor, index: u32) -> OpResult<Transaction> {
    let start = cursor.offset();
    let version = cursor.read_u32()?;
    let is_segwit = matches!(cursor.peek(2), Ok([0x00, 0x01]));
    if is_segwit {
        cursor.skip(2)?;
    }

    let io_start = cursor.offset();
    let n_in = cursor.read_varint()?;
    let mut input = Vec::with_capacity(n_in.min(1024) as usize);
    for _ in 0..n_in {
        let prev_txid = Txid::from_inner(cursor.read_fixed_hash()?);
        let prev_vout = cursor.read_u32()?;
        cursor.skip_length_prefixed_bytes()?;
        cursor.read_u32()?;
        input.push(TxIn {
            prev_txid,
            prev_vout,
            witness: Vec::new(),
        });
    }
    let n_out = cursor.read_varint()?;
    let mut output = Vec::with_capacity(n_out.min(1024) as usize);
    for _ in 0..n_out {
        let value = cursor.read_u64()?;
        let script = cursor.read_length_prefixed_bytes()?;
        output.push(TxOut::new(value, script.to_vec()));
    }
    let io_end = cursor.offset();

    if is_segwit {
        for txin in input.iter_mut() {
            let items = cursor.read_varint()?;
            for _ in 0..items {
                txin.witness
                    .push(cursor.read_length_prefixed_bytes()?.to_vec());
            }
        }
    }

    let lock_start = cursor.offset();
    let lock_time = cursor.read_u32()?;
    let end = cursor.offset();

    let mut engine = Txid::engine();
    engine.input(cursor.slice(start, start + 4)?);
    engine.input(cursor.slice(io_start, io_end)?);
    engine.input(cursor.slice(lock_start, end)?);
    let txid = Txid::from_engine(engine);
    let wtxid = if is_segwit {
        Wtxid::hash(cursor.slice(start, end)?)
    } else {
        Wtxid::from_inner(txid.into_inner())
    };

    Ok(Transaction {
        version,
        input,
        output,
        lock_time,
        is_segwit,
        txid,
        wtxid,
        size: (end - start) as u32,
        index,
    })
}

///
/// Iterator over the blocks of one [`BlockSource`].
///
/// Stops after the first error; the error carries the source name
/// and the offset where the failing block started.
///
pub struct BlockScanner<'a> {
    decoder: &'a BlockDecoder,
    cursor: ByteCursor<'a>,
    name: &'a str,
    direct: bool,
    finished: bool,
}

impl<'a> BlockScanner<'a> {
    pub fn offset(&self) -> usize {
        self.cursor.offset()
    }
}

impl<'a> Iterator for BlockScanner<'a> {
    type Item = OpResult<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let start = self.cursor.offset();
        let result = if self.direct {
            self.finished = true;
            let data = self.cursor.slice(0, self.cursor.len());
            data.and_then(|data| self.decoder.decode_submitted(data).map(Some))
        } else {
            self.decoder.next_block(&mut self.cursor)
        };
        match result {
            Ok(Some(block)) => Some(Ok(block)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e.join_msg(&format!("{} at offset {}", self.name, start))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::reader::write_varint;

    fn p2pkh_script(fill: u8) -> Vec<u8> {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[fill; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        script
    }

    fn legacy_tx() -> Vec<u8> {
        let mut tx = vec![1, 0, 0, 0];
        write_varint(&mut tx, 1);
        tx.extend_from_slice(&[0u8; 32]);
        tx.extend_from_slice(&[0xff; 4]);
        tx.extend_from_slice(&[0x02, 0xab, 0xcd]);
        tx.extend_from_slice(&[0xff; 4]);
        write_varint(&mut tx, 1);
        tx.extend_from_slice(&5_000_000_000u64.to_le_bytes());
        let script = p2pkh_script(0x01);
        write_varint(&mut tx, script.len() as u64);
        tx.extend_from_slice(&script);
        tx.extend_from_slice(&[0u8; 4]);
        tx
    }

    /// version | marker | inputs+outputs | witness | locktime
    fn segwit_parts() -> (Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>) {
        let version = vec![2, 0, 0, 0];
        let mut io = Vec::new();
        write_varint(&mut io, 1);
        io.extend_from_slice(&[0x42; 32]);
        io.extend_from_slice(&[0, 0, 0, 0]);
        write_varint(&mut io, 0);
        io.extend_from_slice(&[0xfe, 0xff, 0xff, 0xff]);
        write_varint(&mut io, 1);
        io.extend_from_slice(&1000u64.to_le_bytes());
        io.extend_from_slice(&[0x16, 0x00, 0x14]);
        io.extend_from_slice(&[0x09; 20]);
        let mut witness = Vec::new();
        write_varint(&mut witness, 2);
        witness.extend_from_slice(&[0x03, 0xaa, 0xbb, 0xcc]);
        witness.extend_from_slice(&[0x01, 0xdd]);
        (version, io, witness, vec![0x10, 0, 0, 0])
    }

    fn block_body(txs: &[Vec<u8>]) -> Vec<u8> {
        let mut body = vec![1, 0, 0, 0];
        body.extend_from_slice(&[0x77; 32]);
        body.extend_from_slice(&[0x88; 32]);
        body.extend_from_slice(&1_231_006_505u32.to_le_bytes());
        body.extend_from_slice(&[0xff, 0xff, 0x00, 0x1d]);
        body.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]);
        write_varint(&mut body, txs.len() as u64);
        for tx in txs {
            body.extend_from_slice(tx);
        }
        body
    }

    fn framed(body: &[u8], magic: u32) -> Vec<u8> {
        let mut out = magic.to_le_bytes().to_vec();
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_legacy_txid_equals_wtxid() {
        let raw = legacy_tx();
        let mut cursor = ByteCursor::new(&raw);
        let tx = decode_transaction(&mut cursor, 0).unwrap();
        assert!(!tx.is_segwit);
        assert!(tx.is_coinbase());
        assert_eq!(tx.txid, Txid::hash(&raw));
        assert_eq!(tx.wtxid.into_inner(), tx.txid.into_inner());
        assert_eq!(tx.size as usize, raw.len());
        assert_eq!(tx.output[0].value, 5_000_000_000);
    }

    #[test]
    fn test_segwit_txid_excludes_witness() {
        let (version, io, witness, lock) = segwit_parts();
        let mut raw = version.clone();
        raw.extend_from_slice(&[0x00, 0x01]);
        raw.extend_from_slice(&io);
        raw.extend_from_slice(&witness);
        raw.extend_from_slice(&lock);

        let mut stripped = version;
        stripped.extend_from_slice(&io);
        stripped.extend_from_slice(&lock);

        let mut cursor = ByteCursor::new(&raw);
        let tx = decode_transaction(&mut cursor, 3).unwrap();
        assert!(tx.is_segwit);
        assert_eq!(tx.index, 3);
        assert_eq!(tx.txid, Txid::hash(&stripped));
        assert_eq!(tx.wtxid, Wtxid::hash(&raw));
        assert_ne!(tx.wtxid.into_inner(), tx.txid.into_inner());
        assert_eq!(tx.input[0].witness, vec![vec![0xaa, 0xbb, 0xcc], vec![0xdd]]);
        assert_eq!(tx.lock_time, 0x10);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_decode_submitted_block() {
        let body = block_body(&[legacy_tx()]);
        let decoder = BlockDecoder::new(Network::Bitcoin);
        let block = decoder.decode_submitted(&body).unwrap();
        assert_eq!(block.hash, BlockHash::hash(&body[..80]));
        assert_eq!(block.header.prev_blockhash, BlockHash::from_inner([0x77; 32]));
        assert_eq!(block.header.time, 1_231_006_505);
        assert_eq!(block.header.nonce, 0x04030201);
        assert_eq!(block.declared_length as usize, body.len());
        assert_eq!(block.txdata.len(), 1);
    }

    #[test]
    fn test_scan_resyncs_after_garbage() {
        let body = block_body(&[legacy_tx()]);
        let mut data = vec![0xee];
        data.extend(framed(&body, Network::Bitcoin.magic()));
        data.extend_from_slice(&[0u8; 7]);

        let decoder = BlockDecoder::new(Network::Bitcoin);
        let blocks: Vec<_> = decoder
            .blocks(BlockSource::File {
                name: "blk00000.dat",
                data: &data,
            })
            .collect::<OpResult<_>>()
            .unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].location.offset, 1);
        assert_eq!(blocks[0].location.length as usize, body.len() + 8);
    }

    #[test]
    fn test_scan_two_blocks_and_network_magic() {
        let body = block_body(&[legacy_tx()]);
        let mut data = framed(&body, Network::Testnet.magic());
        data.extend(framed(&body, Network::Testnet.magic()));

        let testnet = BlockDecoder::new(Network::Testnet);
        let found = testnet
            .blocks(BlockSource::File { name: "t", data: &data })
            .count();
        assert_eq!(found, 2);

        let mainnet = BlockDecoder::new(Network::Bitcoin);
        let mut cursor = ByteCursor::new(&data);
        assert!(mainnet.next_block(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_declared_length_past_end_is_error() {
        let body = block_body(&[legacy_tx()]);
        let mut data = framed(&body, Network::Bitcoin.magic());
        data.truncate(data.len() - 3);
        let decoder = BlockDecoder::new(Network::Bitcoin);
        let mut cursor = ByteCursor::new(&data);
        let err = decoder.next_block(&mut cursor).unwrap_err();
        assert!(err.is_kind(OpErrorKind::ParseError));
    }

    #[test]
    fn test_declared_length_below_header_is_error() {
        let body = block_body(&[legacy_tx()]);
        let mut data = framed(&body, Network::Bitcoin.magic());
        data[4..8].copy_from_slice(&40u32.to_le_bytes());
        let decoder = BlockDecoder::new(Network::Bitcoin).with_filter(Arc::new(|_: &BlockHash| false));
        let mut cursor = ByteCursor::new(&data);
        let err = decoder.next_block(&mut cursor).unwrap_err();
        assert!(err.is_kind(OpErrorKind::ParseError));
        assert!(err.to_string().contains("shorter than a header"));
    }

    #[test]
    fn test_filter_skips_transactions() {
        let body = block_body(&[legacy_tx(), legacy_tx()]);
        let mut data = framed(&body, Network::Bitcoin.magic());
        data.extend(framed(&body, Network::Bitcoin.magic()));
        let decoder = BlockDecoder::new(Network::Bitcoin).with_filter(Arc::new(|_: &BlockHash| false));
        let blocks: Vec<Block> = decoder
            .blocks(BlockSource::File { name: "f", data: &data })
            .collect::<OpResult<_>>()
            .unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.txdata.is_empty()));
        assert_eq!(blocks[1].location.offset as usize, body.len() + 8);
    }

    #[test]
    fn test_truncated_transaction_reports_context() {
        let mut body = block_body(&[legacy_tx()]);
        body.truncate(body.len() - 2);
        let decoder = BlockDecoder::new(Network::Bitcoin);
        let mut scanner = decoder.blocks(BlockSource::Submitted(&body));
        let err = scanner.next().unwrap().unwrap_err();
        assert!(err.is_kind(OpErrorKind::ParseError));
        assert!(err.message().contains("transaction 0"));
        assert!(scanner.next().is_none());
    }
}
