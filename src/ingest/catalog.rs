//!
//! Header-only catalogue of the blocks in a set of blk files, and the
//! height-ordered replay of those blocks into an [`Indexer`].
//!
use crate::api::{Indexer, PushOutcome};
use crate::index::block_index::{ChainIndex, HeadSelector};
use crate::index::store::{ChainLink, ChainSource, LedgerStore, SourceLocator};
use crate::ingest::{IngestReport, ParallelBlockProcessor};
use crate::parser::blk_file::BlkFile;
use crate::parser::errors::{OpError, OpErrorKind, OpResult};
use crate::parser::proto::BlockLocation;
use crate::parser::reader::ByteCursor;
use ahash::AHashSet;
use bitcoin::BlockHash;
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub timestamp: u32,
    pub file: PathBuf,
    pub location: BlockLocation,
}

///
/// Every block found in the files, in discovery order.
///
/// Acts as a [`ChainSource`] so that a [`ChainIndex`] can put the
/// blocks in height order.
///
#[derive(Debug, Clone, Default)]
pub struct BlockCatalog {
    entries: Vec<CatalogEntry>,
    seen: AHashSet<BlockHash>,
    head: Option<BlockHash>,
}

impl BlockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan the headers of all `files` in parallel.
    pub fn build(
        processor: &ParallelBlockProcessor,
        files: Vec<PathBuf>,
    ) -> OpResult<(BlockCatalog, IngestReport)> {
        let mut catalog = BlockCatalog::new();
        let report = processor.run(files, |_, path, block| {
            catalog.add(CatalogEntry {
                hash: block.hash,
                prev_hash: block.header.prev_blockhash,
                timestamp: block.header.time,
                file: path.to_path_buf(),
                location: block.location,
            });
            Ok(())
        })?;
        Ok((catalog, report))
    }

    /// Returns false for a block already catalogued.
    pub fn add(&mut self, entry: CatalogEntry) -> bool {
        if !self.seen.insert(entry.hash) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The best chain through the catalogue, genesis first.
    pub fn ordered(&mut self, selector: Option<&HeadSelector>) -> OpResult<Vec<CatalogEntry>> {
        let chain = ChainIndex::load(self, selector)?;
        Ok(chain
            .nodes()
            .iter()
            .map(|node| self.entries[node.id as usize].clone())
            .collect())
    }
}

impl ChainSource for BlockCatalog {
    fn chain_links(&self) -> OpResult<Vec<ChainLink>> {
        Ok(self
            .entries
            .iter()
            .enumerate()
            .map(|(id, e)| ChainLink {
                id: id as u64,
                hash: e.hash,
                prev_hash: e.prev_hash,
            })
            .collect())
    }

    fn declared_head(&self) -> OpResult<Option<BlockHash>> {
        Ok(self.head)
    }

    fn set_declared_head(&mut self, head: Option<&BlockHash>) -> OpResult<()> {
        self.head = head.copied();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplayReport {
    pub first_height: u64,
    pub blocks_applied: u64,
}

///
/// Push the catalogued blocks into `indexer` in height order, starting
/// from its recorded processing state so an interrupted load resumes.
///
pub fn replay<S: LedgerStore>(
    indexer: &Indexer<S>,
    ordered: &[CatalogEntry],
) -> OpResult<ReplayReport> {
    let first_height = match indexer.processing_state()? {
        Some(next) => next,
        None => indexer.get_blockchain_height()?.map_or(0, |h| h + 1),
    };
    let mut report = ReplayReport {
        first_height,
        blocks_applied: 0,
    };
    for (height, entry) in ordered.iter().enumerate().skip(first_height as usize) {
        let bytes = BlkFile::read_range(&entry.file, &entry.location)?;
        let mut cursor = ByteCursor::new(&bytes);
        let mut block = indexer.decoder().next_block(&mut cursor)?.ok_or_else(|| {
            OpError::new(OpErrorKind::ParseError).join_msg(&format!(
                "no block at {} offset {}",
                entry.file.display(),
                entry.location.offset
            ))
        })?;
        if block.hash != entry.hash {
            return Err(OpError::new(OpErrorKind::ParseError).join_msg(&format!(
                "expected block {} at {} offset {}, found {}",
                entry.hash,
                entry.file.display(),
                entry.location.offset,
                block.hash
            )));
        }
        block.location = entry.location;
        let locator = SourceLocator {
            file: entry.file.display().to_string(),
            offset: entry.location.offset,
            length: entry.location.length,
        };
        if let PushOutcome::BlockRequired { block_required } =
            indexer.push_decoded_block(block, Some(locator))?
        {
            return Err(OpError::from(format!(
                "block {} at height {} requires unknown predecessor {}",
                entry.hash, height, block_required
            )));
        }
        indexer.set_processing_state(height as u64 + 1)?;
        report.blocks_applied += 1;
        if height % 10_000 == 0 {
            info!("replayed up to height {}", height);
        }
    }
    Ok(report)
}

///
/// Catalogue the blk files of `blocks_dir` and replay them into `indexer`.
///
pub fn ingest_directory<S: LedgerStore>(
    indexer: &Indexer<S>,
    blocks_dir: &Path,
    selector: Option<&HeadSelector>,
) -> OpResult<ReplayReport> {
    let files: Vec<PathBuf> = BlkFile::scan(blocks_dir)?.paths().cloned().collect();
    let header_only = indexer
        .decoder()
        .clone()
        .with_filter(Arc::new(|_: &BlockHash| false));
    let processor = ParallelBlockProcessor::new(header_only, indexer.config().ingest_threads);
    let (mut catalog, scan) = BlockCatalog::build(&processor, files)?;
    info!("catalogued {} blocks from {} files", catalog.len(), scan.files);
    let ordered = catalog.ordered(selector)?;
    replay(indexer, &ordered)
}
