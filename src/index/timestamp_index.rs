use crate::index::store::{BlockRow, LedgerStore};
use crate::parser::errors::OpResult;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

///
/// Block timestamp of a contiguous range of transaction ids.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampEntry {
    pub begin: u64,
    pub end: u64,
    pub timestamp: u32,
}

///
/// Position of a transaction in history: its block timestamp, then its
/// index inside the block.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TransactionOrder {
    pub timestamp: u32,
    pub index: u64,
}

impl Ord for TransactionOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for TransactionOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Maps transaction ids to block timestamps. Entries are sorted by `end`.
#[derive(Debug, Clone, Default)]
pub struct TimestampIndex {
    entries: Vec<TimestampEntry>,
}

impl TimestampIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load<S: LedgerStore + ?Sized>(store: &S) -> OpResult<TimestampIndex> {
        let mut index = TimestampIndex::new();
        for row in store.blocks()? {
            index.add_block(&row);
        }
        Ok(index)
    }

    pub fn add_block(&mut self, row: &BlockRow) {
        if row.tx_count == 0 {
            return;
        }
        let entry = TimestampEntry {
            begin: row.first_tx_id,
            end: row.first_tx_id + row.tx_count as u64,
            timestamp: row.timestamp,
        };
        let in_order = self.entries.last().map_or(true, |last| last.end <= entry.end);
        self.entries.push(entry);
        if !in_order {
            self.entries.sort_by_key(|e| e.end);
        }
    }

    /// Timestamp and in-block index of `tx_id`, zeroed if unknown.
    pub fn get_timestamp(&self, tx_id: u64) -> TransactionOrder {
        let pos = self.entries.partition_point(|e| e.end <= tx_id);
        match self.entries.get(pos) {
            Some(entry) if entry.begin <= tx_id => TransactionOrder {
                timestamp: entry.timestamp,
                index: tx_id - entry.begin,
            },
            _ => TransactionOrder::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
