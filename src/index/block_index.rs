//!
//! In-memory view of the accepted chain: one node per height from 0 to
//! the tip, addressable by hash.
//!
//! The chain only changes through `add_new_block` and `revert_block`,
//! and every change persists the new declared head through the
//! [`ChainSource`] it is handed.
//!
use crate::index::store::{ChainLink, ChainSource};
use crate::parser::errors::{OpError, OpErrorKind, OpResult};
use ahash::{AHashMap, AHashSet};
use bitcoin::BlockHash;
use log::info;
use serde::{Deserialize, Serialize};

/// Picks the tip among several head candidates, `None` if it cannot.
pub type HeadSelector = dyn Fn(&[ChainLink]) -> Option<BlockHash>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainNode {
    pub id: u64,
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub height: u64,
    pub prev_id: Option<u64>,
}

///
/// Result of planning the attachment of a block.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachPlan {
    /// The predecessor is unknown, this block must be pushed first.
    BlockRequired(BlockHash),
    /// Revert `revert` (tip first), then attach at `height`.
    Attach { revert: Vec<ChainNode>, height: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevertOutcome {
    Reverted,
    EmptyChain,
    NotTip,
}

/// Saved tail of the chain, restorable after a failed mutation.
#[derive(Debug, Clone)]
pub struct ChainCheckpoint {
    keep: usize,
    tail: Vec<ChainNode>,
}

#[derive(Debug, Clone, Default)]
pub struct ChainIndex {
    nodes: Vec<ChainNode>,
    hash_to_height: AHashMap<BlockHash, u64>,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    ///
    /// Rebuild the chain from the stored block graph.
    ///
    /// A graph with several childless blocks is resolved by the
    /// declared head first, then by `selector`.
    ///
    pub fn load<S: ChainSource + ?Sized>(
        source: &mut S,
        selector: Option<&HeadSelector>,
    ) -> OpResult<ChainIndex> {
        let links = source.chain_links()?;
        if links.is_empty() {
            return Ok(ChainIndex::new());
        }
        let by_hash: AHashMap<BlockHash, &ChainLink> =
            links.iter().map(|l| (l.hash, l)).collect();
        let parents: AHashSet<BlockHash> = links.iter().map(|l| l.prev_hash).collect();
        let candidates: Vec<ChainLink> = links
            .iter()
            .filter(|l| !parents.contains(&l.hash))
            .cloned()
            .collect();

        let tip = match candidates.len() {
            0 => {
                return Err(OpError::new(OpErrorKind::ChainTopology)
                    .join_msg("no head candidate, block graph is cyclic"))
            }
            1 => candidates[0].hash,
            _ => ChainIndex::resolve_head(source, &candidates, &by_hash, selector)?,
        };

        let mut walk = Vec::new();
        let mut cursor = by_hash.get(&tip).copied();
        while let Some(link) = cursor {
            if walk.len() >= by_hash.len() {
                return Err(OpError::new(OpErrorKind::ChainTopology)
                    .join_msg(&format!("cycle reached from head {}", tip)));
            }
            walk.push(link);
            cursor = by_hash.get(&link.prev_hash).copied();
        }
        walk.reverse();

        let mut chain = ChainIndex::new();
        for link in walk {
            let height = chain.nodes.len() as u64;
            let prev_id = chain.nodes.last().map(|n| n.id);
            chain.push_node(ChainNode {
                id: link.id,
                hash: link.hash,
                prev_hash: link.prev_hash,
                height,
                prev_id,
            });
        }
        source.set_declared_head(Some(&tip))?;
        info!(
            "chain loaded: {} blocks, {} head candidates, tip {}",
            chain.nodes.len(),
            candidates.len(),
            tip
        );
        Ok(chain)
    }

    fn resolve_head<S: ChainSource + ?Sized>(
        source: &S,
        candidates: &[ChainLink],
        by_hash: &AHashMap<BlockHash, &ChainLink>,
        selector: Option<&HeadSelector>,
    ) -> OpResult<BlockHash> {
        if let Some(declared) = source.declared_head()? {
            if by_hash.contains_key(&declared) {
                return Ok(declared);
            }
        }
        let selector = selector.ok_or_else(|| {
            OpError::new(OpErrorKind::ChainTopology).join_msg(&format!(
                "ambiguous head among {} candidates, selector required",
                candidates.len()
            ))
        })?;
        match selector(candidates) {
            Some(hash) if by_hash.contains_key(&hash) => Ok(hash),
            _ => Err(OpError::new(OpErrorKind::ChainTopology)
                .join_msg("head selector did not pick a known block")),
        }
    }

    ///
    /// Plan attaching a block whose predecessor is `prev_hash`.
    ///
    /// The nodes to revert come back tip first, the order in which
    /// they must be reverted.
    ///
    pub fn try_add_new_block(&self, prev_hash: &BlockHash) -> AttachPlan {
        if self.nodes.is_empty() {
            return AttachPlan::Attach {
                revert: Vec::new(),
                height: 0,
            };
        }
        match self.hash_to_height.get(prev_hash) {
            None => AttachPlan::BlockRequired(*prev_hash),
            Some(&h) => AttachPlan::Attach {
                revert: self.nodes[h as usize + 1..].iter().rev().cloned().collect(),
                height: h + 1,
            },
        }
    }

    /// Attach a block after its reverts were performed. Returns its height.
    pub fn add_new_block<S: ChainSource + ?Sized>(
        &mut self,
        source: &mut S,
        hash: &BlockHash,
        prev_hash: &BlockHash,
        id: u64,
    ) -> OpResult<u64> {
        let height = match self.try_add_new_block(prev_hash) {
            AttachPlan::BlockRequired(missing) => {
                return Err(OpError::new(OpErrorKind::ChainUsage).join_msg(&format!(
                    "predecessor {} missing, it must be added first",
                    missing
                )))
            }
            AttachPlan::Attach { height, .. } => height,
        };
        self.truncate(height as usize);
        let prev_id = self.nodes.last().map(|n| n.id);
        self.push_node(ChainNode {
            id,
            hash: *hash,
            prev_hash: *prev_hash,
            height,
            prev_id,
        });
        source.set_declared_head(Some(hash))?;
        Ok(height)
    }

    /// Remove the tip if it is `hash`.
    pub fn revert_block<S: ChainSource + ?Sized>(
        &mut self,
        source: &mut S,
        hash: &BlockHash,
    ) -> OpResult<RevertOutcome> {
        match self.nodes.last() {
            None => return Ok(RevertOutcome::EmptyChain),
            Some(tip) if &tip.hash != hash => return Ok(RevertOutcome::NotTip),
            Some(_) => {}
        }
        self.truncate(self.nodes.len() - 1);
        source.set_declared_head(self.nodes.last().map(|n| &n.hash))?;
        Ok(RevertOutcome::Reverted)
    }

    /// Save every node above `keep - 1` so it can be restored.
    pub fn checkpoint(&self, keep: usize) -> ChainCheckpoint {
        let keep = keep.min(self.nodes.len());
        ChainCheckpoint {
            keep,
            tail: self.nodes[keep..].to_vec(),
        }
    }

    pub fn restore(&mut self, checkpoint: ChainCheckpoint) {
        self.truncate(checkpoint.keep);
        for node in checkpoint.tail {
            self.push_node(node);
        }
    }

    fn truncate(&mut self, len: usize) {
        for node in self.nodes.drain(len..) {
            self.hash_to_height.remove(&node.hash);
        }
    }

    fn push_node(&mut self, node: ChainNode) {
        self.hash_to_height.insert(node.hash, node.height);
        self.nodes.push(node);
    }

    /// Height of the tip, `None` for an empty chain.
    pub fn get_height(&self) -> Option<u64> {
        self.nodes.last().map(|n| n.height)
    }

    pub fn tip(&self) -> Option<&ChainNode> {
        self.nodes.last()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_at(&self, height: u64) -> Option<&ChainNode> {
        self.nodes.get(height as usize)
    }

    pub fn height_of(&self, hash: &BlockHash) -> Option<u64> {
        self.hash_to_height.get(hash).copied()
    }

    pub fn nodes(&self) -> &[ChainNode] {
        &self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[derive(Default)]
    struct Links {
        links: Vec<ChainLink>,
        head: Option<BlockHash>,
    }

    impl ChainSource for Links {
        fn chain_links(&self) -> OpResult<Vec<ChainLink>> {
            Ok(self.links.clone())
        }

        fn declared_head(&self) -> OpResult<Option<BlockHash>> {
            Ok(self.head)
        }

        fn set_declared_head(&mut self, head: Option<&BlockHash>) -> OpResult<()> {
            self.head = head.copied();
            Ok(())
        }
    }

    fn h(n: u8) -> BlockHash {
        BlockHash::from_inner([n; 32])
    }

    fn link(id: u64, hash: u8, prev: u8) -> ChainLink {
        ChainLink {
            id,
            hash: h(hash),
            prev_hash: h(prev),
        }
    }

    /// A(1) -> B(2) -> C(3), genesis predecessor is 0
    fn abc() -> (ChainIndex, Links) {
        let mut src = Links::default();
        let mut chain = ChainIndex::new();
        chain.add_new_block(&mut src, &h(1), &h(0), 1).unwrap();
        chain.add_new_block(&mut src, &h(2), &h(1), 2).unwrap();
        chain.add_new_block(&mut src, &h(3), &h(2), 3).unwrap();
        (chain, src)
    }

    #[test]
    fn test_reorg_plan_is_tip_first() {
        let (chain, _) = abc();
        match chain.try_add_new_block(&h(1)) {
            AttachPlan::Attach { revert, height } => {
                let hashes: Vec<_> = revert.iter().map(|n| n.hash).collect();
                assert_eq!(hashes, vec![h(3), h(2)]);
                assert_eq!(height, 1);
            }
            other => panic!("unexpected plan {:?}", other),
        }
        assert_eq!(
            chain.try_add_new_block(&h(9)),
            AttachPlan::BlockRequired(h(9))
        );
    }

    #[test]
    fn test_add_after_reverts() {
        let (mut chain, mut src) = abc();
        assert_eq!(chain.revert_block(&mut src, &h(3)).unwrap(), RevertOutcome::Reverted);
        assert_eq!(chain.revert_block(&mut src, &h(2)).unwrap(), RevertOutcome::Reverted);
        assert_eq!(chain.add_new_block(&mut src, &h(4), &h(1), 4).unwrap(), 1);
        assert_eq!(chain.get_height(), Some(1));
        assert_eq!(chain.height_of(&h(4)), Some(1));
        assert_eq!(chain.height_of(&h(2)), None);
        assert_eq!(chain.tip().unwrap().prev_id, Some(1));
        assert_eq!(src.head, Some(h(4)));
    }

    #[test]
    fn test_add_with_missing_predecessor_is_usage_error() {
        let (mut chain, mut src) = abc();
        let err = chain.add_new_block(&mut src, &h(5), &h(9), 5).unwrap_err();
        assert!(err.is_kind(OpErrorKind::ChainUsage));
        assert_eq!(chain.get_height(), Some(2));
    }

    #[test]
    fn test_revert_only_tip() {
        let (mut chain, mut src) = abc();
        assert_eq!(chain.revert_block(&mut src, &h(2)).unwrap(), RevertOutcome::NotTip);
        assert_eq!(chain.get_height(), Some(2));
        let mut empty = ChainIndex::new();
        assert_eq!(
            empty.revert_block(&mut src, &h(1)).unwrap(),
            RevertOutcome::EmptyChain
        );
        for tip in [3, 2, 1].iter() {
            chain.revert_block(&mut src, &h(*tip)).unwrap();
        }
        assert!(chain.is_empty());
        assert_eq!(chain.get_height(), None);
        assert_eq!(src.head, None);
    }

    #[test]
    fn test_checkpoint_restore() {
        let (mut chain, mut src) = abc();
        let cp = chain.checkpoint(1);
        chain.revert_block(&mut src, &h(3)).unwrap();
        chain.revert_block(&mut src, &h(2)).unwrap();
        chain.add_new_block(&mut src, &h(4), &h(1), 4).unwrap();
        chain.restore(cp);
        let hashes: Vec<_> = chain.nodes().iter().map(|n| n.hash).collect();
        assert_eq!(hashes, vec![h(1), h(2), h(3)]);
        assert_eq!(chain.height_of(&h(4)), None);
        assert_eq!(chain.height_of(&h(3)), Some(2));
    }

    #[test]
    fn test_load_single_head() {
        let mut src = Links {
            links: vec![link(3, 3, 2), link(1, 1, 0), link(2, 2, 1)],
            head: None,
        };
        let chain = ChainIndex::load(&mut src, None).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.node_at(0).unwrap().hash, h(1));
        assert_eq!(chain.node_at(2).unwrap().prev_id, Some(2));
        assert_eq!(src.head, Some(h(3)));
    }

    #[test]
    fn test_load_fork_resolution() {
        // 1 -> 2 -> 3 and 1 -> 4
        let links = vec![link(1, 1, 0), link(2, 2, 1), link(3, 3, 2), link(4, 4, 1)];
        let mut src = Links {
            links: links.clone(),
            head: None,
        };
        let err = ChainIndex::load(&mut src, None).unwrap_err();
        assert!(err.is_kind(OpErrorKind::ChainTopology));

        let pick_four = |c: &[ChainLink]| c.iter().find(|l| l.id == 4).map(|l| l.hash);
        let chain = ChainIndex::load(&mut src, Some(&pick_four)).unwrap();
        assert_eq!(chain.get_height(), Some(1));
        assert_eq!(src.head, Some(h(4)));

        let mut declared = Links {
            links,
            head: Some(h(3)),
        };
        let chain = ChainIndex::load(&mut declared, Some(&pick_four)).unwrap();
        assert_eq!(chain.tip().unwrap().hash, h(3));
    }

    #[test]
    fn test_load_cycle_is_topology_error() {
        let mut src = Links {
            links: vec![link(1, 1, 2), link(2, 2, 1)],
            head: None,
        };
        let err = ChainIndex::load(&mut src, None).unwrap_err();
        assert!(err.is_kind(OpErrorKind::ChainTopology));
    }
}
