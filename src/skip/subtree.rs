//! Subtree blobs: a few trie levels stored as one record
//!
//! A blob lists its frontier left to right. Each frontier node carries its
//! height inside the blob and is either empty, a leaf or a stub holding the
//! root hash of the blob below it. The blob hash is the hash of its top node,
//! computed with the same branch hashing as the sparse tree.

use super::position::Position;
use crate::model::Hash;
use crate::trie::{branch_hash, leaf_hash};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// A frontier node of a subtree blob
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipNode {
    Empty,
    Leaf { key: Vec<u8>, value: Vec<u8> },
    /// Root of the blob one level down
    Stub(Hash),
}

impl SkipNode {
    pub fn hash(&self) -> Hash {
        match self {
            SkipNode::Empty => Hash::EMPTY,
            SkipNode::Leaf { key, value } => leaf_hash(key, value),
            SkipNode::Stub(hash) => *hash,
        }
    }
}

/// One stored blob
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubTree {
    structure: Vec<u8>,
    nodes: Vec<SkipNode>,
    hash: Hash,
}

impl SubTree {
    /// Build a blob from its frontier, checking that the heights describe a
    /// complete cut through the blob
    pub fn new(structure: Vec<u8>, nodes: Vec<SkipNode>) -> Result<Self> {
        if structure.len() != nodes.len() || nodes.is_empty() {
            return Err(Error::Corruption(format!(
                "Subtree has {} heights for {} nodes",
                structure.len(),
                nodes.len()
            )));
        }
        let hash = calculate_root(&structure, &nodes)?;
        Ok(SubTree {
            structure,
            nodes,
            hash,
        })
    }

    /// A blob holding nothing
    pub fn empty() -> Self {
        SubTree {
            structure: vec![0],
            nodes: vec![SkipNode::Empty],
            hash: Hash::EMPTY,
        }
    }

    /// A blob holding a single leaf at its top
    pub fn single(node: SkipNode) -> Self {
        let hash = node.hash();
        SubTree {
            structure: vec![0],
            nodes: vec![node],
            hash,
        }
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn is_empty(&self) -> bool {
        self.hash.is_empty()
    }

    /// Frontier nodes with their heights, left to right
    pub fn into_frontier(self) -> impl Iterator<Item = (u8, SkipNode)> {
        self.structure.into_iter().zip(self.nodes)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(&self.structure, &self.nodes))?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (structure, nodes): (Vec<u8>, Vec<SkipNode>) = bincode::deserialize(data)?;
        SubTree::new(structure, nodes)
    }
}

/// Hash of the top node of a frontier, merging sibling pairs bottom-up
fn calculate_root(structure: &[u8], nodes: &[SkipNode]) -> Result<Hash> {
    let Some(&deepest) = structure.iter().max() else {
        return Err(Error::Corruption("Empty subtree frontier".into()));
    };
    if deepest > 8 {
        return Err(Error::Corruption(format!(
            "Subtree frontier height {} out of range",
            deepest
        )));
    }

    let mut stack: Vec<(Position, Hash)> = Vec::with_capacity(structure.len());
    let mut slot = 0usize;
    for (&height, node) in structure.iter().zip(nodes) {
        let position = Position::at_slot(height, slot, deepest);
        slot += position.span(deepest);
        stack.push((position, node.hash()));

        while stack.len() >= 2 {
            let (right_pos, right) = stack[stack.len() - 1];
            let (left_pos, left) = stack[stack.len() - 2];
            if !left_pos.is_left_sibling_of(&right_pos) {
                break;
            }
            stack.truncate(stack.len() - 2);
            let parent = left_pos.parent().unwrap_or(Position::ROOT);
            stack.push((parent, branch_hash(&left, &right)));
        }
    }

    match stack.as_slice() {
        [(position, hash)] if *position == Position::ROOT && slot == 1 << deepest => Ok(*hash),
        _ => Err(Error::Corruption("Subtree frontier is not a complete cut".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(tag: u8) -> SkipNode {
        SkipNode::Leaf {
            key: vec![tag; 4],
            value: vec![tag],
        }
    }

    #[test]
    fn test_root_of_uneven_frontier() {
        // Heights 1, 2, 2: a leaf on the left, a branch of two on the right
        let subtree = SubTree::new(vec![1, 2, 2], vec![leaf(1), leaf(2), SkipNode::Empty]).unwrap();
        let right = branch_hash(&leaf(2).hash(), &Hash::EMPTY);
        assert_eq!(subtree.hash(), branch_hash(&leaf(1).hash(), &right));
    }

    #[test]
    fn test_single_node_subtrees() {
        assert_eq!(SubTree::empty().hash(), Hash::EMPTY);
        assert!(SubTree::empty().is_empty());
        assert_eq!(SubTree::single(leaf(5)).hash(), leaf(5).hash());

        let stub = Hash::digest(b"below");
        let subtree = SubTree::new(vec![1, 1], vec![SkipNode::Stub(stub), SkipNode::Empty]).unwrap();
        assert_eq!(subtree.hash(), branch_hash(&stub, &Hash::EMPTY));
    }

    #[test]
    fn test_rejects_incomplete_frontier() {
        assert!(SubTree::new(vec![1], vec![leaf(1)]).is_err());
        assert!(SubTree::new(vec![2, 1, 2], vec![leaf(1), leaf(2), leaf(3)]).is_err());
        assert!(SubTree::new(vec![1, 1], vec![leaf(1)]).is_err());
        assert!(SubTree::new(vec![], vec![]).is_err());
    }

    #[test]
    fn test_encoding_roundtrip() {
        let subtree = SubTree::new(
            vec![1, 2, 2],
            vec![leaf(1), SkipNode::Stub(Hash::digest(b"x")), SkipNode::Empty],
        )
        .unwrap();
        let decoded = SubTree::decode(&subtree.encode().unwrap()).unwrap();
        assert_eq!(decoded, subtree);
        assert!(SubTree::decode(b"garbage").is_err());
    }
}
