use super::position::Position;
use super::subtree::{SkipNode, SubTree};
use crate::config::TreeConfig;
use crate::model::Hash;
use crate::store::NodeStore;
use crate::trie::bits::{check_key, is_bit_set, prepare_batch, split_keys};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::{debug, trace, warn};

/// A sparse merkle tree stored `subtree_height` levels per blob
///
/// Root hashes are identical to [`SparseMerkleTree`](crate::SparseMerkleTree)
/// for the same key/value set. Keys can be inserted and overwritten but not
/// removed.
pub struct SkipMerkleTree<'a, S: NodeStore> {
    store: &'a S,
    key_length: usize,
    subtree_height: u8,
    root: Hash,
    prune: bool,
    /// Blobs written and superseded by the update in progress
    changes: Mutex<Changes>,
}

#[derive(Default)]
struct Changes {
    written: HashSet<Hash>,
    stale: Vec<Hash>,
}

impl<'a, S: NodeStore> SkipMerkleTree<'a, S> {
    pub fn new(store: &'a S, key_length: usize, subtree_height: u8) -> Result<Self> {
        if !(1..=8).contains(&subtree_height) {
            return Err(Error::InvalidInput(format!(
                "subtree height must be between 1 and 8, got {}",
                subtree_height
            )));
        }
        Ok(SkipMerkleTree {
            store,
            key_length,
            subtree_height,
            root: Hash::EMPTY,
            prune: true,
            changes: Mutex::new(Changes::default()),
        })
    }

    pub fn from_config(store: &'a S, root: Hash, config: &TreeConfig) -> Result<Self> {
        Ok(SkipMerkleTree::new(store, config.key_length, config.subtree_height)?
            .with_root(root)
            .with_pruning(config.prune))
    }

    pub fn with_root(mut self, root: Hash) -> Self {
        self.root = root;
        self
    }

    pub fn with_pruning(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    pub fn root_hash(&self) -> Hash {
        self.root
    }

    pub fn key_length(&self) -> usize {
        self.key_length
    }

    pub fn subtree_height(&self) -> u8 {
        self.subtree_height
    }

    /// Load the blob whose top node hashes to `hash`
    pub fn get_subtree(&self, hash: &Hash) -> Result<SubTree> {
        if hash.is_empty() {
            return Ok(SubTree::empty());
        }
        let data = self.store.get(hash)?.ok_or(Error::MissingNode(*hash))?;
        let subtree = SubTree::decode(&data)?;
        if subtree.hash() != *hash {
            return Err(Error::Corruption(format!(
                "Subtree stored under {} hashes to {}",
                hash.short(),
                subtree.hash().short()
            )));
        }
        Ok(subtree)
    }

    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<SubTree> {
        self.update_batch(vec![key.to_vec()], vec![value.to_vec()])
    }

    /// Insert or overwrite many keys, returning the new root blob
    pub fn update_batch(&mut self, keys: Vec<Vec<u8>>, values: Vec<Vec<u8>>) -> Result<SubTree> {
        let (keys, values) = prepare_batch(keys, values, self.key_length)?;
        let root = self.get_subtree(&self.root)?;
        if keys.is_empty() {
            return Ok(root);
        }

        self.discard(root.hash());
        let result = self.update_subtree(&keys, &values, root, 0);
        let changes = std::mem::take(self.changes.get_mut());
        let new_root = result?;
        if new_root.hash() != self.root {
            debug!(
                old = %self.root.short(),
                new = %new_root.hash().short(),
                keys = keys.len(),
                "root changed"
            );
        }
        self.root = new_root.hash();

        // Superseded blobs go only once every replacement is stored
        for hash in changes.stale {
            if changes.written.contains(&hash) {
                continue;
            }
            trace!(hash = %hash.short(), "discard subtree");
            if let Err(err) = self.store.del(&hash) {
                warn!(hash = %hash.short(), error = %err, "failed to discard subtree");
            }
        }
        Ok(new_root)
    }

    /// Get the value stored under a key
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        check_key(key, self.key_length)?;

        let mut subtree = self.get_subtree(&self.root)?;
        let mut abs_height = 0;
        loop {
            let slot = self.slot(key, abs_height);
            let mut offset = 0;
            let mut found = None;
            for (height, node) in subtree.into_frontier() {
                let position = self.position(height, offset)?;
                if position.contains(slot, self.subtree_height) {
                    found = Some(node);
                    break;
                }
                offset += position.span(self.subtree_height);
            }

            match found {
                Some(SkipNode::Leaf { key: leaf_key, value }) if leaf_key == key => {
                    return Ok(Some(value))
                }
                Some(SkipNode::Stub(hash)) => {
                    subtree = self.get_subtree(&hash)?;
                    abs_height += self.subtree_height as usize;
                }
                _ => return Ok(None),
            }
        }
    }

    // === Internal helpers ===

    fn discard(&self, hash: Hash) {
        if self.prune && !hash.is_empty() {
            self.changes.lock().stale.push(hash);
        }
    }

    /// Position of a frontier node read from a stored blob
    fn position(&self, height: u8, slot: usize) -> Result<Position> {
        if height > self.subtree_height {
            return Err(Error::Corruption(format!(
                "Frontier height {} exceeds subtree height {}",
                height, self.subtree_height
            )));
        }
        Ok(Position::at_slot(height, slot, self.subtree_height))
    }

    /// Leaf slot of `key` in a blob whose top sits at `abs_height`
    fn slot(&self, key: &[u8], abs_height: usize) -> usize {
        (0..self.subtree_height as usize).fold(0, |slot, i| {
            (slot << 1) | is_bit_set(key, abs_height + i) as usize
        })
    }

    /// Apply sorted keys to a blob, store the result and return it
    fn update_subtree(
        &self,
        keys: &[Vec<u8>],
        values: &[Vec<u8>],
        subtree: SubTree,
        abs_height: usize,
    ) -> Result<SubTree> {
        let slots: Vec<usize> = keys.iter().map(|k| self.slot(k, abs_height)).collect();

        let mut structure = Vec::new();
        let mut nodes = Vec::new();
        let mut start = 0;
        let mut offset = 0;
        for (height, node) in subtree.into_frontier() {
            let position = self.position(height, offset)?;
            offset += position.span(self.subtree_height);
            let end = start + slots[start..].partition_point(|slot| *slot < offset);

            self.update_node(
                &keys[start..end],
                &values[start..end],
                node,
                abs_height,
                height,
                &mut structure,
                &mut nodes,
            )?;
            start = end;
        }

        if offset != 1 << self.subtree_height || start != keys.len() {
            return Err(Error::Corruption(format!(
                "Subtree at height {} does not cover all slots",
                abs_height
            )));
        }

        let subtree = SubTree::new(structure, nodes)?;
        if !subtree.is_empty() {
            trace!(hash = %subtree.hash().short(), height = abs_height, "persist subtree");
            self.store.set(&subtree.hash(), &subtree.encode()?)?;
            if self.prune {
                self.changes.lock().written.insert(subtree.hash());
            }
        }
        Ok(subtree)
    }

    /// Apply keys to one frontier node `height` levels into its blob,
    /// appending the replacement frontier
    #[allow(clippy::too_many_arguments)]
    fn update_node(
        &self,
        keys: &[Vec<u8>],
        values: &[Vec<u8>],
        node: SkipNode,
        abs_height: usize,
        height: u8,
        structure: &mut Vec<u8>,
        nodes: &mut Vec<SkipNode>,
    ) -> Result<()> {
        if keys.is_empty() {
            structure.push(height);
            nodes.push(node);
            return Ok(());
        }
        let replace_leaf = keys.len() == 1
            && match &node {
                SkipNode::Empty => true,
                SkipNode::Leaf { key, .. } => *key == keys[0],
                SkipNode::Stub(_) => false,
            };
        if replace_leaf {
            structure.push(height);
            nodes.push(SkipNode::Leaf {
                key: keys[0].clone(),
                value: values[0].clone(),
            });
            return Ok(());
        }

        if height == self.subtree_height {
            let below = match node {
                SkipNode::Stub(hash) => {
                    let below = self.get_subtree(&hash)?;
                    self.discard(hash);
                    below
                }
                SkipNode::Empty => SubTree::empty(),
                leaf @ SkipNode::Leaf { .. } => SubTree::single(leaf),
            };
            let below = self.update_subtree(
                keys,
                values,
                below,
                abs_height + self.subtree_height as usize,
            )?;
            structure.push(height);
            nodes.push(SkipNode::Stub(below.hash()));
            return Ok(());
        }

        let bit = abs_height + height as usize;
        let (left, right) = match node {
            SkipNode::Empty => (SkipNode::Empty, SkipNode::Empty),
            leaf @ SkipNode::Leaf { .. } => {
                if matches!(&leaf, SkipNode::Leaf { key, .. } if is_bit_set(key, bit)) {
                    (SkipNode::Empty, leaf)
                } else {
                    (leaf, SkipNode::Empty)
                }
            }
            SkipNode::Stub(hash) => {
                return Err(Error::Corruption(format!(
                    "Stub {} above the bottom of a subtree",
                    hash.short()
                )))
            }
        };

        let (left_keys, right_keys) = split_keys(keys, bit);
        let (left_values, right_values) = values.split_at(left_keys.len());
        self.update_node(
            left_keys,
            left_values,
            left,
            abs_height,
            height + 1,
            structure,
            nodes,
        )?;
        self.update_node(
            right_keys,
            right_values,
            right,
            abs_height,
            height + 1,
            structure,
            nodes,
        )
    }
}
