//! Sparse merkle tree over a [`NodeStore`]

use super::bits::{check_key, common_prefix_len, is_bit_set, prepare_batch, split_keys};
use super::node::{Node, Side};
use crate::config::TreeConfig;
use crate::model::Hash;
use crate::store::NodeStore;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::{debug, trace, warn};

/// A binary sparse merkle tree with `8 * key_length` levels
///
/// Only the root hash lives in memory. Nodes are read from and written to the
/// store on demand and keyed by their own hash. A subtree holding a single
/// key is collapsed into one leaf, so depth grows with the number of keys
/// rather than with key length.
pub struct SparseMerkleTree<'a, S: NodeStore> {
    store: &'a S,
    key_length: usize,
    root: Hash,
    /// Delete superseded nodes from the store
    prune: bool,
    /// Batches at least this large rebuild both halves of a split in parallel
    parallel_threshold: Option<usize>,
    /// Nodes written and superseded by the operation in progress
    changes: Mutex<Changes>,
}

/// Store effects of one operation. Superseded nodes are only deleted once
/// the operation has written every replacement, so a failed write never
/// leaves the current root pointing at a deleted node.
#[derive(Default)]
struct Changes {
    written: HashSet<Hash>,
    stale: Vec<Hash>,
}

/// One side of a branch during a batch rebuild. Sides that receive no keys
/// are never loaded.
enum Subtree {
    Loaded(Node),
    Stored(Hash),
}

impl Subtree {
    fn hash(&self) -> Hash {
        match self {
            Subtree::Loaded(node) => node.hash(),
            Subtree::Stored(hash) => *hash,
        }
    }
}

impl<'a, S: NodeStore> SparseMerkleTree<'a, S> {
    /// Create an empty tree
    pub fn new(store: &'a S, key_length: usize) -> Self {
        SparseMerkleTree {
            store,
            key_length,
            root: Hash::EMPTY,
            prune: true,
            parallel_threshold: None,
            changes: Mutex::new(Changes::default()),
        }
    }

    /// Create a tree at `root` with the settings from `config`
    pub fn from_config(store: &'a S, root: Hash, config: &TreeConfig) -> Self {
        SparseMerkleTree::new(store, config.key_length)
            .with_root(root)
            .with_pruning(config.prune)
            .with_parallelism(config.parallel.then_some(config.parallel_threshold))
    }

    /// Start from an existing root
    pub fn with_root(mut self, root: Hash) -> Self {
        self.root = root;
        self
    }

    /// Whether superseded nodes are deleted from the store. Only safe when no
    /// other root reads from the same store.
    pub fn with_pruning(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    /// Minimum batch size for parallel rebuilds, `None` to stay on one thread
    pub fn with_parallelism(mut self, threshold: Option<usize>) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    /// Get the root hash
    pub fn root_hash(&self) -> Hash {
        self.root
    }

    pub fn key_length(&self) -> usize {
        self.key_length
    }

    /// Load the node stored under `hash`
    pub fn get_node(&self, hash: &Hash) -> Result<Node> {
        if hash.is_empty() {
            return Ok(Node::Empty);
        }
        let data = self.store.get(hash)?.ok_or(Error::MissingNode(*hash))?;
        Node::decode(&data, self.key_length)
    }

    /// Insert or overwrite one key, returning the new root node
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<Node> {
        if value.is_empty() {
            return Err(Error::InvalidValue);
        }
        check_key(key, self.key_length)?;

        let root = self.get_node(&self.root)?;
        let result = self.update_node(key, value, root, 0);
        self.finish(result)
    }

    /// Insert or overwrite many keys at once
    ///
    /// The result is the same as calling [`update`](Self::update) for every
    /// pair in any order. Keys must be unique within a batch.
    pub fn update_batch(&mut self, keys: Vec<Vec<u8>>, values: Vec<Vec<u8>>) -> Result<Node> {
        let (keys, values) = prepare_batch(keys, values, self.key_length)?;
        match keys.len() {
            0 => return self.get_node(&self.root),
            1 => return self.update(&keys[0], &values[0]),
            _ => {}
        }

        let root = self.get_node(&self.root)?;
        let result = self.update_batch_node(&keys, &values, root, 0);
        let new_root = self.finish(result)?;
        debug!(keys = keys.len(), "applied batch update");
        Ok(new_root)
    }

    /// Remove a key. Removing an absent key leaves the tree unchanged.
    pub fn remove(&mut self, key: &[u8]) -> Result<Node> {
        check_key(key, self.key_length)?;

        let root = self.get_node(&self.root)?;
        let result = self.remove_node(key, root.clone(), 0).transpose();
        match result {
            Some(result) => self.finish(result),
            None => {
                self.take_changes();
                trace!(key = %hex::encode(key), "remove of absent key");
                Ok(root)
            }
        }
    }

    /// Get the value stored under a key
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        check_key(key, self.key_length)?;

        let mut node = self.get_node(&self.root)?;
        let mut height = 0;
        while let Node::Branch(branch) = node {
            let side = Side::from_bit(is_bit_set(key, height));
            node = self.get_node(&branch.child(side))?;
            height += 1;
        }

        match node {
            Node::Leaf(leaf) if leaf.key() == key => Ok(Some(leaf.into_parts().1)),
            _ => Ok(None),
        }
    }

    /// Hashes of every stored node reachable from the current root
    pub fn reachable(&self) -> Result<HashSet<Hash>> {
        let mut live = HashSet::new();
        let mut pending = vec![self.root];
        while let Some(hash) = pending.pop() {
            if hash.is_empty() || !live.insert(hash) {
                continue;
            }
            if let Node::Branch(branch) = self.get_node(&hash)? {
                pending.push(branch.left());
                pending.push(branch.right());
            }
        }
        Ok(live)
    }

    // === Internal helpers ===

    /// Complete an operation: move the root on success, then drop what the
    /// old root no longer needs. On failure the root and store keep their
    /// previous contents apart from unreferenced new nodes.
    fn finish(&mut self, result: Result<Node>) -> Result<Node> {
        let changes = self.take_changes();
        let new_root = result?;
        self.set_root(new_root.hash());

        for hash in changes.stale {
            if changes.written.contains(&hash) {
                continue;
            }
            trace!(hash = %hash.short(), "discard node");
            if let Err(err) = self.store.del(&hash) {
                // The new root is complete, a failed delete only leaves garbage
                warn!(hash = %hash.short(), error = %err, "failed to discard node");
            }
        }
        Ok(new_root)
    }

    fn take_changes(&mut self) -> Changes {
        std::mem::take(self.changes.get_mut())
    }

    fn set_root(&mut self, root: Hash) {
        if root != self.root {
            debug!(old = %self.root.short(), new = %root.short(), "root changed");
        }
        self.root = root;
    }

    fn persist(&self, node: &Node) -> Result<()> {
        if node.is_empty() {
            return Ok(());
        }
        trace!(hash = %node.hash().short(), "persist node");
        self.store.set(&node.hash(), &node.encode())?;
        if self.prune {
            self.changes.lock().written.insert(node.hash());
        }
        Ok(())
    }

    /// Mark a node as superseded. It is deleted when the operation succeeds.
    fn discard(&self, hash: Hash) {
        if self.prune && !hash.is_empty() {
            self.changes.lock().stale.push(hash);
        }
    }

    /// Put one key below `node`, which sits `height` levels under the root
    fn update_node(&self, key: &[u8], value: &[u8], node: Node, height: usize) -> Result<Node> {
        match node {
            Node::Empty => {
                let leaf = Node::leaf(key.to_vec(), value.to_vec());
                self.persist(&leaf)?;
                Ok(leaf)
            }
            Node::Leaf(mut leaf) if leaf.key() == key => {
                let old = leaf.hash();
                leaf.update(value.to_vec());
                if leaf.hash() != old {
                    self.discard(old);
                }
                let leaf = Node::Leaf(leaf);
                self.persist(&leaf)?;
                Ok(leaf)
            }
            Node::Leaf(existing) => {
                // Two keys share this subtree now: branch down to the first
                // bit where they differ, with empty siblings on the way.
                let new_leaf = Node::leaf(key.to_vec(), value.to_vec());
                self.persist(&new_leaf)?;

                let diverge = common_prefix_len(key, existing.key());
                let mut bottom = if is_bit_set(key, diverge) {
                    Node::branch(existing.hash(), new_leaf.hash())
                } else {
                    Node::branch(new_leaf.hash(), existing.hash())
                };
                self.persist(&bottom)?;

                for h in (height..diverge).rev() {
                    bottom = if is_bit_set(key, h) {
                        Node::branch(Hash::EMPTY, bottom.hash())
                    } else {
                        Node::branch(bottom.hash(), Hash::EMPTY)
                    };
                    self.persist(&bottom)?;
                }
                Ok(bottom)
            }
            Node::Branch(mut branch) => {
                let side = Side::from_bit(is_bit_set(key, height));
                let child = self.get_node(&branch.child(side))?;
                let new_child = self.update_node(key, value, child, height + 1)?;

                self.discard(branch.hash());
                branch.update(new_child.hash(), side);
                let node = Node::Branch(branch);
                self.persist(&node)?;
                Ok(node)
            }
        }
    }

    /// Put sorted, unique keys below `node`
    fn update_batch_node(
        &self,
        keys: &[Vec<u8>],
        values: &[Vec<u8>],
        node: Node,
        height: usize,
    ) -> Result<Node> {
        match keys.len() {
            0 => return Ok(node),
            1 => return self.update_node(&keys[0], &values[0], node, height),
            _ => {}
        }

        let (left_keys, right_keys) = split_keys(keys, height);
        let (left_values, right_values) = values.split_at(left_keys.len());

        let (left, right) = match node {
            Node::Empty => (
                Subtree::Loaded(Node::Empty),
                Subtree::Loaded(Node::Empty),
            ),
            Node::Leaf(leaf) => {
                if is_bit_set(leaf.key(), height) {
                    (Subtree::Loaded(Node::Empty), Subtree::Loaded(Node::Leaf(leaf)))
                } else {
                    (Subtree::Loaded(Node::Leaf(leaf)), Subtree::Loaded(Node::Empty))
                }
            }
            Node::Branch(branch) => {
                self.discard(branch.hash());
                (
                    Subtree::Stored(branch.left()),
                    Subtree::Stored(branch.right()),
                )
            }
        };

        let both_sides = !left_keys.is_empty() && !right_keys.is_empty();
        let (left_hash, right_hash) = if both_sides && self.parallel_for(keys.len()) {
            let (left, right) = rayon::join(
                || self.rebuild(left_keys, left_values, left, height + 1),
                || self.rebuild(right_keys, right_values, right, height + 1),
            );
            (left?, right?)
        } else {
            (
                self.rebuild(left_keys, left_values, left, height + 1)?,
                self.rebuild(right_keys, right_values, right, height + 1)?,
            )
        };

        let branch = Node::branch(left_hash, right_hash);
        self.persist(&branch)?;
        Ok(branch)
    }

    /// Apply a share of a batch to one side of a split
    fn rebuild(
        &self,
        keys: &[Vec<u8>],
        values: &[Vec<u8>],
        side: Subtree,
        height: usize,
    ) -> Result<Hash> {
        if keys.is_empty() {
            return Ok(side.hash());
        }
        let node = match side {
            Subtree::Loaded(node) => node,
            Subtree::Stored(hash) => self.get_node(&hash)?,
        };
        Ok(self.update_batch_node(keys, values, node, height)?.hash())
    }

    fn parallel_for(&self, batch_size: usize) -> bool {
        self.parallel_threshold
            .map_or(false, |threshold| batch_size >= threshold)
    }

    /// Remove `key` below `node`. Returns `None` when the key is not there.
    fn remove_node(&self, key: &[u8], node: Node, height: usize) -> Result<Option<Node>> {
        match node {
            Node::Empty => Ok(None),
            Node::Leaf(leaf) => {
                if leaf.key() != key {
                    return Ok(None);
                }
                self.discard(leaf.hash());
                Ok(Some(Node::Empty))
            }
            Node::Branch(mut branch) => {
                let side = Side::from_bit(is_bit_set(key, height));
                let child = self.get_node(&branch.child(side))?;
                let Some(new_child) = self.remove_node(key, child, height + 1)? else {
                    return Ok(None);
                };
                let sibling = branch.child(side.other());

                // A lone leaf (or nothing) left under an otherwise empty
                // branch moves up in place of the branch.
                if !new_child.is_branch() && sibling.is_empty() {
                    self.discard(branch.hash());
                    return Ok(Some(new_child));
                }
                if new_child.is_empty() {
                    let sibling = self.get_node(&sibling)?;
                    if sibling.is_leaf() {
                        self.discard(branch.hash());
                        return Ok(Some(sibling));
                    }
                }

                self.discard(branch.hash());
                branch.update(new_child.hash(), side);
                let node = Node::Branch(branch);
                self.persist(&node)?;
                Ok(Some(node))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::trie::node::{branch_hash, leaf_hash};

    const KEY_LENGTH: usize = 32;

    fn key(i: u32) -> Vec<u8> {
        Hash::digest(&i.to_be_bytes()).as_bytes().to_vec()
    }

    fn value(i: u32) -> Vec<u8> {
        format!("value-{}", i).into_bytes()
    }

    #[test]
    fn test_empty_tree() {
        let store = MemoryStore::new();
        let tree = SparseMerkleTree::new(&store, KEY_LENGTH);
        assert_eq!(tree.root_hash(), Hash::EMPTY);
        assert_eq!(tree.get(&key(1)).unwrap(), None);
    }

    #[test]
    fn test_single_leaf_is_root() {
        let store = MemoryStore::new();
        let mut tree = SparseMerkleTree::new(&store, KEY_LENGTH);

        let root = tree.update(&key(1), &value(1)).unwrap();
        assert!(root.is_leaf());
        assert_eq!(tree.root_hash(), leaf_hash(&key(1), &value(1)));
        assert_eq!(tree.get(&key(1)).unwrap(), Some(value(1)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_update_rejects_bad_input() {
        let store = MemoryStore::new();
        let mut tree = SparseMerkleTree::new(&store, KEY_LENGTH);

        assert!(matches!(
            tree.update(&key(1), b""),
            Err(Error::InvalidValue)
        ));
        assert!(matches!(
            tree.update(&[1u8; 5], b"v"),
            Err(Error::InvalidKeyLength { expected: 32, found: 5 })
        ));
        assert!(matches!(
            tree.remove(&[1u8; 5]),
            Err(Error::InvalidKeyLength { .. })
        ));
        assert!(store.is_empty());
        assert_eq!(tree.root_hash(), Hash::EMPTY);
    }

    #[test]
    fn test_keys_differing_in_first_bit() {
        let store = MemoryStore::new();
        let mut tree = SparseMerkleTree::new(&store, KEY_LENGTH);

        let left = vec![0x00u8; KEY_LENGTH];
        let right = vec![0x80u8; KEY_LENGTH];
        tree.update(&right, b"r").unwrap();
        tree.update(&left, b"l").unwrap();

        let expected = branch_hash(&leaf_hash(&left, b"l"), &leaf_hash(&right, b"r"));
        assert_eq!(tree.root_hash(), expected);
    }

    #[test]
    fn test_overwrite_replaces_value() {
        let store = MemoryStore::new();
        let mut tree = SparseMerkleTree::new(&store, KEY_LENGTH);

        for i in 0..10 {
            tree.update(&key(i), &value(i)).unwrap();
        }
        let nodes = store.len();
        tree.update(&key(3), b"changed").unwrap();

        assert_eq!(tree.get(&key(3)).unwrap(), Some(b"changed".to_vec()));
        assert_eq!(tree.get(&key(4)).unwrap(), Some(value(4)));
        // Superseded leaf and ancestors are gone
        assert_eq!(store.len(), nodes);
    }

    #[test]
    fn test_batch_matches_sequential() {
        let keys: Vec<_> = (0..50).map(key).collect();
        let values: Vec<_> = (0..50).map(value).collect();

        let seq_store = MemoryStore::new();
        let mut sequential = SparseMerkleTree::new(&seq_store, KEY_LENGTH);
        for (k, v) in keys.iter().zip(&values) {
            sequential.update(k, v).unwrap();
        }

        let batch_store = MemoryStore::new();
        let mut batched = SparseMerkleTree::new(&batch_store, KEY_LENGTH);
        batched.update_batch(keys, values).unwrap();

        assert_eq!(batched.root_hash(), sequential.root_hash());
        assert_eq!(batch_store.len(), seq_store.len());
    }

    #[test]
    fn test_parallel_batch_matches_serial() {
        let keys: Vec<_> = (0..300).map(key).collect();
        let values: Vec<_> = (0..300).map(value).collect();

        let serial_store = MemoryStore::new();
        let mut serial = SparseMerkleTree::new(&serial_store, KEY_LENGTH);
        serial.update_batch(keys.clone(), values.clone()).unwrap();

        let parallel_store = MemoryStore::new();
        let mut parallel =
            SparseMerkleTree::new(&parallel_store, KEY_LENGTH).with_parallelism(Some(2));
        parallel.update_batch(keys, values).unwrap();

        assert_eq!(parallel.root_hash(), serial.root_hash());
    }

    #[test]
    fn test_empty_and_single_batches() {
        let store = MemoryStore::new();
        let mut tree = SparseMerkleTree::new(&store, KEY_LENGTH);

        let root = tree.update_batch(vec![], vec![]).unwrap();
        assert!(root.is_empty());

        tree.update_batch(vec![key(1)], vec![value(1)]).unwrap();
        assert_eq!(tree.root_hash(), leaf_hash(&key(1), &value(1)));
    }

    #[test]
    fn test_batch_rejects_duplicates_without_mutation() {
        let store = MemoryStore::new();
        let mut tree = SparseMerkleTree::new(&store, KEY_LENGTH);
        tree.update(&key(9), &value(9)).unwrap();
        let root = tree.root_hash();

        let result = tree.update_batch(vec![key(1), key(2), key(1)], vec![value(1); 3]);
        assert!(matches!(result, Err(Error::DuplicateKey(_))));
        assert_eq!(tree.root_hash(), root);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_promotes_leaf_sibling() {
        let store = MemoryStore::new();
        let mut tree = SparseMerkleTree::new(&store, KEY_LENGTH);

        let a = vec![0x00u8; KEY_LENGTH];
        let mut b = vec![0x00u8; KEY_LENGTH];
        b[0] = 0x01;
        let c = vec![0x80u8; KEY_LENGTH];

        tree.update(&a, b"a").unwrap();
        tree.update(&b, b"b").unwrap();
        tree.update(&c, b"c").unwrap();

        // a and b diverge at bit 7: a chain of branches sits above them
        tree.remove(&a).unwrap();
        assert_eq!(
            tree.root_hash(),
            branch_hash(&leaf_hash(&b, b"b"), &leaf_hash(&c, b"c"))
        );
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_remove_with_branch_sibling() {
        let store = MemoryStore::new();
        let mut tree = SparseMerkleTree::new(&store, KEY_LENGTH);

        let a = vec![0x00u8; KEY_LENGTH];
        let b = vec![0x40u8; KEY_LENGTH];
        let c = vec![0x80u8; KEY_LENGTH];
        tree.update(&a, b"a").unwrap();
        tree.update(&b, b"b").unwrap();
        tree.update(&c, b"c").unwrap();

        // a and b still share their first bit, so the branch above them stays
        tree.remove(&c).unwrap();
        let inner = branch_hash(&leaf_hash(&a, b"a"), &leaf_hash(&b, b"b"));
        assert_eq!(tree.root_hash(), branch_hash(&inner, &Hash::EMPTY));
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_remove_absent_key_is_noop() {
        let store = MemoryStore::new();
        let mut tree = SparseMerkleTree::new(&store, KEY_LENGTH);
        for i in 0..5 {
            tree.update(&key(i), &value(i)).unwrap();
        }
        let root = tree.root_hash();
        let nodes = store.len();

        let returned = tree.remove(&key(100)).unwrap();
        assert_eq!(returned.hash(), root);
        assert_eq!(tree.root_hash(), root);
        assert_eq!(store.len(), nodes);
    }

    #[test]
    fn test_remove_everything_empties_store() {
        let store = MemoryStore::new();
        let mut tree = SparseMerkleTree::new(&store, KEY_LENGTH);
        let keys: Vec<_> = (0..40).map(key).collect();
        tree.update_batch(keys.clone(), (0..40).map(value).collect())
            .unwrap();

        for k in keys.iter().rev() {
            tree.remove(k).unwrap();
        }
        assert_eq!(tree.root_hash(), Hash::EMPTY);
        assert!(store.is_empty());
    }

    #[test]
    fn test_without_pruning_old_roots_stay_readable() {
        let store = MemoryStore::new();
        let mut tree = SparseMerkleTree::new(&store, KEY_LENGTH).with_pruning(false);
        tree.update(&key(1), &value(1)).unwrap();
        tree.update(&key(2), &value(2)).unwrap();
        let old_root = tree.root_hash();

        tree.update(&key(1), b"new").unwrap();
        tree.remove(&key(2)).unwrap();

        let old = SparseMerkleTree::new(&store, KEY_LENGTH).with_root(old_root);
        assert_eq!(old.get(&key(1)).unwrap(), Some(value(1)));
        assert_eq!(old.get(&key(2)).unwrap(), Some(value(2)));
    }

    #[test]
    fn test_reachable_covers_exactly_the_live_tree() {
        let store = MemoryStore::new();
        let mut tree = SparseMerkleTree::new(&store, KEY_LENGTH).with_pruning(false);
        for i in 0..12 {
            tree.update(&key(i), &value(i)).unwrap();
        }
        let old_root = tree.root_hash();
        tree.update(&key(0), b"changed").unwrap();

        let live = tree.reachable().unwrap();
        assert!(live.contains(&tree.root_hash()));
        assert!(!live.contains(&old_root));
        assert!(live.contains(&leaf_hash(&key(5), &value(5))));

        // With pruning on, the store holds exactly the reachable nodes
        let pruned_store = MemoryStore::new();
        let mut pruned = SparseMerkleTree::new(&pruned_store, KEY_LENGTH);
        pruned
            .update_batch((0..12).map(key).collect(), (0..12).map(value).collect())
            .unwrap();
        pruned.update(&key(0), b"changed").unwrap();
        assert_eq!(pruned.root_hash(), tree.root_hash());
        assert_eq!(live.len(), pruned_store.len());

        let empty = SparseMerkleTree::new(&store, KEY_LENGTH);
        assert!(empty.reachable().unwrap().is_empty());
    }

    #[test]
    fn test_missing_node_is_reported() {
        let store = MemoryStore::new();
        let mut tree = SparseMerkleTree::new(&store, KEY_LENGTH).with_root(Hash::digest(b"gone"));
        assert!(matches!(
            tree.update(&key(1), &value(1)),
            Err(Error::MissingNode(_))
        ));
    }
}
