//! Tree node types and their wire encoding
//!
//! ```text
//! Leaf   = 0x01 || key || value
//! Branch = 0x02 || left_hash (32) || right_hash (32)
//! ```
//!
//! The empty node is never persisted; its hash is `Hash::EMPTY`.

use crate::model::{Hash, HASH_SIZE};
use crate::{Error, Result};

/// Encoding prefix of the empty node
pub const EMPTY_PREFIX: u8 = 0x00;
/// Encoding prefix of a leaf node
pub const LEAF_PREFIX: u8 = 0x01;
/// Encoding prefix of a branch node
pub const BRANCH_PREFIX: u8 = 0x02;

/// Which child of a branch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// The side a key takes at a level given the bit value there
    pub fn from_bit(bit: bool) -> Self {
        if bit {
            Side::Right
        } else {
            Side::Left
        }
    }

    pub fn other(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// Hash of a leaf with the given key and value
pub fn leaf_hash(key: &[u8], value: &[u8]) -> Hash {
    Hash::digest_many(&[&[LEAF_PREFIX], key, value])
}

/// Hash of a branch with the given children
pub fn branch_hash(left: &Hash, right: &Hash) -> Hash {
    Hash::digest_many(&[&[BRANCH_PREFIX], left.as_bytes(), right.as_bytes()])
}

/// A terminal node holding one key/value pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Leaf {
    key: Vec<u8>,
    value: Vec<u8>,
    hash: Hash,
}

impl Leaf {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        let hash = leaf_hash(&key, &value);
        Leaf { key, value, hash }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Replace the value, recomputing the hash
    pub fn update(&mut self, value: Vec<u8>) {
        self.value = value;
        self.hash = leaf_hash(&self.key, &self.value);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.key.len() + self.value.len());
        out.push(LEAF_PREFIX);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
        out
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<u8>) {
        (self.key, self.value)
    }
}

/// An internal node holding the hashes of its two children
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Branch {
    left: Hash,
    right: Hash,
    hash: Hash,
}

impl Branch {
    pub fn new(left: Hash, right: Hash) -> Self {
        Branch {
            left,
            right,
            hash: branch_hash(&left, &right),
        }
    }

    pub fn left(&self) -> Hash {
        self.left
    }

    pub fn right(&self) -> Hash {
        self.right
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Child hash on the given side
    pub fn child(&self, side: Side) -> Hash {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }

    /// Replace one child, recomputing the hash
    pub fn update(&mut self, child: Hash, side: Side) {
        match side {
            Side::Left => self.left = child,
            Side::Right => self.right = child,
        }
        self.hash = branch_hash(&self.left, &self.right);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 2 * HASH_SIZE);
        out.push(BRANCH_PREFIX);
        out.extend_from_slice(self.left.as_bytes());
        out.extend_from_slice(self.right.as_bytes());
        out
    }
}

/// A node in the sparse merkle tree
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    /// An unoccupied subtree
    Empty,
    Leaf(Leaf),
    Branch(Branch),
}

impl Node {
    pub fn leaf(key: Vec<u8>, value: Vec<u8>) -> Self {
        Node::Leaf(Leaf::new(key, value))
    }

    pub fn branch(left: Hash, right: Hash) -> Self {
        Node::Branch(Branch::new(left, right))
    }

    pub fn hash(&self) -> Hash {
        match self {
            Node::Empty => Hash::EMPTY,
            Node::Leaf(leaf) => leaf.hash(),
            Node::Branch(branch) => branch.hash(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Node::Empty)
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, Node::Branch(_))
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Node::Empty => vec![EMPTY_PREFIX],
            Node::Leaf(leaf) => leaf.encode(),
            Node::Branch(branch) => branch.encode(),
        }
    }

    /// Decode a persisted node. Leaf keys are `key_length` bytes, the rest
    /// of a leaf encoding is its value.
    pub fn decode(data: &[u8], key_length: usize) -> Result<Self> {
        let (&prefix, body) = data
            .split_first()
            .ok_or_else(|| Error::Corruption("Empty node data".into()))?;

        match prefix {
            EMPTY_PREFIX if body.is_empty() => Ok(Node::Empty),
            LEAF_PREFIX if body.len() > key_length => {
                let (key, value) = body.split_at(key_length);
                Ok(Node::leaf(key.to_vec(), value.to_vec()))
            }
            BRANCH_PREFIX if body.len() == 2 * HASH_SIZE => {
                let (left, right) = body.split_at(HASH_SIZE);
                // Both halves are exactly HASH_SIZE long
                let left = Hash::from_slice(left)
                    .ok_or_else(|| Error::Corruption("Bad branch child".into()))?;
                let right = Hash::from_slice(right)
                    .ok_or_else(|| Error::Corruption("Bad branch child".into()))?;
                Ok(Node::branch(left, right))
            }
            _ => Err(Error::Corruption(format!(
                "Invalid node encoding (prefix {:#04x}, {} bytes)",
                prefix,
                data.len()
            ))),
        }
    }
}

impl Default for Node {
    fn default() -> Self {
        Node::Empty
    }
}
