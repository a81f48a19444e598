//! # state_tree
//!
//! An authenticated sparse key-value tree.
//!
//! The tree commits to a set of fixed-length keys and their values with a
//! single 32-byte root hash and produces compact proofs that keys are present
//! or absent. Nodes are content-addressed and live in a pluggable
//! [`NodeStore`]; the tree itself only holds the root hash.
//!
//! ## Core Concepts
//!
//! - **Nodes**: empty, leaf (key + value) or branch (two child hashes)
//! - **Single-leaf collapse**: a subtree with one key is stored as one leaf
//! - **Batches**: many keys applied in one pass, same result as one by one
//! - **Proofs**: deduplicated sibling hashes plus a bitmap per queried key
//! - **Skip layout**: several levels per stored blob, same root hashes
//!
//! ## Example
//!
//! ```ignore
//! use state_tree::{MemoryStore, SparseMerkleTree, verify};
//!
//! let store = MemoryStore::new();
//! let mut tree = SparseMerkleTree::new(&store, 32);
//! tree.update(&[7u8; 32], b"value")?;
//!
//! let keys = vec![vec![7u8; 32]];
//! let proof = tree.generate_multi_proof(&keys)?;
//! assert!(verify(&keys, &proof, &tree.root_hash(), 32));
//! ```

pub mod config;
pub mod model;
pub mod skip;
pub mod store;
pub mod trie;

mod error;

pub use config::TreeConfig;
pub use error::{Error, Result};
pub use model::Hash;
pub use skip::SkipMerkleTree;
pub use store::{MemoryStore, NodeStore, ObjectStore};
pub use trie::{verify, Node, Proof, Query, SingleProof, SparseMerkleTree};

/// Store file format version
pub const VERSION: u32 = 1;

/// Magic bytes for file identification
pub const MAGIC: &[u8; 8] = b"STATETRE";
