//! Sparse merkle tree
//!
//! - Every key has a fixed length and maps to a path of `8 * key_length` bits
//! - A subtree holding one key is stored as a single leaf
//! - The root hash commits to the whole key/value set, independent of the
//!   order updates were applied in
//! - Proofs show presence or absence of any set of keys against a root

pub mod bits;
mod node;
mod proof;
mod tree;

pub use node::{branch_hash, leaf_hash, Branch, Leaf, Node, Side};
pub use proof::{verify, Proof, Query, SingleProof};
pub use tree::SparseMerkleTree;
