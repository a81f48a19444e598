//! Subtree-batched layout of the sparse merkle tree
//!
//! Groups a fixed number of trie levels into one stored blob so a lookup or
//! update touches one record per `subtree_height` levels instead of one per
//! level. Commitments are the same as the unbatched tree.
//!
//! A store should hold blobs of one layout only: a single-leaf skip tree is
//! stored under the same hash as the leaf node of a sparse tree.

mod position;
mod subtree;
mod tree;

pub use position::Position;
pub use subtree::{SkipNode, SubTree};
pub use tree::SkipMerkleTree;
