//! Core data model types for state_tree

mod hash;
pub mod hex_serde;

pub use hash::{Hash, HASH_SIZE};
