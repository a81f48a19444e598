//! Node storage
//!
//! The tree engines only talk to storage through [`NodeStore`]: a
//! content-addressed get/set/del keyed by node hash. Two backends ship with
//! the crate, an in-memory map and a single-file object store whose records
//! are optionally compressed with zstd.

mod blob;
mod file_store;
mod memory;

pub use blob::{Record, RecordEncoding};
pub use file_store::ObjectStore;
pub use memory::MemoryStore;

use crate::model::Hash;
use crate::Result;

/// Persistent key-value storage for encoded tree nodes
///
/// Implementations must give read-after-write consistency within one
/// operation. Durability and atomic commit of a new root belong to the caller.
pub trait NodeStore: Send + Sync {
    /// Fetch the encoding stored under `hash`
    fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>>;

    /// Store `data` under `hash`
    fn set(&self, hash: &Hash, data: &[u8]) -> Result<()>;

    /// Remove whatever is stored under `hash`. Removing an absent hash is not
    /// an error.
    fn del(&self, hash: &Hash) -> Result<()>;
}

impl<T: NodeStore + ?Sized> NodeStore for &T {
    fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        (**self).get(hash)
    }

    fn set(&self, hash: &Hash, data: &[u8]) -> Result<()> {
        (**self).set(hash, data)
    }

    fn del(&self, hash: &Hash) -> Result<()> {
        (**self).del(hash)
    }
}
