//! In-memory node store

use super::NodeStore;
use crate::model::Hash;
use crate::Result;
use parking_lot::RwLock;
use std::collections::HashMap;

/// A [`NodeStore`] backed by a hash map
#[derive(Default)]
pub struct MemoryStore {
    nodes: RwLock<HashMap<Hash, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored nodes
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.nodes.read().contains_key(hash)
    }
}

impl NodeStore for MemoryStore {
    fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        Ok(self.nodes.read().get(hash).cloned())
    }

    fn set(&self, hash: &Hash, data: &[u8]) -> Result<()> {
        self.nodes.write().insert(*hash, data.to_vec());
        Ok(())
    }

    fn del(&self, hash: &Hash) -> Result<()> {
        self.nodes.write().remove(hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_del() {
        let store = MemoryStore::new();
        let hash = Hash::digest(b"node");

        assert_eq!(store.get(&hash).unwrap(), None);
        store.set(&hash, b"node").unwrap();
        assert_eq!(store.get(&hash).unwrap(), Some(b"node".to_vec()));
        assert_eq!(store.len(), 1);

        store.del(&hash).unwrap();
        assert!(store.is_empty());
        // Deleting twice is fine
        store.del(&hash).unwrap();
    }
}
