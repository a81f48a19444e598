//! Inclusion and exclusion proofs
//!
//! A proof for a set of query keys carries, per query, the terminal node the
//! key path ends in plus a bitmap of which levels on the path have a
//! non-empty sibling. Sibling hashes for the whole set are deduplicated into
//! one list, ordered the way the verifier folds queries back into the root.
//!
//! Bitmaps list the deepest level first.

use super::bits::{bits_to_bytes, bytes_to_bits, check_key, common_prefix_len, is_bit_set};
use super::node::{branch_hash, leaf_hash, Node, Side};
use super::tree::SparseMerkleTree;
use crate::model::{hex_serde, Hash};
use crate::store::NodeStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::VecDeque;
use tracing::debug;

/// The path of one key from the root down to its terminal node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SingleProof {
    /// Key of the terminal leaf, or the queried key when the path ends empty
    pub key: Vec<u8>,
    /// Value of the terminal leaf, empty when the path ends empty
    pub value: Vec<u8>,
    /// One bit per level, deepest first: set when the sibling is non-empty
    pub bitmap: Vec<bool>,
    /// Hashes of the nodes on the path, root first, terminal leaf last
    pub ancestor_hashes: Vec<Hash>,
    /// Non-empty sibling hashes, root level first
    pub sibling_hashes: Vec<Hash>,
}

impl SingleProof {
    /// Whether this proves `key` is present, as opposed to absent
    pub fn is_inclusion(&self, key: &[u8]) -> bool {
        !self.value.is_empty() && self.key == key
    }

    pub fn to_query(&self) -> Query {
        Query {
            key: self.key.clone(),
            value: self.value.clone(),
            bitmap: bits_to_bytes(&self.bitmap),
        }
    }
}

/// One query of a multi-key proof
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    #[serde(with = "hex_serde")]
    pub key: Vec<u8>,
    #[serde(with = "hex_serde")]
    pub value: Vec<u8>,
    /// Packed bitmap, see [`bits_to_bytes`]
    #[serde(with = "hex_serde")]
    pub bitmap: Vec<u8>,
}

impl Query {
    /// Hash of the terminal node this query ends in
    pub fn terminal_hash(&self) -> Hash {
        if self.value.is_empty() {
            Hash::EMPTY
        } else {
            leaf_hash(&self.key, &self.value)
        }
    }
}

/// A proof for any number of keys against one root
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    #[serde(with = "hex_serde::hashes")]
    pub sibling_hashes: Vec<Hash>,
    pub queries: Vec<Query>,
}

impl Proof {
    /// Shorthand for [`verify`]
    pub fn verify(&self, query_keys: &[Vec<u8>], expected_root: &Hash, key_length: usize) -> bool {
        verify(query_keys, self, expected_root, key_length)
    }
}

impl<'a, S: NodeStore> SparseMerkleTree<'a, S> {
    /// Walk the path of `key` and record what is needed to rebuild the root
    pub fn generate_single_proof(&self, key: &[u8]) -> Result<SingleProof> {
        check_key(key, self.key_length())?;

        let mut bitmap = Vec::new();
        let mut ancestor_hashes = Vec::new();
        let mut sibling_hashes = Vec::new();

        let mut node = self.get_node(&self.root_hash())?;
        let mut height = 0;
        while let Node::Branch(branch) = node {
            ancestor_hashes.push(branch.hash());
            let side = Side::from_bit(is_bit_set(key, height));
            let sibling = branch.child(side.other());
            if sibling.is_empty() {
                bitmap.push(false);
            } else {
                bitmap.push(true);
                sibling_hashes.push(sibling);
            }
            node = self.get_node(&branch.child(side))?;
            height += 1;
        }
        bitmap.reverse();

        let (key, value) = match node {
            Node::Leaf(leaf) => {
                ancestor_hashes.push(leaf.hash());
                leaf.into_parts()
            }
            _ => (key.to_vec(), Vec::new()),
        };

        Ok(SingleProof {
            key,
            value,
            bitmap,
            ancestor_hashes,
            sibling_hashes,
        })
    }

    /// Build one proof covering all of `query_keys`
    ///
    /// Queries come back in the order of `query_keys`. Sibling hashes that
    /// are themselves on the path of another query are left out.
    pub fn generate_multi_proof(&self, query_keys: &[Vec<u8>]) -> Result<Proof> {
        let singles = query_keys
            .iter()
            .map(|key| self.generate_single_proof(key))
            .collect::<Result<Vec<_>>>()?;

        let pending = singles
            .iter()
            .map(|single| PendingQuery {
                key: single.key.clone(),
                hash: single.to_query().terminal_hash(),
                height: single.bitmap.len(),
                bitmap: single.bitmap.clone(),
                siblings: single.sibling_hashes.clone(),
            })
            .collect();

        let mut collector = CollectSiblings::default();
        let root = fold(pending, &mut collector);
        if !query_keys.is_empty() && root != Some(self.root_hash()) {
            return Err(Error::Corruption(
                "Proof paths do not rebuild the current root".into(),
            ));
        }

        debug!(
            queries = query_keys.len(),
            siblings = collector.hashes.len(),
            "generated multi proof"
        );
        Ok(Proof {
            sibling_hashes: collector.hashes,
            queries: singles.iter().map(SingleProof::to_query).collect(),
        })
    }
}

/// Check that `proof` answers `query_keys` against `expected_root`
///
/// Malformed proofs are rejected, never reported as errors. Every sibling
/// hash in the proof must be used.
pub fn verify(
    query_keys: &[Vec<u8>],
    proof: &Proof,
    expected_root: &Hash,
    key_length: usize,
) -> bool {
    if query_keys.is_empty() || query_keys.len() != proof.queries.len() {
        return false;
    }

    let max_height = key_length * 8;
    let mut pending = Vec::with_capacity(query_keys.len());
    for (query_key, query) in query_keys.iter().zip(&proof.queries) {
        if query_key.len() != key_length || query.key.len() != key_length {
            return false;
        }
        let bitmap = bytes_to_bits(&query.bitmap);
        if bitmap.len() > max_height {
            return false;
        }
        // A different leaf proves absence only if it sits on the query's path
        if query.key != *query_key
            && (query.value.is_empty() || bitmap.len() > common_prefix_len(query_key, &query.key))
        {
            return false;
        }

        pending.push(PendingQuery {
            key: query.key.clone(),
            hash: query.terminal_hash(),
            height: bitmap.len(),
            bitmap,
            siblings: Vec::new(),
        });
    }

    let mut siblings = ProofSiblings {
        hashes: proof.sibling_hashes.iter(),
    };
    match fold(pending, &mut siblings) {
        Some(root) => siblings.hashes.next().is_none() && root == *expected_root,
        None => false,
    }
}

// === Root reconstruction ===

/// A query on its way up to the root
struct PendingQuery {
    key: Vec<u8>,
    hash: Hash,
    bitmap: Vec<bool>,
    /// Depth of the node `hash` belongs to
    height: usize,
    /// Remaining non-empty siblings, root level first
    siblings: Vec<Hash>,
}

impl PendingQuery {
    fn sibling_is_set(&self) -> bool {
        self.bitmap[self.bitmap.len() - self.height]
    }

    fn same_position(&self, other: &PendingQuery) -> bool {
        self.height == other.height && common_prefix_len(&self.key, &other.key) >= self.height
    }

    fn is_sibling_of(&self, other: &PendingQuery) -> bool {
        self.height == other.height
            && self.height > 0
            && common_prefix_len(&self.key, &other.key) == self.height - 1
    }

    /// Deepest first, then by key
    fn order(&self, other: &PendingQuery) -> Ordering {
        other
            .height
            .cmp(&self.height)
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// Where sibling hashes come from while folding
trait SiblingSource {
    /// Next sibling of `query` that is not on another query's path
    fn next_sibling(&mut self, query: &mut PendingQuery) -> Option<Hash>;

    /// The sibling of `query` was supplied by another query
    fn covered(&mut self, _query: &mut PendingQuery) {}
}

/// Reads siblings from the paths while generating, recording the ones used
#[derive(Default)]
struct CollectSiblings {
    hashes: Vec<Hash>,
}

impl SiblingSource for CollectSiblings {
    fn next_sibling(&mut self, query: &mut PendingQuery) -> Option<Hash> {
        let hash = query.siblings.pop()?;
        self.hashes.push(hash);
        Some(hash)
    }

    fn covered(&mut self, query: &mut PendingQuery) {
        query.siblings.pop();
    }
}

/// Reads siblings from a proof while verifying
struct ProofSiblings<'p> {
    hashes: std::slice::Iter<'p, Hash>,
}

impl SiblingSource for ProofSiblings<'_> {
    fn next_sibling(&mut self, _query: &mut PendingQuery) -> Option<Hash> {
        self.hashes.next().copied()
    }
}

/// Insert keeping queue order. Two queries at one position merge and must
/// agree on the hash.
fn enqueue(queue: &mut VecDeque<PendingQuery>, query: PendingQuery) -> Option<()> {
    let index = match queue.binary_search_by(|queued| queued.order(&query)) {
        Ok(index) => {
            return (queue[index].hash == query.hash).then_some(());
        }
        Err(index) => index,
    };

    let neighbours = [index.checked_sub(1), Some(index)];
    for i in neighbours.into_iter().flatten() {
        if let Some(existing) = queue.get(i) {
            if existing.same_position(&query) {
                return (existing.hash == query.hash).then_some(());
            }
        }
    }
    queue.insert(index, query);
    Some(())
}

/// Combine queries level by level until one node at the root remains
fn fold(queries: Vec<PendingQuery>, source: &mut impl SiblingSource) -> Option<Hash> {
    let mut queue = VecDeque::with_capacity(queries.len());
    for query in queries {
        enqueue(&mut queue, query)?;
    }

    while let Some(mut query) = queue.pop_front() {
        if query.height == 0 {
            // Everything left is at the root and was merged on insert
            return queue.is_empty().then_some(query.hash);
        }

        // A sibling on another query's path is rebuilt here, never read
        let sibling = if queue.front().map_or(false, |next| query.is_sibling_of(next)) {
            let next = queue.pop_front()?;
            if query.sibling_is_set() {
                source.covered(&mut query);
            } else if !next.hash.is_empty() {
                return None;
            }
            next.hash
        } else if query.sibling_is_set() {
            source.next_sibling(&mut query)?
        } else {
            Hash::EMPTY
        };

        query.hash = if is_bit_set(&query.key, query.height - 1) {
            branch_hash(&sibling, &query.hash)
        } else {
            branch_hash(&query.hash, &sibling)
        };
        query.height -= 1;
        enqueue(&mut queue, query)?;
    }
    None
}
