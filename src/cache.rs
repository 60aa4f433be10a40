//! Decoded-node cache (`spec.md` §4.K).
//!
//! Separate from [`crate::block::BlockCache`] (which holds raw block bytes):
//! this cache holds already-parsed, already-validated [`BTreeNode`]s behind
//! an `Arc`, so a [`crate::btree::Cursor`] can keep a node alive past its
//! eviction from the cache (`spec.md` §9 "Source-style reference-counted
//! nodes"). Entries are keyed by `(subtype, block_address)` rather than a
//! bare block number — `spec.md` §3's invariant that "the same block
//! address under two trees is two distinct entries" is satisfied because a
//! node's subtype already identifies which kind of tree it belongs to
//! (object map, file-system tree, snapshot tree); two different volumes'
//! file-system trees share a subtype but never a block address, since
//! physical block numbers are container-global.

use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::btree::BTreeNode;
use crate::error::Result;

pub struct NodeCache {
    cache: RefCell<LruCache<(u32, u64), Arc<BTreeNode>>>,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        NodeCache {
            cache: RefCell::new(LruCache::new(capacity)),
        }
    }

    /// Fetch a cached node or decode and insert it. `decode` runs at most
    /// once per miss; a failed decode is never cached (`spec.md` §9
    /// "'Invalid' sentinel nodes" — decode is transactional).
    pub fn get_or_insert_with(
        &self,
        subtype: u32,
        block_number: u64,
        decode: impl FnOnce() -> Result<BTreeNode>,
    ) -> Result<Arc<BTreeNode>> {
        let key = (subtype, block_number);
        if let Some(hit) = self.cache.borrow_mut().get(&key) {
            return Ok(hit.clone());
        }
        let node = Arc::new(decode()?);
        self.cache.borrow_mut().put(key, node.clone());
        Ok(node)
    }

    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
