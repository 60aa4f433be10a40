//! Generic iterative B-tree descent (`spec.md` §4.G).
//!
//! Grounded in the teacher's `catalog.rs`/`omap.rs` traversal loops, which
//! each hand-roll their own descent against a tree's particular key type.
//! This module factors that into one generic engine shared by the object
//! map, the file-system tree, and the snapshot metadata tree, parameterized
//! over a [`ChildResolver`] — the one place the three trees actually
//! differ. The object map's own sub-nodes are addressed by *physical block
//! number*, never by oid (`spec.md` §4.F step 3, §9): resolving through the
//! object map again here would recurse forever. Every other tree's
//! children are oids that must themselves be resolved through the object
//! map. Modeling that as a trait rather than an `Option<u64>` parameter (as
//! the teacher does) makes the physical-vs-virtual distinction a type the
//! caller has to pick, not a boolean easy to flip by accident.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::block::{BlockCache, BlockSource};
use crate::cache::NodeCache;
use crate::config::MAX_BTREE_DEPTH;
use crate::error::{ApfsError, Result};

use super::node::BTreeNode;

/// How a branch node's 8-byte child value is turned into a physical block
/// number to read next.
pub trait ChildResolver {
    /// `value` is the branch entry's raw 8-byte value (an oid for every
    /// tree except the object map's own nodes, which store the physical
    /// block number directly).
    fn resolve(&self, value: u64) -> Result<u64>;
}

/// Children are oids that must be looked up in an object map to find their
/// current physical location. Used by every tree *except* the object map's
/// own internal nodes.
pub struct OmapResolver<'a, F> {
    pub lookup: F,
    pub _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a, F> ChildResolver for OmapResolver<'a, F>
where
    F: Fn(u64) -> Result<u64>,
{
    fn resolve(&self, value: u64) -> Result<u64> {
        (self.lookup)(value)
    }
}

/// Children are already physical block numbers. Used by the object map's
/// own nodes, which is the one tree in APFS not itself indirected through
/// another object map (`spec.md` §4.F step 3).
pub struct DirectResolver;

impl ChildResolver for DirectResolver {
    fn resolve(&self, value: u64) -> Result<u64> {
        Ok(value)
    }
}

/// Everything a descent needs to read and cache nodes of one tree.
pub struct TreeAccess<'a, S: BlockSource, R: ChildResolver> {
    pub source: &'a S,
    pub block_cache: &'a BlockCache,
    pub node_cache: &'a NodeCache,
    pub resolver: R,
    pub subtype: u32,
    pub lenient: bool,
    pub verify_checksums: bool,
    pub fallback_key_size: u32,
    pub fallback_value_size: u32,
}

impl<'a, S: BlockSource, R: ChildResolver> TreeAccess<'a, S, R> {
    /// Decoded nodes come from the node cache (`spec.md` §4.K), keyed by
    /// `(subtype, block_number)`; a cache miss reads through the raw
    /// data-block cache (`spec.md` §4.B) and decodes once.
    fn load_node(&self, block_number: u64) -> Result<Arc<BTreeNode>> {
        let subtype = self.subtype;
        let lenient = self.lenient;
        let verify_checksums = self.verify_checksums;
        let source = self.source;
        let block_cache = self.block_cache;
        self.node_cache.get_or_insert_with(subtype, block_number, || {
            let block = block_cache.get_or_read(source, block_number)?;
            BTreeNode::parse(&block, subtype, lenient, verify_checksums)
        })
    }

    /// Iterative descent from `root_block` to the leaf entry matching `key`
    /// under `cmp`, following the rightmost-entry-not-greater-than-key rule
    /// at each branch level (`spec.md` §4.G step 2). Returns `None` when the
    /// key is absent — that is a value, not an error.
    pub fn find<K>(&self, root_block: u64, key: &K, cmp: impl Fn(&K, &[u8]) -> Ordering) -> Result<Option<Cursor>> {
        let mut block_number = root_block;
        let mut depth = 0usize;

        loop {
            if depth >= MAX_BTREE_DEPTH {
                return Err(ApfsError::DepthExceeded { max: MAX_BTREE_DEPTH });
            }
            let node = self.load_node(block_number)?;
            let (fks, fvs) = node.fixed_sizes(self.fallback_key_size, self.fallback_value_size);

            let slot = self.locate(&node, key, &cmp, fks)?;

            if node.is_leaf() {
                return Ok(slot.map(|index| Cursor {
                    block_number,
                    index,
                    node,
                }));
            }

            let index = match slot {
                Some(i) => i,
                None => return Ok(None),
            };
            let child_value = node.child_oid(index)?;
            block_number = self.resolver.resolve(child_value)?;
            depth += 1;
        }
    }

    /// Binary search for the rightmost entry whose key is `<= key`
    /// (branch descent) or the exact match (leaf lookup). Returns `None`
    /// when every entry's key is greater than `key`.
    fn locate<K>(
        &self,
        node: &BTreeNode,
        key: &K,
        cmp: &impl Fn(&K, &[u8]) -> Ordering,
        fixed_key_size: u32,
    ) -> Result<Option<usize>> {
        let n = node.nkeys();
        if n == 0 {
            return Ok(None);
        }

        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let mid_key = node.key(mid, fixed_key_size)?;
            match cmp(key, mid_key) {
                Ordering::Less => hi = mid,
                _ => lo = mid + 1,
            }
        }

        if lo == 0 {
            // key is smaller than every entry in this node.
            if node.is_leaf() {
                return Ok(None);
            }
            return Ok(None);
        }
        let candidate = lo - 1;

        if node.is_leaf() {
            let candidate_key = node.key(candidate, fixed_key_size)?;
            if cmp(key, candidate_key) == Ordering::Equal {
                Ok(Some(candidate))
            } else {
                Ok(None)
            }
        } else {
            Ok(Some(candidate))
        }
    }

    /// Load the root node directly, for full-tree traversals (directory
    /// listings, snapshot enumeration) that don't start from a key.
    pub fn root(&self, root_block: u64) -> Result<Arc<BTreeNode>> {
        self.load_node(root_block)
    }

    pub fn child(&self, node: &BTreeNode, index: usize) -> Result<Arc<BTreeNode>> {
        let child_value = node.child_oid(index)?;
        let block_number = self.resolver.resolve(child_value)?;
        self.load_node(block_number)
    }

    /// Leftmost leaf cursor under `root_block`, for forward iteration
    /// starting at the beginning of the tree.
    pub fn first_leaf(&self, root_block: u64) -> Result<Option<Cursor>> {
        let mut block_number = root_block;
        let mut depth = 0usize;
        loop {
            if depth >= MAX_BTREE_DEPTH {
                return Err(ApfsError::DepthExceeded { max: MAX_BTREE_DEPTH });
            }
            let node = self.load_node(block_number)?;
            if node.is_leaf() {
                return Ok(if node.nkeys() == 0 {
                    None
                } else {
                    Some(Cursor {
                        block_number,
                        index: 0,
                        node,
                    })
                });
            }
            if node.nkeys() == 0 {
                return Ok(None);
            }
            let child_value = node.child_oid(0)?;
            block_number = self.resolver.resolve(child_value)?;
            depth += 1;
        }
    }

    /// Advance `cursor` to the next leaf entry, re-descending from the root
    /// when the current node is exhausted (`spec.md` §4.G step 5 — range
    /// scans don't keep parent pointers, so crossing a leaf boundary means
    /// re-finding the successor key from the top).
    pub fn next(&self, cursor: &Cursor, root_block: u64) -> Result<Option<Cursor>> {
        if cursor.index + 1 < cursor.node.nkeys() {
            return Ok(Some(Cursor {
                block_number: cursor.block_number,
                index: cursor.index + 1,
                node: cursor.node.clone(),
            }));
        }

        let (fks, _fvs) = cursor.node.fixed_sizes(self.fallback_key_size, self.fallback_value_size);
        let last_key = cursor.node.key(cursor.index, fks)?.to_vec();
        self.find(root_block, &last_key, |needle: &Vec<u8>, candidate: &[u8]| {
            needle.as_slice().cmp(candidate)
        })
        .and_then(|found| match found {
            Some(exact) => self.advance_past(&exact, root_block),
            None => self.first_after(&last_key, root_block),
        })
    }

    fn advance_past(&self, cursor: &Cursor, root_block: u64) -> Result<Option<Cursor>> {
        if cursor.index + 1 < cursor.node.nkeys() {
            return Ok(Some(Cursor {
                block_number: cursor.block_number,
                index: cursor.index + 1,
                node: cursor.node.clone(),
            }));
        }
        let (fks, _) = cursor.node.fixed_sizes(self.fallback_key_size, self.fallback_value_size);
        let last_key = cursor.node.key(cursor.index, fks)?.to_vec();
        self.first_after(&last_key, root_block)
    }

    /// Smallest-key leaf entry strictly greater than `key`, found by a
    /// fresh descent (used once a leaf boundary is crossed during a
    /// forward scan).
    ///
    /// A single top-down pass cannot always find this leaf: the branch
    /// entry whose range contains `key` can itself dead-end at its own
    /// rightmost leaf, in which case the answer lives in the next sibling
    /// subtree up at some ancestor, not anywhere under the child picked at
    /// that level. This keeps a stack of `(ancestor node, child index
    /// taken)` while descending and, if the leaf search comes up empty,
    /// retreats up that stack to the nearest ancestor with an unvisited
    /// right sibling and takes that subtree's leftmost leaf instead.
    fn first_after(&self, key: &[u8], root_block: u64) -> Result<Option<Cursor>> {
        let mut block_number = root_block;
        let mut depth = 0usize;
        let mut ancestors: Vec<(Arc<BTreeNode>, usize)> = Vec::new();

        loop {
            if depth >= MAX_BTREE_DEPTH {
                return Err(ApfsError::DepthExceeded { max: MAX_BTREE_DEPTH });
            }
            let node = self.load_node(block_number)?;
            let (fks, _) = node.fixed_sizes(self.fallback_key_size, self.fallback_value_size);
            let n = node.nkeys();
            if n == 0 {
                return Ok(None);
            }

            let mut lo = 0usize;
            let mut hi = n;
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                let mid_key = node.key(mid, fks)?;
                if mid_key.cmp(key) == Ordering::Greater {
                    hi = mid;
                } else {
                    lo = mid + 1;
                }
            }

            if node.is_leaf() {
                if lo < n {
                    return Ok(Some(Cursor {
                        block_number,
                        index: lo,
                        node,
                    }));
                }
                return self.retreat_to_next_subtree(&mut ancestors);
            }

            // Branch key[i] is the smallest key in child i's subtree, so
            // the child that can contain `key`'s successor is the rightmost
            // one whose key is `<= key` — `lo - 1`, not `lo` (which is the
            // first key strictly greater and belongs to a sibling already
            // one past the right subtree).
            let idx = if lo == 0 { 0 } else { lo - 1 };
            ancestors.push((node.clone(), idx));
            let child_value = node.child_oid(idx)?;
            block_number = self.resolver.resolve(child_value)?;
            depth += 1;
        }
    }

    /// Unwind `ancestors` to the nearest branch node with an unvisited
    /// right sibling of the child just exhausted, and return that
    /// sibling's leftmost leaf entry.
    fn retreat_to_next_subtree(&self, ancestors: &mut Vec<(Arc<BTreeNode>, usize)>) -> Result<Option<Cursor>> {
        while let Some((node, idx)) = ancestors.pop() {
            let n = node.nkeys();
            if idx + 1 < n {
                let child_value = node.child_oid(idx + 1)?;
                let next_block = self.resolver.resolve(child_value)?;
                return self.first_leaf(next_block);
            }
        }
        Ok(None)
    }
}

/// A position within a leaf node, holding the node alive so repeated
/// `key`/`value` calls don't re-read the block.
#[derive(Clone)]
pub struct Cursor {
    pub block_number: u64,
    pub index: usize,
    pub node: Arc<BTreeNode>,
}

impl Cursor {
    pub fn key(&self, fixed_key_size: u32) -> Result<&[u8]> {
        self.node.key(self.index, fixed_key_size)
    }

    pub fn value(&self, fixed_value_size: u32) -> Result<&[u8]> {
        self.node.value(self.index, fixed_value_size)
    }
}
