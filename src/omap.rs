//! Object map: `(oid, xid) -> (flags, size, paddr)` (`spec.md` §4.F).
//!
//! Grounded in the teacher's `omap.rs`, rebuilt on the generic descent
//! engine in `btree::descent` instead of the teacher's bespoke
//! `btree_lookup`/`btree_scan` pair. The object map is the one tree whose
//! own internal branch nodes are addressed by *physical block number*
//! rather than oid (`spec.md` §4.F step 3) — it terminates the indirection
//! that every other tree relies on it for. That asymmetry is modeled here
//! with `btree::DirectResolver` rather than a boolean flag, so a caller
//! cannot accidentally wire an object map's own descent through itself.

use std::sync::Arc;

use crate::block::{BlockCache, BlockSource};
use crate::btree::{BTreeNode, DirectResolver, TreeAccess};
use crate::cache::NodeCache;
use crate::decode;
use crate::error::{ApfsError, Result};
use crate::object::{ObjectHeader, OBJECT_TYPE_OMAP};

const OMAP_KEY_SIZE: u32 = 16;
const OMAP_VAL_SIZE: u32 = 16;
const OMAP_PHYS_HEADER_SIZE: usize = 20; // om_flags, om_snap_count, om_tree_type, om_snapshot_tree_type, om_tree_oid is 8 more

/// Resolved object-map entry.
#[derive(Debug, Clone, Copy)]
pub struct OmapEntry {
    pub flags: u32,
    pub size: u32,
    pub paddr: u64,
}

/// The `omap_phys_t` header: its one field this crate needs is the B-tree
/// root's physical block number.
pub struct ObjectMap {
    pub tree_root_block: u64,
}

impl ObjectMap {
    /// Parse the object map structure itself, found at the container
    /// superblock's `nx_omap_oid` (which, notably, is *also* a direct
    /// physical block number — the container's own object map is not
    /// itself indirected).
    pub fn parse(block: &[u8]) -> Result<Self> {
        let header = ObjectHeader::parse(block)?;
        header.validate(&[OBJECT_TYPE_OMAP], "object map")?;

        let body_start = ObjectHeader::SIZE;
        decode::require_len(&block[body_start..], OMAP_PHYS_HEADER_SIZE + 8, "omap body")?;
        let tree_root_block = decode::u64_at(block, body_start + OMAP_PHYS_HEADER_SIZE, "om_tree_oid")?;

        Ok(ObjectMap { tree_root_block })
    }

    /// Look up the most recent mapping for `oid` — the entry with the
    /// greatest `xid` among those present (`spec.md` §4.F step 2: the
    /// object map stores one entry per `(oid, xid)` snapshot generation,
    /// and an unqualified lookup wants the live one). Absence is `Ok(None)`.
    pub fn lookup<S: BlockSource>(
        &self,
        source: &S,
        block_cache: &BlockCache,
        node_cache: &NodeCache,
        oid: u64,
        verify_checksums: bool,
    ) -> Result<Option<OmapEntry>> {
        let access = self.access(source, block_cache, node_cache, verify_checksums);

        // Keys are ordered (oid, xid) ascending, so the entry with the
        // largest xid for this oid is the last one in the oid's run.
        // `find` with an oid-only comparator lands on a match if one
        // exists; scan forward from there to the run's end.
        let cmp = |needle: &u64, candidate: &[u8]| -> std::cmp::Ordering {
            let candidate_oid = u64::from_le_bytes(candidate[0..8].try_into().unwrap());
            needle.cmp(&candidate_oid)
        };

        let mut cursor = match access.find(self.tree_root_block, &oid, cmp)? {
            Some(c) => c,
            None => return Ok(None),
        };

        loop {
            let key = cursor.key(OMAP_KEY_SIZE)?;
            let key_oid = decode::u64_at(key, 0, "omap key oid")?;
            if key_oid != oid {
                break;
            }
            match access.next(&cursor, self.tree_root_block)? {
                Some(next) => {
                    let next_key = next.key(OMAP_KEY_SIZE)?;
                    let next_oid = decode::u64_at(next_key, 0, "omap key oid")?;
                    if next_oid != oid {
                        break;
                    }
                    cursor = next;
                }
                None => break,
            }
        }

        let value = cursor.value(OMAP_VAL_SIZE)?;
        Ok(Some(parse_omap_value(value)?))
    }

    /// Resolve `oid` directly to its physical block address, the common
    /// case callers outside this module actually want.
    pub fn resolve<S: BlockSource>(
        &self,
        source: &S,
        block_cache: &BlockCache,
        node_cache: &NodeCache,
        oid: u64,
        verify_checksums: bool,
    ) -> Result<u64> {
        match self.lookup(source, block_cache, node_cache, oid, verify_checksums)? {
            Some(entry) => Ok(entry.paddr),
            None => Err(ApfsError::corrupt("omap lookup", format!("oid {oid} not found"))),
        }
    }

    fn access<'a, S: BlockSource>(
        &self,
        source: &'a S,
        block_cache: &'a BlockCache,
        node_cache: &'a NodeCache,
        verify_checksums: bool,
    ) -> TreeAccess<'a, S, DirectResolver> {
        TreeAccess {
            source,
            block_cache,
            node_cache,
            resolver: DirectResolver,
            subtype: OBJECT_TYPE_OMAP,
            lenient: false,
            verify_checksums,
            fallback_key_size: OMAP_KEY_SIZE,
            fallback_value_size: OMAP_VAL_SIZE,
        }
    }

    /// Load the root node directly — used by callers (e.g. the snapshot
    /// walker) that need full enumeration rather than point lookup.
    pub fn root_node<S: BlockSource>(
        &self,
        source: &S,
        block_cache: &BlockCache,
        node_cache: &NodeCache,
        verify_checksums: bool,
    ) -> Result<Arc<BTreeNode>> {
        self.access(source, block_cache, node_cache, verify_checksums)
            .root(self.tree_root_block)
    }
}

fn parse_omap_value(val: &[u8]) -> Result<OmapEntry> {
    decode::require_len(val, 16, "omap value")?;
    Ok(OmapEntry {
        flags: decode::u32_at(val, 0, "om_val_flags")?,
        size: decode::u32_at(val, 4, "om_val_size")?,
        paddr: decode::u64_at(val, 8, "om_val_paddr")?,
    })
}
