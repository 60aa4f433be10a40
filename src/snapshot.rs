//! Snapshot metadata B-tree (`spec.md` §4.I).
//!
//! Same node format as the file-system tree (variable-size entries,
//! composite keys), but a single key namespace: every key in this tree has
//! `data_type = J_TYPE_SNAP_METADATA`. Grounded in
//! `original_source/libfsapfs/libfsapfs_snapshot_metadata_tree.c` for the
//! record shape, and built on the same `btree::descent` engine `fs_tree`
//! uses rather than a bespoke traversal — the only thing distinguishing this
//! tree from the file-system tree is its object-header subtype and its
//! single-purpose value decoder.

use crate::block::{BlockCache, BlockSource};
use crate::cache::NodeCache;
use crate::decode;
use crate::error::{ApfsError, Result};
use crate::fs_tree::{ObjKey, J_TYPE_SNAP_METADATA};
use crate::object::{ObjectHeader, OBJECT_TYPE_SNAPSHOT_META_TREE};
use crate::omap::ObjectMap;
use crate::btree::{OmapResolver, TreeAccess};

/// One entry of the snapshot metadata tree (`j_snap_metadata_val_t`).
#[derive(Debug, Clone)]
pub struct SnapshotMetadata {
    pub oid: u64,
    pub xid: u64,
    pub extent_ref_tree_oid: u64,
    pub btree_oid: u64,
    pub create_time: i64,
    pub change_time: i64,
    pub inode_number: u64,
    pub flags: u32,
    pub name: String,
}

impl SnapshotMetadata {
    /// Fixed prefix before the name: xid, extentref_tree_oid, btree_oid,
    /// create_time, change_time, inode_number, flags, name_len.
    const FIXED_SIZE: usize = 8 + 8 + 8 + 8 + 8 + 8 + 4 + 2;

    fn parse(oid: u64, data: &[u8]) -> Result<Self> {
        decode::require_len(data, Self::FIXED_SIZE, "snapshot metadata value")?;
        let xid = decode::u64_at(data, 0, "snap xid")?;
        let extent_ref_tree_oid = decode::u64_at(data, 8, "snap extentref_tree_oid")?;
        let btree_oid = decode::u64_at(data, 16, "snap btree_oid")?;
        let create_time = decode::i64_at(data, 24, "snap create_time")?;
        let change_time = decode::i64_at(data, 32, "snap change_time")?;
        let inode_number = decode::u64_at(data, 40, "snap inum")?;
        let flags = decode::u32_at(data, 48, "snap flags")?;
        let name_len = decode::u16_at(data, 52, "snap name_len")? as usize;
        let name_bytes = decode::bytes_at(data, Self::FIXED_SIZE, name_len, "snap name")?;
        let name = String::from_utf8_lossy(name_bytes).into_owned();

        Ok(SnapshotMetadata {
            oid,
            xid,
            extent_ref_tree_oid,
            btree_oid,
            create_time,
            change_time,
            inode_number,
            flags,
            name,
        })
    }
}

pub struct SnapshotTree<'a, S: BlockSource> {
    source: &'a S,
    block_cache: &'a BlockCache,
    node_cache: &'a NodeCache,
    omap: &'a ObjectMap,
    omap_node_cache: &'a NodeCache,
    root_block: u64,
    lenient: bool,
    verify_checksums: bool,
}

impl<'a, S: BlockSource> SnapshotTree<'a, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: &'a S,
        block_cache: &'a BlockCache,
        node_cache: &'a NodeCache,
        omap: &'a ObjectMap,
        omap_node_cache: &'a NodeCache,
        root_block: u64,
        lenient: bool,
        verify_checksums: bool,
    ) -> Self {
        SnapshotTree {
            source,
            block_cache,
            node_cache,
            omap,
            omap_node_cache,
            root_block,
            lenient,
            verify_checksums,
        }
    }

    fn access(&self) -> TreeAccess<'_, S, OmapResolver<'_, impl Fn(u64) -> Result<u64> + '_>> {
        let verify_checksums = self.verify_checksums;
        TreeAccess {
            source: self.source,
            block_cache: self.block_cache,
            node_cache: self.node_cache,
            resolver: OmapResolver {
                lookup: move |oid: u64| {
                    self.omap.resolve(
                        self.source,
                        self.block_cache,
                        self.omap_node_cache,
                        oid,
                        verify_checksums,
                    )
                },
                _marker: std::marker::PhantomData,
            },
            subtype: OBJECT_TYPE_SNAPSHOT_META_TREE,
            lenient: self.lenient,
            verify_checksums: self.verify_checksums,
            fallback_key_size: 0,
            fallback_value_size: 0,
        }
    }

    /// Full in-order traversal of every snapshot descriptor (`spec.md`
    /// §4.I `list()`).
    pub fn list(&self) -> Result<Vec<SnapshotMetadata>> {
        let access = self.access();
        let mut out = Vec::new();

        let mut cursor = match access.first_leaf(self.root_block)? {
            Some(c) => c,
            None => return Ok(out),
        };

        loop {
            let key = cursor.key(0)?;
            let obj_key = ObjKey::decode(key)?;
            if obj_key.obj_type == J_TYPE_SNAP_METADATA {
                out.push(SnapshotMetadata::parse(obj_key.oid, cursor.value(0)?)?);
            }
            match access.next(&cursor, self.root_block)? {
                Some(next) => cursor = next,
                None => break,
            }
        }

        Ok(out)
    }

    /// Point lookup by the snapshot's own object id (`spec.md` §4.I
    /// `lookup_by_oid()`), a standard composite-key descent.
    pub fn lookup_by_oid(&self, oid: u64) -> Result<Option<SnapshotMetadata>> {
        let access = self.access();
        let target = ObjKey {
            oid,
            obj_type: J_TYPE_SNAP_METADATA,
        };
        let cmp = |needle: &ObjKey, candidate: &[u8]| -> std::cmp::Ordering {
            let candidate_key = ObjKey::decode(candidate).unwrap_or(ObjKey { oid: 0, obj_type: 0 });
            needle.cmp(&candidate_key)
        };
        match access.find(self.root_block, &target, cmp)? {
            Some(cursor) => Ok(Some(SnapshotMetadata::parse(oid, cursor.value(0)?)?)),
            None => Ok(None),
        }
    }

    pub fn root_node_header(&self) -> Result<ObjectHeader> {
        let node = self.access().root(self.root_block)?;
        Ok(node.object_header)
    }
}

/// Validate that a block is a snapshot-metadata-tree root, used before
/// handing its root block number to [`SnapshotTree::new`].
pub fn validate_snapshot_root(block: &[u8]) -> Result<()> {
    let header = ObjectHeader::parse(block)?;
    header.validate(&[crate::object::OBJECT_TYPE_BTREE], "snapshot metadata tree root")?;
    if header.subtype != OBJECT_TYPE_SNAPSHOT_META_TREE {
        return Err(ApfsError::InvalidObjectType {
            context: "snapshot metadata tree root",
            expected: OBJECT_TYPE_SNAPSHOT_META_TREE,
            got: header.subtype,
        });
    }
    Ok(())
}
