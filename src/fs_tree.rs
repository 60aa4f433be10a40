//! File-system (catalog) B-tree: composite keys and record values
//! (`spec.md` §4.H).
//!
//! Grounded in the teacher's `catalog.rs`, rebuilt on the generic descent
//! engine. Two things the teacher never implemented are added here because
//! `spec.md` §4.H names them explicitly: extended-attribute records
//! (`J_TYPE_XATTR`), and a full extended-field walk on inode records
//! (the teacher's `InodeVal::parse_dstream_size` stops at the first
//! `INO_EXT_TYPE_DSTREAM` field and throws the rest away).

use std::sync::Arc;

use crate::block::{BlockCache, BlockSource};
use crate::btree::{BTreeNode, ChildResolver, Cursor as TreeCursor, OmapResolver, TreeAccess};
use crate::cache::NodeCache;
use crate::decode;
use crate::error::{ApfsError, Result};
use crate::object::{ObjectHeader, OBJECT_TYPE_FS};
use crate::omap::ObjectMap;
use crate::{DirEntry, EntryKind};

// j_obj_types, the top 4 bits of a composite key's obj_id_and_type.
pub const J_TYPE_SNAP_METADATA: u8 = 1;
pub const J_TYPE_EXTENT: u8 = 2;
pub const J_TYPE_INODE: u8 = 3;
pub const J_TYPE_XATTR: u8 = 4;
pub const J_TYPE_SIBLING_LINK: u8 = 5;
pub const J_TYPE_DSTREAM_ID: u8 = 6;
pub const J_TYPE_CRYPTO_STATE: u8 = 7;
pub const J_TYPE_FILE_EXTENT: u8 = 8;
pub const J_TYPE_DIR_REC: u8 = 9;
pub const J_TYPE_DIR_STATS: u8 = 10;
pub const J_TYPE_SNAP_NAME: u8 = 11;
pub const J_TYPE_SIBLING_MAP: u8 = 12;

pub const ROOT_DIR_PARENT: u64 = 1;
pub const ROOT_DIR_RECORD: u64 = 2;

pub const INODE_DIR_TYPE: u16 = 0o040000;
pub const INODE_FILE_TYPE: u16 = 0o100000;
pub const INODE_SYMLINK_TYPE: u16 = 0o120000;

pub const DT_REG: u16 = 8;
pub const DT_DIR: u16 = 4;
pub const DT_LNK: u16 = 10;

const OBJ_ID_MASK: u64 = 0x0FFF_FFFF_FFFF_FFFF;

const INO_EXT_TYPE_SNAP_XID: u8 = 1;
const INO_EXT_TYPE_DELTA_TREE_OID: u8 = 2;
const INO_EXT_TYPE_DOCUMENT_ID: u8 = 3;
const INO_EXT_TYPE_NAME: u8 = 4;
const INO_EXT_TYPE_PREV_FSIZE: u8 = 5;
const INO_EXT_TYPE_FINDER_INFO: u8 = 6;
const INO_EXT_TYPE_DSTREAM: u8 = 8;
const INO_EXT_TYPE_DIR_STATS_KEY: u8 = 10;
const INO_EXT_TYPE_FS_UUID: u8 = 11;
const INO_EXT_TYPE_SPARSE_BYTES: u8 = 13;
const INO_EXT_TYPE_RDEV: u8 = 14;

/// Decomposed composite key: type tag plus the file-system identifier it
/// scopes to (`spec.md` §3 — top 4 bits / bottom 60 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjKey {
    pub oid: u64,
    pub obj_type: u8,
}

impl ObjKey {
    pub fn decode(key_bytes: &[u8]) -> Result<Self> {
        let obj_id_and_type = decode::u64_at(key_bytes, 0, "catalog key")?;
        Ok(ObjKey {
            oid: obj_id_and_type & OBJ_ID_MASK,
            obj_type: ((obj_id_and_type >> 60) & 0xF) as u8,
        })
    }

    /// Ordering used by the on-disk tree: oid first, then type.
    pub fn cmp(&self, other: &ObjKey) -> std::cmp::Ordering {
        self.oid.cmp(&other.oid).then(self.obj_type.cmp(&other.obj_type))
    }
}

/// One extended field decoded from an inode's or dstream's xfield blob
/// (`xf_blob_t` followed by `x_field_t[]` then packed, 8-byte-aligned
/// values). `spec.md` §4.H asks for the full walk, not just the dstream
/// size the teacher singled out.
#[derive(Debug, Clone)]
pub enum ExtendedField {
    SnapXid(u64),
    DeltaTreeOid(u64),
    DocumentId(u32),
    Name(String),
    PrevFileSize(u64),
    FinderInfo(Vec<u8>),
    Dstream(DstreamInfo),
    DirStatsKey(Vec<u8>),
    FsUuid([u8; 16]),
    SparseBytes(u64),
    Rdev(u32),
    Unknown { x_type: u8, data: Vec<u8> },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DstreamInfo {
    pub size: u64,
    pub alloced_size: u64,
    pub default_crypto_id: u64,
    pub total_bytes_written: u64,
    pub total_bytes_read: u64,
}

impl DstreamInfo {
    fn parse(data: &[u8]) -> Result<Self> {
        decode::require_len(data, 40, "j_dstream_t")?;
        Ok(DstreamInfo {
            size: decode::u64_at(data, 0, "dstream size")?,
            alloced_size: decode::u64_at(data, 8, "dstream alloced_size")?,
            default_crypto_id: decode::u64_at(data, 16, "dstream crypto_id")?,
            total_bytes_written: decode::u64_at(data, 24, "dstream bytes_written")?,
            total_bytes_read: decode::u64_at(data, 32, "dstream bytes_read")?,
        })
    }
}

fn parse_xfields(xfield_data: &[u8]) -> Result<Vec<ExtendedField>> {
    if xfield_data.len() < 4 {
        return Ok(Vec::new());
    }
    let xf_num_exts = decode::u16_at(xfield_data, 0, "xf_num_exts")? as usize;
    if xf_num_exts == 0 {
        return Ok(Vec::new());
    }

    let entries_start = 4;
    let entries_end = entries_start + xf_num_exts * 4;
    decode::require_len(xfield_data, entries_end, "x_field_t table")?;

    let mut fields = Vec::with_capacity(xf_num_exts);
    let mut data_offset = entries_end;

    for i in 0..xf_num_exts {
        let entry_off = entries_start + i * 4;
        let x_type = xfield_data[entry_off];
        let x_size = decode::u16_at(xfield_data, entry_off + 2, "x_field_t size")? as usize;

        let value_bytes = decode::bytes_at(xfield_data, data_offset, x_size, "xfield value")?;

        let field = match x_type {
            INO_EXT_TYPE_SNAP_XID => ExtendedField::SnapXid(decode::u64_at(value_bytes, 0, "xf snap_xid")?),
            INO_EXT_TYPE_DELTA_TREE_OID => {
                ExtendedField::DeltaTreeOid(decode::u64_at(value_bytes, 0, "xf delta_tree_oid")?)
            }
            INO_EXT_TYPE_DOCUMENT_ID => {
                ExtendedField::DocumentId(decode::u32_at(value_bytes, 0, "xf document_id")?)
            }
            INO_EXT_TYPE_NAME => ExtendedField::Name(decode::nul_terminated_utf8(value_bytes)),
            INO_EXT_TYPE_PREV_FSIZE => {
                ExtendedField::PrevFileSize(decode::u64_at(value_bytes, 0, "xf prev_fsize")?)
            }
            INO_EXT_TYPE_FINDER_INFO => ExtendedField::FinderInfo(value_bytes.to_vec()),
            INO_EXT_TYPE_DSTREAM => ExtendedField::Dstream(DstreamInfo::parse(value_bytes)?),
            INO_EXT_TYPE_DIR_STATS_KEY => ExtendedField::DirStatsKey(value_bytes.to_vec()),
            INO_EXT_TYPE_FS_UUID => {
                decode::require_len(value_bytes, 16, "xf fs_uuid")?;
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(&value_bytes[..16]);
                ExtendedField::FsUuid(uuid)
            }
            INO_EXT_TYPE_SPARSE_BYTES => {
                ExtendedField::SparseBytes(decode::u64_at(value_bytes, 0, "xf sparse_bytes")?)
            }
            INO_EXT_TYPE_RDEV => ExtendedField::Rdev(decode::u32_at(value_bytes, 0, "xf rdev")?),
            other => ExtendedField::Unknown {
                x_type: other,
                data: value_bytes.to_vec(),
            },
        };
        fields.push(field);

        let padded_size = (x_size + 7) & !7;
        data_offset += padded_size;
    }

    Ok(fields)
}

#[derive(Debug, Clone)]
pub struct InodeVal {
    pub parent_id: u64,
    pub private_id: u64,
    pub create_time: i64,
    pub modify_time: i64,
    pub change_time: i64,
    pub access_time: i64,
    pub internal_flags: u64,
    pub nchildren_or_nlink: i32,
    pub default_protection_class: u32,
    pub write_generation_counter: u32,
    pub bsd_flags: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub uncompressed_size: u64,
    pub xfields: Vec<ExtendedField>,
}

impl InodeVal {
    const FIXED_SIZE: usize = 92;

    pub fn parse(data: &[u8]) -> Result<Self> {
        decode::require_len(data, Self::FIXED_SIZE, "inode value")?;
        let xfields = parse_xfields(&data[Self::FIXED_SIZE..])?;

        Ok(InodeVal {
            parent_id: decode::u64_at(data, 0, "j_inode parent_id")?,
            private_id: decode::u64_at(data, 8, "j_inode private_id")?,
            create_time: decode::i64_at(data, 16, "j_inode create_time")?,
            modify_time: decode::i64_at(data, 24, "j_inode modify_time")?,
            change_time: decode::i64_at(data, 32, "j_inode change_time")?,
            access_time: decode::i64_at(data, 40, "j_inode access_time")?,
            internal_flags: decode::u64_at(data, 48, "j_inode internal_flags")?,
            nchildren_or_nlink: decode::i32_at(data, 56, "j_inode nchildren")?,
            default_protection_class: decode::u32_at(data, 60, "j_inode protection_class")?,
            write_generation_counter: decode::u32_at(data, 64, "j_inode write_gen")?,
            bsd_flags: decode::u32_at(data, 68, "j_inode bsd_flags")?,
            uid: decode::u32_at(data, 72, "j_inode uid")?,
            gid: decode::u32_at(data, 76, "j_inode gid")?,
            mode: decode::u16_at(data, 80, "j_inode mode")?,
            uncompressed_size: decode::u64_at(data, 84, "j_inode uncompressed_size")?,
            xfields,
        })
    }

    pub fn kind(&self) -> u16 {
        self.mode & 0o170000
    }

    pub fn dstream(&self) -> Option<DstreamInfo> {
        self.xfields.iter().find_map(|f| match f {
            ExtendedField::Dstream(d) => Some(*d),
            _ => None,
        })
    }

    pub fn size(&self) -> u64 {
        self.dstream().map(|d| d.size).unwrap_or(self.uncompressed_size)
    }

    pub fn nlink(&self) -> u32 {
        self.nchildren_or_nlink as u32
    }
}

#[derive(Debug, Clone)]
pub struct DrecVal {
    pub file_id: u64,
    pub date_added: i64,
    pub flags: u16,
}

impl DrecVal {
    pub fn parse(data: &[u8]) -> Result<Self> {
        decode::require_len(data, 18, "drec value")?;
        Ok(DrecVal {
            file_id: decode::u64_at(data, 0, "drec file_id")?,
            date_added: decode::i64_at(data, 8, "drec date_added")?,
            flags: decode::u16_at(data, 16, "drec flags")?,
        })
    }

    pub fn file_type(&self) -> u16 {
        self.flags & 0x000F
    }
}

/// Extended-attribute record value (`j_xattr_val_t`): either inline data or
/// a reference to a dedicated dstream. The teacher never modeled xattrs at
/// all; this is new per `spec.md` §4.H.
#[derive(Debug, Clone)]
pub enum XattrValue {
    Inline(Vec<u8>),
    Dstream { xdata_id: u64 },
}

#[derive(Debug, Clone)]
pub struct XattrRecord {
    pub name: String,
    pub value: XattrValue,
}

const XATTR_DATA_STREAM: u16 = 0x0001;

fn parse_xattr_val(data: &[u8]) -> Result<XattrValue> {
    decode::require_len(data, 4, "xattr value header")?;
    let flags = decode::u16_at(data, 0, "xattr flags")?;
    let xdata_len = decode::u16_at(data, 2, "xattr xdata_len")? as usize;
    let xdata = decode::bytes_at(data, 4, xdata_len, "xattr xdata")?;

    if flags & XATTR_DATA_STREAM != 0 {
        let xdata_id = decode::u64_at(xdata, 0, "xattr xdata_id")?;
        Ok(XattrValue::Dstream { xdata_id })
    } else {
        Ok(XattrValue::Inline(xdata.to_vec()))
    }
}

fn decode_name_keyed(key_bytes: &[u8]) -> Result<&[u8]> {
    // j_xattr_key_t and j_drec_hashed_key_t share the same 8+4+name_len
    // shape; only the interpretation of the u32 (length-only vs.
    // length+hash) differs, which callers account for separately.
    decode::require_len(key_bytes, 12, "name-keyed record")?;
    Ok(&key_bytes[8..])
}

pub fn decode_drec_name(key_bytes: &[u8]) -> Result<String> {
    let tail = decode_name_keyed(key_bytes)?;
    let name_len_and_hash = decode::u32_at(tail, 0, "drec name_len_and_hash")?;
    let name_len = (name_len_and_hash & 0x0000_03FF) as usize;
    let name_bytes = decode::bytes_at(tail, 4, name_len, "drec name")?;
    Ok(decode::nul_terminated_utf8(name_bytes))
}

pub fn decode_xattr_name(key_bytes: &[u8]) -> Result<String> {
    let tail = decode_name_keyed(key_bytes)?;
    let name_len = decode::u16_at(tail, 0, "xattr name_len")? as usize;
    let name_bytes = decode::bytes_at(tail, 2, name_len, "xattr name")?;
    Ok(decode::nul_terminated_utf8(name_bytes))
}

#[derive(Debug, Clone)]
pub struct FileExtentVal {
    pub flags_and_length: u64,
    pub phys_block_num: u64,
    pub crypto_id: u64,
}

impl FileExtentVal {
    pub fn parse(data: &[u8]) -> Result<Self> {
        decode::require_len(data, 24, "file extent value")?;
        Ok(FileExtentVal {
            flags_and_length: decode::u64_at(data, 0, "extent flags_and_length")?,
            phys_block_num: decode::u64_at(data, 8, "extent phys_block_num")?,
            crypto_id: decode::u64_at(data, 16, "extent crypto_id")?,
        })
    }

    pub fn length(&self) -> u64 {
        self.flags_and_length & 0x00FF_FFFF_FFFF_FFFF
    }
}

/// Handle to the file-system (catalog) B-tree for one volume, bound to its
/// object map for node resolution.
pub struct FsTree<'a, S: BlockSource> {
    source: &'a S,
    block_cache: &'a BlockCache,
    node_cache: &'a NodeCache,
    omap: &'a ObjectMap,
    omap_node_cache: &'a NodeCache,
    root_block: u64,
    lenient: bool,
    verify_checksums: bool,
    use_case_folding: bool,
    max_path_depth: usize,
}

impl<'a, S: BlockSource> FsTree<'a, S> {
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
        use_case_folding: bool,
        max_path_depth: usize,
    ) -> Self {
        FsTree {
            source,
            block_cache,
            node_cache,
            omap,
            omap_node_cache,
            root_block,
            lenient,
            verify_checksums,
            use_case_folding,
            max_path_depth,
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
            subtype: OBJECT_TYPE_FS,
            lenient: self.lenient,
            verify_checksums: self.verify_checksums,
            fallback_key_size: 0,
            fallback_value_size: 0,
        }
    }

    /// Directory entries for `parent_oid`: a prefix scan over
    /// `(parent_oid, J_TYPE_DIR_REC, *)` entries, each cross-referenced
    /// against its inode for size and timestamps.
    pub fn directory_entries(&self, parent_oid: u64) -> Result<Vec<DirEntry>> {
        let access = self.access();
        let mut cursor = match self.seek_prefix(parent_oid, J_TYPE_DIR_REC)? {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        loop {
            let key = cursor.key(0)?;
            let obj_key = ObjKey::decode(key)?;
            if obj_key.oid != parent_oid || obj_key.obj_type != J_TYPE_DIR_REC {
                break;
            }

            let name = decode_drec_name(key)?;
            let drec = DrecVal::parse(cursor.value(0)?)?;
            let kind = match drec.file_type() {
                DT_DIR => EntryKind::Directory,
                DT_LNK => EntryKind::Symlink,
                _ => EntryKind::File,
            };

            let (size, create_time, modify_time) = match self.lookup_inode(drec.file_id) {
                Ok(inode) => (inode.size(), inode.create_time, inode.modify_time),
                Err(_) => (0, 0, 0),
            };

            out.push(DirEntry {
                name,
                oid: drec.file_id,
                kind,
                size,
                create_time,
                modify_time,
            });

            match access.next(&cursor, self.root_block)? {
                Some(next) => cursor = next,
                None => break,
            }
        }

        Ok(out)
    }

    /// A single named directory record under `parent_oid`. Comparison
    /// folds Unicode normalization and (when `use_case_folding` is set on
    /// this tree — `spec.md` §6, inherited from the volume's
    /// incompatible-features bitfield) case, matching the way the on-disk
    /// name hash itself is computed (`spec.md` §4.E).
    pub fn directory_record(&self, parent_oid: u64, name: &str) -> Result<Option<DrecVal>> {
        let target = crate::name_hash::normalize(name, self.use_case_folding);
        for entry in self.directory_entries_raw(parent_oid)? {
            let candidate = crate::name_hash::normalize(&entry.0, self.use_case_folding);
            if candidate == target {
                return Ok(Some(entry.1));
            }
        }
        Ok(None)
    }

    fn directory_entries_raw(&self, parent_oid: u64) -> Result<Vec<(String, DrecVal)>> {
        let access = self.access();
        let mut cursor = match self.seek_prefix(parent_oid, J_TYPE_DIR_REC)? {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::new();
        loop {
            let key = cursor.key(0)?;
            let obj_key = ObjKey::decode(key)?;
            if obj_key.oid != parent_oid || obj_key.obj_type != J_TYPE_DIR_REC {
                break;
            }
            let name = decode_drec_name(key)?;
            let drec = DrecVal::parse(cursor.value(0)?)?;
            out.push((name, drec));
            match access.next(&cursor, self.root_block)? {
                Some(next) => cursor = next,
                None => break,
            }
        }
        Ok(out)
    }

    pub fn lookup_inode(&self, oid: u64) -> Result<InodeVal> {
        let access = self.access();
        let cmp = |needle: &ObjKey, candidate: &[u8]| -> std::cmp::Ordering {
            let candidate_key = ObjKey::decode(candidate).unwrap_or(ObjKey { oid: 0, obj_type: 0 });
            needle.cmp(&candidate_key)
        };
        let target = ObjKey { oid, obj_type: J_TYPE_INODE };
        match access.find(self.root_block, &target, cmp)? {
            Some(cursor) => InodeVal::parse(cursor.value(0)?),
            None => Err(ApfsError::FileNotFound(format!("inode oid {oid}"))),
        }
    }

    /// Extended attributes on `oid`: a prefix scan over
    /// `(oid, J_TYPE_XATTR, *)`.
    pub fn extended_attributes(&self, oid: u64) -> Result<Vec<XattrRecord>> {
        let access = self.access();
        let mut cursor = match self.seek_prefix(oid, J_TYPE_XATTR)? {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        loop {
            let key = cursor.key(0)?;
            let obj_key = ObjKey::decode(key)?;
            if obj_key.oid != oid || obj_key.obj_type != J_TYPE_XATTR {
                break;
            }
            let name = decode_xattr_name(key)?;
            let value = parse_xattr_val(cursor.value(0)?)?;
            out.push(XattrRecord { name, value });

            match access.next(&cursor, self.root_block)? {
                Some(next) => cursor = next,
                None => break,
            }
        }
        Ok(out)
    }

    /// File extents for `file_oid` (a dstream's private id), in logical
    /// offset order.
    pub fn file_extents(&self, file_oid: u64) -> Result<Vec<FileExtentVal>> {
        let access = self.access();
        let mut cursor = match self.seek_prefix(file_oid, J_TYPE_FILE_EXTENT)? {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        loop {
            let key = cursor.key(0)?;
            let obj_key = ObjKey::decode(key)?;
            if obj_key.oid != file_oid || obj_key.obj_type != J_TYPE_FILE_EXTENT {
                break;
            }
            out.push(FileExtentVal::parse(cursor.value(0)?)?);

            match access.next(&cursor, self.root_block)? {
                Some(next) => cursor = next,
                None => break,
            }
        }
        Ok(out)
    }

    /// Position a cursor at the first entry of `(oid, obj_type)` — the
    /// prefix-scan entry point shared by every per-oid range query above.
    /// drec/xattr/extent records all carry trailing name/offset bytes past
    /// the 8-byte `(oid, obj_type)` prefix, and several such records share
    /// the same prefix (every file under one directory, every extent of
    /// one file). `TreeAccess::find`'s binary search is biased to the
    /// *rightmost* entry comparing equal under `cmp` (`spec.md` §4.G step
    /// 2's "rightmost-not-greater" branch rule), which for a bare-prefix
    /// comparator lands on the last record of the run, not the first —
    /// wrong for a forward scan starting here. `first_at_or_after`'s
    /// lower-bound search doesn't have that bias, so it is used
    /// unconditionally rather than as a fallback after a `find` attempt.
    fn seek_prefix(&self, oid: u64, obj_type: u8) -> Result<Option<TreeCursor>> {
        self.first_at_or_after(&ObjKey { oid, obj_type })
    }

    /// Like `btree::descent::TreeAccess::first_after`, this cannot commit
    /// to one child per level: the branch entry whose range contains
    /// `target` can dead-end at its own rightmost leaf without reaching an
    /// entry `>= target`, in which case the answer is the next sibling
    /// subtree up at some ancestor. A stack of `(ancestor node, child index
    /// taken)` lets the walk retreat to the nearest ancestor with an
    /// unvisited right sibling instead of silently dropping every entry
    /// past the dead end.
    fn first_at_or_after(&self, target: &ObjKey) -> Result<Option<TreeCursor>> {
        let access = self.access();
        let mut node = access.root(self.root_block)?;
        let mut block_number = self.root_block;
        let mut depth = 0usize;
        let mut ancestors: Vec<(Arc<BTreeNode>, usize)> = Vec::new();

        loop {
            if depth >= crate::config::MAX_BTREE_DEPTH {
                return Err(ApfsError::DepthExceeded { max: crate::config::MAX_BTREE_DEPTH });
            }
            let n = node.nkeys();
            if n == 0 {
                return Ok(None);
            }

            let mut lo = 0usize;
            let mut hi = n;
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                let mid_key = ObjKey::decode(node.key(mid, 0)?)?;
                if mid_key.cmp(target) == std::cmp::Ordering::Less {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }

            if node.is_leaf() {
                if lo < n {
                    return Ok(Some(TreeCursor {
                        block_number,
                        index: lo,
                        node: node.clone(),
                    }));
                }
                return self.retreat_to_next_subtree(&access, &mut ancestors);
            }

            // Branch key[i] is the smallest key in child i's subtree: the
            // child that can hold `target` is the rightmost one whose key
            // is `<= target`, i.e. `lo - 1`, not `lo` (the first key
            // strictly greater, already one subtree past the right one).
            let idx = if lo == 0 { 0 } else { lo - 1 };
            ancestors.push((node.clone(), idx));
            let child = access.child(&node, idx)?;
            block_number = node.child_oid(idx).and_then(|v| access.resolver.resolve(v))?;
            node = child;
            depth += 1;
        }
    }

    fn retreat_to_next_subtree<R: ChildResolver>(
        &self,
        access: &TreeAccess<'_, S, R>,
        ancestors: &mut Vec<(Arc<BTreeNode>, usize)>,
    ) -> Result<Option<TreeCursor>> {
        while let Some((node, idx)) = ancestors.pop() {
            let n = node.nkeys();
            if idx + 1 < n {
                let next_block = node.child_oid(idx + 1).and_then(|v| access.resolver.resolve(v))?;
                return Self::first_leaf_from(access, next_block);
            }
        }
        Ok(None)
    }

    fn first_leaf_from<R: ChildResolver>(access: &TreeAccess<'_, S, R>, root_block: u64) -> Result<Option<TreeCursor>> {
        let mut block_number = root_block;
        let mut depth = 0usize;
        loop {
            if depth >= crate::config::MAX_BTREE_DEPTH {
                return Err(ApfsError::DepthExceeded { max: crate::config::MAX_BTREE_DEPTH });
            }
            let node = access.root(block_number)?;
            if node.is_leaf() {
                return Ok(if node.nkeys() == 0 {
                    None
                } else {
                    Some(TreeCursor {
                        block_number,
                        index: 0,
                        node,
                    })
                });
            }
            if node.nkeys() == 0 {
                return Ok(None);
            }
            block_number = node.child_oid(0).and_then(|v| access.resolver.resolve(v))?;
            depth += 1;
        }
    }

    /// Resolve `/a/b/c` to `(oid, InodeVal)`, starting from the volume
    /// root. Component-by-component, as the teacher does, but against the
    /// new directory-record lookup.
    pub fn resolve_path(&self, path: &str) -> Result<(u64, InodeVal)> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            let inode = self.lookup_inode(ROOT_DIR_RECORD)?;
            return Ok((ROOT_DIR_RECORD, inode));
        }

        let components: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if components.len() > self.max_path_depth {
            return Err(ApfsError::DepthExceeded { max: self.max_path_depth });
        }
        let mut current_parent = ROOT_DIR_RECORD;

        for (i, component) in components.iter().enumerate() {
            let drec = self
                .directory_record(current_parent, component)?
                .ok_or_else(|| ApfsError::FileNotFound(components[..=i].join("/")))?;

            if i == components.len() - 1 {
                let inode = self.lookup_inode(drec.file_id)?;
                return Ok((drec.file_id, inode));
            }

            if drec.file_type() != DT_DIR {
                return Err(ApfsError::NotADirectory(components[..=i].join("/")));
            }
            current_parent = drec.file_id;
        }

        unreachable!("non-empty component list always returns from the loop")
    }

    pub fn root_node(&self) -> Result<Arc<BTreeNode>> {
        self.access().root(self.root_block)
    }
}

/// Validate that a block is a file-system (catalog) object-header-bearing
/// root, used before handing its root block number to [`FsTree::new`].
pub fn validate_fs_root(block: &[u8]) -> Result<()> {
    let header = ObjectHeader::parse(block)?;
    header.validate(&[crate::object::OBJECT_TYPE_BTREE], "file-system tree root")
}
