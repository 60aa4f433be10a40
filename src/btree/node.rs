//! B-tree node header, footer, and entry-table decode (`spec.md` §4.D).
//!
//! Grounded in the teacher's `btree::BTreeNode`/`BTreeNodeHeader`/
//! `BTreeInfo`, with one correctness fix: the teacher's node-header parser
//! reads thirteen fields into a struct it declares as 24 bytes wide (it is
//! actually 28 once every field is read), which silently misaligns every
//! offset that follows on real on-disk nodes. `spec.md` §3's
//! `BTreeNodeHeader` — `flags, level, nkeys, entries_off, entries_size,
//! unused_off, unused_size, key_freelist, value_freelist` — is the correct,
//! 24-byte layout (it matches the real `btree_node_phys_t` header used by
//! every other structurally-independent reimplementation in the retrieval
//! pack); this module implements that layout instead of the teacher's.

use crate::decode;
use crate::error::{ApfsError, Result};
use crate::object::{ObjectHeader, OBJECT_TYPE_BTREE, OBJECT_TYPE_BTREE_NODE};

pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;

pub const BTREE_NODE_HEADER_SIZE: usize = 24;
pub const BTREE_FOOTER_SIZE: usize = 40;

/// B-tree node header, 24 bytes immediately after the object header.
#[derive(Debug, Clone, Copy)]
pub struct BTreeNodeHeader {
    pub flags: u16,
    pub level: u16,
    pub nkeys: u32,
    pub entries_off: u16,
    pub entries_size: u16,
    pub unused_off: u16,
    pub unused_size: u16,
    pub key_freelist: (u16, u16),
    pub value_freelist: (u16, u16),
}

impl BTreeNodeHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        decode::require_len(data, BTREE_NODE_HEADER_SIZE, "btree node header")?;
        Ok(BTreeNodeHeader {
            flags: decode::u16_at(data, 0, "btn_flags")?,
            level: decode::u16_at(data, 2, "btn_level")?,
            nkeys: decode::u32_at(data, 4, "btn_nkeys")?,
            entries_off: decode::u16_at(data, 8, "btn_entries_off")?,
            entries_size: decode::u16_at(data, 10, "btn_entries_size")?,
            unused_off: decode::u16_at(data, 12, "btn_unused_off")?,
            unused_size: decode::u16_at(data, 14, "btn_unused_size")?,
            key_freelist: (
                decode::u16_at(data, 16, "btn_key_freelist_off")?,
                decode::u16_at(data, 18, "btn_key_freelist_len")?,
            ),
            value_freelist: (
                decode::u16_at(data, 20, "btn_val_freelist_off")?,
                decode::u16_at(data, 22, "btn_val_freelist_len")?,
            ),
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.flags & BTNODE_LEAF != 0
    }

    pub fn is_root(&self) -> bool {
        self.flags & BTNODE_ROOT != 0
    }

    pub fn has_footer(&self) -> bool {
        self.is_root()
    }

    pub fn is_fixed_kv(&self) -> bool {
        self.flags & BTNODE_FIXED_KV_SIZE != 0
    }
}

/// Present only in root nodes — the last 40 bytes of the block.
#[derive(Debug, Clone, Copy)]
pub struct BTreeFooter {
    pub flags: u32,
    pub node_size: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_key_size: u32,
    pub max_value_size: u32,
    pub total_keys: u64,
    pub total_nodes: u64,
}

impl BTreeFooter {
    pub fn parse(data: &[u8]) -> Result<Self> {
        decode::require_len(data, BTREE_FOOTER_SIZE, "btree footer")?;
        Ok(BTreeFooter {
            flags: decode::u32_at(data, 0, "bt_flags")?,
            node_size: decode::u32_at(data, 4, "bt_node_size")?,
            key_size: decode::u32_at(data, 8, "bt_key_size")?,
            value_size: decode::u32_at(data, 12, "bt_value_size")?,
            max_key_size: decode::u32_at(data, 16, "bt_max_key_size")?,
            max_value_size: decode::u32_at(data, 20, "bt_max_value_size")?,
            total_keys: decode::u64_at(data, 24, "bt_total_keys")?,
            total_nodes: decode::u64_at(data, 32, "bt_total_nodes")?,
        })
    }

    /// `key_size > 0` (and `value_size > 0`) marks a fixed-size-entry tree;
    /// both zero marks variable-size entries (`spec.md` §3).
    pub fn is_fixed_size_tree(&self) -> bool {
        self.key_size > 0 && self.value_size > 0
    }
}

/// One slot in the node's entry table, normalized across the fixed- and
/// variable-size layouts (`key_len`/`val_len` are `None` for fixed-size
/// entries — their length comes from the tree-wide fixed sizes instead).
#[derive(Debug, Clone, Copy)]
pub struct TocEntry {
    pub key_off: u16,
    pub key_len: Option<u16>,
    pub val_off: u16,
    pub val_len: Option<u16>,
}

/// A decoded B-tree node: header, optional footer, and the byte ranges of
/// every (key, value) entry. Entries are *not* copied here — `BTreeNode`
/// borrows nothing and holds its own block, but key/value retrieval still
/// happens through bounds-checked accessors rather than eagerly copying
/// every entry on decode, matching the teacher's lazy `key()`/`value()`.
pub struct BTreeNode {
    pub object_header: ObjectHeader,
    pub header: BTreeNodeHeader,
    pub footer: Option<BTreeFooter>,
    pub toc: Vec<TocEntry>,
    block: Vec<u8>,
    key_area_off: usize,
    val_area_end: usize,
}

impl BTreeNode {
    /// Decode a node from a raw block, validating the object header against
    /// `(expected_type, expected_subtype)` — root nodes carry
    /// `OBJECT_TYPE_BTREE`, non-root nodes carry `OBJECT_TYPE_BTREE_NODE`
    /// (`spec.md` §4.D step 1), and the subtype identifies which tree this
    /// is meant to belong to (object map, file-system tree, snapshot tree).
    pub fn parse(block: &[u8], expected_subtype: u32, lenient: bool, verify_checksums: bool) -> Result<Self> {
        let object_header = ObjectHeader::parse(block)?;
        object_header.validate(&[OBJECT_TYPE_BTREE, OBJECT_TYPE_BTREE_NODE], "btree node")?;
        object_header.validate_subtype(expected_subtype, "btree node subtype")?;
        crate::superblock::verify_checksum(block, &object_header, verify_checksums)?;

        let header_start = ObjectHeader::SIZE;
        let header_data = decode::bytes_at(
            block,
            header_start,
            BTREE_NODE_HEADER_SIZE,
            "btree node header",
        )?;
        let header = BTreeNodeHeader::parse(header_data)?;

        // The object header's type and the node header's own root flag must
        // agree (`spec.md` §4.D step 1): root nodes carry OBJECT_TYPE_BTREE,
        // non-root nodes carry OBJECT_TYPE_BTREE_NODE. Checking the object
        // header against the pair of allowed types above doesn't by itself
        // rule out a root-flagged node claiming OBJECT_TYPE_BTREE_NODE or
        // vice versa.
        let expected_type = if header.is_root() {
            OBJECT_TYPE_BTREE
        } else {
            OBJECT_TYPE_BTREE_NODE
        };
        if object_header.object_type() != expected_type {
            return Err(ApfsError::InvalidObjectType {
                context: "btree node root flag vs object type",
                expected: expected_type,
                got: object_header.object_type(),
            });
        }

        let footer = if header.has_footer() {
            if block.len() < BTREE_FOOTER_SIZE {
                return Err(ApfsError::corrupt("btree footer", "block shorter than footer"));
            }
            Some(BTreeFooter::parse(&block[block.len() - BTREE_FOOTER_SIZE..])?)
        } else {
            None
        };

        let val_area_end = if footer.is_some() {
            block.len() - BTREE_FOOTER_SIZE
        } else {
            block.len()
        };

        let toc_start = header_start + BTREE_NODE_HEADER_SIZE + header.entries_off as usize;
        let toc_end = toc_start + header.entries_size as usize;
        if toc_end > val_area_end {
            return Err(ApfsError::corrupt(
                "btree entries table",
                format!("table [{toc_start}..{toc_end}) exceeds value area end {val_area_end}"),
            ));
        }

        let fixed_kv = header.is_fixed_kv();
        let stride = if fixed_kv { 4 } else { 8 };
        let needed = header.nkeys as usize * stride;
        if needed > header.entries_size as usize {
            return Err(ApfsError::corrupt(
                "btree entries table",
                format!(
                    "nkeys({}) * stride({}) = {} exceeds entries_size {}",
                    header.nkeys, stride, needed, header.entries_size
                ),
            ));
        }

        if !lenient {
            // The C source has this check commented out at one call site
            // ("fails on some container"); kept on by default per `spec.md`
            // §9, relaxable only when the caller opts into lenient mode.
            let claimed_end = header.unused_off as usize + header.unused_size as usize;
            let node_payload_len = val_area_end.saturating_sub(header_start + BTREE_NODE_HEADER_SIZE);
            if claimed_end > node_payload_len {
                return Err(ApfsError::corrupt(
                    "btree node header",
                    format!("unused region end {claimed_end} exceeds node payload {node_payload_len}"),
                ));
            }
        }

        let toc_bytes = &block[toc_start..toc_end];
        let mut toc = Vec::with_capacity(header.nkeys as usize);
        for i in 0..header.nkeys as usize {
            let entry = if fixed_kv {
                let base = i * 4;
                let key_off = decode::u16_at(toc_bytes, base, "toc key_off")?;
                let val_off = decode::u16_at(toc_bytes, base + 2, "toc val_off")?;
                TocEntry {
                    key_off,
                    key_len: None,
                    val_off,
                    val_len: None,
                }
            } else {
                let base = i * 8;
                let key_off = decode::u16_at(toc_bytes, base, "toc key_off")?;
                let key_len = decode::u16_at(toc_bytes, base + 2, "toc key_len")?;
                let val_off = decode::u16_at(toc_bytes, base + 4, "toc val_off")?;
                let val_len = decode::u16_at(toc_bytes, base + 6, "toc val_len")?;
                TocEntry {
                    key_off,
                    key_len: Some(key_len),
                    val_off,
                    val_len: Some(val_len),
                }
            };
            toc.push(entry);
        }

        let key_area_off = toc_end;

        Ok(BTreeNode {
            object_header,
            header,
            footer,
            toc,
            block: block.to_vec(),
            key_area_off,
            val_area_end,
        })
    }

    pub fn nkeys(&self) -> usize {
        self.header.nkeys as usize
    }

    pub fn is_leaf(&self) -> bool {
        self.header.is_leaf()
    }

    pub fn level(&self) -> u16 {
        self.header.level
    }

    /// Key bytes for entry `index`. `fixed_key_size` is the tree-wide fixed
    /// key size (from the root's footer), used only when this node uses
    /// fixed-size entries.
    pub fn key(&self, index: usize, fixed_key_size: u32) -> Result<&[u8]> {
        let entry = self
            .toc
            .get(index)
            .ok_or_else(|| ApfsError::corrupt("btree key", format!("index {index} out of range")))?;
        let len = entry.key_len.map(|l| l as usize).unwrap_or(fixed_key_size as usize);
        let start = self.key_area_off + entry.key_off as usize;
        self.bounded_key_slice(start, len)
    }

    /// Value bytes for entry `index`. For branch (non-leaf) nodes the value
    /// is always an 8-byte child object id, overriding any fixed/footer
    /// size (`spec.md` §4.D step 6) — this is the hard contract documented
    /// in `spec.md` §9.
    pub fn value(&self, index: usize, fixed_value_size: u32) -> Result<&[u8]> {
        let entry = self
            .toc
            .get(index)
            .ok_or_else(|| ApfsError::corrupt("btree value", format!("index {index} out of range")))?;
        let len = if !self.is_leaf() {
            8
        } else {
            entry.val_len.map(|l| l as usize).unwrap_or(fixed_value_size as usize)
        };
        let start = self
            .val_area_end
            .checked_sub(entry.val_off as usize)
            .ok_or_else(|| ApfsError::corrupt("btree value", "val_off exceeds value area end"))?;
        self.bounded_value_slice(start, len)
    }

    pub fn child_oid(&self, index: usize) -> Result<u64> {
        let val = self.value(index, 8)?;
        decode::u64_at(val, 0, "child oid")
    }

    fn bounded_key_slice(&self, start: usize, len: usize) -> Result<&[u8]> {
        let end = start.checked_add(len).ok_or_else(|| ApfsError::corrupt("btree key", "overflow"))?;
        if start < self.key_area_off || end > self.val_area_end || end > self.block.len() {
            return Err(ApfsError::corrupt(
                "btree key",
                format!("[{start}..{end}) outside key heap [{}..{})", self.key_area_off, self.val_area_end),
            ));
        }
        Ok(&self.block[start..end])
    }

    fn bounded_value_slice(&self, start: usize, len: usize) -> Result<&[u8]> {
        let end = start.checked_add(len).ok_or_else(|| ApfsError::corrupt("btree value", "overflow"))?;
        if start < self.key_area_off || end > self.val_area_end || end > self.block.len() {
            return Err(ApfsError::corrupt(
                "btree value",
                format!("[{start}..{end}) outside value heap [{}..{})", self.key_area_off, self.val_area_end),
            ));
        }
        Ok(&self.block[start..end])
    }

    /// Tree-wide fixed key/value sizes, preferring the root footer when
    /// present and falling back to caller-supplied sizes for non-root
    /// nodes (which carry no footer of their own).
    pub fn fixed_sizes(&self, fallback_key: u32, fallback_val: u32) -> (u32, u32) {
        match &self.footer {
            Some(footer) if footer.is_fixed_size_tree() => (footer.key_size, footer.value_size),
            _ => (fallback_key, fallback_val),
        }
    }
}
