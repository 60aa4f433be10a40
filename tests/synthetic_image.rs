//! End-to-end coverage over a hand-built container image: container and
//! volume superblocks, both object maps, and a single-leaf file-system tree
//! holding a directory, a two-extent file, and a symlink with an inline
//! xattr target. Exercised entirely through the public `Container`/`Volume`
//! API rather than any internal module, so it doubles as a check that the
//! whole pipeline composes correctly end to end without needing a captured
//! device image on disk.

use std::io::Cursor;

use apfs::fs_tree::INODE_SYMLINK_TYPE;
use apfs::{ApfsError, Config, Container, EntryKind};

const BLOCK_SIZE: usize = 4096;
const FOOTER_SIZE: usize = 40;

const OBJECT_TYPE_NX_SUPERBLOCK: u32 = 0x01;
const OBJECT_TYPE_BTREE: u32 = 0x02;
const OBJECT_TYPE_BTREE_NODE: u32 = 0x03;
const OBJECT_TYPE_OMAP: u32 = 0x0B;
const OBJECT_TYPE_VOLUME_SUPERBLOCK: u32 = 0x0D;
const OBJECT_TYPE_FS: u32 = 0x0E;

const NX_MAGIC: u32 = 0x4253_584E;
const APSB_MAGIC: u32 = 0x4253_5041;
const INCOMPAT_CASE_INSENSITIVE: u64 = 1;

const BTNODE_ROOT: u16 = 0x0001;
const BTNODE_LEAF: u16 = 0x0002;
const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;

const J_TYPE_INODE: u8 = 3;
const J_TYPE_XATTR: u8 = 4;
const J_TYPE_FILE_EXTENT: u8 = 8;
const J_TYPE_DIR_REC: u8 = 9;

const DT_REG: u16 = 8;
const DT_DIR: u16 = 4;
const DT_LNK: u16 = 10;

const INODE_DIR_MODE: u16 = 0o040755;
const INODE_FILE_MODE: u16 = 0o100644;
const INODE_SYMLINK_MODE: u16 = 0o120755;

fn w16(block: &mut [u8], off: usize, v: u16) {
    block[off..off + 2].copy_from_slice(&v.to_le_bytes());
}
fn w32(block: &mut [u8], off: usize, v: u32) {
    block[off..off + 4].copy_from_slice(&v.to_le_bytes());
}
fn w64(block: &mut [u8], off: usize, v: u64) {
    block[off..off + 8].copy_from_slice(&v.to_le_bytes());
}
fn wi64(block: &mut [u8], off: usize, v: i64) {
    block[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn object_header(block: &mut [u8], oid: u64, xid: u64, obj_type: u32, subtype: u32) {
    w64(block, 8, oid);
    w64(block, 16, xid);
    w32(block, 24, obj_type);
    w32(block, 28, subtype);
}

fn name_with_nul(out: &mut Vec<u8>, name: &str) -> usize {
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    name.len() + 1
}

fn inode_fixed(parent_id: u64, private_id: u64, mode: u16, nlink: i32, uncompressed_size: u64) -> Vec<u8> {
    let mut v = vec![0u8; 92];
    w64(&mut v, 0, parent_id);
    w64(&mut v, 8, private_id);
    wi64(&mut v, 16, 1_700_000_000);
    wi64(&mut v, 24, 1_700_000_000);
    wi64(&mut v, 32, 1_700_000_000);
    wi64(&mut v, 40, 1_700_000_000);
    w64(&mut v, 48, 0);
    w32(&mut v, 56, nlink as u32);
    w32(&mut v, 60, 0);
    w32(&mut v, 64, 0);
    w32(&mut v, 68, 0);
    w32(&mut v, 72, 0);
    w32(&mut v, 76, 0);
    w16(&mut v, 80, mode);
    w64(&mut v, 84, uncompressed_size);
    v
}

/// One `xf_blob_t` holding a single `INO_EXT_TYPE_DSTREAM` field.
fn dstream_xfield(size: u64, alloced_size: u64) -> Vec<u8> {
    let mut xf = Vec::new();
    xf.extend_from_slice(&1u16.to_le_bytes()); // xf_num_exts
    xf.extend_from_slice(&0u16.to_le_bytes()); // xf_used_data
    xf.push(8); // x_type: INO_EXT_TYPE_DSTREAM
    xf.push(0); // x_field flags, unused by the reader
    xf.extend_from_slice(&40u16.to_le_bytes()); // x_size
    let mut d = vec![0u8; 40];
    w64(&mut d, 0, size);
    w64(&mut d, 8, alloced_size);
    w64(&mut d, 16, 0);
    w64(&mut d, 24, size);
    w64(&mut d, 32, 0);
    xf.extend_from_slice(&d);
    xf
}

struct Entry {
    key: Vec<u8>,
    value: Vec<u8>,
}

fn fs_entry(oid: u64, obj_type: u8, key_tail: Vec<u8>, value: Vec<u8>) -> Entry {
    let combined = oid | ((obj_type as u64) << 60);
    let mut key = combined.to_le_bytes().to_vec();
    key.extend_from_slice(&key_tail);
    Entry { key, value }
}

fn drec_key_tail(name: &str) -> Vec<u8> {
    let mut name_bytes = Vec::new();
    let name_len = name_with_nul(&mut name_bytes, name);
    let mut tail = (name_len as u32).to_le_bytes().to_vec();
    tail.extend_from_slice(&name_bytes);
    tail
}

fn xattr_key_tail(name: &str) -> Vec<u8> {
    let mut name_bytes = Vec::new();
    let name_len = name_with_nul(&mut name_bytes, name);
    let mut tail = (name_len as u16).to_le_bytes().to_vec();
    tail.extend_from_slice(&name_bytes);
    tail
}

fn drec_value(file_id: u64, file_type: u16) -> Vec<u8> {
    let mut v = file_id.to_le_bytes().to_vec();
    v.extend_from_slice(&1_700_000_000i64.to_le_bytes());
    v.extend_from_slice(&file_type.to_le_bytes());
    v
}

fn file_extent_value(length: u64, phys_block_num: u64) -> Vec<u8> {
    let mut v = length.to_le_bytes().to_vec();
    v.extend_from_slice(&phys_block_num.to_le_bytes());
    v.extend_from_slice(&0u64.to_le_bytes());
    v
}

fn xattr_inline_value(data: &[u8]) -> Vec<u8> {
    let mut v = 0u16.to_le_bytes().to_vec(); // flags: inline, no data stream
    v.extend_from_slice(&(data.len() as u16).to_le_bytes());
    v.extend_from_slice(data);
    v
}

/// Writes a single-level (root doubles as leaf) variable-size B-tree node.
/// `entries` must already be sorted the way the real on-disk key comparator
/// orders them — ascending by `(oid, obj_type)`, with same-prefix runs left
/// in the order callers should see them (extents logical-first, etc).
fn write_variable_leaf(block: &mut [u8], oid: u64, subtype: u32, entries: &[Entry]) {
    object_header(block, oid, 1, OBJECT_TYPE_BTREE, subtype);

    let flags: u16 = BTNODE_ROOT | BTNODE_LEAF;
    w16(block, 32, flags);
    w16(block, 34, 0); // level
    w32(block, 36, entries.len() as u32); // nkeys
    let entries_size = (entries.len() * 8) as u16;
    w16(block, 40, 0); // entries_off
    w16(block, 42, entries_size);
    w16(block, 44, 0); // unused_off
    w16(block, 46, 0); // unused_size

    let toc_start = 32 + 24;
    let key_area_off = toc_start + entries_size as usize;
    let value_region_end = block.len() - FOOTER_SIZE;

    let mut key_cursor = 0usize;
    let mut val_cursor = 0usize;
    for (i, entry) in entries.iter().enumerate() {
        let key_off = key_cursor as u16;
        let key_len = entry.key.len() as u16;
        val_cursor += entry.value.len();
        let val_off = val_cursor as u16;
        let val_len = entry.value.len() as u16;

        let toc_entry = toc_start + i * 8;
        w16(block, toc_entry, key_off);
        w16(block, toc_entry + 2, key_len);
        w16(block, toc_entry + 4, val_off);
        w16(block, toc_entry + 6, val_len);

        let key_pos = key_area_off + key_off as usize;
        block[key_pos..key_pos + entry.key.len()].copy_from_slice(&entry.key);

        let val_pos = value_region_end - val_off as usize;
        block[val_pos..val_pos + entry.value.len()].copy_from_slice(&entry.value);

        key_cursor += entry.key.len();
    }

    let footer_start = block.len() - FOOTER_SIZE;
    w32(block, footer_start, 1);
    w32(block, footer_start + 4, block.len() as u32);
    w32(block, footer_start + 8, 0); // key_size 0 => variable-size tree
    w32(block, footer_start + 12, 0);
    w32(block, footer_start + 16, 64);
    w32(block, footer_start + 20, 200);
    w64(block, footer_start + 24, entries.len() as u64);
    w64(block, footer_start + 32, 1);
}

/// Like `write_variable_leaf`, but parameterized over root/leaf so it can
/// also write a non-root branch or a non-root leaf — the shapes needed to
/// build a file-system tree deeper than one level. Non-root nodes carry no
/// footer (`has_footer()` is `is_root()`-only) and `OBJECT_TYPE_BTREE_NODE`
/// instead of `OBJECT_TYPE_BTREE`.
fn write_variable_node(block: &mut [u8], oid: u64, is_root: bool, is_leaf: bool, subtype: u32, entries: &[Entry]) {
    let obj_type = if is_root { OBJECT_TYPE_BTREE } else { OBJECT_TYPE_BTREE_NODE };
    object_header(block, oid, 1, obj_type, subtype);

    let mut flags: u16 = 0;
    if is_root {
        flags |= BTNODE_ROOT;
    }
    if is_leaf {
        flags |= BTNODE_LEAF;
    }
    w16(block, 32, flags);
    w16(block, 34, 0); // level
    w32(block, 36, entries.len() as u32); // nkeys
    let entries_size = (entries.len() * 8) as u16;
    w16(block, 40, 0); // entries_off
    w16(block, 42, entries_size);
    w16(block, 44, 0); // unused_off
    w16(block, 46, 0); // unused_size

    let toc_start = 32 + 24;
    let key_area_off = toc_start + entries_size as usize;
    let value_region_end = if is_root { block.len() - FOOTER_SIZE } else { block.len() };

    let mut key_cursor = 0usize;
    let mut val_cursor = 0usize;
    for (i, entry) in entries.iter().enumerate() {
        let key_off = key_cursor as u16;
        let key_len = entry.key.len() as u16;
        val_cursor += entry.value.len();
        let val_off = val_cursor as u16;
        let val_len = entry.value.len() as u16;

        let toc_entry = toc_start + i * 8;
        w16(block, toc_entry, key_off);
        w16(block, toc_entry + 2, key_len);
        w16(block, toc_entry + 4, val_off);
        w16(block, toc_entry + 6, val_len);

        let key_pos = key_area_off + key_off as usize;
        block[key_pos..key_pos + entry.key.len()].copy_from_slice(&entry.key);

        let val_pos = value_region_end - val_off as usize;
        block[val_pos..val_pos + entry.value.len()].copy_from_slice(&entry.value);

        key_cursor += entry.key.len();
    }

    if is_root {
        let footer_start = block.len() - FOOTER_SIZE;
        w32(block, footer_start, 1);
        w32(block, footer_start + 4, block.len() as u32);
        w32(block, footer_start + 8, 0); // key_size 0 => variable-size tree
        w32(block, footer_start + 12, 0);
        w32(block, footer_start + 16, 64);
        w32(block, footer_start + 20, 200);
        w64(block, footer_start + 24, entries.len() as u64);
        w64(block, footer_start + 32, 1);
    }
}

/// A branch entry whose value is an 8-byte child oid, keyed by the
/// smallest `(oid, obj_type)` key in that child's subtree.
fn branch_entry(oid: u64, obj_type: u8, child_oid: u64) -> Entry {
    let combined = oid | ((obj_type as u64) << 60);
    Entry {
        key: combined.to_le_bytes().to_vec(),
        value: child_oid.to_le_bytes().to_vec(),
    }
}

/// Writes a single-level fixed-8/8-byte-key/value object-map leaf holding
/// one `(oid, xid) -> paddr` mapping, mirroring `omap::tests::build_image`.
fn write_omap_leaf(block: &mut [u8], map_oid: u64, oid: u64, xid: u64, paddr: u64) {
    object_header(block, map_oid, 1, OBJECT_TYPE_BTREE, OBJECT_TYPE_OMAP);

    let flags: u16 = BTNODE_ROOT | BTNODE_LEAF | BTNODE_FIXED_KV_SIZE;
    w16(block, 32, flags);
    w16(block, 34, 0);
    w32(block, 36, 1);
    w16(block, 40, 0);
    w16(block, 42, 4);
    w16(block, 44, 0);
    w16(block, 46, 0);

    let toc_start = 32 + 24;
    w16(block, toc_start, 0);
    w16(block, toc_start + 2, 16);

    let key_area_off = toc_start + 4;
    w64(block, key_area_off, oid);
    w64(block, key_area_off + 8, xid);

    let value_region_end = block.len() - FOOTER_SIZE;
    let val_pos = value_region_end - 16;
    w32(block, val_pos, 0);
    w32(block, val_pos + 4, 0);
    w64(block, val_pos + 8, paddr);

    let footer_start = block.len() - FOOTER_SIZE;
    w32(block, footer_start, 1);
    w32(block, footer_start + 4, block.len() as u32);
    w32(block, footer_start + 8, 16);
    w32(block, footer_start + 12, 16);
    w32(block, footer_start + 16, 16);
    w32(block, footer_start + 20, 16);
    w64(block, footer_start + 24, 1);
    w64(block, footer_start + 32, 1);
}

/// A root leaf holding several `(oid, xid) -> paddr` mappings, needed once
/// an object map has to resolve more than one oid (a multi-level
/// file-system tree's branch root plus its children).
fn write_omap_leaf_multi(block: &mut [u8], map_oid: u64, entries: &[(u64, u64, u64)]) {
    object_header(block, map_oid, 1, OBJECT_TYPE_BTREE, OBJECT_TYPE_OMAP);

    let flags: u16 = BTNODE_ROOT | BTNODE_LEAF | BTNODE_FIXED_KV_SIZE;
    w16(block, 32, flags);
    w16(block, 34, 0);
    w32(block, 36, entries.len() as u32);
    let entries_size = (entries.len() * 4) as u16;
    w16(block, 40, 0);
    w16(block, 42, entries_size);
    w16(block, 44, 0);
    w16(block, 46, 0);

    let toc_start = 32 + 24;
    let key_area_off = toc_start + entries_size as usize;
    let value_region_end = block.len() - FOOTER_SIZE;

    for (i, (oid, xid, paddr)) in entries.iter().enumerate() {
        let key_off = (i * 16) as u16;
        let val_off = ((i + 1) * 16) as u16;
        let toc_entry = toc_start + i * 4;
        w16(block, toc_entry, key_off);
        w16(block, toc_entry + 2, val_off);

        let key_pos = key_area_off + key_off as usize;
        w64(block, key_pos, *oid);
        w64(block, key_pos + 8, *xid);

        let val_pos = value_region_end - val_off as usize;
        w32(block, val_pos, 0);
        w32(block, val_pos + 4, 0);
        w64(block, val_pos + 8, *paddr);
    }

    let footer_start = block.len() - FOOTER_SIZE;
    w32(block, footer_start, 1);
    w32(block, footer_start + 4, block.len() as u32);
    w32(block, footer_start + 8, 16);
    w32(block, footer_start + 12, 16);
    w32(block, footer_start + 16, 16);
    w32(block, footer_start + 20, 16);
    w64(block, footer_start + 24, entries.len() as u64);
    w64(block, footer_start + 32, 1);
}

fn write_omap_header(block: &mut [u8], oid: u64, tree_root_block: u64) {
    object_header(block, oid, 1, OBJECT_TYPE_OMAP, 0);
    w64(block, 32 + 20, tree_root_block); // om_tree_oid, 20 bytes into the body
}

/// Assembles a 9-block container image:
///   0 NXSB                        5 volume omap btree root
///   1 container omap header       6 file-system tree root
///   2 container omap btree root   7 hello.txt's first extent
///   3 APSB                        8 hello.txt's second extent
///   4 volume omap header
fn build_image() -> Vec<u8> {
    let mut image = vec![0u8; BLOCK_SIZE * 9];

    {
        let block = &mut image[0..BLOCK_SIZE];
        object_header(block, 1, 1, OBJECT_TYPE_NX_SUPERBLOCK, 0);
        let body = 32;
        w32(block, body, NX_MAGIC);
        w32(block, body + 4, BLOCK_SIZE as u32); // block_size
        w64(block, body + 8, 9); // block_count
        w64(block, body + 56, 1000); // next_oid
        w64(block, body + 64, 2); // next_xid
        w32(block, body + 72, 0); // xp_desc_blocks: skip the checkpoint scan
        w32(block, body + 76, 0); // xp_data_blocks
        w64(block, body + 80, 0); // xp_desc_base
        w64(block, body + 88, 0); // xp_data_base
        w64(block, body + 120, 0); // spaceman_oid
        w64(block, body + 128, 1); // omap_oid -> block 1
        w64(block, body + 136, 0); // reaper_oid
        w32(block, body + 144, 0); // test_type
        w32(block, body + 148, 1); // max_file_systems
        w64(block, body + 152, 100); // fs_oids[0] -> volume oid 100
    }

    write_omap_header(&mut image[BLOCK_SIZE..2 * BLOCK_SIZE], 2, 2);
    write_omap_leaf(&mut image[2 * BLOCK_SIZE..3 * BLOCK_SIZE], 900, 100, 1, 3);

    {
        let block = &mut image[3 * BLOCK_SIZE..4 * BLOCK_SIZE];
        object_header(block, 100, 1, OBJECT_TYPE_VOLUME_SUPERBLOCK, 0);
        let body = 32;
        w32(block, body, APSB_MAGIC);
        w32(block, body + 4, 0); // fs_index
        w64(block, body + 24, INCOMPAT_CASE_INSENSITIVE); // incompatible_features
        w64(block, body + 96, 4); // omap_oid -> block 4
        w64(block, body + 104, 200); // root_tree_oid
        w64(block, body + 120, 0); // snap_meta_tree_oid: no snapshots
        w64(block, body + 144, 1000); // next_obj_id
        w64(block, body + 152, 2); // num_files
        w64(block, body + 160, 2); // num_directories
        w64(block, body + 168, 1); // num_symlinks
        let name_off = body + 672;
        let name = b"Synthetic Volume";
        block[name_off..name_off + name.len()].copy_from_slice(name);
    }

    write_omap_header(&mut image[4 * BLOCK_SIZE..5 * BLOCK_SIZE], 902, 5);
    write_omap_leaf(&mut image[5 * BLOCK_SIZE..6 * BLOCK_SIZE], 901, 200, 1, 6);

    {
        let root_inode = inode_fixed(1, 2, INODE_DIR_MODE, 2, 0);
        let hello_inode = {
            let mut v = inode_fixed(2, 20, INODE_FILE_MODE, 1, 0);
            v.extend_from_slice(&dstream_xfield(6096, 8192));
            v
        };
        let subdir_inode = inode_fixed(2, 30, INODE_DIR_MODE, 1, 0);
        let link_inode = inode_fixed(30, 40, INODE_SYMLINK_MODE, 1, 12);

        // Sorted ascending by (oid, obj_type), matching the on-disk key
        // comparator; file extents for the same oid are left in ascending
        // logical order since nothing decodes a logical-offset field from
        // the key itself — offsets are assigned by iteration order alone.
        let entries = vec![
            fs_entry(2, J_TYPE_INODE, Vec::new(), root_inode),
            fs_entry(2, J_TYPE_DIR_REC, drec_key_tail("hello.txt"), drec_value(20, DT_REG)),
            fs_entry(2, J_TYPE_DIR_REC, drec_key_tail("subdir"), drec_value(30, DT_DIR)),
            fs_entry(20, J_TYPE_INODE, Vec::new(), hello_inode),
            fs_entry(20, J_TYPE_FILE_EXTENT, 0u64.to_le_bytes().to_vec(), file_extent_value(4096, 7)),
            fs_entry(20, J_TYPE_FILE_EXTENT, 4096u64.to_le_bytes().to_vec(), file_extent_value(2000, 8)),
            fs_entry(30, J_TYPE_INODE, Vec::new(), subdir_inode),
            fs_entry(30, J_TYPE_DIR_REC, drec_key_tail("link"), drec_value(40, DT_LNK)),
            fs_entry(40, J_TYPE_INODE, Vec::new(), link_inode),
            fs_entry(
                40,
                J_TYPE_XATTR,
                xattr_key_tail("com.apple.fs.symlink"),
                xattr_inline_value(b"../hello.txt"),
            ),
        ];

        write_variable_leaf(&mut image[6 * BLOCK_SIZE..7 * BLOCK_SIZE], 903, OBJECT_TYPE_FS, &entries);
    }

    image[7 * BLOCK_SIZE..8 * BLOCK_SIZE].fill(b'A');
    image[8 * BLOCK_SIZE..8 * BLOCK_SIZE + 2000].fill(b'B');

    image
}

/// A 11-block image whose file-system tree is two levels deep: a branch
/// root over two leaves, split so the root directory's entries live in one
/// leaf and everything under `oid` 20/30/40 lives in the other. Regression
/// coverage for the successor-walk bug in `fs_tree::FsTree::first_at_or_after`
/// (and the identical shape of bug in `btree::descent::TreeAccess::
/// first_after`): a range scan that dead-ends at the end of one leaf must
/// retreat to the branch root and descend into the next leaf, not stop or
/// skip straight to an unrelated sibling.
///
///   0 NXSB                        6 fs tree branch root (oid 903)
///   1 container omap header       7 fs tree leaf: root dir (oid 2)
///   2 container omap btree root   8 fs tree leaf: oids 20/30/40
///   3 APSB                        9 hello.txt's first extent
///   4 volume omap header         10 hello.txt's second extent
///   5 volume omap btree root (3 entries)
fn build_multilevel_image() -> Vec<u8> {
    let mut image = vec![0u8; BLOCK_SIZE * 11];

    {
        let block = &mut image[0..BLOCK_SIZE];
        object_header(block, 1, 1, OBJECT_TYPE_NX_SUPERBLOCK, 0);
        let body = 32;
        w32(block, body, NX_MAGIC);
        w32(block, body + 4, BLOCK_SIZE as u32);
        w64(block, body + 8, 11);
        w64(block, body + 56, 1000);
        w64(block, body + 64, 2);
        w32(block, body + 72, 0);
        w32(block, body + 76, 0);
        w64(block, body + 80, 0);
        w64(block, body + 88, 0);
        w64(block, body + 120, 0);
        w64(block, body + 128, 1);
        w64(block, body + 136, 0);
        w32(block, body + 144, 0);
        w32(block, body + 148, 1);
        w64(block, body + 152, 100);
    }

    write_omap_header(&mut image[BLOCK_SIZE..2 * BLOCK_SIZE], 2, 2);
    write_omap_leaf(&mut image[2 * BLOCK_SIZE..3 * BLOCK_SIZE], 900, 100, 1, 3);

    {
        let block = &mut image[3 * BLOCK_SIZE..4 * BLOCK_SIZE];
        object_header(block, 100, 1, OBJECT_TYPE_VOLUME_SUPERBLOCK, 0);
        let body = 32;
        w32(block, body, APSB_MAGIC);
        w32(block, body + 4, 0);
        w64(block, body + 24, INCOMPAT_CASE_INSENSITIVE);
        w64(block, body + 96, 4); // omap_oid -> block 4
        w64(block, body + 104, 200); // root_tree_oid, resolved through the omap
        w64(block, body + 120, 0);
        w64(block, body + 144, 1000);
        w64(block, body + 152, 2);
        w64(block, body + 160, 2);
        w64(block, body + 168, 1);
        let name_off = body + 672;
        let name = b"Synthetic Volume";
        block[name_off..name_off + name.len()].copy_from_slice(name);
    }

    write_omap_header(&mut image[4 * BLOCK_SIZE..5 * BLOCK_SIZE], 902, 5);
    // oid 200 -> the branch root (block 6); 904/905 -> its two leaves.
    write_omap_leaf_multi(
        &mut image[5 * BLOCK_SIZE..6 * BLOCK_SIZE],
        901,
        &[(200, 1, 6), (904, 1, 7), (905, 1, 8)],
    );

    {
        let root_inode = inode_fixed(1, 2, INODE_DIR_MODE, 2, 0);
        let root_entries = vec![
            fs_entry(2, J_TYPE_INODE, Vec::new(), root_inode),
            fs_entry(2, J_TYPE_DIR_REC, drec_key_tail("hello.txt"), drec_value(20, DT_REG)),
            fs_entry(2, J_TYPE_DIR_REC, drec_key_tail("subdir"), drec_value(30, DT_DIR)),
        ];
        write_variable_node(&mut image[7 * BLOCK_SIZE..8 * BLOCK_SIZE], 9030, false, true, OBJECT_TYPE_FS, &root_entries);

        let hello_inode = {
            let mut v = inode_fixed(2, 20, INODE_FILE_MODE, 1, 0);
            v.extend_from_slice(&dstream_xfield(6096, 8192));
            v
        };
        let subdir_inode = inode_fixed(2, 30, INODE_DIR_MODE, 1, 0);
        let link_inode = inode_fixed(30, 40, INODE_SYMLINK_MODE, 1, 12);
        let rest_entries = vec![
            fs_entry(20, J_TYPE_INODE, Vec::new(), hello_inode),
            fs_entry(20, J_TYPE_FILE_EXTENT, 0u64.to_le_bytes().to_vec(), file_extent_value(4096, 9)),
            fs_entry(20, J_TYPE_FILE_EXTENT, 4096u64.to_le_bytes().to_vec(), file_extent_value(2000, 10)),
            fs_entry(30, J_TYPE_INODE, Vec::new(), subdir_inode),
            fs_entry(30, J_TYPE_DIR_REC, drec_key_tail("link"), drec_value(40, DT_LNK)),
            fs_entry(40, J_TYPE_INODE, Vec::new(), link_inode),
            fs_entry(
                40,
                J_TYPE_XATTR,
                xattr_key_tail("com.apple.fs.symlink"),
                xattr_inline_value(b"../hello.txt"),
            ),
        ];
        write_variable_node(&mut image[8 * BLOCK_SIZE..9 * BLOCK_SIZE], 9031, false, true, OBJECT_TYPE_FS, &rest_entries);

        // Branch root: child 0 covers (2, INODE).., child 1 covers (20, INODE)..
        let branch_entries = vec![branch_entry(2, J_TYPE_INODE, 904), branch_entry(20, J_TYPE_INODE, 905)];
        write_variable_node(&mut image[6 * BLOCK_SIZE..7 * BLOCK_SIZE], 903, true, false, OBJECT_TYPE_FS, &branch_entries);
    }

    image[9 * BLOCK_SIZE..10 * BLOCK_SIZE].fill(b'A');
    image[10 * BLOCK_SIZE..10 * BLOCK_SIZE + 2000].fill(b'B');

    image
}

fn open_multilevel() -> Container<Cursor<Vec<u8>>> {
    let config = Config {
        verify_checksums: false,
        ..Config::default()
    };
    Container::open_with_config(Cursor::new(build_multilevel_image()), config).expect("container should open")
}

#[test]
fn multilevel_fs_tree_directory_listing_spans_both_leaves() {
    let container = open_multilevel();
    let volume = container.open_volume(0).unwrap();

    // The root directory's records live entirely in leaf 0 (block 7), so
    // this alone wouldn't catch a broken successor walk.
    let mut names: Vec<String> = volume.list_directory("/").unwrap().into_iter().map(|e| e.name).collect();
    names.sort();
    assert_eq!(names, vec!["hello.txt".to_string(), "subdir".to_string()]);

    // "link" lives under "subdir" (oid 30), whose dir record is in leaf 1
    // (block 8) — reached only by crossing the branch boundary from leaf 0.
    let mut sub_names: Vec<String> =
        volume.list_directory("/subdir").unwrap().into_iter().map(|e| e.name).collect();
    sub_names.sort();
    assert_eq!(sub_names, vec!["link".to_string()]);

    // A file-extent range scan (oid 20) also crosses from leaf 0 into
    // leaf 1 before any of oid 20's own records are reached.
    let data = volume.read_file("/hello.txt").unwrap();
    assert_eq!(data.len(), 6096);
    assert!(data[..4096].iter().all(|&b| b == b'A'));
    assert!(data[4096..].iter().all(|&b| b == b'B'));

    // A full walk must enumerate every entry across both leaves, in order.
    let mut paths: Vec<String> = volume.walk().unwrap().into_iter().map(|e| e.path).collect();
    paths.sort();
    assert_eq!(
        paths,
        vec!["/hello.txt".to_string(), "/subdir".to_string(), "/subdir/link".to_string()]
    );
}

fn open() -> Container<Cursor<Vec<u8>>> {
    let config = Config {
        // Hand-built blocks have no valid Fletcher-64 checksums; the
        // existing node/omap/descent unit tests take the same shortcut.
        verify_checksums: false,
        ..Config::default()
    };
    Container::open_with_config(Cursor::new(build_image()), config).expect("container should open")
}

#[test]
fn opens_container_and_lists_root_volume() {
    let container = open();
    assert_eq!(container.volume_count(), 1);
    let volume = container.open_volume(0).unwrap();

    let info = volume.info();
    assert_eq!(info.name, "Synthetic Volume");
    assert_eq!(info.block_size, BLOCK_SIZE as u32);

    let mut names: Vec<String> = volume.list_directory("/").unwrap().into_iter().map(|e| e.name).collect();
    names.sort();
    assert_eq!(names, vec!["hello.txt".to_string(), "subdir".to_string()]);
}

#[test]
fn resolves_nested_path_and_reads_symlink_target() {
    let container = open();
    let volume = container.open_volume(0).unwrap();

    let (oid, inode) = volume.resolve_path("/subdir/link").unwrap();
    assert_eq!(oid, 40);
    assert_eq!(inode.kind(), INODE_SYMLINK_TYPE);

    let target = volume.read_symlink("/subdir/link").unwrap();
    assert_eq!(target, "../hello.txt");
}

#[test]
fn reads_file_spanning_two_extents() {
    let container = open();
    let volume = container.open_volume(0).unwrap();

    let data = volume.read_file("/hello.txt").unwrap();
    assert_eq!(data.len(), 6096);
    assert!(data[..4096].iter().all(|&b| b == b'A'));
    assert!(data[4096..].iter().all(|&b| b == b'B'));

    let stat = volume.stat("/hello.txt").unwrap();
    assert_eq!(stat.size, 6096);
    assert_eq!(stat.kind, EntryKind::File);
}

#[test]
fn case_folded_lookup_finds_same_file() {
    let container = open();
    let volume = container.open_volume(0).unwrap();

    let (oid_lower, _) = volume.resolve_path("/hello.txt").unwrap();
    let (oid_upper, _) = volume.resolve_path("/HELLO.TXT").unwrap();
    assert_eq!(oid_lower, oid_upper);
}

#[test]
fn walk_reaches_every_entry_with_full_paths() {
    let container = open();
    let volume = container.open_volume(0).unwrap();

    let mut paths: Vec<String> = volume.walk().unwrap().into_iter().map(|e| e.path).collect();
    paths.sort();
    assert_eq!(
        paths,
        vec!["/hello.txt".to_string(), "/subdir".to_string(), "/subdir/link".to_string()]
    );
}

#[test]
fn path_deeper_than_configured_max_is_rejected() {
    let config = Config {
        verify_checksums: false,
        max_path_depth: 1,
        ..Config::default()
    };
    let container = Container::open_with_config(Cursor::new(build_image()), config).expect("container should open");
    let volume = container.open_volume(0).unwrap();

    // "/subdir/link" is two components deep, over the configured limit of one.
    let err = volume.resolve_path("/subdir/link").unwrap_err();
    assert!(matches!(err, ApfsError::DepthExceeded { max: 1 }));

    // A single-component path still resolves fine under the same limit.
    assert!(volume.resolve_path("/hello.txt").is_ok());
}

#[test]
fn corrupted_node_reports_corruption_without_poisoning_later_reads() {
    // Lie about the file-system root's nkeys without growing its entries
    // table — the same shape of corruption `btree::node`'s own unit tests
    // cover at the node level. Confirms it surfaces cleanly through the
    // full open/list path, and that an independent, honest container built
    // from the same layout still works right after.
    let mut image = build_image();
    let fs_root = &mut image[6 * BLOCK_SIZE..7 * BLOCK_SIZE];
    w32(fs_root, 36, 5000);

    let config = Config {
        verify_checksums: false,
        ..Config::default()
    };
    let container = Container::open_with_config(Cursor::new(image), config).unwrap();
    let volume = container.open_volume(0).unwrap();
    let err = volume.list_directory("/").unwrap_err();
    assert!(matches!(err, ApfsError::Corruption { .. }));

    let good = open();
    let good_volume = good.open_volume(0).unwrap();
    assert!(!good_volume.list_directory("/").unwrap().is_empty());
}
