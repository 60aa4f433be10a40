//! Read-only APFS container and volume access (`spec.md` §1/§6).
//!
//! [`Container::open`] parses a container superblock, resolves the
//! checkpoint descriptor area for the latest transaction, and exposes each
//! volume through [`Volume`]. Every read — block IO, object-map
//! resolution, B-tree descent — goes through `&self`, so repeated lookups
//! against the same `Volume` reuse cached blocks and nodes instead of
//! re-parsing anything. This is single-threaded, cooperative access only
//! (`spec.md` §5): the interior caches are `RefCell`-based, not `Sync`, so
//! concurrent callers need independent `Container`/`Volume` handles over
//! independent IO backends, not a shared one.

pub mod block;
pub mod btree;
pub mod cache;
pub mod config;
pub mod decode;
pub mod error;
pub mod extents;
pub mod fletcher;
pub mod fs_tree;
pub mod name_hash;
pub mod object;
pub mod observer;
pub mod omap;
pub mod snapshot;
pub mod superblock;

pub use config::Config;
pub use error::{ApfsError, Result};

use std::io::{Read, Seek, Write};

use block::{BlockCache, BlockSource, RandomAccessReader};
use cache::NodeCache;
use fs_tree::FsTree;
use omap::ObjectMap;
use snapshot::SnapshotTree;
use superblock::{ApfsSuperblock, NxSuperblock};

/// Entry kind in the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// A directory entry returned by [`Volume::list_directory`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub oid: u64,
    pub kind: EntryKind,
    pub size: u64,
    pub create_time: i64,
    pub modify_time: i64,
}

/// Detailed file/directory metadata returned by [`Volume::stat`].
#[derive(Debug, Clone)]
pub struct FileStat {
    pub oid: u64,
    pub kind: EntryKind,
    pub size: u64,
    pub create_time: i64,
    pub modify_time: i64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub nlink: u32,
}

/// Entry from [`Volume::walk`] — includes the full path from the volume root.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub path: String,
    pub entry: DirEntry,
}

/// Volume metadata reported by [`Volume::info`].
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub name: String,
    pub block_size: u32,
    pub num_files: u64,
    pub num_directories: u64,
    pub num_symlinks: u64,
    pub num_snapshots: u64,
}

const SYMLINK_XATTR_NAME: &str = "com.apple.fs.symlink";

/// An open APFS container: the parsed superblock plus the container-wide
/// object map and block/node caches shared by every volume it holds.
pub struct Container<R: Read + Seek> {
    source: RandomAccessReader<R>,
    config: Config,
    block_cache: BlockCache,
    container_node_cache: NodeCache,
    nxsb: NxSuperblock,
    container_omap: ObjectMap,
}

impl<R: Read + Seek> Container<R> {
    /// Open a container with default [`Config`].
    pub fn open(reader: R) -> Result<Self> {
        Self::open_with_config(reader, Config::default())
    }

    /// Open a container, reading block 0 to discover its block size (unless
    /// overridden), scanning the checkpoint descriptor area for the latest
    /// transaction, and parsing the container object map.
    pub fn open_with_config(reader: R, config: Config) -> Result<Self> {
        let initial_block_size = config.block_size_override.unwrap_or(4096);
        let mut source = RandomAccessReader::new(reader, initial_block_size);

        let nxsb = superblock::read_nxsb(&mut source, &config)?;
        let nxsb = superblock::find_latest_nxsb(&source, &nxsb)?;

        let block_cache = BlockCache::new(config.data_cache_capacity);
        let container_node_cache = NodeCache::new(config.node_cache_capacity);

        let omap_block = block_cache.get_or_read(&source, nxsb.omap_oid)?;
        let container_omap = ObjectMap::parse(&omap_block)?;

        Ok(Container {
            source,
            config,
            block_cache,
            container_node_cache,
            nxsb,
            container_omap,
        })
    }

    /// Container-wide UUID.
    pub fn uuid(&self) -> [u8; 16] {
        self.nxsb.uuid
    }

    /// Number of volumes present (non-zero entries in `fs_oids`).
    pub fn volume_count(&self) -> usize {
        self.nxsb.fs_oids.iter().filter(|&&oid| oid != 0).count()
    }

    /// Mount the `index`-th volume (in on-disk `fs_oids` order).
    pub fn open_volume(&self, index: usize) -> Result<Volume<'_, R>> {
        let vol_oid = self
            .nxsb
            .fs_oids
            .iter()
            .filter(|&&oid| oid != 0)
            .nth(index)
            .copied()
            .ok_or(ApfsError::NoSuchVolume(index))?;

        let vol_block = self.container_omap.resolve(
            &self.source,
            &self.block_cache,
            &self.container_node_cache,
            vol_oid,
            self.config.verify_checksums,
        )?;
        let vol_data = self.block_cache.get_or_read(&self.source, vol_block)?;

        let header = object::ObjectHeader::parse(&vol_data)?;
        superblock::verify_checksum(&vol_data, &header, self.config.verify_checksums)?;
        let sb = ApfsSuperblock::parse(&vol_data)?;

        let vol_omap_block = self.block_cache.get_or_read(&self.source, sb.omap_oid)?;
        let vol_omap = ObjectMap::parse(&vol_omap_block)?;

        let node_cache = NodeCache::new(self.config.node_cache_capacity);
        let omap_node_cache = NodeCache::new(self.config.node_cache_capacity);

        let fs_root_block = vol_omap.resolve(
            &self.source,
            &self.block_cache,
            &omap_node_cache,
            sb.root_tree_oid,
            self.config.verify_checksums,
        )?;

        let snap_root_block = if sb.snap_meta_tree_oid != 0 {
            Some(vol_omap.resolve(
                &self.source,
                &self.block_cache,
                &omap_node_cache,
                sb.snap_meta_tree_oid,
                self.config.verify_checksums,
            )?)
        } else {
            None
        };

        let use_case_folding = self.config.use_case_folding.unwrap_or_else(|| sb.uses_case_folding());

        Ok(Volume {
            container: self,
            sb,
            omap: vol_omap,
            node_cache,
            omap_node_cache,
            fs_root_block,
            snap_root_block,
            use_case_folding,
        })
    }

    /// Mount every volume present, in on-disk order.
    pub fn volumes(&self) -> Result<Vec<Volume<'_, R>>> {
        (0..self.volume_count()).map(|i| self.open_volume(i)).collect()
    }
}

/// One mounted volume: its superblock, object map, and the per-volume
/// decoded-node caches its file-system and snapshot trees read through.
pub struct Volume<'a, R: Read + Seek> {
    container: &'a Container<R>,
    sb: ApfsSuperblock,
    omap: ObjectMap,
    node_cache: NodeCache,
    omap_node_cache: NodeCache,
    fs_root_block: u64,
    snap_root_block: Option<u64>,
    use_case_folding: bool,
}

impl<'a, R: Read + Seek> Volume<'a, R> {
    fn fs_tree(&self) -> FsTree<'_, RandomAccessReader<R>> {
        FsTree::new(
            &self.container.source,
            &self.container.block_cache,
            &self.node_cache,
            &self.omap,
            &self.omap_node_cache,
            self.fs_root_block,
            self.container.config.lenient,
            self.container.config.verify_checksums,
            self.use_case_folding,
            self.container.config.max_path_depth,
        )
    }

    fn snapshot_tree(&self) -> Option<SnapshotTree<'_, RandomAccessReader<R>>> {
        self.snap_root_block.map(|root| {
            SnapshotTree::new(
                &self.container.source,
                &self.container.block_cache,
                &self.node_cache,
                &self.omap,
                &self.omap_node_cache,
                root,
                self.container.config.lenient,
                self.container.config.verify_checksums,
            )
        })
    }

    /// Volume-level metadata (name, block size, object counts).
    pub fn info(&self) -> VolumeInfo {
        VolumeInfo {
            name: self.sb.volume_name.clone(),
            block_size: self.container.source.block_size(),
            num_files: self.sb.num_files,
            num_directories: self.sb.num_directories,
            num_symlinks: self.sb.num_symlinks,
            num_snapshots: self.sb.num_snapshots,
        }
    }

    /// List entries of the directory at `path` ("/" for the volume root).
    pub fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>> {
        let parent = if path == "/" || path.is_empty() {
            fs_tree::ROOT_DIR_RECORD
        } else {
            let (oid, inode) = self.fs_tree().resolve_path(path)?;
            if inode.kind() != fs_tree::INODE_DIR_TYPE {
                return Err(ApfsError::NotADirectory(path.to_string()));
            }
            oid
        };

        self.fs_tree().directory_entries(parent)
    }

    /// Resolve `path` to its object id and inode.
    pub fn resolve_path(&self, path: &str) -> Result<(u64, fs_tree::InodeVal)> {
        self.fs_tree().resolve_path(path)
    }

    /// Metadata for a file, directory, or symlink at `path`.
    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let (oid, inode) = self.fs_tree().resolve_path(path)?;
        Ok(FileStat {
            oid,
            kind: match inode.kind() {
                fs_tree::INODE_DIR_TYPE => EntryKind::Directory,
                fs_tree::INODE_SYMLINK_TYPE => EntryKind::Symlink,
                _ => EntryKind::File,
            },
            size: inode.size(),
            create_time: inode.create_time,
            modify_time: inode.modify_time,
            uid: inode.uid,
            gid: inode.gid,
            mode: inode.mode,
            nlink: inode.nlink(),
        })
    }

    /// Read an entire file into memory.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.read_file_to(path, &mut buf)?;
        Ok(buf)
    }

    /// Stream a file's data to `writer`, returning the number of bytes
    /// written.
    pub fn read_file_to<W: Write>(&self, path: &str, writer: &mut W) -> Result<u64> {
        let (_oid, inode) = self.fs_tree().resolve_path(path)?;
        let file_extents = self.fs_tree().file_extents(inode.private_id)?;
        extents::read_file_data(
            &self.container.source,
            &self.container.block_cache,
            &file_extents,
            inode.size(),
            writer,
        )
    }

    /// Open a file for `Read + Seek` access without buffering it whole.
    pub fn open_file(&self, path: &str) -> Result<extents::ApfsForkReader<'_, RandomAccessReader<R>>> {
        let (_oid, inode) = self.fs_tree().resolve_path(path)?;
        let file_extents = self.fs_tree().file_extents(inode.private_id)?;
        Ok(extents::ApfsForkReader::new(
            &self.container.source,
            &self.container.block_cache,
            file_extents,
            inode.size(),
        ))
    }

    /// Extended attributes on the file or directory at `path`.
    pub fn extended_attributes(&self, path: &str) -> Result<Vec<fs_tree::XattrRecord>> {
        let (oid, _inode) = self.fs_tree().resolve_path(path)?;
        self.fs_tree().extended_attributes(oid)
    }

    /// The target of the symlink at `path`, read from its
    /// `com.apple.fs.symlink` extended attribute.
    pub fn read_symlink(&self, path: &str) -> Result<String> {
        let (oid, inode) = self.fs_tree().resolve_path(path)?;
        if inode.kind() != fs_tree::INODE_SYMLINK_TYPE {
            return Err(ApfsError::corrupt("read_symlink", format!("{path} is not a symlink")));
        }

        let target = self
            .fs_tree()
            .extended_attributes(oid)?
            .into_iter()
            .find(|x| x.name == SYMLINK_XATTR_NAME)
            .ok_or_else(|| ApfsError::corrupt("read_symlink", format!("{path}: missing {SYMLINK_XATTR_NAME} xattr")))?;

        match target.value {
            fs_tree::XattrValue::Inline(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            fs_tree::XattrValue::Dstream { .. } => {
                Err(ApfsError::unsupported("symlink target stored in a dstream rather than inline"))
            }
        }
    }

    /// Every snapshot recorded in this volume's snapshot metadata tree, or
    /// an empty list if the volume has none.
    pub fn snapshots(&self) -> Result<Vec<snapshot::SnapshotMetadata>> {
        match self.snapshot_tree() {
            Some(tree) => tree.list(),
            None => Ok(Vec::new()),
        }
    }

    /// Recursively walk every entry reachable from the volume root.
    pub fn walk(&self) -> Result<Vec<WalkEntry>> {
        let mut entries = Vec::new();
        self.walk_recursive(fs_tree::ROOT_DIR_RECORD, "", &mut entries)?;
        Ok(entries)
    }

    /// `true` if `path` resolves to an existing file, directory, or
    /// symlink.
    pub fn exists(&self, path: &str) -> Result<bool> {
        match self.fs_tree().resolve_path(path) {
            Ok(_) => Ok(true),
            Err(ApfsError::FileNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn walk_recursive(&self, parent_oid: u64, parent_path: &str, entries: &mut Vec<WalkEntry>) -> Result<()> {
        let dir_entries = self.fs_tree().directory_entries(parent_oid)?;

        for entry in dir_entries {
            let full_path = if parent_path.is_empty() {
                format!("/{}", entry.name)
            } else {
                format!("{}/{}", parent_path, entry.name)
            };

            let is_dir = entry.kind == EntryKind::Directory;
            let oid = entry.oid;

            entries.push(WalkEntry {
                path: full_path.clone(),
                entry,
            });

            if is_dir {
                self.walk_recursive(oid, &full_path, entries)?;
            }
        }

        Ok(())
    }
}
