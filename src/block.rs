//! Block-granular IO and the raw data-block cache (`spec.md` §4.B).
//!
//! The core never opens files itself; it consumes an abstract
//! [`BlockSource`] — "given a block number and a buffer, fill the buffer" —
//! and an optional [`Decryptor`]. The teacher's `apfs` crate instead takes
//! `R: Read + Seek` by `&mut self` everywhere; that doesn't compose with a
//! shared cache whose entries must outlive the call that produced them
//! (§4.K), so `BlockSource` reads through `&self` and any `Read + Seek`
//! backend is wrapped in an interior-mutable adapter to get there.

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use lru::LruCache;
use std::num::NonZeroUsize;

use crate::error::Result;

/// Capability required of a block device: fill `buf` with `block_size`
/// bytes read from physical block `block_number`. Implementations must not
/// perform any IO until asked — the core never reads in a constructor.
pub trait BlockSource {
    fn block_size(&self) -> u32;
    fn read_block_into(&self, block_number: u64, buf: &mut [u8]) -> Result<()>;

    fn read_block(&self, block_number: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size() as usize];
        self.read_block_into(block_number, &mut buf)?;
        Ok(buf)
    }
}

/// Wraps any `Read + Seek` backend (a file, a `Cursor<Vec<u8>>`, a memory
/// map view) behind `&self` access via a `RefCell`. This is the adapter a
/// caller reaches for to turn an ordinary file handle into a `BlockSource`.
pub struct RandomAccessReader<R> {
    inner: RefCell<R>,
    block_size: u32,
}

impl<R: Read + Seek> RandomAccessReader<R> {
    pub fn new(inner: R, block_size: u32) -> Self {
        RandomAccessReader {
            inner: RefCell::new(inner),
            block_size,
        }
    }

    pub fn set_block_size(&mut self, block_size: u32) {
        self.block_size = block_size;
    }
}

impl<R: Read + Seek> BlockSource for RandomAccessReader<R> {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read_block_into(&self, block_number: u64, buf: &mut [u8]) -> Result<()> {
        let offset = block_number * self.block_size as u64;
        let mut inner = self.inner.borrow_mut();
        inner.seek(SeekFrom::Start(offset))?;
        inner.read_exact(buf)?;
        Ok(())
    }
}

/// Per-volume decryption of data blocks (FileVault etc.), tweaked by
/// physical block number. Out of scope per `spec.md` §1 ("encryption ...
/// FileVault key unwrapping") beyond this seam: the core calls it if
/// present and surfaces `Unsupported` on an encrypted volume with none.
pub trait Decryptor {
    fn decrypt_block(&self, block_number: u64, buf: &mut [u8]);
}

/// Interposes an optional [`Decryptor`] in front of a [`BlockSource`].
pub struct DecryptingBlockSource<S, D> {
    inner: S,
    decryptor: Option<D>,
}

impl<S: BlockSource, D: Decryptor> DecryptingBlockSource<S, D> {
    pub fn new(inner: S, decryptor: Option<D>) -> Self {
        DecryptingBlockSource { inner, decryptor }
    }
}

impl<S: BlockSource, D: Decryptor> BlockSource for DecryptingBlockSource<S, D> {
    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn read_block_into(&self, block_number: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_block_into(block_number, buf)?;
        if let Some(decryptor) = &self.decryptor {
            decryptor.decrypt_block(block_number, buf);
        }
        Ok(())
    }
}

/// Bounded, deterministic-eviction cache of raw decoded blocks, keyed by
/// block address. `spec.md` §4.B recommends LRU for testability; this
/// wraps `lru::LruCache` rather than hand-rolling one, matching the rest
/// of the crate's habit of reaching for a small single-purpose dependency
/// instead of reinventing it (the teacher does this with `byteorder` and
/// `thiserror`).
pub struct BlockCache {
    cache: RefCell<LruCache<u64, Arc<[u8]>>>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        BlockCache {
            cache: RefCell::new(LruCache::new(capacity)),
        }
    }

    /// Fetch a block, consulting the cache first. A read that fails is
    /// never inserted.
    pub fn get_or_read<S: BlockSource>(&self, source: &S, block_number: u64) -> Result<Arc<[u8]>> {
        if let Some(hit) = self.cache.borrow_mut().get(&block_number) {
            return Ok(hit.clone());
        }
        let data: Arc<[u8]> = source.read_block(block_number)?.into();
        self.cache.borrow_mut().put(block_number, data.clone());
        Ok(data)
    }

    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
