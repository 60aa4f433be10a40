//! Pluggable profiling hook (`spec.md` §9 "Global state and profiling").
//!
//! The source this crate is grounded in carries a process-wide CSV
//! profiler; that's out of scope here (`spec.md` §1 lists "the CSV
//! profiler" among the external collaborators). In its place: an optional
//! observer callback a caller can attach to a [`crate::block::BlockSource`],
//! receiving `(operation, block_address, size, duration)` for every block
//! read. No logging framework — nothing in the teacher's dependency stack
//! reaches for one, so this stays a plain trait object instead.

use std::time::{Duration, Instant};

use crate::block::BlockSource;
use crate::error::Result;

pub trait Observer {
    fn on_block_read(&self, operation: &str, block_address: u64, size: usize, duration: Duration);
}

/// Wraps a [`BlockSource`], timing every read and forwarding the event to
/// an [`Observer`]. `operation` is a fixed label identifying the call site
/// (e.g. `"btree_node"`, `"data_block"`) rather than anything dynamically
/// formatted, keeping this a zero-allocation pass-through on the hot path.
pub struct ObservedBlockSource<'a, S, O> {
    inner: S,
    observer: &'a O,
    operation: &'static str,
}

impl<'a, S: BlockSource, O: Observer> ObservedBlockSource<'a, S, O> {
    pub fn new(inner: S, observer: &'a O, operation: &'static str) -> Self {
        ObservedBlockSource {
            inner,
            observer,
            operation,
        }
    }
}

impl<'a, S: BlockSource, O: Observer> BlockSource for ObservedBlockSource<'a, S, O> {
    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn read_block_into(&self, block_number: u64, buf: &mut [u8]) -> Result<()> {
        let start = Instant::now();
        let result = self.inner.read_block_into(block_number, buf);
        self.observer
            .on_block_read(self.operation, block_number, buf.len(), start.elapsed());
        result
    }
}
