//! Log write blocks: the fill-side state of one in-flight log block and the
//! block size estimator.
//!
//! State machine per block: Closed -> Opened -> Issued -> WriteDone ->
//! FlushDone, strictly in that order.  Opening and issuing happen under the
//! issuer lock; the two Done transitions are driven by the completion task.

use crate::base_types::*;
use crate::chain::CHAIN_HEADER_SIZE;
use crate::itx::ItxCallback;
use lazy_static::lazy_static;
use more_asserts::*;
use std::collections::HashSet;
use util::get_tunable;

lazy_static! {
    static ref MAX_BLOCK_SIZE: u64 = get_tunable("zil_max_block_size", 128 * 1024u64);
    static ref NOCACHEFLUSH: bool = get_tunable("zil_nocacheflush", false);
}

pub const MIN_BLOCK_SIZE: u64 = 4096;

pub fn max_block_size() -> u64 {
    *MAX_BLOCK_SIZE
}

/// Largest encoded record that fits an empty block of the maximum size.
pub fn max_record_size() -> usize {
    (max_block_size() as usize) - CHAIN_HEADER_SIZE
}

/// When set, vdev cache flushes are skipped; only safe on storage with a
/// nonvolatile write cache.
pub fn nocacheflush() -> bool {
    *NOCACHEFLUSH
}

/// Block size buckets: the estimated demand is rounded up to one of these so
/// that most workloads settle on a handful of sizes the allocator can recycle.
/// The odd-looking middle sizes leave room for the chain header on top of a
/// power-of-two of record data.
const BLOCK_BUCKETS: [u64; 3] = [4096, 8192 + 4096, 32768 + 4096];

pub const SIZE_HISTORY: usize = 16;

/// Round a record-byte demand up to its bucket.
pub(crate) fn bucket_size(demand: u64) -> u64 {
    BLOCK_BUCKETS
        .iter()
        .copied()
        .find(|&b| b >= demand + CHAIN_HEADER_SIZE as u64)
        .unwrap_or_else(max_block_size)
        .min(max_block_size())
}

/// Pick the size of the next block from the bytes the current one carried,
/// smoothed over the recent history so one small commit doesn't collapse the
/// block size during a burst.
pub(crate) fn pick_block_size(demand: u64, history: &[u64; SIZE_HISTORY]) -> u64 {
    let bucket = bucket_size(demand);
    let smoothed = history.iter().copied().max().unwrap_or(0).max(bucket);
    smoothed.clamp(MIN_BLOCK_SIZE, max_block_size())
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum LwbState {
    Closed,
    Opened,
    Issued,
    WriteDone,
    FlushDone,
}

/// Fill-side state of one open block; owned by the issuer until issue, then
/// consumed by the completion task.
pub(crate) struct Lwb {
    pub id: LwbId,
    pub bp: BlockPointer,
    pub slog: bool,
    pub buf: Vec<u8>,
    pub nused: usize,
    /// Highest txg of any record in the block; the block can be freed once
    /// the main store has synced past it.
    pub max_txg: Txg,
    /// Callbacks of the itxs whose records live in this block, run at flush
    /// completion.
    pub callbacks: Vec<ItxCallback>,
    /// Vdevs that must be flushed before this block's waiters are signaled:
    /// the block's own vdev plus those of any indirect write payloads.
    pub flush_vdevs: HashSet<VdevId>,
}

impl Lwb {
    pub fn new(id: LwbId, bp: BlockPointer, slog: bool) -> Lwb {
        assert_ge!(bp.extent.size, MIN_BLOCK_SIZE);
        let mut flush_vdevs = HashSet::new();
        flush_vdevs.insert(bp.extent.vdev);
        Lwb {
            id,
            bp,
            slog,
            buf: vec![0u8; bp.extent.size as usize],
            nused: CHAIN_HEADER_SIZE,
            max_txg: Txg(0),
            callbacks: Vec::new(),
            flush_vdevs,
        }
    }

    pub fn space_left(&self) -> usize {
        self.buf.len() - self.nused
    }

    /// Copy an encoded record into the block.  Returns false (leaving the
    /// block untouched) if it doesn't fit.
    pub fn append(&mut self, record: &[u8], txg: Txg) -> bool {
        if record.len() > self.space_left() {
            return false;
        }
        self.buf[self.nused..self.nused + record.len()].copy_from_slice(record);
        self.nused += record.len();
        self.max_txg = self.max_txg.max(txg);
        true
    }
}
