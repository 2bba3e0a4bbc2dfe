//! Per-log counters, owned by the log rather than process-global so that
//! multiple logs in one process stay distinguishable.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ZilMetrics {
    /// Number of commit requests.
    pub commit_count: AtomicU64,
    /// Number of times a committing thread became the writer and drained the
    /// queue (the rest rode along on someone else's generation).
    pub commit_writer_count: AtomicU64,
    /// Number of waiters that timed out batching and issued their own block.
    pub commit_waiter_timeouts: AtomicU64,
    /// Waiters signaled without anything to write.
    pub commit_skip_count: AtomicU64,

    pub itx_count: AtomicU64,
    pub itx_indirect_count: AtomicU64,
    pub itx_indirect_bytes: AtomicU64,
    pub itx_copied_count: AtomicU64,
    pub itx_copied_bytes: AtomicU64,
    pub itx_needcopy_count: AtomicU64,
    pub itx_needcopy_bytes: AtomicU64,
    pub itx_metadata_count: AtomicU64,
    /// Itxs dropped by write conflation or because their txg synced first.
    pub itx_skipped_count: AtomicU64,

    pub blocks_allocated_log: AtomicU64,
    pub blocks_allocated_main: AtomicU64,
    pub bytes_written: AtomicU64,
    pub record_bytes_written: AtomicU64,
    pub flushes_deferred: AtomicU64,
    pub write_errors: AtomicU64,
}

impl ZilMetrics {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }
}
