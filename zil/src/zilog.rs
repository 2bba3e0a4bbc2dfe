//! The log itself: commit coordination, block fill and issue, completion.
//!
//! Two-tier locking, mirroring the on-disk chain's needs: the async issuer
//! lock serializes everything that extends the chain (opening blocks, filling
//! records, issuing writes), while the completion mutex guards the bookkeeping
//! that i/o completion tasks and waiters touch.  The issuer lock is never
//! taken while holding the completion mutex.

use crate::base_types::*;
use crate::chain::{self, ChainIdentity, CHAIN_HEADER_SIZE};
use crate::error::{AllocError, CommitError, IoError};
use crate::header::LogHeaderPhys;
use crate::io::{AllocClass, BlockIo, LogAllocator, TxgProvider, WriteSource};
use crate::itx::{Itx, ItxOp, ItxOutcome, ItxQueue, ItxWrite};
use crate::lwb::{self, Lwb, LwbState, SIZE_HISTORY};
use crate::metrics::ZilMetrics;
use crate::record::{LogRecord, RecordBody, WriteData, WriteRecord};
use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use lazy_static::lazy_static;
use log::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use util::{get_tunable, maybe_die_with};

lazy_static! {
    static ref COMMIT_TIMEOUT_PCT: u32 = get_tunable("zil_commit_timeout_pct", 5u32);
    static ref MIN_COMMIT_TIMEOUT: Duration =
        Duration::from_millis(get_tunable("zil_min_commit_timeout_ms", 1u64));
}

#[derive(Default)]
pub(crate) struct WaiterShared {
    done: AtomicBool,
    lwb: Mutex<Option<LwbId>>,
}

impl WaiterShared {
    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn linked(&self) -> Option<LwbId> {
        *self.lwb.lock().unwrap()
    }
}

/// The sending half of a commit waiter, carried by the commit itx and then by
/// the block whose completion will signal it.
pub(crate) struct WaiterLink {
    tx: oneshot::Sender<Result<(), CommitError>>,
    shared: Arc<WaiterShared>,
}

impl WaiterLink {
    fn link(&self, id: LwbId) {
        *self.shared.lwb.lock().unwrap() = Some(id);
    }

    pub(crate) fn signal(self, result: Result<(), CommitError>) {
        self.shared.done.store(true, Ordering::Release);
        let _ = self.tx.send(result);
    }
}

/// Handle returned by `Zilog::commit_async`; `wait` resolves once everything
/// enqueued before the corresponding commit is durable (or failed).
pub struct CommitWaiter {
    zilog: Zilog,
    rx: oneshot::Receiver<Result<(), CommitError>>,
    shared: Arc<WaiterShared>,
}

impl CommitWaiter {
    pub async fn wait(self) -> Result<(), CommitError> {
        let zilog = self.zilog.clone();
        // Nobody else may be committing; a bare commit_async/wait pair has
        // to drive the writer itself.
        zilog.commit_writer(&self.shared).await;
        zilog.commit_waiter(self).await
    }
}

struct LwbSlot {
    state: LwbState,
    waiters: Vec<WaiterLink>,
}

struct FlushedLwb {
    id: LwbId,
    extent: Extent,
    max_txg: Txg,
    next: Option<BlockPointer>,
}

struct IssuerState {
    open_lwb: Option<Lwb>,
    /// Block pre-allocated at the previous issue; the chain header already
    /// points at it, so the next block must land there.
    next_bp: Option<(BlockPointer, bool)>,
    next_lwb_id: u64,
    size_history: [u64; SIZE_HISTORY],
    size_rotor: usize,
    /// Record bytes filled since the last issue; drives next block's size.
    cur_used: u64,
    /// Completion of the most recently issued block; the next issue chains on
    /// it so completions signal in issue order, and a failure anywhere in the
    /// chain fails every block issued behind it.
    prev_done: Option<oneshot::Receiver<Result<(), CommitError>>>,
}

struct CompletionState {
    lwbs: BTreeMap<LwbId, LwbSlot>,
    last_lwb_opened: Option<LwbId>,
    /// Flushes inherited from predecessors that had no waiters.
    deferred_flush: HashSet<VdevId>,
    last_lwb_latency: Duration,
    /// Set on the first unrecoverable error; cleared once the main store has
    /// synced past the covering txg.
    failed: Option<(Txg, CommitError)>,
    /// Flush-done blocks not yet freed by `sync`, in issue order.
    flushed: Vec<FlushedLwb>,
    header: LogHeaderPhys,
}

struct ZilogInner {
    identity: ChainIdentity,
    io: Arc<dyn BlockIo>,
    alloc: Arc<dyn LogAllocator>,
    txgs: Arc<dyn TxgProvider>,
    source: Arc<dyn WriteSource>,
    itxs: ItxQueue,
    issuer: tokio::sync::Mutex<IssuerState>,
    state: Mutex<CompletionState>,
    metrics: ZilMetrics,
}

#[derive(Clone)]
pub struct Zilog {
    inner: Arc<ZilogInner>,
}

impl Zilog {
    /// Initialize a fresh log on the device and return it.
    pub async fn create(
        identity: ChainIdentity,
        io: Arc<dyn BlockIo>,
        alloc: Arc<dyn LogAllocator>,
        txgs: Arc<dyn TxgProvider>,
        source: Arc<dyn WriteSource>,
    ) -> Result<Zilog> {
        let header = LogHeaderPhys::new(identity);
        header.write(&*io).await?;
        info!("created log {}", identity.guid);
        Ok(Zilog::with_header(header, io, alloc, txgs, source))
    }

    /// Open an existing log from its on-device header.
    pub async fn open(
        io: Arc<dyn BlockIo>,
        alloc: Arc<dyn LogAllocator>,
        txgs: Arc<dyn TxgProvider>,
        source: Arc<dyn WriteSource>,
    ) -> Result<Zilog> {
        let header = LogHeaderPhys::read(&*io).await?;
        info!(
            "opened log {}: log={:?} claim_txg={} replay_needed={}",
            header.identity.guid, header.log, header.claim_txg, header.replay_needed
        );
        Ok(Zilog::with_header(header, io, alloc, txgs, source))
    }

    fn with_header(
        header: LogHeaderPhys,
        io: Arc<dyn BlockIo>,
        alloc: Arc<dyn LogAllocator>,
        txgs: Arc<dyn TxgProvider>,
        source: Arc<dyn WriteSource>,
    ) -> Zilog {
        Zilog {
            inner: Arc::new(ZilogInner {
                identity: header.identity,
                io,
                alloc,
                txgs,
                source,
                itxs: ItxQueue::new(),
                issuer: tokio::sync::Mutex::new(IssuerState {
                    open_lwb: None,
                    next_bp: None,
                    next_lwb_id: 1,
                    size_history: [0; SIZE_HISTORY],
                    size_rotor: 0,
                    cur_used: 0,
                    prev_done: None,
                }),
                state: Mutex::new(CompletionState {
                    lwbs: BTreeMap::new(),
                    last_lwb_opened: None,
                    deferred_flush: HashSet::new(),
                    last_lwb_latency: Duration::ZERO,
                    failed: None,
                    flushed: Vec::new(),
                    header,
                }),
                metrics: Default::default(),
            }),
        }
    }

    pub fn identity(&self) -> ChainIdentity {
        self.inner.identity
    }

    pub fn metrics(&self) -> &ZilMetrics {
        &self.inner.metrics
    }

    pub fn header(&self) -> LogHeaderPhys {
        self.inner.state.lock().unwrap().header.clone()
    }

    pub(crate) fn set_header(&self, header: LogHeaderPhys) {
        self.inner.state.lock().unwrap().header = header;
    }

    pub(crate) fn io(&self) -> &Arc<dyn BlockIo> {
        &self.inner.io
    }

    pub(crate) fn alloc(&self) -> &Arc<dyn LogAllocator> {
        &self.inner.alloc
    }

    pub(crate) fn txgs(&self) -> &Arc<dyn TxgProvider> {
        &self.inner.txgs
    }

    /// Enqueue an itx for the txg in which its operation was made.
    pub fn assign(&self, itx: Itx, txg: Txg) {
        let metrics = &self.inner.metrics;
        ZilMetrics::bump(&metrics.itx_count);
        match &itx.op {
            ItxOp::Write { write, .. } => {
                let length = write.length();
                match write {
                    ItxWrite::Copied(_) => {
                        ZilMetrics::bump(&metrics.itx_copied_count);
                        ZilMetrics::add(&metrics.itx_copied_bytes, length);
                    }
                    ItxWrite::NeedCopy { .. } => {
                        ZilMetrics::bump(&metrics.itx_needcopy_count);
                        ZilMetrics::add(&metrics.itx_needcopy_bytes, length);
                    }
                    ItxWrite::Indirect { .. } => {
                        ZilMetrics::bump(&metrics.itx_indirect_count);
                        ZilMetrics::add(&metrics.itx_indirect_bytes, length);
                    }
                }
            }
            ItxOp::Meta { body } => {
                ZilMetrics::bump(&metrics.itx_metadata_count);
                // A rename reorders the namespace under every async write;
                // force them all into the sync stream first.
                if matches!(body, RecordBody::Rename(_)) {
                    self.inner.itxs.async_to_sync(None);
                }
            }
            ItxOp::Commit { .. } => {}
        }
        let dropped = self.inner.itxs.assign(itx, txg);
        for itx in dropped.synced {
            itx.complete(ItxOutcome::Committed);
        }
        if let Some(itx) = dropped.conflated {
            ZilMetrics::bump(&metrics.itx_skipped_count);
            itx.complete(ItxOutcome::Skipped);
        }
    }

    /// Make everything enqueued so far durable before returning.
    pub async fn commit(&self, obj: Option<ObjectId>) -> Result<(), CommitError> {
        ZilMetrics::bump(&self.inner.metrics.commit_count);
        if let Some(failed_txg) = self.failed_txg() {
            // The chain is dead until the covering txg syncs; durability
            // falls back to the main store.
            debug!("log failed at txg {}; waiting for main-store sync", failed_txg);
            {
                // Push out a lingering open block so the dead chain drains.
                let mut issuer = self.inner.issuer.lock().await;
                if issuer.open_lwb.is_some() {
                    let _ = self.issue_lwb(&mut issuer, 0, "failed log drain").await;
                }
            }
            let open = self.inner.txgs.open_txg();
            self.inner.txgs.wait_synced(open).await;
            self.clear_failed(open);
            return Ok(());
        }
        self.commit_async(obj).wait().await
    }

    /// Enqueue a commit and return a waiter for it.  The records it covers
    /// may ride a later caller's generation; `CommitWaiter::wait` will issue
    /// a lingering open block itself if nobody else does.
    pub fn commit_async(&self, obj: Option<ObjectId>) -> CommitWaiter {
        self.inner.itxs.async_to_sync(obj);
        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(WaiterShared::default());
        let link = WaiterLink {
            tx,
            shared: shared.clone(),
        };
        let itx = Itx::new_commit(link);
        let dropped = self.inner.itxs.assign(itx, self.inner.txgs.open_txg());
        for itx in dropped.synced {
            itx.complete(ItxOutcome::Committed);
        }
        CommitWaiter {
            zilog: self.clone(),
            rx,
            shared,
        }
    }

    fn failed_txg(&self) -> Option<Txg> {
        self.inner
            .state
            .lock()
            .unwrap()
            .failed
            .as_ref()
            .map(|(txg, _)| *txg)
    }

    fn clear_failed(&self, synced: Txg) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some((txg, _)) = &state.failed {
            // Wait for in-flight blocks to drain too, so the dead chain can
            // be abandoned wholesale.
            if *txg <= synced && state.lwbs.is_empty() {
                info!("clearing log failure latched at txg {}", txg);
                state.failed = None;
            }
        }
    }

    fn latch_failed(&self, error: &CommitError) {
        let mut state = self.inner.state.lock().unwrap();
        if state.failed.is_none() {
            let txg = self.inner.txgs.open_txg();
            warn!("log failed at txg {}: {}", txg, error);
            state.failed = Some((txg, error.clone()));
        }
    }

    /// Become the (sole) writer for the current generation if the waiter
    /// still needs one: drain the queue and fill blocks.
    async fn commit_writer(&self, shared: &Arc<WaiterShared>) {
        if shared.is_done() || shared.linked().is_some() {
            return;
        }
        let mut issuer = self.inner.issuer.lock().await;
        // Someone else may have drained our commit itx while we waited for
        // the lock.
        if shared.is_done() || shared.linked().is_some() {
            return;
        }
        ZilMetrics::bump(&self.inner.metrics.commit_writer_count);
        let mut list = self.inner.itxs.get_commit_list(self.inner.txgs.open_txg());
        self.prune_commit_list(&mut list);
        self.process_commit_list(&mut issuer, list).await;
    }

    /// Leading commit itxs have no records of their own in this generation;
    /// they either ride the last opened block or are already durable.
    fn prune_commit_list(&self, list: &mut Vec<Itx>) {
        while let Some(first) = list.first() {
            if !matches!(first.op, ItxOp::Commit { .. }) {
                break;
            }
            let itx = list.remove(0);
            let link = match itx.op {
                ItxOp::Commit { link } => link,
                _ => unreachable!(),
            };
            let mut state = self.inner.state.lock().unwrap();
            match state.last_lwb_opened {
                Some(id) if state.lwbs.contains_key(&id) => {
                    link.link(id);
                    state.lwbs.get_mut(&id).unwrap().waiters.push(link);
                }
                _ => {
                    drop(state);
                    ZilMetrics::bump(&self.inner.metrics.commit_skip_count);
                    link.signal(Ok(()));
                }
            }
        }
    }

    async fn process_commit_list(&self, issuer: &mut IssuerState, list: Vec<Itx>) {
        if list.is_empty() {
            return;
        }
        let last_synced = self.inner.txgs.last_synced_txg();
        let mut abort: Option<CommitError> = None;
        for itx in list {
            if let ItxOp::Commit { .. } = &itx.op {
                let link = match itx.op {
                    ItxOp::Commit { link } => link,
                    _ => unreachable!(),
                };
                match &abort {
                    Some(error) => link.signal(Err(error.clone())),
                    None => self.link_waiter(issuer, link),
                }
                continue;
            }
            if let Some(_error) = &abort {
                // This generation can't reach the log; the operation will
                // become durable when its txg syncs.
                ZilMetrics::bump(&self.inner.metrics.itx_skipped_count);
                itx.complete(ItxOutcome::Skipped);
                continue;
            }
            if itx.txg <= last_synced {
                // Already durable via the main store.
                ZilMetrics::bump(&self.inner.metrics.itx_skipped_count);
                itx.complete(ItxOutcome::Committed);
                continue;
            }
            if let Err(error) = self.lwb_fill(issuer, itx).await {
                self.latch_failed(&error);
                abort = Some(error);
            }
        }
        // The final, partially filled block stays open so closely following
        // commits can share it; its waiters issue it on timeout.
    }

    fn link_waiter(&self, issuer: &IssuerState, link: WaiterLink) {
        let mut state = self.inner.state.lock().unwrap();
        let target = issuer
            .open_lwb
            .as_ref()
            .map(|lwb| lwb.id)
            .or(state.last_lwb_opened)
            .filter(|id| state.lwbs.contains_key(id));
        match target {
            Some(id) => {
                link.link(id);
                state.lwbs.get_mut(&id).unwrap().waiters.push(link);
            }
            None => {
                drop(state);
                ZilMetrics::bump(&self.inner.metrics.commit_skip_count);
                link.signal(Ok(()));
            }
        }
    }

    /// Fill one record itx into the open block, opening and issuing blocks
    /// as needed.
    async fn lwb_fill(&self, issuer: &mut IssuerState, itx: Itx) -> Result<(), CommitError> {
        let txg = itx.txg;
        let seq = itx.seq;
        let Itx { op, callback, .. } = itx;
        match op {
            ItxOp::Meta { body } => {
                let record = LogRecord { txg, seq, body };
                self.append_record(issuer, &record, callback).await
            }
            ItxOp::Write { obj, offset, write } => match write {
                ItxWrite::Copied(data) => {
                    let record = LogRecord {
                        txg,
                        seq,
                        body: RecordBody::Write(WriteRecord {
                            obj,
                            offset,
                            length: data.len() as u64,
                            data: WriteData::Copied(data),
                        }),
                    };
                    self.append_record(issuer, &record, callback).await
                }
                ItxWrite::Indirect { length } => {
                    match self.inner.source.write_indirect(obj, offset, length, txg).await {
                        Ok(Some(bp)) => {
                            let record = LogRecord {
                                txg,
                                seq,
                                body: RecordBody::Write(WriteRecord {
                                    obj,
                                    offset,
                                    length,
                                    data: WriteData::Indirect(bp),
                                }),
                            };
                            self.append_record(issuer, &record, callback).await?;
                            // The payload's vdev must be flushed before this
                            // block's waiters hear "durable".
                            if let Some(lwb) = issuer.open_lwb.as_mut() {
                                lwb.flush_vdevs.insert(bp.extent.vdev);
                            }
                            Ok(())
                        }
                        Ok(None) => {
                            // Already synced; nothing to log.
                            if let Some(callback) = callback {
                                callback(ItxOutcome::Committed);
                            }
                            Ok(())
                        }
                        Err(e) => {
                            warn!("indirect write of {} at {} failed: {:#}", obj, offset, e);
                            if let Some(callback) = callback {
                                callback(ItxOutcome::Skipped);
                            }
                            Err(IoError::new(format!("indirect write failed: {:#}", e)).into())
                        }
                    }
                }
                ItxWrite::NeedCopy { length } => {
                    self.fill_need_copy(issuer, obj, offset, length, txg, seq, callback)
                        .await
                }
            },
            ItxOp::Commit { .. } => unreachable!("commit itxs are linked, not filled"),
        }
    }

    /// A NEED_COPY write fetches its payload now and may be split across
    /// blocks, each piece a self-contained write record.
    async fn fill_need_copy(
        &self,
        issuer: &mut IssuerState,
        obj: ObjectId,
        offset: u64,
        length: u64,
        txg: Txg,
        seq: u64,
        callback: Option<crate::itx::ItxCallback>,
    ) -> Result<(), CommitError> {
        let base = RecordBody::Write(WriteRecord {
            obj,
            offset,
            length: 0,
            data: WriteData::Copied(Vec::new()),
        })
        .encoded_len();
        let need = (base + crate::record::RECORD_ALIGN) as u64;
        let mut off = offset;
        let mut remaining = length;
        while remaining > 0 {
            self.ensure_open(issuer, need).await?;
            let space = issuer.open_lwb.as_ref().unwrap().space_left();
            // Equality would leave room only for a payload-free record.
            if space <= base + crate::record::RECORD_ALIGN {
                self.issue_lwb(issuer, need, "block full").await?;
                continue;
            }
            let chunk = remaining.min((space - base - crate::record::RECORD_ALIGN) as u64);
            let data = match self.inner.source.get_write_data(obj, off, chunk).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    // The range was synced out from under us; the main store
                    // already has it.
                    if let Some(callback) = callback {
                        callback(ItxOutcome::Committed);
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!("fetching write data for {} at {} failed: {:#}", obj, off, e);
                    if let Some(callback) = callback {
                        callback(ItxOutcome::Skipped);
                    }
                    return Err(IoError::new(format!("write data fetch failed: {:#}", e)).into());
                }
            };
            assert_eq!(data.len() as u64, chunk);
            let record = LogRecord {
                txg,
                seq,
                body: RecordBody::Write(WriteRecord {
                    obj,
                    offset: off,
                    length: chunk,
                    data: WriteData::Copied(data),
                }),
            };
            let bytes = record.encode();
            let lwb = issuer.open_lwb.as_mut().unwrap();
            let fit = lwb.append(&bytes, txg);
            assert!(fit, "sized chunk must fit the block");
            issuer.cur_used += bytes.len() as u64;
            off += chunk;
            remaining -= chunk;
        }
        if let Some(callback) = callback {
            issuer.open_lwb.as_mut().unwrap().callbacks.push(callback);
        }
        Ok(())
    }

    async fn append_record(
        &self,
        issuer: &mut IssuerState,
        record: &LogRecord,
        callback: Option<crate::itx::ItxCallback>,
    ) -> Result<(), CommitError> {
        let bytes = record.encode();
        loop {
            self.ensure_open(issuer, bytes.len() as u64).await?;
            let lwb = issuer.open_lwb.as_mut().unwrap();
            if lwb.append(&bytes, record.txg) {
                issuer.cur_used += bytes.len() as u64;
                if let Some(callback) = callback {
                    lwb.callbacks.push(callback);
                }
                return Ok(());
            }
            // The next block must be sized for the record that didn't fit.
            self.issue_lwb(issuer, bytes.len() as u64, "block full").await?;
        }
    }

    async fn allocate_block(&self, size: u64) -> Result<(Extent, bool), CommitError> {
        match self.inner.alloc.allocate(size, AllocClass::Log).await {
            Ok(extent) => {
                ZilMetrics::bump(&self.inner.metrics.blocks_allocated_log);
                Ok((extent, true))
            }
            Err(AllocError::NoSpace(_)) => {
                match self.inner.alloc.allocate(size, AllocClass::Main).await {
                    Ok(extent) => {
                        ZilMetrics::bump(&self.inner.metrics.blocks_allocated_main);
                        Ok((extent, false))
                    }
                    Err(e) => Err(CommitError::Alloc(e)),
                }
            }
        }
    }

    /// Open the next block of the chain.  The very first block of a chain
    /// also pins the header to it, durably, before anything rides on it.
    async fn ensure_open(&self, issuer: &mut IssuerState, need: u64) -> Result<(), CommitError> {
        if issuer.open_lwb.is_some() {
            return Ok(());
        }
        let id = LwbId(issuer.next_lwb_id);
        issuer.next_lwb_id += 1;
        // The slot is visible (closed) while the chain start below is in
        // flight; waiters can't link to it until it opens.
        {
            let mut state = self.inner.state.lock().unwrap();
            state.lwbs.insert(
                id,
                LwbSlot {
                    state: LwbState::Closed,
                    waiters: Vec::new(),
                },
            );
        }
        let (bp, slog) = match issuer.next_bp.take() {
            Some(next) => next,
            None => {
                let demand = issuer.cur_used.max(need);
                let size = lwb::pick_block_size(demand, &issuer.size_history);
                let (extent, slog) = match self.allocate_block(size).await {
                    Ok(allocated) => allocated,
                    Err(e) => {
                        self.inner.state.lock().unwrap().lwbs.remove(&id);
                        return Err(e);
                    }
                };
                let bp = BlockPointer {
                    extent,
                    birth_txg: self.inner.txgs.open_txg(),
                    seq: 1,
                };
                let (old_log, header) = {
                    let mut state = self.inner.state.lock().unwrap();
                    let old_log = state.header.log;
                    if old_log.is_some() {
                        // Leftover pointer from a chain that died with an i/o
                        // error; its blocks were freed once their txgs synced.
                        debug!("replacing dead chain head {:?}", old_log);
                    }
                    state.header.log = Some(bp);
                    (old_log, state.header.clone())
                };
                debug!("starting chain at {}", bp);
                if let Err(e) = header.write(&*self.inner.io).await {
                    {
                        let mut state = self.inner.state.lock().unwrap();
                        state.header.log = old_log;
                        state.lwbs.remove(&id);
                    }
                    self.inner.alloc.free(bp.extent).await;
                    return Err(e.into());
                }
                (bp, slog)
            }
        };
        trace!("opening {} at {}", id, bp);
        issuer.open_lwb = Some(Lwb::new(id, bp, slog));
        let mut state = self.inner.state.lock().unwrap();
        state.lwbs.get_mut(&id).unwrap().state = LwbState::Opened;
        state.last_lwb_opened = Some(id);
        Ok(())
    }

    /// Seal and issue the open block.  The next chain block is allocated
    /// here so its address can ride in this block's chain header; if that
    /// allocation fails the chain ends with this block and the log is
    /// latched failed.
    async fn issue_lwb(
        &self,
        issuer: &mut IssuerState,
        need: u64,
        why: &str,
    ) -> Result<(), CommitError> {
        let mut lwb = issuer.open_lwb.take().expect("issue without open block");
        let demand = issuer.cur_used.max(need);
        issuer.cur_used = 0;
        let size = lwb::pick_block_size(demand, &issuer.size_history);
        issuer.size_history[issuer.size_rotor] = lwb::bucket_size(demand);
        issuer.size_rotor = (issuer.size_rotor + 1) % SIZE_HISTORY;

        let next_alloc = self.allocate_block(size).await;
        let next = match next_alloc {
            Ok((extent, slog)) => {
                let bp = BlockPointer {
                    extent,
                    birth_txg: self.inner.txgs.open_txg(),
                    seq: lwb.bp.seq + 1,
                };
                issuer.next_bp = Some((bp, slog));
                Some(bp)
            }
            Err(ref e) => {
                warn!("can't extend chain past {}: {}", lwb.bp, e);
                issuer.next_bp = None;
                None
            }
        };

        chain::seal_block(
            &mut lwb.buf,
            &self.inner.identity,
            lwb.bp.seq,
            next,
            lwb.nused,
        );
        maybe_die_with(|| format!("before issuing {} ({})", lwb.bp, why));
        trace!(
            "issuing {} at {} (slog={}): {} record bytes, {}",
            lwb.id,
            lwb.bp,
            lwb.slog,
            lwb.nused - CHAIN_HEADER_SIZE,
            why
        );
        {
            let mut state = self.inner.state.lock().unwrap();
            state.lwbs.get_mut(&lwb.id).unwrap().state = LwbState::Issued;
        }
        ZilMetrics::add(&self.inner.metrics.bytes_written, lwb.bp.extent.size);
        ZilMetrics::add(
            &self.inner.metrics.record_bytes_written,
            (lwb.nused - CHAIN_HEADER_SIZE) as u64,
        );

        let prev_done = issuer.prev_done.take();
        let (done_tx, done_rx) = oneshot::channel();
        issuer.prev_done = Some(done_rx);
        let zilog = self.clone();
        tokio::spawn(async move {
            zilog.lwb_complete(lwb, next, prev_done, done_tx).await;
        });

        match next_alloc {
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Completion path of one issued block: write, maybe flush, then signal
    /// in issue order.
    async fn lwb_complete(
        &self,
        lwb: Lwb,
        next: Option<BlockPointer>,
        prev_done: Option<oneshot::Receiver<Result<(), CommitError>>>,
        done_tx: oneshot::Sender<Result<(), CommitError>>,
    ) {
        let begin = Instant::now();
        let Lwb {
            id,
            bp,
            buf,
            max_txg,
            callbacks,
            flush_vdevs,
            ..
        } = lwb;
        let write_res = self
            .inner
            .io
            .write(bp.extent.vdev, bp.extent.location, buf)
            .await;

        // Decide what to flush.  A block nobody is waiting on passes its
        // flush duty to its successor.
        let to_flush = {
            let mut state = self.inner.state.lock().unwrap();
            state.lwbs.get_mut(&id).unwrap().state = LwbState::WriteDone;
            match &write_res {
                Ok(()) => {
                    let no_waiters = state.lwbs.get(&id).unwrap().waiters.is_empty();
                    let has_successor = state.lwbs.keys().any(|&other| other > id);
                    if no_waiters && has_successor && !lwb::nocacheflush() {
                        state.deferred_flush.extend(flush_vdevs.iter().copied());
                        ZilMetrics::bump(&self.inner.metrics.flushes_deferred);
                        HashSet::new()
                    } else {
                        let mut vdevs = flush_vdevs;
                        vdevs.extend(state.deferred_flush.drain());
                        vdevs
                    }
                }
                Err(_) => HashSet::new(),
            }
        };

        let mut result: Result<(), CommitError> = write_res.map_err(CommitError::Io);
        if result.is_ok() && !lwb::nocacheflush() {
            let mut flushes = to_flush
                .iter()
                .map(|&vdev| self.inner.io.flush(vdev))
                .collect::<FuturesUnordered<_>>();
            while let Some(r) = flushes.next().await {
                if let Err(e) = r {
                    result = Err(CommitError::Io(e));
                }
            }
        }

        // Completions must land in issue order; wait for the predecessor.
        // A failed predecessor broke the chain ahead of this block, so its
        // records are unreachable at replay no matter how our write went.
        if let Some(prev_done) = prev_done {
            if let Ok(Err(e)) = prev_done.await {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        let waiters = {
            let mut state = self.inner.state.lock().unwrap();
            state.last_lwb_latency = begin.elapsed();
            let slot = state.lwbs.remove(&id).unwrap();
            if state.last_lwb_opened == Some(id) {
                state.last_lwb_opened = None;
            }
            match &result {
                Ok(()) => state.flushed.push(FlushedLwb {
                    id,
                    extent: bp.extent,
                    max_txg,
                    next,
                }),
                Err(e) => {
                    ZilMetrics::bump(&self.inner.metrics.write_errors);
                    if state.failed.is_none() {
                        warn!("log failed at txg {} writing {}: {}", max_txg, bp, e);
                        state.failed = Some((max_txg, e.clone()));
                    }
                }
            }
            slot.waiters
        };
        if result.is_err() {
            // The block never made it; give its space back.
            self.inner.alloc.free(bp.extent).await;
        }
        trace!("{} complete: {:?}", id, result.as_ref().map(|_| ()));
        for waiter in waiters {
            waiter.signal(result.clone());
        }
        let outcome = match &result {
            Ok(()) => ItxOutcome::Committed,
            Err(_) => ItxOutcome::Skipped,
        };
        for callback in callbacks {
            callback(outcome);
        }
        let _ = done_tx.send(result);
    }

    fn commit_waiter_timeout(&self) -> Duration {
        let latency = self.inner.state.lock().unwrap().last_lwb_latency;
        (latency * *COMMIT_TIMEOUT_PCT / 100).max(*MIN_COMMIT_TIMEOUT)
    }

    /// Wait for a commit waiter, issuing its block ourselves if it lingers
    /// open past the batching window.
    async fn commit_waiter(&self, waiter: CommitWaiter) -> Result<(), CommitError> {
        let CommitWaiter { rx, shared, .. } = waiter;
        let mut rx = rx;
        loop {
            if shared.is_done() {
                break;
            }
            let lwb_opened = match shared.linked() {
                Some(id) => {
                    let state = self.inner.state.lock().unwrap();
                    state.lwbs.get(&id).map(|slot| slot.state) == Some(LwbState::Opened)
                }
                None => false,
            };
            if !lwb_opened {
                break;
            }
            match tokio::time::timeout(self.commit_waiter_timeout(), &mut rx).await {
                Ok(received) => return flatten(received),
                Err(_elapsed) => {
                    ZilMetrics::bump(&self.inner.metrics.commit_waiter_timeouts);
                    let mut issuer = self.inner.issuer.lock().await;
                    if shared.is_done() {
                        continue;
                    }
                    let open_id = issuer.open_lwb.as_ref().map(|lwb| lwb.id);
                    if shared.linked().is_some() && shared.linked() == open_id {
                        trace!("commit waiter timed out; issuing {}", open_id.unwrap());
                        // An issue failure latches the log; this waiter's
                        // block was still written, so just keep waiting.
                        let _ = self.issue_lwb(&mut issuer, 0, "commit waiter timeout").await;
                    }
                }
            }
        }
        flatten((&mut rx).await)
    }

    /// Called from the main store's syncing context after `synced_txg` is on
    /// stable storage: release covered itxs, free covered blocks, advance
    /// the header.
    pub async fn sync(&self, synced_txg: Txg) -> Result<()> {
        for itx in self.inner.itxs.clean(synced_txg) {
            itx.complete(ItxOutcome::Committed);
        }
        // Hold the issuer lock from latch-clear through abandonment so no
        // commit can restart the chain in between.
        let mut issuer = self.inner.issuer.lock().await;
        let had_failure = self.failed_txg().is_some();
        self.clear_failed(synced_txg);
        let (freed, header_dirty, header) = {
            let mut state = self.inner.state.lock().unwrap();
            let mut freed = Vec::new();
            let mut dirty = false;
            // Free in chain order; stop at the first block the main store
            // hasn't covered yet.
            while let Some(first) = state.flushed.first() {
                if first.max_txg > synced_txg {
                    break;
                }
                let lwb = state.flushed.remove(0);
                trace!("releasing {} covered by txg {}", lwb.id, synced_txg);
                state.header.log = lwb.next;
                freed.push(lwb.extent);
                dirty = true;
            }
            if !state.header.claim_txg.is_none()
                && synced_txg >= state.header.claim_txg
                && !state.header.replay_needed
            {
                state.header.claim_txg = Txg(0);
                state.header.claim_blk_seq = 0;
                state.header.claim_lr_seq = 0;
                state.header.claim_lr_seq_valid = false;
                dirty = true;
            }
            (freed, dirty, state.header.clone())
        };
        for extent in freed {
            self.inner.alloc.free(extent).await;
        }
        if header_dirty {
            header.write(&*self.inner.io).await?;
        }
        if had_failure && self.failed_txg().is_none() {
            self.abandon_dead_chain(&mut issuer).await?;
        }
        drop(issuer);
        Ok(())
    }

    /// The failed chain's records are all covered by the main store now;
    /// drop what's left of it so a fresh chain can start.
    async fn abandon_dead_chain(&self, issuer: &mut IssuerState) -> Result<()> {
        if let Some((bp, _)) = issuer.next_bp.take() {
            self.inner.alloc.free(bp.extent).await;
        }
        // The last completion on the dead chain carried its error; a fresh
        // chain must not inherit it.
        issuer.prev_done = None;
        let (freed, header) = {
            let mut state = self.inner.state.lock().unwrap();
            assert!(state.lwbs.is_empty());
            let freed = std::mem::take(&mut state.flushed)
                .into_iter()
                .map(|lwb| lwb.extent)
                .collect::<Vec<_>>();
            state.header.log = None;
            (freed, state.header.clone())
        };
        for extent in freed {
            self.inner.alloc.free(extent).await;
        }
        header.write(&*self.inner.io).await?;
        Ok(())
    }

    /// Free the whole chain and return the header to its empty state.  Used
    /// once replay has finished with the old chain.
    pub(crate) async fn reset_log(&self, freed: Vec<Extent>) -> Result<()> {
        let mut issuer = self.inner.issuer.lock().await;
        assert!(issuer.open_lwb.is_none());
        issuer.next_bp = None;
        issuer.prev_done = None;
        let header = {
            let mut state = self.inner.state.lock().unwrap();
            assert!(state.lwbs.is_empty());
            state.flushed.clear();
            state.header = LogHeaderPhys::new(state.header.identity);
            state.header.clone()
        };
        for extent in freed {
            self.inner.alloc.free(extent).await;
        }
        header.write(&*self.inner.io).await?;
        Ok(())
    }
}

fn flatten(
    received: Result<Result<(), CommitError>, oneshot::error::RecvError>,
) -> Result<(), CommitError> {
    match received {
        Ok(result) => result,
        Err(_) => Err(CommitError::Io(IoError::new("commit waiter abandoned"))),
    }
}
