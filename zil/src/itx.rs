//! In-memory intent log transactions, bucketed by txg.
//!
//! Each txg gets its own slot so that enqueue (any txg currently open or
//! quiescing) and drain (commit) contend on different locks.  Within a slot,
//! synchronous itxs sit on one list in enqueue order; asynchronous writes sit
//! on per-object lists until something forces them out (a commit of that
//! object, or a namespace operation that must order against everything).

use crate::base_types::*;
use crate::error::EncodeOverflow;
use crate::lwb;
use crate::record::{RecordBody, WriteData, WriteRecord};
use crate::zilog::WaiterLink;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ItxOutcome {
    /// The operation is durable, via the log or via main-store sync.
    Committed,
    /// The itx was dropped without being written: conflated away, or its
    /// generation failed and durability falls to the main store.
    Skipped,
}

pub type ItxCallback = Box<dyn FnOnce(ItxOutcome) + Send>;

/// How a write's payload reaches the log.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WriteState {
    /// Payload copied into the itx at creation.
    Copied,
    /// Payload fetched from the source at issue time; may be split across
    /// blocks.
    NeedCopy,
    /// Payload synced to the main store at issue time; only a pointer is
    /// logged.
    Indirect,
}

#[derive(Debug)]
pub enum ItxWrite {
    Copied(Vec<u8>),
    NeedCopy { length: u64 },
    Indirect { length: u64 },
}

impl ItxWrite {
    pub fn length(&self) -> u64 {
        match self {
            ItxWrite::Copied(data) => data.len() as u64,
            ItxWrite::NeedCopy { length } => *length,
            ItxWrite::Indirect { length } => *length,
        }
    }

    pub fn state(&self) -> WriteState {
        match self {
            ItxWrite::Copied(_) => WriteState::Copied,
            ItxWrite::NeedCopy { .. } => WriteState::NeedCopy,
            ItxWrite::Indirect { .. } => WriteState::Indirect,
        }
    }
}

pub(crate) enum ItxOp {
    Write {
        obj: ObjectId,
        offset: u64,
        write: ItxWrite,
    },
    Meta {
        body: RecordBody,
    },
    /// Never written to disk; carries a commit waiter through the queue so
    /// the waiter gets linked to the block holding everything before it.
    Commit {
        link: WaiterLink,
    },
}

pub struct Itx {
    pub(crate) op: ItxOp,
    pub(crate) sync: bool,
    pub(crate) txg: Txg,
    pub(crate) seq: u64,
    pub(crate) callback: Option<ItxCallback>,
}

impl Itx {
    pub fn new_write(
        obj: ObjectId,
        offset: u64,
        write: ItxWrite,
        sync: bool,
    ) -> Result<Itx, EncodeOverflow> {
        if let ItxWrite::Copied(data) = &write {
            let body = RecordBody::Write(WriteRecord {
                obj,
                offset,
                length: data.len() as u64,
                data: WriteData::Copied(data.clone()),
            });
            let size = body.encoded_len();
            let max = lwb::max_record_size();
            if size > max {
                return Err(EncodeOverflow { size, max });
            }
        }
        Ok(Itx {
            op: ItxOp::Write { obj, offset, write },
            sync,
            txg: Txg(0),
            seq: 0,
            callback: None,
        })
    }

    /// A namespace or attribute record; always synchronous.
    pub fn new_meta(body: RecordBody) -> Result<Itx, EncodeOverflow> {
        assert!(!matches!(body, RecordBody::Write(_)));
        let size = body.encoded_len();
        let max = lwb::max_record_size();
        if size > max {
            return Err(EncodeOverflow { size, max });
        }
        Ok(Itx {
            op: ItxOp::Meta { body },
            sync: true,
            txg: Txg(0),
            seq: 0,
            callback: None,
        })
    }

    pub(crate) fn new_commit(link: WaiterLink) -> Itx {
        Itx {
            op: ItxOp::Commit { link },
            sync: true,
            txg: Txg(0),
            seq: 0,
            callback: None,
        }
    }

    /// Invoked exactly once, when the itx's fate is known.
    pub fn with_callback(mut self, callback: ItxCallback) -> Itx {
        self.callback = Some(callback);
        self
    }

    pub(crate) fn object(&self) -> Option<ObjectId> {
        match &self.op {
            ItxOp::Write { obj, .. } => Some(*obj),
            ItxOp::Meta { body } => body.object(),
            ItxOp::Commit { .. } => None,
        }
    }

    fn write_range(&self) -> Option<(ObjectId, u64, u64)> {
        match &self.op {
            ItxOp::Write { obj, offset, write } => Some((*obj, *offset, write.length())),
            _ => None,
        }
    }

    pub(crate) fn complete(self, outcome: ItxOutcome) {
        if let ItxOp::Commit { link } = self.op {
            // A commit itx reaching completion means everything ahead of it
            // is durable one way or the other.
            link.signal(Ok(()));
            return;
        }
        if let Some(callback) = self.callback {
            callback(outcome);
        }
    }
}

#[derive(Default)]
struct ItxSlot {
    txg: Txg,
    sync: Vec<Itx>,
    async_by_obj: BTreeMap<ObjectId, Vec<Itx>>,
}

impl ItxSlot {
    fn take_all(&mut self) -> Vec<Itx> {
        let mut itxs = std::mem::take(&mut self.sync);
        for (_, mut list) in std::mem::take(&mut self.async_by_obj) {
            itxs.append(&mut list);
        }
        self.txg = Txg(0);
        itxs
    }
}

/// Itxs dropped during assignment, to be completed outside the slot lock.
#[derive(Default)]
pub(crate) struct AssignDropped {
    /// Leftovers from a previous (long-synced) occupant of the slot.
    pub synced: Vec<Itx>,
    /// A write superseded by the one just assigned.
    pub conflated: Option<Itx>,
}

pub(crate) struct ItxQueue {
    seq: AtomicU64,
    slots: [Mutex<ItxSlot>; TXG_SIZE],
}

impl ItxQueue {
    pub fn new() -> ItxQueue {
        ItxQueue {
            seq: AtomicU64::new(0),
            slots: [(); TXG_SIZE].map(|()| Default::default()),
        }
    }

    fn slot(&self, txg: Txg) -> &Mutex<ItxSlot> {
        &self.slots[txg.0 as usize % TXG_SIZE]
    }

    /// Assign an itx to its txg's slot, stamping its sequence number.  The
    /// sequence counter is global to the log, so enqueue order and sequence
    /// order coincide.
    pub fn assign(&self, mut itx: Itx, txg: Txg) -> AssignDropped {
        assert!(!txg.is_none());
        let mut dropped = AssignDropped::default();
        itx.txg = txg;
        itx.seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut slot = self.slot(txg).lock().unwrap();
        if slot.txg != txg {
            // A slot is reused only TXG_SIZE txgs later, by which point its
            // old txg has long synced.
            assert_lt(slot.txg, txg);
            dropped.synced = slot.take_all();
            slot.txg = txg;
        }
        let is_async = matches!(itx.op, ItxOp::Write { .. }) && !itx.sync;
        if is_async {
            let obj = itx.object().unwrap();
            let list = slot.async_by_obj.entry(obj).or_default();
            dropped.conflated = conflate_tail(list, &itx);
            list.push(itx);
        } else {
            if matches!(itx.op, ItxOp::Write { .. }) {
                dropped.conflated = conflate_tail(&mut slot.sync, &itx);
            }
            slot.sync.push(itx);
        }
        dropped
    }

    /// Move async itxs into the sync stream: one object's, or everyone's.
    /// Lists are merged by sequence number so the sync list stays in enqueue
    /// order.
    pub fn async_to_sync(&self, obj: Option<ObjectId>) {
        for slot in &self.slots {
            let mut slot = slot.lock().unwrap();
            let promoted: Vec<Itx> = match obj {
                Some(obj) => slot.async_by_obj.remove(&obj).unwrap_or_default(),
                None => {
                    let mut all = Vec::new();
                    for (_, mut list) in std::mem::take(&mut slot.async_by_obj) {
                        all.append(&mut list);
                    }
                    all.sort_by_key(|itx| itx.seq);
                    all
                }
            };
            if promoted.is_empty() {
                continue;
            }
            let sync = std::mem::take(&mut slot.sync);
            slot.sync = merge_by_seq(sync, promoted);
        }
    }

    /// Drain every slot whose txg is at or before the open txg, merged into
    /// one sequence-ordered list.  Called by the single commit writer.
    pub fn get_commit_list(&self, open_txg: Txg) -> Vec<Itx> {
        let mut list = Vec::new();
        for slot in &self.slots {
            let mut slot = slot.lock().unwrap();
            if slot.txg.is_none() || slot.txg > open_txg {
                continue;
            }
            let sync = std::mem::take(&mut slot.sync);
            list = merge_by_seq(list, sync);
        }
        list
    }

    /// Release itxs whose txg the main store has synced; their operations are
    /// durable regardless of the log.
    pub fn clean(&self, synced_txg: Txg) -> Vec<Itx> {
        let mut released = Vec::new();
        for slot in &self.slots {
            let mut slot = slot.lock().unwrap();
            if slot.txg.is_none() || slot.txg > synced_txg {
                continue;
            }
            released.append(&mut slot.take_all());
        }
        released
    }
}

fn assert_lt(a: Txg, b: Txg) {
    more_asserts::assert_lt!(a.0, b.0);
}

fn merge_by_seq(a: Vec<Itx>, b: Vec<Itx>) -> Vec<Itx> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        let take_a = match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => x.seq < y.seq,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        if take_a {
            out.push(a.next().unwrap());
        } else {
            out.push(b.next().unwrap());
        }
    }
    out
}

/// Conservative write conflation: if the most recent itx aliasing the new
/// write's object is itself a write wholly covered by the new one, it will
/// never be observed and can be dropped.  The scan stops at that first
/// aliasing itx either way; anything older is shadowed by it, not by us.
fn conflate_tail(list: &mut Vec<Itx>, new: &Itx) -> Option<Itx> {
    let (obj, new_off, new_len) = new.write_range()?;
    let pos = list.iter().rposition(|itx| itx.object() == Some(obj))?;
    let (_, old_off, old_len) = list[pos].write_range()?;
    if new_off <= old_off && new_off + new_len >= old_off + old_len {
        Some(list.remove(pos))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn write_itx(obj: u64, offset: u64, len: usize, sync: bool) -> Itx {
        Itx::new_write(
            ObjectId(obj),
            offset,
            ItxWrite::Copied(vec![0xaa; len]),
            sync,
        )
        .unwrap()
    }

    fn seqs(list: &[Itx]) -> Vec<u64> {
        list.iter().map(|itx| itx.seq).collect()
    }

    #[test]
    fn sequence_is_strictly_increasing_across_txgs() {
        let q = ItxQueue::new();
        q.assign(write_itx(1, 0, 10, true), Txg(5));
        q.assign(write_itx(2, 0, 10, true), Txg(6));
        q.assign(write_itx(3, 0, 10, true), Txg(5));
        let list = q.get_commit_list(Txg(6));
        assert_eq!(seqs(&list), vec![1, 2, 3]);
    }

    #[test]
    fn commit_list_leaves_async_itxs() {
        let q = ItxQueue::new();
        q.assign(write_itx(1, 0, 10, true), Txg(5));
        q.assign(write_itx(2, 0, 10, false), Txg(5));
        let list = q.get_commit_list(Txg(5));
        assert_eq!(list.len(), 1);
        // still there for a later async_to_sync
        q.async_to_sync(Some(ObjectId(2)));
        let list = q.get_commit_list(Txg(5));
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].object(), Some(ObjectId(2)));
    }

    #[test]
    fn async_to_sync_merges_in_seq_order() {
        let q = ItxQueue::new();
        q.assign(write_itx(1, 0, 10, false), Txg(5)); // seq 1
        q.assign(write_itx(2, 0, 10, true), Txg(5)); // seq 2
        q.assign(write_itx(1, 100, 10, false), Txg(5)); // seq 3
        q.async_to_sync(None);
        let list = q.get_commit_list(Txg(5));
        assert_eq!(seqs(&list), vec![1, 2, 3]);
    }

    #[test]
    fn covering_write_conflates_previous() {
        let q = ItxQueue::new();
        let skipped = Arc::new(AtomicBool::new(false));
        let skipped2 = skipped.clone();
        let first = write_itx(1, 100, 50, true).with_callback(Box::new(move |outcome| {
            assert_eq!(outcome, ItxOutcome::Skipped);
            skipped2.store(true, Ordering::SeqCst);
        }));
        q.assign(first, Txg(5));
        let dropped = q.assign(write_itx(1, 0, 4096, true), Txg(5));
        let conflated = dropped.conflated.expect("covered write should conflate");
        conflated.complete(ItxOutcome::Skipped);
        assert!(skipped.load(Ordering::SeqCst));
        assert_eq!(q.get_commit_list(Txg(5)).len(), 1);
    }

    #[test]
    fn partial_overlap_does_not_conflate() {
        let q = ItxQueue::new();
        q.assign(write_itx(1, 0, 100, true), Txg(5));
        let dropped = q.assign(write_itx(1, 50, 100, true), Txg(5));
        assert!(dropped.conflated.is_none());
        assert_eq!(q.get_commit_list(Txg(5)).len(), 2);
    }

    #[test]
    fn intervening_observer_blocks_conflation() {
        let q = ItxQueue::new();
        q.assign(write_itx(1, 0, 100, true), Txg(5));
        // A truncate of the same object observes the first write.
        q.assign(
            Itx::new_meta(RecordBody::Truncate(crate::record::TruncateRecord {
                obj: ObjectId(1),
                offset: 0,
                length: 0,
            }))
            .unwrap(),
            Txg(5),
        );
        let dropped = q.assign(write_itx(1, 0, 4096, true), Txg(5));
        assert!(dropped.conflated.is_none());
        assert_eq!(q.get_commit_list(Txg(5)).len(), 3);
    }

    #[test]
    fn different_txgs_do_not_conflate() {
        let q = ItxQueue::new();
        q.assign(write_itx(1, 0, 100, true), Txg(5));
        let dropped = q.assign(write_itx(1, 0, 4096, true), Txg(6));
        assert!(dropped.conflated.is_none());
    }

    #[test]
    fn clean_releases_synced_slots() {
        let q = ItxQueue::new();
        q.assign(write_itx(1, 0, 10, true), Txg(5));
        q.assign(write_itx(2, 0, 10, false), Txg(5));
        q.assign(write_itx(3, 0, 10, true), Txg(6));
        let released = q.clean(Txg(5));
        assert_eq!(released.len(), 2);
        assert_eq!(q.get_commit_list(Txg(6)).len(), 1);
    }

    #[test]
    fn oversized_copied_write_rejected() {
        let max = crate::lwb::max_record_size();
        let err = match Itx::new_write(ObjectId(1), 0, ItxWrite::Copied(vec![0; max + 1]), true) {
            Err(err) => err,
            Ok(_) => panic!("oversized write accepted"),
        };
        more_asserts::assert_gt!(err.size, err.max);
        // NEED_COPY writes of any size are fine; they split at issue time.
        Itx::new_write(
            ObjectId(1),
            0,
            ItxWrite::NeedCopy {
                length: (max * 10) as u64,
            },
            true,
        )
        .unwrap();
    }
}
