//! In-memory stand-ins for the storage seams, shared by the integration
//! tests.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use zil::base_types::*;
use zil::AllocClass;
use zil::AllocError;
use zil::BlockIo;
use zil::ChainEntry;
use zil::ChainIdentity;
use zil::IoError;
use zil::LogAllocator;
use zil::RecordBody;
use zil::ReplayDispatch;
use zil::TxgProvider;
use zil::WriteSource;
use zil::Zilog;

pub const DISK_SIZE: usize = 16 << 20;

/// Memory-backed block devices.  Writes land immediately; flushes only
/// count (and can be gated to test signal ordering).
pub struct MemVdev {
    disks: Vec<Mutex<Vec<u8>>>,
    pub flushes: Vec<AtomicU64>,
    pub fail_writes: AtomicBool,
    /// Writes landing at this vdev-0 offset fail; everything else succeeds.
    fail_write_offset: Mutex<Option<u64>>,
    flush_gated: AtomicBool,
    flush_gate: Semaphore,
}

impl MemVdev {
    pub fn new(nvdevs: usize) -> Arc<MemVdev> {
        Arc::new(MemVdev {
            disks: (0..nvdevs).map(|_| Mutex::new(vec![0u8; DISK_SIZE])).collect(),
            flushes: (0..nvdevs).map(|_| AtomicU64::new(0)).collect(),
            fail_writes: AtomicBool::new(false),
            fail_write_offset: Mutex::new(None),
            flush_gated: AtomicBool::new(false),
            flush_gate: Semaphore::new(0),
        })
    }

    pub fn fail_writes_at(&self, offset: Option<u64>) {
        *self.fail_write_offset.lock().unwrap() = offset;
    }

    pub fn flush_count(&self, vdev: VdevId) -> u64 {
        self.flushes[vdev.0 as usize].load(Ordering::SeqCst)
    }

    /// Make every subsequent flush block until the gate is opened.
    pub fn gate_flushes(&self) {
        self.flush_gated.store(true, Ordering::SeqCst);
    }

    pub fn open_flush_gate(&self) {
        self.flush_gated.store(false, Ordering::SeqCst);
        self.flush_gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    /// Flip one on-disk byte.
    pub fn corrupt(&self, vdev: VdevId, offset: u64) {
        let mut disk = self.disks[vdev.0 as usize].lock().unwrap();
        disk[offset as usize] ^= 0xff;
    }
}

#[async_trait]
impl BlockIo for MemVdev {
    async fn read(&self, extent: Extent) -> Result<Vec<u8>, IoError> {
        let disk = self.disks[extent.vdev.0 as usize].lock().unwrap();
        let start = extent.location.offset as usize;
        let end = start + extent.size as usize;
        if end > disk.len() {
            return Err(IoError::new(format!("read past end: {}", extent)));
        }
        Ok(disk[start..end].to_vec())
    }

    async fn write(
        &self,
        vdev: VdevId,
        location: DiskLocation,
        data: Vec<u8>,
    ) -> Result<(), IoError> {
        if self.fail_writes.load(Ordering::SeqCst)
            || (vdev == VdevId(0)
                && *self.fail_write_offset.lock().unwrap() == Some(location.offset))
        {
            return Err(IoError::new("injected write failure"));
        }
        let mut disk = self.disks[vdev.0 as usize].lock().unwrap();
        let start = location.offset as usize;
        disk[start..start + data.len()].copy_from_slice(&data);
        Ok(())
    }

    async fn flush(&self, vdev: VdevId) -> Result<(), IoError> {
        if self.flush_gated.load(Ordering::SeqCst) {
            self.flush_gate.acquire().await.unwrap().forget();
        }
        self.flushes[vdev.0 as usize].fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Bump allocator on vdev 0, starting past the header superblock.
pub struct MemAlloc {
    next: AtomicU64,
    pub log_class_ok: AtomicBool,
    pub fail_all: AtomicBool,
    pub claimed: Mutex<Vec<Extent>>,
    pub freed: Mutex<Vec<Extent>>,
}

impl MemAlloc {
    pub fn new() -> Arc<MemAlloc> {
        Arc::new(MemAlloc {
            next: AtomicU64::new(4096),
            log_class_ok: AtomicBool::new(true),
            fail_all: AtomicBool::new(false),
            claimed: Mutex::new(Vec::new()),
            freed: Mutex::new(Vec::new()),
        })
    }

    pub fn freed_extents(&self) -> Vec<Extent> {
        self.freed.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogAllocator for MemAlloc {
    async fn allocate(&self, size: u64, class: AllocClass) -> Result<Extent, AllocError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(AllocError::NoSpace(size));
        }
        if class == AllocClass::Log && !self.log_class_ok.load(Ordering::SeqCst) {
            return Err(AllocError::NoSpace(size));
        }
        let offset = self.next.fetch_add(size, Ordering::SeqCst);
        assert!(offset + size <= DISK_SIZE as u64);
        Ok(Extent {
            vdev: VdevId(0),
            location: DiskLocation { offset },
            size,
        })
    }

    async fn claim(&self, extent: Extent) -> Result<(), IoError> {
        self.claimed.lock().unwrap().push(extent);
        Ok(())
    }

    async fn free(&self, extent: Extent) {
        self.freed.lock().unwrap().push(extent);
    }
}

pub struct MemTxgs {
    open: AtomicU64,
    synced: AtomicU64,
    notify: Notify,
}

impl MemTxgs {
    pub fn new(open: u64, synced: u64) -> Arc<MemTxgs> {
        Arc::new(MemTxgs {
            open: AtomicU64::new(open),
            synced: AtomicU64::new(synced),
            notify: Notify::new(),
        })
    }

    pub fn advance_synced(&self, txg: Txg) {
        self.synced.store(txg.0, Ordering::SeqCst);
        if self.open.load(Ordering::SeqCst) <= txg.0 {
            self.open.store(txg.0 + 1, Ordering::SeqCst);
        }
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl TxgProvider for MemTxgs {
    fn open_txg(&self) -> Txg {
        Txg(self.open.load(Ordering::SeqCst))
    }

    fn last_synced_txg(&self) -> Txg {
        Txg(self.synced.load(Ordering::SeqCst))
    }

    async fn wait_synced(&self, txg: Txg) {
        loop {
            let notified = self.notify.notified();
            if self.last_synced_txg() >= txg {
                return;
            }
            notified.await;
        }
    }
}

pub const NEED_COPY_FILL: u8 = 0xbb;

/// Write-payload source.  NEED_COPY fetches return a constant fill byte;
/// indirect writes get a fabricated pointer on vdev 1.
pub struct MemSource {
    pub drained: AtomicBool,
    pub fail: AtomicBool,
    indirect_next: AtomicU64,
}

impl MemSource {
    pub fn new() -> Arc<MemSource> {
        Arc::new(MemSource {
            drained: AtomicBool::new(false),
            fail: AtomicBool::new(false),
            indirect_next: AtomicU64::new(1 << 20),
        })
    }
}

#[async_trait]
impl WriteSource for MemSource {
    async fn get_write_data(
        &self,
        _obj: ObjectId,
        _offset: u64,
        length: u64,
    ) -> Result<Option<Vec<u8>>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("injected source failure"));
        }
        if self.drained.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(vec![NEED_COPY_FILL; length as usize]))
    }

    async fn write_indirect(
        &self,
        _obj: ObjectId,
        _offset: u64,
        length: u64,
        txg: Txg,
    ) -> Result<Option<BlockPointer>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("injected source failure"));
        }
        if self.drained.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let offset = self.indirect_next.fetch_add(length, Ordering::SeqCst);
        Ok(Some(BlockPointer {
            extent: Extent {
                vdev: VdevId(1),
                location: DiskLocation { offset },
                size: length,
            },
            birth_txg: txg,
            seq: 0,
        }))
    }
}

/// Replay dispatch that records every applied body, optionally failing
/// writes at one offset.
#[derive(Default)]
pub struct Recorder {
    pub applied: Mutex<Vec<RecordBody>>,
    /// Writes at this offset fail until cleared.
    pub fail_write_at: Mutex<Option<u64>>,
}

impl Recorder {
    pub fn applied_bodies(&self) -> Vec<RecordBody> {
        self.applied.lock().unwrap().clone()
    }

    fn note(&self, body: RecordBody) -> Result<()> {
        self.applied.lock().unwrap().push(body);
        Ok(())
    }
}

#[async_trait]
impl ReplayDispatch for Recorder {
    async fn replay_create(&self, r: &zil::CreateRecord) -> Result<()> {
        self.note(RecordBody::Create(r.clone()))
    }

    async fn replay_remove(&self, r: &zil::RemoveRecord) -> Result<()> {
        self.note(RecordBody::Remove(r.clone()))
    }

    async fn replay_write(&self, r: &zil::WriteRecord) -> Result<()> {
        if *self.fail_write_at.lock().unwrap() == Some(r.offset) {
            return Err(anyhow!("object layer not ready for offset {}", r.offset));
        }
        self.note(RecordBody::Write(r.clone()))
    }

    async fn replay_rename(&self, r: &zil::RenameRecord) -> Result<()> {
        self.note(RecordBody::Rename(r.clone()))
    }

    async fn replay_truncate(&self, r: &zil::TruncateRecord) -> Result<()> {
        self.note(RecordBody::Truncate(r.clone()))
    }

    async fn replay_setattr(&self, r: &zil::SetAttrRecord) -> Result<()> {
        self.note(RecordBody::SetAttr(r.clone()))
    }

    async fn replay_acl(&self, r: &zil::AclRecord) -> Result<()> {
        self.note(RecordBody::Acl(r.clone()))
    }
}

pub fn test_identity() -> ChainIdentity {
    ChainIdentity {
        guid: LogGuid(0x5eed_f00d_cafe_0001),
        objset: ObjectId(42),
    }
}

pub struct Harness {
    pub vdev: Arc<MemVdev>,
    pub alloc: Arc<MemAlloc>,
    pub txgs: Arc<MemTxgs>,
    pub source: Arc<MemSource>,
}

impl Harness {
    pub fn new() -> Harness {
        Harness {
            vdev: MemVdev::new(2),
            alloc: MemAlloc::new(),
            txgs: MemTxgs::new(5, 4),
            source: MemSource::new(),
        }
    }

    pub async fn create_log(&self) -> Zilog {
        Zilog::create(
            test_identity(),
            self.vdev.clone(),
            self.alloc.clone(),
            self.txgs.clone(),
            self.source.clone(),
        )
        .await
        .unwrap()
    }

    /// Reopen from the on-disk header, as a crash recovery would.
    pub async fn reopen_log(&self) -> Zilog {
        Zilog::open(
            self.vdev.clone(),
            self.alloc.clone(),
            self.txgs.clone(),
            self.source.clone(),
        )
        .await
        .unwrap()
    }
}

/// Walk the chain and collect everything in it, panicking on corruption.
pub async fn parse_all(
    vdev: &Arc<MemVdev>,
    zilog: &Zilog,
) -> (Vec<BlockPointer>, Vec<zil::LogRecord>) {
    use futures::pin_mut;
    use futures::StreamExt;
    let stream = zil::parse_chain(vdev.clone(), zilog.header(), true);
    pin_mut!(stream);
    let mut blocks = Vec::new();
    let mut records = Vec::new();
    while let Some(entry) = stream.next().await {
        match entry.unwrap() {
            ChainEntry::Block { bp, .. } => blocks.push(bp),
            ChainEntry::Record(record) => records.push(record),
        }
    }
    (blocks, records)
}
