//! Seams to the embedding storage system.  The log itself only ever sees
//! these traits; production wires in real block devices and the main-store
//! txg machinery, tests wire in mocks.

use crate::base_types::*;
use crate::error::{AllocError, IoError};
use crate::record::RecordBody;
use anyhow::Result;
use async_trait::async_trait;

/// Raw block i/o.  A write is durable only once `flush` of its vdev has
/// returned.
#[async_trait]
pub trait BlockIo: Send + Sync {
    async fn read(&self, extent: Extent) -> Result<Vec<u8>, IoError>;
    async fn write(&self, vdev: VdevId, location: DiskLocation, data: Vec<u8>)
        -> Result<(), IoError>;
    async fn flush(&self, vdev: VdevId) -> Result<(), IoError>;
}

/// Which allocation class to prefer for a log block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AllocClass {
    /// Dedicated log device, if the pool has one.
    Log,
    /// Main pool storage.
    Main,
}

#[async_trait]
pub trait LogAllocator: Send + Sync {
    async fn allocate(&self, size: u64, class: AllocClass) -> Result<Extent, AllocError>;
    /// Mark an extent discovered during log claim as in-use so the main store
    /// won't reallocate it before the log is replayed.
    async fn claim(&self, extent: Extent) -> Result<(), IoError>;
    async fn free(&self, extent: Extent);
}

/// View of the main store's transaction group machinery.
#[async_trait]
pub trait TxgProvider: Send + Sync {
    fn open_txg(&self) -> Txg;
    fn last_synced_txg(&self) -> Txg;
    async fn wait_synced(&self, txg: Txg);
}

/// Source of write payloads that were not copied into the itx at creation.
#[async_trait]
pub trait WriteSource: Send + Sync {
    /// Fetch the data for a NEED_COPY write at issue time.  Ok(None) means
    /// the range is no longer dirty (already synced); the record is dropped.
    async fn get_write_data(
        &self,
        obj: ObjectId,
        offset: u64,
        length: u64,
    ) -> Result<Option<Vec<u8>>>;

    /// Sync the data for an indirect write to its final main-store location,
    /// returning the pointer to embed in the log record.  Ok(None) means the
    /// range was already synced and needs no log entry.
    async fn write_indirect(
        &self,
        obj: ObjectId,
        offset: u64,
        length: u64,
        txg: Txg,
    ) -> Result<Option<BlockPointer>>;
}

/// Per-type application of recovered records.  `apply` dispatches on the
/// record body; implementors only provide the typed methods.
#[async_trait]
pub trait ReplayDispatch: Send + Sync {
    async fn replay_create(&self, r: &crate::record::CreateRecord) -> Result<()>;
    async fn replay_remove(&self, r: &crate::record::RemoveRecord) -> Result<()>;
    async fn replay_write(&self, r: &crate::record::WriteRecord) -> Result<()>;
    async fn replay_rename(&self, r: &crate::record::RenameRecord) -> Result<()>;
    async fn replay_truncate(&self, r: &crate::record::TruncateRecord) -> Result<()>;
    async fn replay_setattr(&self, r: &crate::record::SetAttrRecord) -> Result<()>;
    async fn replay_acl(&self, r: &crate::record::AclRecord) -> Result<()>;

    async fn apply(&self, body: &RecordBody) -> Result<()> {
        match body {
            RecordBody::Create(r) => self.replay_create(r).await,
            RecordBody::Remove(r) => self.replay_remove(r).await,
            RecordBody::Write(r) => self.replay_write(r).await,
            RecordBody::Rename(r) => self.replay_rename(r).await,
            RecordBody::Truncate(r) => self.replay_truncate(r).await,
            RecordBody::SetAttr(r) => self.replay_setattr(r).await,
            RecordBody::Acl(r) => self.replay_acl(r).await,
        }
    }
}
