//! Persistent log header, stored in a 4 KiB superblock at the front of the
//! primary log vdev.  Everything a cold start needs to find and bound the
//! chain lives here.

use crate::base_types::*;
use crate::chain::ChainIdentity;
use crate::error::IoError;
use crate::io::BlockIo;
use anyhow::{anyhow, Context, Result};
use bincode::Options;
use log::*;
use serde::{Deserialize, Serialize};

pub const HEADER_VDEV: VdevId = VdevId(0);
pub const HEADER_SIZE: u64 = 4096;
const HEADER_MAGIC: u64 = 0x5a49_4c48_4452_3031; // "ZILHDR01"

#[derive(Serialize, Deserialize, Debug, Clone, Default, Eq, PartialEq)]
pub struct LogHeaderPhys {
    pub identity: ChainIdentity,
    /// First block of the chain; None when the log is empty.
    pub log: Option<BlockPointer>,
    /// Txg at which the chain was claimed after a crash; 0 when not claimed.
    pub claim_txg: Txg,
    /// Highest record seq already applied by an interrupted replay.
    pub replay_seq: u64,
    /// Highest block seq observed at claim time.  Blocks at or below this
    /// bound must validate; an invalid one is corruption, not a torn tail.
    pub claim_blk_seq: u64,
    /// Highest record seq observed at claim time; only meaningful when
    /// `claim_lr_seq_valid` is set.
    pub claim_lr_seq: u64,
    pub claim_lr_seq_valid: bool,
    pub replay_needed: bool,
}

#[derive(Serialize, Deserialize, Debug)]
struct HeaderRaw {
    magic: u64,
    payload_size: u64,
    checksum: u64,
}

fn encoding() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .allow_trailing_bytes()
}

const RAW_PREFIX_SIZE: usize = 24;

impl LogHeaderPhys {
    pub fn new(identity: ChainIdentity) -> LogHeaderPhys {
        LogHeaderPhys {
            identity,
            ..Default::default()
        }
    }

    fn to_raw(&self) -> Vec<u8> {
        let payload = encoding().serialize(self).unwrap();
        let raw = HeaderRaw {
            magic: HEADER_MAGIC,
            payload_size: payload.len() as u64,
            checksum: seahash::hash(&payload),
        };
        let mut buf = encoding().serialize(&raw).unwrap();
        assert_eq!(buf.len(), RAW_PREFIX_SIZE);
        buf.extend_from_slice(&payload);
        assert!(buf.len() <= HEADER_SIZE as usize);
        buf.resize(HEADER_SIZE as usize, 0);
        buf
    }

    fn from_raw(buf: &[u8]) -> Result<LogHeaderPhys> {
        let raw: HeaderRaw = encoding()
            .deserialize(&buf[..RAW_PREFIX_SIZE])
            .context("log header prefix")?;
        if raw.magic != HEADER_MAGIC {
            return Err(anyhow!("bad log header magic {:#x}", raw.magic));
        }
        let end = RAW_PREFIX_SIZE + raw.payload_size as usize;
        if end > buf.len() {
            return Err(anyhow!("log header payload size {} too large", raw.payload_size));
        }
        let payload = &buf[RAW_PREFIX_SIZE..end];
        let checksum = seahash::hash(payload);
        if checksum != raw.checksum {
            return Err(anyhow!(
                "log header checksum mismatch (expected {:#x}, found {:#x})",
                raw.checksum,
                checksum
            ));
        }
        Ok(encoding().deserialize(payload).context("log header payload")?)
    }

    pub async fn read(io: &dyn BlockIo) -> Result<LogHeaderPhys> {
        let buf = io
            .read(Extent {
                vdev: HEADER_VDEV,
                location: DiskLocation { offset: 0 },
                size: HEADER_SIZE,
            })
            .await?;
        let this = Self::from_raw(&buf)?;
        debug!("read log header: {:?}", this);
        Ok(this)
    }

    /// Write and flush the header; it must be durable before any block that
    /// depends on it is issued.
    pub async fn write(&self, io: &dyn BlockIo) -> Result<(), IoError> {
        trace!("writing log header: {:?}", self);
        io.write(HEADER_VDEV, DiskLocation { offset: 0 }, self.to_raw())
            .await?;
        io.flush(HEADER_VDEV).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        let header = LogHeaderPhys {
            identity: ChainIdentity {
                guid: LogGuid(99),
                objset: ObjectId(3),
            },
            log: Some(BlockPointer {
                extent: Extent {
                    vdev: VdevId(0),
                    location: DiskLocation { offset: 8192 },
                    size: 4096,
                },
                birth_txg: Txg(10),
                seq: 1,
            }),
            claim_txg: Txg(11),
            replay_seq: 17,
            claim_blk_seq: 3,
            claim_lr_seq: 29,
            claim_lr_seq_valid: true,
            replay_needed: true,
        };
        let raw = header.to_raw();
        assert_eq!(raw.len() as u64, HEADER_SIZE);
        assert_eq!(LogHeaderPhys::from_raw(&raw).unwrap(), header);
    }

    #[test]
    fn garbage_rejected() {
        assert!(LogHeaderPhys::from_raw(&[0u8; HEADER_SIZE as usize]).is_err());
        let mut raw = LogHeaderPhys::new(Default::default()).to_raw();
        raw[40] ^= 1;
        assert!(LogHeaderPhys::from_raw(&raw).is_err());
    }
}
