//! Chain header sealing and validation.
//!
//! Every log block begins with a fixed-size chain header carrying the pointer
//! to the next block, the used length, the log identity, the block's sequence
//! number, and a checksum of the used record bytes.  Pre-allocating the next
//! block at issue time is what lets the reader distinguish the true end of
//! the chain (a block that was never written) from damage in the middle.

use crate::base_types::*;
use bincode::Options;
use more_asserts::*;
use serde::{Deserialize, Serialize};

pub const CHAIN_HEADER_SIZE: usize = 128;
const CHAIN_MAGIC: u64 = 0x5a49_4c43_4841_494e; // "ZILCHAIN"

/// Stamped into every chain header and mixed into every checksum.
#[derive(Serialize, Deserialize, Default, Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChainIdentity {
    pub guid: LogGuid,
    pub objset: ObjectId,
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
struct ChainHeaderPhys {
    magic: u64,
    next: Option<BlockPointer>,
    nused: u64,
    identity: ChainIdentity,
    seq: u64,
    checksum: u64,
}

fn encoding() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .allow_trailing_bytes()
}

fn record_checksum(records: &[u8], identity: &ChainIdentity, seq: u64) -> u64 {
    seahash::hash_seeded(records, identity.guid.0, identity.objset.0, seq, CHAIN_MAGIC)
}

/// Why a block failed validation.  Any of these just ends the chain walk;
/// whether that end is tolerable is the caller's call, based on the claimed
/// bounds.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChainInvalid {
    ShortBlock { have: usize },
    BadHeader,
    WrongIdentity { found: ChainIdentity },
    WrongSeq { expected: u64, found: u64 },
    BadLength { nused: u64, block_size: u64 },
    BadChecksum { expected: u64, found: u64 },
}

impl std::fmt::Display for ChainInvalid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainInvalid::ShortBlock { have } => write!(f, "short block ({} bytes)", have),
            ChainInvalid::BadHeader => write!(f, "unparseable chain header"),
            ChainInvalid::WrongIdentity { found } => {
                write!(f, "wrong identity (guid {} objset {})", found.guid, found.objset)
            }
            ChainInvalid::WrongSeq { expected, found } => {
                write!(f, "wrong block seq (expected {}, found {})", expected, found)
            }
            ChainInvalid::BadLength { nused, block_size } => {
                write!(f, "bad used length {} for {}-byte block", nused, block_size)
            }
            ChainInvalid::BadChecksum { expected, found } => {
                write!(f, "checksum mismatch (expected {:#x}, found {:#x})", expected, found)
            }
        }
    }
}

/// Contents of a block that passed validation.
#[derive(Debug)]
pub struct OpenedBlock<'a> {
    pub records: &'a [u8],
    pub next: Option<BlockPointer>,
    pub nused: usize,
}

/// Write the chain header into the front of a filled block buffer.  `nused`
/// counts the header itself plus the record bytes behind it.
pub fn seal_block(
    buf: &mut [u8],
    identity: &ChainIdentity,
    seq: u64,
    next: Option<BlockPointer>,
    nused: usize,
) {
    assert_ge!(nused, CHAIN_HEADER_SIZE);
    assert_le!(nused, buf.len());
    let checksum = record_checksum(&buf[CHAIN_HEADER_SIZE..nused], identity, seq);
    let phys = ChainHeaderPhys {
        magic: CHAIN_MAGIC,
        next,
        nused: nused as u64,
        identity: *identity,
        seq,
        checksum,
    };
    let header = encoding().serialize(&phys).unwrap();
    assert_le!(header.len(), CHAIN_HEADER_SIZE);
    buf[..header.len()].copy_from_slice(&header);
    buf[header.len()..CHAIN_HEADER_SIZE].fill(0);
}

/// Validate a block read back from disk against the identity and sequence
/// number the pointing block promised.
pub fn open_block<'a>(
    buf: &'a [u8],
    identity: &ChainIdentity,
    expected_seq: u64,
) -> Result<OpenedBlock<'a>, ChainInvalid> {
    if buf.len() < CHAIN_HEADER_SIZE {
        return Err(ChainInvalid::ShortBlock { have: buf.len() });
    }
    let phys: ChainHeaderPhys = encoding()
        .deserialize(&buf[..CHAIN_HEADER_SIZE])
        .map_err(|_| ChainInvalid::BadHeader)?;
    if phys.magic != CHAIN_MAGIC {
        return Err(ChainInvalid::BadHeader);
    }
    if phys.identity != *identity {
        return Err(ChainInvalid::WrongIdentity {
            found: phys.identity,
        });
    }
    if phys.seq != expected_seq {
        return Err(ChainInvalid::WrongSeq {
            expected: expected_seq,
            found: phys.seq,
        });
    }
    if phys.nused < CHAIN_HEADER_SIZE as u64 || phys.nused > buf.len() as u64 {
        return Err(ChainInvalid::BadLength {
            nused: phys.nused,
            block_size: buf.len() as u64,
        });
    }
    let nused = phys.nused as usize;
    let checksum = record_checksum(&buf[CHAIN_HEADER_SIZE..nused], identity, phys.seq);
    if checksum != phys.checksum {
        return Err(ChainInvalid::BadChecksum {
            expected: phys.checksum,
            found: checksum,
        });
    }
    Ok(OpenedBlock {
        records: &buf[CHAIN_HEADER_SIZE..nused],
        next: phys.next,
        nused,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ChainIdentity {
        ChainIdentity {
            guid: LogGuid(0xdead_beef_0bad_cafe),
            objset: ObjectId(54),
        }
    }

    fn next_bp() -> BlockPointer {
        BlockPointer {
            extent: Extent {
                vdev: VdevId(0),
                location: DiskLocation { offset: 0x4000 },
                size: 4096,
            },
            birth_txg: Txg(12),
            seq: 5,
        }
    }

    fn sealed(records: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        buf[CHAIN_HEADER_SIZE..CHAIN_HEADER_SIZE + records.len()].copy_from_slice(records);
        seal_block(
            &mut buf,
            &identity(),
            4,
            Some(next_bp()),
            CHAIN_HEADER_SIZE + records.len(),
        );
        buf
    }

    #[test]
    fn seal_and_open() {
        let records = b"some record bytes".to_vec();
        let buf = sealed(&records);
        let opened = open_block(&buf, &identity(), 4).unwrap();
        assert_eq!(opened.records, &records[..]);
        assert_eq!(opened.next, Some(next_bp()));
        assert_eq!(opened.nused, CHAIN_HEADER_SIZE + records.len());
    }

    #[test]
    fn flipped_record_bit_is_detected() {
        let mut buf = sealed(b"some record bytes");
        buf[CHAIN_HEADER_SIZE + 3] ^= 0x10;
        match open_block(&buf, &identity(), 4) {
            Err(ChainInvalid::BadChecksum { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn wrong_expected_seq() {
        let buf = sealed(b"x");
        match open_block(&buf, &identity(), 5) {
            Err(ChainInvalid::WrongSeq { expected: 5, found: 4 }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn foreign_identity() {
        let buf = sealed(b"x");
        let other = ChainIdentity {
            guid: LogGuid(1),
            objset: ObjectId(54),
        };
        match open_block(&buf, &other, 4) {
            Err(ChainInvalid::WrongIdentity { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn zeroed_block_is_invalid() {
        let buf = vec![0u8; 4096];
        assert!(open_block(&buf, &identity(), 1).is_err());
    }

    #[test]
    fn header_fits_reserved_region() {
        // The largest header form: a present next pointer.
        let phys = ChainHeaderPhys {
            magic: CHAIN_MAGIC,
            next: Some(next_bp()),
            nused: u64::MAX,
            identity: identity(),
            seq: u64::MAX,
            checksum: u64::MAX,
        };
        assert_le!(
            encoding().serialized_size(&phys).unwrap() as usize,
            CHAIN_HEADER_SIZE
        );
    }
}
