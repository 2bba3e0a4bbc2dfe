use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;

/// Transaction group of the main store.  Txg 0 is "none".
#[derive(
    Serialize, Deserialize, Default, Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
pub struct Txg(pub u64);
impl Display for Txg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl Txg {
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
    pub fn next(&self) -> Txg {
        Txg(self.0 + 1)
    }
}

/// Object in the main store (file, directory, ...).
#[derive(
    Serialize, Deserialize, Default, Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
pub struct ObjectId(pub u64);
impl Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

/// Identity of one log chain; stamped into every chain header so that a
/// leftover block from a previous incarnation can't be mistaken for ours.
#[derive(
    Serialize, Deserialize, Default, Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
pub struct LogGuid(pub u64);
impl Display for LogGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[derive(
    Serialize, Deserialize, Default, Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
pub struct VdevId(pub u64);
impl Display for VdevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vdev-{}", self.0)
    }
}

/// Handle to a log write block.  Ids are allocated in issue order and never
/// reused, so stale references are detectable rather than dangling.
#[derive(
    Serialize, Deserialize, Default, Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
pub struct LwbId(pub u64);
impl Display for LwbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lwb-{}", self.0)
    }
}

#[derive(
    Serialize, Deserialize, Default, Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
pub struct DiskLocation {
    pub offset: u64,
}
impl Display for DiskLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.offset)
    }
}

#[derive(Serialize, Deserialize, Default, Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Extent {
    pub vdev: VdevId,
    pub location: DiskLocation,
    pub size: u64,
}
impl Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{:#x}", self.vdev, self.location, self.size)
    }
}

/// Pointer to one block, as embedded in chain headers and indirect write
/// records.  `seq` is the chain sequence number the pointed-to block must
/// carry; it is zero for data (non-chain) blocks.
#[derive(Serialize, Deserialize, Default, Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct BlockPointer {
    pub extent: Extent,
    pub birth_txg: Txg,
    pub seq: u64,
}
impl Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} birth={} seq={}]", self.extent, self.birth_txg, self.seq)
    }
}

/// How many txgs can be in flight (open, quiescing, syncing) at once.
pub const TXG_CONCURRENT_STATES: usize = 3;
/// Number of per-txg itx buckets; one more than the concurrent states so a
/// bucket is always fully drained before its txg number comes around again.
pub const TXG_SIZE: usize = 4;
