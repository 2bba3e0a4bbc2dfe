use crate::base_types::*;
use thiserror::Error;

/// Failure to decode a log record from a validated block.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum DecodeError {
    #[error("truncated record: need {needed} bytes, have {have}")]
    TruncatedRecord { needed: usize, have: usize },
    #[error("unknown record type {0}")]
    UnknownType(u64),
    #[error("corrupt record length {reclen}")]
    CorruptLength { reclen: u64 },
}

/// Returned at itx creation time; encoding itself cannot fail.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[error("record of {size} bytes exceeds the largest log record ({max} bytes)")]
pub struct EncodeOverflow {
    pub size: usize,
    pub max: usize,
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum AllocError {
    #[error("allocation of {0} bytes failed: out of space")]
    NoSpace(u64),
}

/// Clonable i/o error; one failure is delivered to every waiter of the
/// affected write block.
#[derive(Debug, Error, Clone)]
#[error("i/o error: {message}")]
pub struct IoError {
    pub message: String,
}
impl IoError {
    pub fn new(message: impl Into<String>) -> IoError {
        IoError {
            message: message.into(),
        }
    }
}
impl From<std::io::Error> for IoError {
    fn from(e: std::io::Error) -> IoError {
        IoError::new(e.to_string())
    }
}
impl From<nix::Error> for IoError {
    fn from(e: nix::Error) -> IoError {
        IoError::new(e.to_string())
    }
}

#[derive(Debug, Error, Clone)]
pub enum CommitError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Io(#[from] IoError),
    /// Damage before the claimed end of the log; a torn tail past the claimed
    /// end is not an error.
    #[error("log corrupt at {bp}: {detail}")]
    LogCorrupt { bp: BlockPointer, detail: String },
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("replay of record seq {seq} (txg {txg}) failed: {source}")]
    Apply {
        seq: u64,
        txg: Txg,
        source: anyhow::Error,
    },
}
