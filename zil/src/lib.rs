#![warn(clippy::cast_lossless)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![warn(clippy::cast_sign_loss)]

pub mod base_types;
mod chain;
mod error;
mod header;
mod io;
mod itx;
mod lwb;
mod metrics;
mod record;
mod replay;
mod vdev_file;
mod zilog;

pub use chain::ChainIdentity;
pub use error::AllocError;
pub use error::CommitError;
pub use error::DecodeError;
pub use error::EncodeOverflow;
pub use error::IoError;
pub use error::ParseError;
pub use error::ReplayError;
pub use header::LogHeaderPhys;
pub use io::AllocClass;
pub use io::BlockIo;
pub use io::LogAllocator;
pub use io::ReplayDispatch;
pub use io::TxgProvider;
pub use io::WriteSource;
pub use itx::Itx;
pub use itx::ItxCallback;
pub use itx::ItxOutcome;
pub use itx::ItxWrite;
pub use itx::WriteState;
pub use lwb::LwbState;
pub use metrics::ZilMetrics;
pub use record::AclRecord;
pub use record::CreateRecord;
pub use record::LogRecord;
pub use record::RecordBody;
pub use record::RecordType;
pub use record::RemoveRecord;
pub use record::RenameRecord;
pub use record::SetAttrRecord;
pub use record::TruncateRecord;
pub use record::WriteData;
pub use record::WriteRecord;
pub use replay::parse_chain;
pub use replay::ChainEntry;
pub use vdev_file::FileVdev;
pub use zilog::CommitWaiter;
pub use zilog::Zilog;
