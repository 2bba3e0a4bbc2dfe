//! On-disk log record codec.
//!
//! Every record is a fixed 32-byte little-endian header (type, length, txg,
//! seq) followed by a bincode-encoded body, zero-padded so that the total
//! length is a multiple of 8.  The length lives in the header rather than the
//! body so a reader can step over records it doesn't understand.

use crate::base_types::*;
use crate::error::DecodeError;
use bincode::Options;
use serde::{Deserialize, Serialize};

pub const RECORD_HEADER_SIZE: usize = 32;
pub const RECORD_ALIGN: usize = 8;

fn encoding() -> impl bincode::Options {
    // Fixed-width little-endian so the format is byte-exact across hosts;
    // trailing bytes are the alignment padding.
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .allow_trailing_bytes()
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RecordType {
    Create = 1,
    Remove = 2,
    Write = 3,
    Rename = 4,
    Truncate = 5,
    SetAttr = 6,
    Acl = 7,
}

impl RecordType {
    pub fn from_u64(t: u64) -> Option<RecordType> {
        match t {
            1 => Some(RecordType::Create),
            2 => Some(RecordType::Remove),
            3 => Some(RecordType::Write),
            4 => Some(RecordType::Rename),
            5 => Some(RecordType::Truncate),
            6 => Some(RecordType::SetAttr),
            7 => Some(RecordType::Acl),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct CreateRecord {
    pub dir: ObjectId,
    pub obj: ObjectId,
    pub mode: u64,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct RemoveRecord {
    pub dir: ObjectId,
    pub name: String,
}

/// Payload of a write record.  NEED_COPY writes are converted to `Copied`
/// when the record is filled into a block, so only these two forms exist on
/// disk.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub enum WriteData {
    Copied(Vec<u8>),
    Indirect(BlockPointer),
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct WriteRecord {
    pub obj: ObjectId,
    pub offset: u64,
    pub length: u64,
    pub data: WriteData,
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct RenameRecord {
    pub src_dir: ObjectId,
    pub dst_dir: ObjectId,
    pub src_name: String,
    pub dst_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct TruncateRecord {
    pub obj: ObjectId,
    pub offset: u64,
    pub length: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct SetAttrRecord {
    pub obj: ObjectId,
    pub mask: u64,
    pub mode: u64,
    pub uid: u64,
    pub gid: u64,
    pub size: u64,
    pub mtime: [u64; 2],
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct AclRecord {
    pub obj: ObjectId,
    pub acl: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub enum RecordBody {
    Create(CreateRecord),
    Remove(RemoveRecord),
    Write(WriteRecord),
    Rename(RenameRecord),
    Truncate(TruncateRecord),
    SetAttr(SetAttrRecord),
    Acl(AclRecord),
}

impl RecordBody {
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordBody::Create(_) => RecordType::Create,
            RecordBody::Remove(_) => RecordType::Remove,
            RecordBody::Write(_) => RecordType::Write,
            RecordBody::Rename(_) => RecordType::Rename,
            RecordBody::Truncate(_) => RecordType::Truncate,
            RecordBody::SetAttr(_) => RecordType::SetAttr,
            RecordBody::Acl(_) => RecordType::Acl,
        }
    }

    /// The object this record touches, for write-conflation aliasing.
    /// Namespace operations return None and are never conflated.
    pub fn object(&self) -> Option<ObjectId> {
        match self {
            RecordBody::Write(w) => Some(w.obj),
            RecordBody::Truncate(t) => Some(t.obj),
            RecordBody::SetAttr(s) => Some(s.obj),
            RecordBody::Acl(a) => Some(a.obj),
            RecordBody::Create(_) | RecordBody::Remove(_) | RecordBody::Rename(_) => None,
        }
    }

    fn body_bytes(&self) -> Vec<u8> {
        // Serializing an in-memory body can't fail.
        match self {
            RecordBody::Create(r) => encoding().serialize(r).unwrap(),
            RecordBody::Remove(r) => encoding().serialize(r).unwrap(),
            RecordBody::Write(r) => encoding().serialize(r).unwrap(),
            RecordBody::Rename(r) => encoding().serialize(r).unwrap(),
            RecordBody::Truncate(r) => encoding().serialize(r).unwrap(),
            RecordBody::SetAttr(r) => encoding().serialize(r).unwrap(),
            RecordBody::Acl(r) => encoding().serialize(r).unwrap(),
        }
    }

    /// Encoded length of the whole record, header and padding included.
    pub fn encoded_len(&self) -> usize {
        let body = match self {
            RecordBody::Create(r) => encoding().serialized_size(r).unwrap(),
            RecordBody::Remove(r) => encoding().serialized_size(r).unwrap(),
            RecordBody::Write(r) => encoding().serialized_size(r).unwrap(),
            RecordBody::Rename(r) => encoding().serialized_size(r).unwrap(),
            RecordBody::Truncate(r) => encoding().serialized_size(r).unwrap(),
            RecordBody::SetAttr(r) => encoding().serialized_size(r).unwrap(),
            RecordBody::Acl(r) => encoding().serialized_size(r).unwrap(),
        };
        round_up(RECORD_HEADER_SIZE + body as usize)
    }
}

fn round_up(n: usize) -> usize {
    (n + RECORD_ALIGN - 1) / RECORD_ALIGN * RECORD_ALIGN
}

fn decode_body(txtype: u64, bytes: &[u8], reclen: u64) -> Result<RecordBody, DecodeError> {
    let txtype = RecordType::from_u64(txtype).ok_or(DecodeError::UnknownType(txtype))?;
    // The block checksum already validated these bytes, so a deserialize
    // failure means the length field disagrees with the body.
    let corrupt = |_| DecodeError::CorruptLength { reclen };
    Ok(match txtype {
        RecordType::Create => RecordBody::Create(encoding().deserialize(bytes).map_err(corrupt)?),
        RecordType::Remove => RecordBody::Remove(encoding().deserialize(bytes).map_err(corrupt)?),
        RecordType::Write => RecordBody::Write(encoding().deserialize(bytes).map_err(corrupt)?),
        RecordType::Rename => RecordBody::Rename(encoding().deserialize(bytes).map_err(corrupt)?),
        RecordType::Truncate => {
            RecordBody::Truncate(encoding().deserialize(bytes).map_err(corrupt)?)
        }
        RecordType::SetAttr => RecordBody::SetAttr(encoding().deserialize(bytes).map_err(corrupt)?),
        RecordType::Acl => RecordBody::Acl(encoding().deserialize(bytes).map_err(corrupt)?),
    })
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogRecord {
    pub txg: Txg,
    pub seq: u64,
    pub body: RecordBody,
}

impl LogRecord {
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body.body_bytes();
        let reclen = round_up(RECORD_HEADER_SIZE + body.len());
        let mut buf = Vec::with_capacity(reclen);
        buf.extend_from_slice(&(self.body.record_type() as u64).to_le_bytes());
        buf.extend_from_slice(&(reclen as u64).to_le_bytes());
        buf.extend_from_slice(&self.txg.0.to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&body);
        buf.resize(reclen, 0);
        buf
    }

    /// Decode the record at the front of `bytes`, returning it and the number
    /// of bytes it occupied.
    pub fn decode(bytes: &[u8]) -> Result<(LogRecord, usize), DecodeError> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return Err(DecodeError::TruncatedRecord {
                needed: RECORD_HEADER_SIZE,
                have: bytes.len(),
            });
        }
        let word = |i: usize| u64::from_le_bytes(bytes[i * 8..(i + 1) * 8].try_into().unwrap());
        let txtype = word(0);
        let reclen = word(1);
        let txg = word(2);
        let seq = word(3);
        // No record can be larger than what fits an empty maximum-size
        // block; a declared length past that is damage, not truncation.
        if reclen < RECORD_HEADER_SIZE as u64
            || reclen % RECORD_ALIGN as u64 != 0
            || reclen > crate::lwb::max_record_size() as u64
        {
            return Err(DecodeError::CorruptLength { reclen });
        }
        if bytes.len() < reclen as usize {
            return Err(DecodeError::TruncatedRecord {
                needed: reclen as usize,
                have: bytes.len(),
            });
        }
        let body = decode_body(txtype, &bytes[RECORD_HEADER_SIZE..reclen as usize], reclen)?;
        Ok((
            LogRecord {
                txg: Txg(txg),
                seq,
                body,
            },
            reclen as usize,
        ))
    }
}
