//! Binary frame format for file transfer messages.
//!
//! # Wire format
//!
//! ```text
//! HEADER:
//!   [1 byte: flags]        bit 7 = response, bits 0..6 = message kind
//!   [1 byte: source node]
//!   [1 byte: destination node]
//!   [1 byte: transfer id]
//!
//! WRITE REQUEST:  [4 bytes BE: offset][1 byte: path_len][path][2 bytes BE: data_len][data]
//! WRITE RESPONSE: [2 bytes BE: error]
//! READ REQUEST:   [4 bytes BE: offset][1 byte: path_len][path]
//! READ RESPONSE:  [2 bytes BE: error][2 bytes BE: data_len][data]
//!
//! TRAILER: [4 bytes BE: CRC-32 of everything before it]
//! ```

use crc32fast::Hasher;

use crate::constants::{MAX_PATH_LEN, MAX_READ_CHUNK, MAX_WRITE_CHUNK, MessageKind};
use crate::error::ErrorCode;
use crate::messages::{ReadRequest, ReadResponse, Request, Response, WriteRequest, WriteResponse};
use crate::types::{FilePath, NodeId};

/// Flag bit marking a response frame.
const RESPONSE_FLAG: u8 = 0x80;

/// Header length in bytes.
pub const HEADER_LEN: usize = 4;

/// Trailer length in bytes.
pub const TRAILER_LEN: usize = 4;

/// Errors from encoding or decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("checksum mismatch: frame says {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("invalid node id {0}")]
    InvalidNode(u8),

    #[error("path field is {0} bytes (max {max})", max = MAX_PATH_LEN)]
    PathTooLong(usize),

    #[error("payload is {len} bytes (max {max})")]
    ChunkTooLarge { len: usize, max: usize },

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Request or response carried by a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Request(Request),
    Response(Response),
}

impl Body {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Request(req) => req.kind(),
            Self::Response(rsp) => rsp.kind(),
        }
    }
}

/// A single addressed transfer on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub source: NodeId,
    pub destination: NodeId,
    pub transfer_id: u8,
    pub body: Body,
}

impl Frame {
    /// Serializes the frame, trailer included.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 16 + TRAILER_LEN);
        let mut flags = self.body.kind() as u8;
        if matches!(self.body, Body::Response(_)) {
            flags |= RESPONSE_FLAG;
        }
        buf.push(flags);
        buf.push(self.source.get());
        buf.push(self.destination.get());
        buf.push(self.transfer_id);

        match &self.body {
            Body::Request(Request::Write(req)) => {
                buf.extend_from_slice(&req.offset.to_be_bytes());
                put_path(&mut buf, &req.path)?;
                put_data(&mut buf, &req.data, MAX_WRITE_CHUNK)?;
            }
            Body::Request(Request::Read(req)) => {
                buf.extend_from_slice(&req.offset.to_be_bytes());
                put_path(&mut buf, &req.path)?;
            }
            Body::Response(Response::Write(rsp)) => {
                buf.extend_from_slice(&rsp.error.value().to_be_bytes());
            }
            Body::Response(Response::Read(rsp)) => {
                buf.extend_from_slice(&rsp.error.value().to_be_bytes());
                put_data(&mut buf, &rsp.data, MAX_READ_CHUNK)?;
            }
        }

        let crc = checksum(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        Ok(buf)
    }

    /// Parses a frame, verifying its trailer and every length field.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_LEN + TRAILER_LEN {
            return Err(WireError::Truncated {
                needed: HEADER_LEN + TRAILER_LEN - bytes.len(),
            });
        }
        let (content, trailer) = bytes.split_at(bytes.len() - TRAILER_LEN);
        let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = checksum(content);
        if expected != actual {
            return Err(WireError::ChecksumMismatch { expected, actual });
        }

        let mut cur = Cursor::new(content);
        let flags = cur.u8()?;
        let kind = MessageKind::from_u8(flags & !RESPONSE_FLAG)
            .ok_or(WireError::UnknownKind(flags & !RESPONSE_FLAG))?;
        let is_response = flags & RESPONSE_FLAG != 0;
        let source = node(cur.u8()?)?;
        let destination = node(cur.u8()?)?;
        let transfer_id = cur.u8()?;

        let body = match (kind, is_response) {
            (MessageKind::Write, false) => {
                let offset = cur.u32()?;
                let path = cur.path()?;
                let data = cur.data(MAX_WRITE_CHUNK)?;
                Body::Request(Request::Write(WriteRequest { path, offset, data }))
            }
            (MessageKind::Read, false) => {
                let offset = cur.u32()?;
                let path = cur.path()?;
                Body::Request(Request::Read(ReadRequest { path, offset }))
            }
            (MessageKind::Write, true) => {
                let error = ErrorCode(cur.i16()?);
                Body::Response(Response::Write(WriteResponse { error }))
            }
            (MessageKind::Read, true) => {
                let error = ErrorCode(cur.i16()?);
                let data = cur.data(MAX_READ_CHUNK)?;
                Body::Response(Response::Read(ReadResponse { data, error }))
            }
        };

        if cur.remaining() != 0 {
            return Err(WireError::TrailingBytes(cur.remaining()));
        }

        Ok(Self {
            source,
            destination,
            transfer_id,
            body,
        })
    }
}

fn checksum(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn node(raw: u8) -> Result<NodeId, WireError> {
    NodeId::new(raw).ok_or(WireError::InvalidNode(raw))
}

fn put_path(buf: &mut Vec<u8>, path: &FilePath) -> Result<(), WireError> {
    let bytes = path.as_bytes();
    if bytes.len() > MAX_PATH_LEN {
        return Err(WireError::PathTooLong(bytes.len()));
    }
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_data(buf: &mut Vec<u8>, data: &[u8], max: usize) -> Result<(), WireError> {
    if data.len() > max {
        return Err(WireError::ChunkTooLarge {
            len: data.len(),
            max,
        });
    }
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n - self.remaining(),
            });
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> Result<i16, WireError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn path(&mut self) -> Result<FilePath, WireError> {
        let len = self.u8()? as usize;
        if len > MAX_PATH_LEN {
            return Err(WireError::PathTooLong(len));
        }
        let bytes = self.take(len)?;
        FilePath::from_bytes(bytes).ok_or(WireError::PathTooLong(len))
    }

    fn data(&mut self, max: usize) -> Result<Vec<u8>, WireError> {
        let len = self.u16()? as usize;
        if len > max {
            return Err(WireError::ChunkTooLarge { len, max });
        }
        Ok(self.take(len)?.to_vec())
    }
}
