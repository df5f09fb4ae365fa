//! Wire protocol types for remote file transfer between bus nodes.
//!
//! A client writes or reads a named file on a server node one bounded
//! chunk per request/response exchange. This crate holds everything both
//! sides must agree on: node addressing, the path field, the four message
//! payloads, the error code vocabulary, and the binary frame codec.

pub mod constants;
pub mod error;
pub mod messages;
pub mod types;
pub mod wire;

// Re-export primary types for convenience.
pub use constants::{
    DEFAULT_SESSION_CAPACITY, MAX_PATH_LEN, MAX_READ_CHUNK, MAX_WRITE_CHUNK, MessageKind,
};
pub use error::ErrorCode;
pub use messages::{ReadRequest, ReadResponse, Request, Response, WriteRequest, WriteResponse};
pub use types::{FilePath, InvalidNodeId, NodeId, PathError};
pub use wire::{Body, Frame, WireError};
