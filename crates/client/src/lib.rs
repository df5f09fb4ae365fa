//! File transfer client.
//!
//! Drives one transfer at a time (open, then writes or reads, then close)
//! against a remote file server, keeping the byte offset of the stream so
//! callers only hand over chunks.
//!
//! Every operation returns as soon as its request is submitted. Results
//! arrive on a completion closure, or through the awaitable
//! [`FileClient::upload`] and [`FileClient::download`] helpers.

mod client;
mod transfer;

pub use client::FileClient;

use std::time::Duration;

use busfile_protocol::{ErrorCode, PathError};
use busfile_transport::TransportError;

/// How long the awaitable helpers wait for each response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub response_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Read,
    Write,
}

impl std::fmt::Display for TransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferMode::Read => write!(f, "read"),
            TransferMode::Write => write!(f, "write"),
        }
    }
}

/// Receives the outcome of a write or close.
pub type WriteCompletion = Box<dyn FnOnce(Result<(), ClientError>) + Send + 'static>;

/// Receives the bytes of one read chunk.
pub type ReadCompletion = Box<dyn FnOnce(Result<Vec<u8>, ClientError>) + Send + 'static>;

/// Errors reported by the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no remote node configured")]
    NotConfigured,

    #[error("a transfer is already open")]
    AlreadyOpen,

    #[error("no transfer is open")]
    NotOpen,

    #[error("transfer is open for {0}")]
    WrongMode(TransferMode),

    #[error("read stream already finished")]
    StreamFinished,

    #[error("empty chunk")]
    EmptyChunk,

    #[error("chunk of {len} bytes exceeds {max}")]
    ChunkTooLarge { len: usize, max: usize },

    #[error("file offset overflow")]
    OffsetOverflow,

    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),

    #[error("request superseded by a newer one")]
    Superseded,

    #[error("transfer aborted")]
    Aborted,

    #[error("response does not match the request")]
    UnexpectedResponse,

    #[error("no response within the timeout")]
    Timeout,

    #[error("remote error: {0}")]
    Remote(ErrorCode),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ClientError {
    /// Protocol error code reported by the server, if any.
    pub fn remote_code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Remote(code) => Some(*code),
            _ => None,
        }
    }
}
