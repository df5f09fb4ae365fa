//! Backing stores for the file server.
//!
//! The server only needs POSIX-shaped descriptor I/O: open a path in one
//! direction, seek, read or write, close. [`BackingStore`] captures that
//! contract, plus positioned variants that seek and transfer as one step; failures come back as [`StoreError`] values that know their
//! protocol error code, so nothing depends on a global `errno`.

mod dir;
mod memory;
mod validation;

pub use dir::DirStore;
pub use memory::MemStore;
pub use validation::resolve_store_path;

use busfile_protocol::ErrorCode;

/// Default size of a store's descriptor table.
pub const DEFAULT_MAX_OPEN: usize = 16;

/// Handle to an open file inside a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(pub u32);

impl std::fmt::Display for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd{}", self.0)
    }
}

/// Direction a file is opened in. There are no read/write handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
}

impl std::fmt::Display for OpenMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadOnly => f.write_str("read-only"),
            Self::WriteOnly => f.write_str("write-only"),
        }
    }
}

/// Errors produced by a backing store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad descriptor {0}")]
    BadDescriptor(Fd),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("descriptor table full ({0} open)")]
    TooManyOpen(usize),
}

impl StoreError {
    /// Protocol code reported to the requesting node.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Io(e) => ErrorCode::from_io_error(e),
            Self::BadDescriptor(_) => ErrorCode::EBADF,
            Self::InvalidPath(_) => ErrorCode::EINVAL,
            Self::TooManyOpen(_) => ErrorCode::EMFILE,
        }
    }
}

/// Descriptor-based file I/O used by the server.
///
/// Implementations must be shareable across threads: the server calls
/// `read_at`/`write_at` without holding its own session lock, so several
/// requests may target one descriptor at once.
pub trait BackingStore: Send + Sync + 'static {
    /// Opens `path` in the given direction. Write-only opens create the file.
    fn open(&self, path: &str, mode: OpenMode) -> Result<Fd, StoreError>;

    /// Reads up to `buf.len()` bytes at the current position.
    fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize, StoreError>;

    /// Writes `data` at the current position; may write fewer bytes.
    fn write(&self, fd: Fd, data: &[u8]) -> Result<usize, StoreError>;

    /// Moves the position to `offset` bytes from the start of the file.
    fn seek(&self, fd: Fd, offset: u64) -> Result<u64, StoreError>;

    /// Seeks to `offset` and reads, with no other call on `fd` in between.
    ///
    /// A failed seek is returned as is and leaves the descriptor open.
    fn read_at(&self, fd: Fd, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError>;

    /// Seeks to `offset` and writes, with no other call on `fd` in between.
    fn write_at(&self, fd: Fd, offset: u64, data: &[u8]) -> Result<usize, StoreError>;

    /// Releases the descriptor.
    fn close(&self, fd: Fd) -> Result<(), StoreError>;
}
