use crate::constants::MessageKind;
use crate::error::ErrorCode;
use crate::types::FilePath;

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Writes `data` at `offset` of the file named by `path`.
///
/// Empty `data` at a nonzero offset ends the write stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub path: FilePath,
    pub offset: u32,
    pub data: Vec<u8>,
}

impl WriteRequest {
    /// Returns `true` if this request marks the end of a write stream.
    pub fn is_end_of_stream(&self) -> bool {
        self.data.is_empty() && self.offset != 0
    }
}

/// Reads the chunk at `offset` of the file named by `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub path: FilePath,
    pub offset: u32,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteResponse {
    pub error: ErrorCode,
}

impl WriteResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(error: ErrorCode) -> Self {
        Self { error }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadResponse {
    pub data: Vec<u8>,
    pub error: ErrorCode,
}

impl ReadResponse {
    pub fn error(error: ErrorCode) -> Self {
        Self {
            data: Vec::new(),
            error,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Any request a file server accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Write(WriteRequest),
    Read(ReadRequest),
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Write(_) => MessageKind::Write,
            Self::Read(_) => MessageKind::Read,
        }
    }

    pub fn path(&self) -> &FilePath {
        match self {
            Self::Write(req) => &req.path,
            Self::Read(req) => &req.path,
        }
    }
}

/// Any response a file server produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Write(WriteResponse),
    Read(ReadResponse),
}

impl Response {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Write(_) => MessageKind::Write,
            Self::Read(_) => MessageKind::Read,
        }
    }

    pub fn error(&self) -> ErrorCode {
        match self {
            Self::Write(rsp) => rsp.error,
            Self::Read(rsp) => rsp.error,
        }
    }
}

impl From<WriteRequest> for Request {
    fn from(req: WriteRequest) -> Self {
        Self::Write(req)
    }
}

impl From<ReadRequest> for Request {
    fn from(req: ReadRequest) -> Self {
        Self::Read(req)
    }
}

impl From<WriteResponse> for Response {
    fn from(rsp: WriteResponse) -> Self {
        Self::Write(rsp)
    }
}

impl From<ReadResponse> for Response {
    fn from(rsp: ReadResponse) -> Self {
        Self::Read(rsp)
    }
}
