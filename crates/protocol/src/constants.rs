//! Field widths and defaults shared by every node on the bus.

/// Width of the path field in read and write requests, terminator included.
pub const MAX_PATH_LEN: usize = 200;

/// Maximum payload of a single write request.
pub const MAX_WRITE_CHUNK: usize = 192;

/// Maximum payload of a single read response.
///
/// A read response carrying exactly this many bytes tells the client that
/// more data may follow; anything shorter ends the stream.
pub const MAX_READ_CHUNK: usize = 256;

/// Default number of concurrent file sessions a server keeps.
pub const DEFAULT_SESSION_CAPACITY: usize = 5;

/// Highest node id addressable on the bus.
pub const MAX_NODE_ID: u8 = 127;

/// Message kind identifier carried in every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Write = 1,
    Read = 2,
}

impl MessageKind {
    /// Decodes the kind bits of a frame header.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Write),
            2 => Some(Self::Read),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Write => f.write_str("write"),
            Self::Read => f.write_str("read"),
        }
    }
}
