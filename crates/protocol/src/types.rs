use serde::{Deserialize, Serialize};

use crate::constants::{MAX_NODE_ID, MAX_PATH_LEN};
use crate::error::ErrorCode;

/// Address of a node on the bus.
///
/// Zero is reserved for "unset" and is never a valid `NodeId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct NodeId(u8);

impl NodeId {
    pub const MIN: NodeId = NodeId(1);
    pub const MAX: NodeId = NodeId(MAX_NODE_ID);

    /// Returns `None` for 0 and for ids above [`MAX_NODE_ID`].
    pub fn new(id: u8) -> Option<Self> {
        if id == 0 || id > MAX_NODE_ID {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for NodeId {
    type Error = InvalidNodeId;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidNodeId(value))
    }
}

impl From<NodeId> for u8 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for NodeId {
    type Err = InvalidNodeId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u8 = s.trim().parse().map_err(|_| InvalidNodeId(0))?;
        Self::try_from(raw)
    }
}

/// Rejected node id value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid node id {0} (expected 1..={max})", max = MAX_NODE_ID)]
pub struct InvalidNodeId(pub u8);

/// Errors from building or interpreting a path field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path is {len} bytes, field holds {max}", max = MAX_PATH_LEN - 1)]
    TooLong { len: usize },

    #[error("path contains an interior NUL byte")]
    InteriorNul,

    #[error("path field is not NUL-terminated")]
    Unterminated,

    #[error("path is not valid UTF-8")]
    InvalidUtf8,
}

impl PathError {
    /// Protocol code reported when a request carries this path.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TooLong { .. } | Self::Unterminated => ErrorCode::ENAMETOOLONG,
            Self::InteriorNul | Self::InvalidUtf8 => ErrorCode::EINVAL,
        }
    }
}

/// The path field of a file request, exactly as carried on the wire.
///
/// A well-formed field holds the path bytes followed by a NUL terminator.
/// Equality compares the whole field byte-for-byte, so two requests name
/// the same file only when their fields are identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FilePath {
    bytes: Vec<u8>,
}

impl FilePath {
    /// Builds a terminated path field from a string.
    pub fn new(path: &str) -> Result<Self, PathError> {
        if path.as_bytes().contains(&0) {
            return Err(PathError::InteriorNul);
        }
        if path.len() >= MAX_PATH_LEN {
            return Err(PathError::TooLong { len: path.len() });
        }
        let mut bytes = Vec::with_capacity(path.len() + 1);
        bytes.extend_from_slice(path.as_bytes());
        bytes.push(0);
        Ok(Self { bytes })
    }

    /// Wraps raw field bytes without validating termination.
    ///
    /// Returns `None` if the bytes do not fit the field.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > MAX_PATH_LEN {
            return None;
        }
        Some(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// Raw field bytes, terminator included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns the path up to its terminator.
    ///
    /// Fails with [`PathError::Unterminated`] when the field holds no NUL.
    pub fn as_str(&self) -> Result<&str, PathError> {
        let end = self
            .bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or(PathError::Unterminated)?;
        std::str::from_utf8(&self.bytes[..end]).map_err(|_| PathError::InvalidUtf8)
    }
}

impl std::fmt::Display for FilePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.as_str() {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "{}", String::from_utf8_lossy(&self.bytes)),
        }
    }
}
