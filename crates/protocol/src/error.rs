//! Protocol error codes.
//!
//! Responses carry a signed 16-bit code: zero is success, positive values
//! are POSIX error numbers. Backing-store failures forward the OS error
//! number unchanged; the named constants below cover the failures the
//! server reports on its own.

use std::io;

use serde::{Deserialize, Serialize};

/// Error code carried in every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i16);

impl ErrorCode {
    pub const OK: Self = Self(0);
    pub const ENOENT: Self = Self(2);
    pub const EIO: Self = Self(5);
    pub const EBADF: Self = Self(9);
    pub const EAGAIN: Self = Self(11);
    pub const EACCES: Self = Self(13);
    pub const EEXIST: Self = Self(17);
    pub const EISDIR: Self = Self(21);
    pub const EINVAL: Self = Self(22);
    pub const EMFILE: Self = Self(24);
    pub const ENOSPC: Self = Self(28);
    pub const ENAMETOOLONG: Self = Self(36);
    pub const ENOSR: Self = Self(63);
    /// Failure with no error number attached.
    pub const UNKNOWN: Self = Self(-1);

    /// Returns `true` for the success code.
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Raw wire value.
    pub fn value(self) -> i16 {
        self.0
    }

    /// Maps an I/O error onto a protocol code.
    ///
    /// The OS error number wins when present. Errors raised without one
    /// fall back to the closest POSIX number for their kind, and to
    /// [`ErrorCode::UNKNOWN`] when no such number exists.
    pub fn from_io_error(err: &io::Error) -> Self {
        if let Some(raw) = err.raw_os_error() {
            return i16::try_from(raw).map(Self).unwrap_or(Self::UNKNOWN);
        }
        match err.kind() {
            io::ErrorKind::NotFound => Self::ENOENT,
            io::ErrorKind::PermissionDenied => Self::EACCES,
            io::ErrorKind::AlreadyExists => Self::EEXIST,
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Self::EAGAIN,
            io::ErrorKind::InvalidInput => Self::EINVAL,
            io::ErrorKind::IsADirectory => Self::EISDIR,
            io::ErrorKind::StorageFull => Self::ENOSPC,
            io::ErrorKind::WriteZero | io::ErrorKind::UnexpectedEof => Self::EIO,
            _ => Self::UNKNOWN,
        }
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::OK => "OK",
            Self::ENOENT => "ENOENT",
            Self::EIO => "EIO",
            Self::EBADF => "EBADF",
            Self::EAGAIN => "EAGAIN",
            Self::EACCES => "EACCES",
            Self::EEXIST => "EEXIST",
            Self::EISDIR => "EISDIR",
            Self::EINVAL => "EINVAL",
            Self::EMFILE => "EMFILE",
            Self::ENOSPC => "ENOSPC",
            Self::ENAMETOOLONG => "ENAMETOOLONG",
            Self::ENOSR => "ENOSR",
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "error {}", self.0),
        }
    }
}

impl From<&io::Error> for ErrorCode {
    fn from(err: &io::Error) -> Self {
        Self::from_io_error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_error_number_is_forwarded() {
        let err = io::Error::from_raw_os_error(28);
        assert_eq!(ErrorCode::from_io_error(&err), ErrorCode::ENOSPC);
    }

    #[test]
    fn kind_fallback_without_os_number() {
        let err = io::Error::new(io::ErrorKind::NotFound, "missing");
        assert_eq!(ErrorCode::from_io_error(&err), ErrorCode::ENOENT);
    }

    #[test]
    fn unmapped_kind_is_unknown() {
        let err = io::Error::other("boom");
        assert_eq!(ErrorCode::from_io_error(&err), ErrorCode::UNKNOWN);
        assert!(ErrorCode::UNKNOWN.value() < 0);
    }

    #[test]
    fn display_includes_name_and_value() {
        assert_eq!(ErrorCode::ENOSR.to_string(), "ENOSR (63)");
        assert_eq!(ErrorCode(99).to_string(), "error 99");
    }

    #[test]
    fn only_zero_is_ok() {
        assert!(ErrorCode::OK.is_ok());
        assert!(!ErrorCode::EAGAIN.is_ok());
        assert!(!ErrorCode::UNKNOWN.is_ok());
    }
}
