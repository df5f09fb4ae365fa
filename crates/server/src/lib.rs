//! File server for the bus.
//!
//! Answers write and read requests from any node against a fixed pool of
//! file sessions. Sessions are keyed by the request path: two nodes naming
//! the same path share one session and one descriptor.

mod server;
mod session;

pub use server::FileServer;
pub use session::FileSession;

use std::time::Duration;

use busfile_protocol::DEFAULT_SESSION_CAPACITY;

/// Idle time after which a session may be reclaimed for another path.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of concurrent file sessions.
    pub capacity: usize,
    /// Idle sessions older than this are closed when a slot is needed.
    /// `None` keeps sessions until their stream ends.
    pub session_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_SESSION_CAPACITY,
            session_timeout: Some(DEFAULT_SESSION_TIMEOUT),
        }
    }
}
