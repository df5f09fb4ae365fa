use std::time::Duration;

use tokio::time::Instant;

use busfile_protocol::{FilePath, NodeId};
use busfile_store::{Fd, OpenMode};

/// One server-side file session.
///
/// A slot is free while `descriptor` is `None`; the path of a free slot is
/// only a reservation and carries no meaning.
#[derive(Debug, Clone)]
pub struct FileSession {
    pub(crate) descriptor: Option<Fd>,
    pub(crate) path: FilePath,
    pub(crate) open_mode: OpenMode,
    pub(crate) owner: Option<NodeId>,
    pub(crate) last_activity: Instant,
    /// Stream position after the last read; a request elsewhere is a reposition.
    pub(crate) cursor: u64,
}

impl FileSession {
    fn free(now: Instant) -> Self {
        Self {
            descriptor: None,
            path: FilePath::default(),
            open_mode: OpenMode::ReadOnly,
            owner: None,
            last_activity: now,
            cursor: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.descriptor.is_some()
    }

    pub fn path(&self) -> &FilePath {
        &self.path
    }

    pub fn open_mode(&self) -> OpenMode {
        self.open_mode
    }

    /// Node that touched the session last.
    pub fn owner(&self) -> Option<NodeId> {
        self.owner
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Returns `true` if the session is open and idle for at least `timeout`.
    pub(crate) fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        self.is_open() && now.saturating_duration_since(self.last_activity) >= timeout
    }
}

/// Fixed-capacity arena of sessions indexed by slot number.
pub(crate) struct SessionPool {
    slots: Box<[FileSession]>,
}

impl SessionPool {
    pub(crate) fn new(capacity: usize) -> Self {
        let now = Instant::now();
        Self {
            slots: (0..capacity).map(|_| FileSession::free(now)).collect(),
        }
    }

    /// Finds the session serving `path`, or reserves the first free slot.
    ///
    /// Returns `None` without touching any slot when the pool is full.
    pub(crate) fn acquire(&mut self, path: &FilePath) -> Option<usize> {
        if let Some(slot) = self
            .slots
            .iter()
            .position(|s| s.is_open() && s.path == *path)
        {
            return Some(slot);
        }
        let slot = self.slots.iter().position(|s| !s.is_open())?;
        self.slots[slot].path = path.clone();
        Some(slot)
    }

    /// Slot currently holding `fd`.
    pub(crate) fn find_descriptor(&mut self, fd: Fd) -> Option<&mut FileSession> {
        self.slots.iter_mut().find(|s| s.descriptor == Some(fd))
    }

    pub(crate) fn get_mut(&mut self, slot: usize) -> &mut FileSession {
        &mut self.slots[slot]
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut FileSession> {
        self.slots.iter_mut()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &FileSession> {
        self.slots.iter()
    }

    pub(crate) fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_open()).count()
    }
}
