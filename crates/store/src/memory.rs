use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{BackingStore, DEFAULT_MAX_OPEN, Fd, OpenMode, StoreError};

/// Keeps files in memory.
///
/// Useful for targets without a filesystem and for tests. A write limit can
/// be set to make every `write` call persist at most that many bytes, and
/// seeks or writes can be made to fail with a fixed OS error number.
pub struct MemStore {
    inner: Mutex<MemInner>,
}

struct MemInner {
    files: HashMap<String, Vec<u8>>,
    handles: HashMap<Fd, Handle>,
    next_fd: u32,
    max_open: usize,
    write_limit: Option<usize>,
    seek_errno: Option<i32>,
    write_errno: Option<i32>,
}

struct Handle {
    path: String,
    mode: OpenMode,
    pos: u64,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemInner {
                files: HashMap::new(),
                handles: HashMap::new(),
                next_fd: 3,
                max_open: DEFAULT_MAX_OPEN,
                write_limit: None,
                seek_errno: None,
                write_errno: None,
            }),
        }
    }

    /// Caps the number of bytes a single `write` call persists.
    pub fn with_write_limit(self, limit: usize) -> Self {
        self.lock().write_limit = Some(limit);
        self
    }

    /// Makes every seek fail with OS error `errno`.
    pub fn with_seek_error(self, errno: i32) -> Self {
        self.set_seek_error(Some(errno));
        self
    }

    /// Makes every write fail with OS error `errno`.
    pub fn with_write_error(self, errno: i32) -> Self {
        self.set_write_error(Some(errno));
        self
    }

    pub fn set_seek_error(&self, errno: Option<i32>) {
        self.lock().seek_errno = errno;
    }

    pub fn set_write_error(&self, errno: Option<i32>) {
        self.lock().write_errno = errno;
    }

    /// Replaces the content of `path`.
    pub fn insert(&self, path: &str, content: impl Into<Vec<u8>>) {
        self.lock().files.insert(path.to_string(), content.into());
    }

    /// Returns a copy of the content of `path`.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    /// Number of descriptors currently open.
    pub fn open_count(&self) -> usize {
        self.lock().handles.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemInner {
    fn seek(&mut self, fd: Fd, offset: u64) -> Result<u64, StoreError> {
        let handle = self
            .handles
            .get_mut(&fd)
            .ok_or(StoreError::BadDescriptor(fd))?;
        if let Some(errno) = self.seek_errno {
            return Err(io::Error::from_raw_os_error(errno).into());
        }
        handle.pos = offset;
        Ok(offset)
    }

    fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, StoreError> {
        let handle = self
            .handles
            .get_mut(&fd)
            .ok_or(StoreError::BadDescriptor(fd))?;
        if handle.mode != OpenMode::ReadOnly {
            return Err(StoreError::BadDescriptor(fd));
        }
        let content = self.files.get(&handle.path).map(Vec::as_slice).unwrap_or(&[]);
        let start = usize::try_from(handle.pos).unwrap_or(usize::MAX).min(content.len());
        let n = buf.len().min(content.len() - start);
        buf[..n].copy_from_slice(&content[start..start + n]);
        handle.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, fd: Fd, data: &[u8]) -> Result<usize, StoreError> {
        let handle = self
            .handles
            .get_mut(&fd)
            .ok_or(StoreError::BadDescriptor(fd))?;
        if handle.mode != OpenMode::WriteOnly {
            return Err(StoreError::BadDescriptor(fd));
        }
        if let Some(errno) = self.write_errno {
            return Err(io::Error::from_raw_os_error(errno).into());
        }
        let n = self.write_limit.map_or(data.len(), |l| l.min(data.len()));
        let content = self.files.entry(handle.path.clone()).or_default();
        let start = usize::try_from(handle.pos)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        if content.len() < start + n {
            content.resize(start + n, 0);
        }
        content[start..start + n].copy_from_slice(&data[..n]);
        handle.pos += n as u64;
        Ok(n)
    }
}

impl BackingStore for MemStore {
    fn open(&self, path: &str, mode: OpenMode) -> Result<Fd, StoreError> {
        if path.is_empty() {
            return Err(StoreError::InvalidPath("empty path".into()));
        }
        let mut inner = self.lock();
        if inner.handles.len() >= inner.max_open {
            return Err(StoreError::TooManyOpen(inner.handles.len()));
        }
        match mode {
            OpenMode::ReadOnly => {
                if !inner.files.contains_key(path) {
                    return Err(io::Error::from(io::ErrorKind::NotFound).into());
                }
            }
            OpenMode::WriteOnly => {
                inner.files.entry(path.to_string()).or_default();
            }
        }
        let fd = Fd(inner.next_fd);
        inner.next_fd += 1;
        inner.handles.insert(
            fd,
            Handle {
                path: path.to_string(),
                mode,
                pos: 0,
            },
        );
        Ok(fd)
    }

    fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize, StoreError> {
        self.lock().read(fd, buf)
    }

    fn write(&self, fd: Fd, data: &[u8]) -> Result<usize, StoreError> {
        self.lock().write(fd, data)
    }

    fn seek(&self, fd: Fd, offset: u64) -> Result<u64, StoreError> {
        self.lock().seek(fd, offset)
    }

    fn read_at(&self, fd: Fd, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        inner.seek(fd, offset)?;
        inner.read(fd, buf)
    }

    fn write_at(&self, fd: Fd, offset: u64, data: &[u8]) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        inner.seek(fd, offset)?;
        inner.write(fd, data)
    }

    fn close(&self, fd: Fd) -> Result<(), StoreError> {
        self.lock()
            .handles
            .remove(&fd)
            .map(|_| ())
            .ok_or(StoreError::BadDescriptor(fd))
    }
}
