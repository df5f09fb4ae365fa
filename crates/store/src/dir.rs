use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::validation::resolve_store_path;
use crate::{BackingStore, DEFAULT_MAX_OPEN, Fd, OpenMode, StoreError};

/// Serves files from a directory on the local filesystem.
///
/// Each descriptor owns its own `File` behind a mutex, so I/O on one
/// descriptor never waits on another.
pub struct DirStore {
    root: PathBuf,
    max_open: usize,
    files: Mutex<HashMap<Fd, Arc<Mutex<File>>>>,
    next_fd: AtomicU32,
}

impl DirStore {
    /// Creates a store rooted at `root` with the default descriptor limit.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_max_open(root, DEFAULT_MAX_OPEN)
    }

    /// Creates a store that keeps at most `max_open` descriptors.
    pub fn with_max_open(root: impl Into<PathBuf>, max_open: usize) -> Self {
        Self {
            root: root.into(),
            max_open,
            files: Mutex::new(HashMap::new()),
            next_fd: AtomicU32::new(3),
        }
    }

    /// Returns the store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of descriptors currently open.
    pub fn open_count(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Fd, Arc<Mutex<File>>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn file(&self, fd: Fd) -> Result<Arc<Mutex<File>>, StoreError> {
        self.table()
            .get(&fd)
            .cloned()
            .ok_or(StoreError::BadDescriptor(fd))
    }
}

impl BackingStore for DirStore {
    fn open(&self, path: &str, mode: OpenMode) -> Result<Fd, StoreError> {
        let full_path = resolve_store_path(&self.root, path)?;

        let open_now = self.table().len();
        if open_now >= self.max_open {
            return Err(StoreError::TooManyOpen(open_now));
        }

        let file = match mode {
            OpenMode::ReadOnly => File::open(&full_path)?,
            OpenMode::WriteOnly => {
                if let Some(parent) = full_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(false)
                    .open(&full_path)?
            }
        };

        let fd = Fd(self.next_fd.fetch_add(1, Ordering::Relaxed));
        self.table().insert(fd, Arc::new(Mutex::new(file)));
        debug!(%fd, %mode, path = %full_path.display(), "store: opened");
        Ok(fd)
    }

    fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize, StoreError> {
        let file = self.file(fd)?;
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(file.read(buf)?)
    }

    fn write(&self, fd: Fd, data: &[u8]) -> Result<usize, StoreError> {
        let file = self.file(fd)?;
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(file.write(data)?)
    }

    fn seek(&self, fd: Fd, offset: u64) -> Result<u64, StoreError> {
        let file = self.file(fd)?;
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(file.seek(SeekFrom::Start(offset))?)
    }

    fn read_at(&self, fd: Fd, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError> {
        let file = self.file(fd)?;
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(offset))?;
        Ok(file.read(buf)?)
    }

    fn write_at(&self, fd: Fd, offset: u64, data: &[u8]) -> Result<usize, StoreError> {
        let file = self.file(fd)?;
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(offset))?;
        Ok(file.write(data)?)
    }

    fn close(&self, fd: Fd) -> Result<(), StoreError> {
        let file = self
            .table()
            .remove(&fd)
            .ok_or(StoreError::BadDescriptor(fd))?;
        let file = file.lock().unwrap_or_else(PoisonError::into_inner);
        file.sync_all()?;
        debug!(%fd, "store: closed");
        Ok(())
    }
}
