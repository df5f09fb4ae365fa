use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use busfile_protocol::{
    ErrorCode, FilePath, MAX_READ_CHUNK, MessageKind, NodeId, ReadRequest, ReadResponse, Request,
    Response, WriteRequest, WriteResponse,
};
use busfile_store::{BackingStore, Fd, OpenMode};
use busfile_transport::{RequestHandler, Transport};

use crate::ServerConfig;
use crate::session::{FileSession, SessionPool};

/// Serves file reads and writes for remote nodes.
///
/// The pool lock is held for slot lookup, open and close only. Reads and
/// writes run without it so one slow file does not stall the others; each
/// one is positioned by the store itself, so requests racing on a shared
/// descriptor still land at their own offsets.
pub struct FileServer<S: BackingStore> {
    store: Arc<S>,
    config: ServerConfig,
    sessions: Mutex<SessionPool>,
}

impl<S: BackingStore> FileServer<S> {
    pub fn new(store: Arc<S>, config: ServerConfig) -> Self {
        let sessions = Mutex::new(SessionPool::new(config.capacity));
        Self {
            store,
            config,
            sessions,
        }
    }

    /// Registers this server for both message kinds on `transport`.
    pub fn register(self: &Arc<Self>, transport: &dyn Transport) {
        let handler: Arc<dyn RequestHandler> = self.clone();
        transport.register_handler(MessageKind::Write, Arc::clone(&handler));
        transport.register_handler(MessageKind::Read, handler);
        info!(
            node = %transport.local_node(),
            capacity = self.config.capacity,
            "file server registered"
        );
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Number of slots currently holding a descriptor.
    pub fn active_sessions(&self) -> usize {
        self.pool().active()
    }

    /// Snapshot of the open sessions.
    pub fn sessions(&self) -> Vec<FileSession> {
        self.pool().iter().filter(|s| s.is_open()).cloned().collect()
    }

    /// Closes every session idle for longer than the configured timeout.
    ///
    /// Returns the number of sessions closed. Does nothing without a timeout.
    pub fn reclaim_idle(&self) -> usize {
        let mut pool = self.pool();
        self.reclaim(&mut pool, Instant::now())
    }

    pub fn handle_write_request(&self, source: NodeId, req: &WriteRequest) -> WriteResponse {
        debug!(
            %source,
            path = %req.path,
            offset = req.offset,
            len = req.data.len(),
            "write request"
        );
        let now = Instant::now();

        let fd = {
            let mut pool = self.pool();
            let Some(slot) = self.acquire(&mut pool, &req.path, now) else {
                warn!(%source, path = %req.path, "no free session for write");
                return WriteResponse::error(ErrorCode::ENOSR);
            };
            let session = pool.get_mut(slot);
            session.owner = Some(source);
            session.last_activity = now;

            if session.is_open() && session.open_mode != OpenMode::WriteOnly {
                self.release(session, "mode switch");
            }

            let fd = match session.descriptor {
                Some(fd) => fd,
                None => match self.open(session, OpenMode::WriteOnly) {
                    Ok(fd) => fd,
                    Err(code) => return WriteResponse::error(code),
                },
            };

            if req.is_end_of_stream() {
                self.release(session, "end of stream");
                return WriteResponse::ok();
            }
            fd
        };

        match self.store.write_at(fd, u64::from(req.offset), &req.data) {
            Ok(n) if n < req.data.len() => {
                warn!(
                    %source,
                    path = %req.path,
                    written = n,
                    requested = req.data.len(),
                    "short write"
                );
                WriteResponse::error(ErrorCode::EAGAIN)
            }
            Ok(_) => WriteResponse::ok(),
            Err(e) => {
                warn!(%source, path = %req.path, offset = req.offset, error = %e, "write failed");
                WriteResponse::error(e.code())
            }
        }
    }

    pub fn handle_read_request(&self, source: NodeId, req: &ReadRequest) -> ReadResponse {
        debug!(%source, path = %req.path, offset = req.offset, "read request");
        let now = Instant::now();

        let (fd, cursor) = {
            let mut pool = self.pool();
            let Some(slot) = self.acquire(&mut pool, &req.path, now) else {
                warn!(%source, path = %req.path, "no free session for read");
                return ReadResponse::error(ErrorCode::ENOSR);
            };
            let session = pool.get_mut(slot);
            session.owner = Some(source);
            session.last_activity = now;

            if session.is_open() && session.open_mode != OpenMode::ReadOnly {
                self.release(session, "mode switch");
            }

            let fd = match session.descriptor {
                Some(fd) => fd,
                None => match self.open(session, OpenMode::ReadOnly) {
                    Ok(fd) => fd,
                    Err(code) => return ReadResponse::error(code),
                },
            };
            (fd, session.cursor)
        };

        let offset = u64::from(req.offset);
        if offset != cursor {
            debug!(path = %req.path, from = cursor, to = offset, "repositioning read");
        }

        let mut data = vec![0u8; MAX_READ_CHUNK];
        let mut filled = 0;
        let mut error = ErrorCode::OK;
        while filled < data.len() {
            match self.store.read_at(fd, offset + filled as u64, &mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    warn!(%source, path = %req.path, offset, error = %e, "read failed");
                    error = e.code();
                    break;
                }
            }
        }
        data.truncate(filled);

        if let Some(session) = self.pool().find_descriptor(fd) {
            session.cursor = offset + filled as u64;
        }
        ReadResponse { data, error }
    }

    fn pool(&self) -> MutexGuard<'_, SessionPool> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves a slot for `path`, reclaiming idle sessions if the pool is full.
    fn acquire(&self, pool: &mut SessionPool, path: &FilePath, now: Instant) -> Option<usize> {
        if let Some(slot) = pool.acquire(path) {
            return Some(slot);
        }
        if self.reclaim(pool, now) == 0 {
            return None;
        }
        pool.acquire(path)
    }

    fn reclaim(&self, pool: &mut SessionPool, now: Instant) -> usize {
        let Some(timeout) = self.config.session_timeout else {
            return 0;
        };
        let mut reclaimed = 0;
        for session in pool.iter_mut().filter(|s| s.is_stale(now, timeout)) {
            self.release(session, "idle timeout");
            reclaimed += 1;
        }
        reclaimed
    }

    /// Opens the session's path. On failure the slot stays free.
    fn open(&self, session: &mut FileSession, mode: OpenMode) -> Result<Fd, ErrorCode> {
        let path = session.path.as_str().map_err(|e| {
            warn!(error = %e, "rejecting path");
            e.code()
        })?;
        let fd = self.store.open(path, mode).map_err(|e| {
            warn!(path, %mode, error = %e, "open failed");
            e.code()
        })?;
        info!(path, %mode, %fd, "session opened");
        session.descriptor = Some(fd);
        session.open_mode = mode;
        session.cursor = 0;
        Ok(fd)
    }

    fn release(&self, session: &mut FileSession, reason: &str) {
        let Some(fd) = session.descriptor.take() else {
            return;
        };
        if let Err(e) = self.store.close(fd) {
            warn!(path = %session.path, %fd, error = %e, "close failed");
        }
        info!(path = %session.path, mode = %session.open_mode, %fd, reason, "session closed");
    }
}

impl<S: BackingStore> RequestHandler for FileServer<S> {
    fn handle(&self, source: NodeId, request: Request) -> Response {
        match request {
            Request::Write(req) => self.handle_write_request(source, &req).into(),
            Request::Read(req) => self.handle_read_request(source, &req).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busfile_store::{DirStore, MemStore};
    use std::time::Duration;

    fn node(raw: u8) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    fn path(p: &str) -> FilePath {
        FilePath::new(p).unwrap()
    }

    fn write(p: &str, offset: u32, data: &[u8]) -> WriteRequest {
        WriteRequest {
            path: path(p),
            offset,
            data: data.to_vec(),
        }
    }

    fn read(p: &str, offset: u32) -> ReadRequest {
        ReadRequest {
            path: path(p),
            offset,
        }
    }

    fn mem_server(capacity: usize) -> FileServer<MemStore> {
        FileServer::new(
            Arc::new(MemStore::new()),
            ServerConfig {
                capacity,
                session_timeout: None,
            },
        )
    }

    #[test]
    fn write_lands_at_offset() {
        let server = mem_server(5);
        let a = node(10);
        assert_eq!(server.handle_write_request(a, &write("/f", 0, b"hello")), WriteResponse::ok());
        assert_eq!(server.handle_write_request(a, &write("/f", 5, b" bus")), WriteResponse::ok());
        assert_eq!(server.active_sessions(), 1);
        assert_eq!(server.store().contents("/f").unwrap(), b"hello bus");
    }

    #[test]
    fn requests_beyond_capacity_get_enosr() {
        let server = mem_server(2);
        let a = node(10);
        assert!(server.handle_write_request(a, &write("/a", 0, b"1")).error.is_ok());
        assert!(server.handle_write_request(a, &write("/b", 0, b"2")).error.is_ok());

        let before = server.sessions();
        let rsp = server.handle_write_request(a, &write("/c", 0, b"3"));
        assert_eq!(rsp.error, ErrorCode::ENOSR);
        let rsp = server.handle_read_request(a, &read("/c", 0));
        assert_eq!(rsp.error, ErrorCode::ENOSR);
        assert!(rsp.data.is_empty());

        let after = server.sessions();
        assert_eq!(after.len(), 2);
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(b.path(), a.path());
            assert_eq!(b.open_mode(), a.open_mode());
        }
        assert!(server.store().contents("/c").is_none());
        assert_eq!(server.store().open_count(), 2);
    }

    #[test]
    fn identical_paths_from_different_nodes_share_a_session() {
        let server = mem_server(5);
        assert!(server.handle_write_request(node(10), &write("/shared", 0, b"abc")).error.is_ok());
        assert!(server.handle_write_request(node(11), &write("/shared", 3, b"def")).error.is_ok());
        assert_eq!(server.active_sessions(), 1);
        assert_eq!(server.store().open_count(), 1);
        assert_eq!(server.sessions()[0].owner(), Some(node(11)));
        assert_eq!(server.store().contents("/shared").unwrap(), b"abcdef");
    }

    #[test]
    fn end_of_stream_frees_the_slot() {
        let server = mem_server(1);
        let a = node(10);
        assert!(server.handle_write_request(a, &write("/a", 0, b"data")).error.is_ok());
        assert_eq!(server.active_sessions(), 1);

        assert_eq!(server.handle_write_request(a, &write("/a", 4, b"")), WriteResponse::ok());
        assert_eq!(server.active_sessions(), 0);
        assert_eq!(server.store().open_count(), 0);

        // The single slot is available to another path again.
        assert!(server.handle_write_request(a, &write("/b", 0, b"x")).error.is_ok());
        assert_eq!(server.sessions()[0].path(), &path("/b"));
    }

    #[test]
    fn empty_write_at_offset_zero_is_not_end_of_stream() {
        let server = mem_server(1);
        assert!(server.handle_write_request(node(10), &write("/a", 0, b"")).error.is_ok());
        assert_eq!(server.active_sessions(), 1);
        assert_eq!(server.store().contents("/a").unwrap(), b"");
    }

    #[test]
    fn end_of_stream_without_session_opens_and_closes() {
        let server = mem_server(1);
        assert!(server.handle_write_request(node(10), &write("/new", 8, b"")).error.is_ok());
        assert_eq!(server.active_sessions(), 0);
        assert_eq!(server.store().open_count(), 0);
        assert!(server.store().contents("/new").is_some());
    }

    #[test]
    fn read_after_write_switches_mode() {
        let server = mem_server(1);
        let a = node(10);
        assert!(server.handle_write_request(a, &write("/a", 0, b"content")).error.is_ok());
        assert_eq!(server.sessions()[0].open_mode(), OpenMode::WriteOnly);

        let rsp = server.handle_read_request(a, &read("/a", 0));
        assert!(rsp.error.is_ok());
        assert_eq!(rsp.data, b"content");
        assert_eq!(server.sessions()[0].open_mode(), OpenMode::ReadOnly);
        assert_eq!(server.store().open_count(), 1);
    }

    #[test]
    fn mode_switch_to_missing_file_closes_and_fails() {
        let dir = tempfile::tempdir().unwrap();
        let server = FileServer::new(Arc::new(DirStore::new(dir.path())), ServerConfig::default());
        let a = node(10);
        assert!(server.handle_write_request(a, &write("/gone", 0, b"x")).error.is_ok());
        std::fs::remove_file(dir.path().join("gone")).unwrap();

        let rsp = server.handle_read_request(a, &read("/gone", 0));
        assert_eq!(rsp.error, ErrorCode::ENOENT);
        assert_eq!(server.active_sessions(), 0);
        assert_eq!(server.store().open_count(), 0);
    }

    #[test]
    fn short_write_reports_eagain() {
        let server = FileServer::new(
            Arc::new(MemStore::new().with_write_limit(2)),
            ServerConfig::default(),
        );
        let rsp = server.handle_write_request(node(10), &write("/a", 0, b"abcd"));
        assert_eq!(rsp.error, ErrorCode::EAGAIN);
        // The partial write still happened and the session stays open.
        assert_eq!(server.store().contents("/a").unwrap(), b"ab");
        assert_eq!(server.active_sessions(), 1);
    }

    #[test]
    fn unterminated_path_is_enametoolong() {
        let server = mem_server(1);
        let req = WriteRequest {
            path: FilePath::from_bytes(&[b'a'; 200]).unwrap(),
            offset: 0,
            data: b"x".to_vec(),
        };
        let rsp = server.handle_write_request(node(10), &req);
        assert_eq!(rsp.error, ErrorCode::ENAMETOOLONG);
        assert_eq!(server.active_sessions(), 0);

        // The slot is still usable.
        assert!(server.handle_write_request(node(10), &write("/ok", 0, b"x")).error.is_ok());
    }

    #[test]
    fn read_of_missing_file_is_enoent_and_leaves_slot_free() {
        let server = mem_server(1);
        let rsp = server.handle_read_request(node(10), &read("/missing", 0));
        assert_eq!(rsp.error, ErrorCode::ENOENT);
        assert!(rsp.data.is_empty());
        assert_eq!(server.active_sessions(), 0);
    }

    #[test]
    fn reads_are_chunked_and_reposition_out_of_order() {
        let server = mem_server(1);
        let content: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        server.store().insert("/big", content.clone());
        let a = node(10);

        let first = server.handle_read_request(a, &read("/big", 0));
        assert_eq!(first.data, &content[..MAX_READ_CHUNK]);
        let second = server.handle_read_request(a, &read("/big", MAX_READ_CHUNK as u32));
        assert_eq!(second.data, &content[MAX_READ_CHUNK..]);
        assert!(second.error.is_ok());

        let again = server.handle_read_request(a, &read("/big", 10));
        assert_eq!(again.data, &content[10..10 + MAX_READ_CHUNK]);
        let past_end = server.handle_read_request(a, &read("/big", 400));
        assert!(past_end.data.is_empty());
        assert!(past_end.error.is_ok());
    }

    #[test]
    fn read_of_directory_forwards_store_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let server = FileServer::new(Arc::new(DirStore::new(dir.path())), ServerConfig::default());

        let rsp = server.handle_read_request(node(10), &read("/sub", 0));
        assert_eq!(rsp.error, ErrorCode::EISDIR);
        assert!(rsp.data.is_empty());
    }

    #[test]
    fn capacity_two_scenario() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("tmp")).unwrap();
        std::fs::write(dir.path().join("tmp/b"), b"bravo").unwrap();
        let server = FileServer::new(
            Arc::new(DirStore::new(dir.path())),
            ServerConfig {
                capacity: 2,
                session_timeout: None,
            },
        );
        let (a, b, c) = (node(10), node(11), node(12));

        assert!(server.handle_write_request(a, &write("/tmp/a", 0, b"01234")).error.is_ok());
        assert_eq!(server.handle_read_request(b, &read("/tmp/b", 0)).data, b"bravo");
        assert!(server.handle_write_request(a, &write("/tmp/a", 5, b"56789")).error.is_ok());

        let rsp = server.handle_write_request(c, &write("/tmp/c", 0, b"x"));
        assert_eq!(rsp.error, ErrorCode::ENOSR);

        assert!(server.handle_write_request(a, &write("/tmp/a", 10, b"")).error.is_ok());
        assert!(server.handle_write_request(c, &write("/tmp/c", 0, b"x")).error.is_ok());
        assert_eq!(std::fs::read(dir.path().join("tmp/a")).unwrap(), b"0123456789");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_reclaimed_when_full() {
        let server = FileServer::new(
            Arc::new(MemStore::new()),
            ServerConfig {
                capacity: 1,
                session_timeout: Some(Duration::from_secs(10)),
            },
        );
        let (a, b) = (node(10), node(11));
        assert!(server.handle_write_request(a, &write("/a", 0, b"1")).error.is_ok());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(server.handle_write_request(b, &write("/b", 0, b"2")).error, ErrorCode::ENOSR);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(server.handle_write_request(b, &write("/b", 0, b"2")).error.is_ok());
        assert_eq!(server.sessions()[0].path(), &path("/b"));
        assert_eq!(server.store().open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_keeps_a_session_alive() {
        let server = FileServer::new(
            Arc::new(MemStore::new()),
            ServerConfig {
                capacity: 1,
                session_timeout: Some(Duration::from_secs(10)),
            },
        );
        let a = node(10);
        for i in 0..4u32 {
            assert!(server.handle_write_request(a, &write("/a", i, b"x")).error.is_ok());
            tokio::time::advance(Duration::from_secs(8)).await;
        }
        assert_eq!(server.reclaim_idle(), 0);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(server.reclaim_idle(), 1);
        assert_eq!(server.active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_timeout_never_reclaims() {
        let server = mem_server(1);
        assert!(server.handle_write_request(node(10), &write("/a", 0, b"1")).error.is_ok());
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(server.reclaim_idle(), 0);
        assert_eq!(
            server.handle_write_request(node(11), &write("/b", 0, b"2")).error,
            ErrorCode::ENOSR
        );
    }

    #[test]
    fn concurrent_writers_on_distinct_paths() {
        let server = Arc::new(mem_server(5));
        std::thread::scope(|scope| {
            for t in 0..4u8 {
                let server = Arc::clone(&server);
                scope.spawn(move || {
                    let p = format!("/w{t}");
                    let source = node(10 + t);
                    for i in 0..50u32 {
                        let rsp = server.handle_write_request(source, &write(&p, i, &[t]));
                        assert!(rsp.error.is_ok());
                    }
                    let rsp = server.handle_write_request(source, &write(&p, 50, b""));
                    assert!(rsp.error.is_ok());
                });
            }
        });
        assert_eq!(server.active_sessions(), 0);
        for t in 0..4u8 {
            assert_eq!(server.store().contents(&format!("/w{t}")).unwrap(), vec![t; 50]);
        }
    }

    #[test]
    fn racing_writes_to_one_path_land_at_their_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let server = FileServer::new(Arc::new(DirStore::new(dir.path())), ServerConfig::default());
        let chunks = 48u8;
        let gate = std::sync::Barrier::new(usize::from(chunks));

        std::thread::scope(|scope| {
            for i in 0..chunks {
                let (server, gate) = (&server, &gate);
                scope.spawn(move || {
                    gate.wait();
                    let req = write("/f", u32::from(i) * 8, &[i; 8]);
                    assert!(server.handle_write_request(node(10), &req).error.is_ok());
                });
            }
        });
        assert_eq!(server.active_sessions(), 1);
        assert!(server.handle_write_request(node(10), &write("/f", 384, b"")).error.is_ok());

        let content = std::fs::read(dir.path().join("f")).unwrap();
        let expected: Vec<u8> = (0..chunks).flat_map(|i| [i; 8]).collect();
        assert_eq!(content, expected);
    }

    #[test]
    fn racing_reads_of_one_path_see_their_offsets() {
        let server = mem_server(1);
        let content: Vec<u8> = (0..32 * MAX_READ_CHUNK)
            .map(|i| (i / MAX_READ_CHUNK) as u8)
            .collect();
        server.store().insert("/big", content);
        let gate = std::sync::Barrier::new(32);

        std::thread::scope(|scope| {
            for i in 0..32u8 {
                let (server, gate) = (&server, &gate);
                scope.spawn(move || {
                    gate.wait();
                    let offset = u32::from(i) * MAX_READ_CHUNK as u32;
                    let rsp = server.handle_read_request(node(10), &read("/big", offset));
                    assert!(rsp.error.is_ok());
                    assert_eq!(rsp.data, vec![i; MAX_READ_CHUNK]);
                });
            }
        });
        assert_eq!(server.store().open_count(), 1);
    }

    #[test]
    fn seek_failure_is_forwarded_and_keeps_the_session() {
        let store = Arc::new(MemStore::new().with_seek_error(22));
        let server = FileServer::new(Arc::clone(&store), ServerConfig::default());
        let a = node(10);

        let rsp = server.handle_write_request(a, &write("/a", 4, b"data"));
        assert_eq!(rsp.error, ErrorCode::EINVAL);
        assert_eq!(server.active_sessions(), 1);
        assert_eq!(store.open_count(), 1);
        assert_eq!(store.contents("/a").unwrap(), b"");

        // A retry on the same descriptor succeeds once seeking works again.
        store.set_seek_error(None);
        assert!(server.handle_write_request(a, &write("/a", 4, b"data")).error.is_ok());
        assert_eq!(store.open_count(), 1);
        assert_eq!(store.contents("/a").unwrap(), b"\0\0\0\0data");
    }

    #[test]
    fn read_seek_failure_is_forwarded() {
        let store = Arc::new(MemStore::new().with_seek_error(22));
        store.insert("/r", b"abc".to_vec());
        let server = FileServer::new(Arc::clone(&store), ServerConfig::default());

        let rsp = server.handle_read_request(node(10), &read("/r", 1));
        assert_eq!(rsp.error, ErrorCode::EINVAL);
        assert!(rsp.data.is_empty());
        assert_eq!(server.active_sessions(), 1);
    }

    #[test]
    fn write_failure_is_forwarded_not_eagain() {
        let store = Arc::new(MemStore::new().with_write_error(28));
        let server = FileServer::new(Arc::clone(&store), ServerConfig::default());

        let rsp = server.handle_write_request(node(10), &write("/full", 0, b"abcd"));
        assert_eq!(rsp.error, ErrorCode::ENOSPC);
        assert_eq!(server.active_sessions(), 1);
        assert_eq!(store.contents("/full").unwrap(), b"");

        // End of stream still closes the session.
        assert!(server.handle_write_request(node(10), &write("/full", 4, b"")).error.is_ok());
        assert_eq!(server.active_sessions(), 0);
    }

    #[test]
    fn handler_dispatches_by_kind() {
        let server = mem_server(1);
        server.store().insert("/r", b"abc".to_vec());
        let rsp = server.handle(node(10), Request::Read(read("/r", 0)));
        match rsp {
            Response::Read(r) => assert_eq!(r.data, b"abc"),
            other => panic!("unexpected response: {other:?}"),
        }
        let rsp = server.handle(node(10), Request::Write(write("/r", 4, b"")));
        assert_eq!(rsp, Response::Write(WriteResponse::ok()));
    }
}
