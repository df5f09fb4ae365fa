use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use busfile_protocol::{
    ErrorCode, FilePath, MAX_READ_CHUNK, MAX_WRITE_CHUNK, NodeId, ReadRequest, Request, Response,
    WriteRequest,
};
use busfile_transport::{ResponseCallback, Transport};

use crate::{ClientConfig, ClientError, ReadCompletion, TransferMode, WriteCompletion};

/// The open transfer.
struct Session {
    id: u64,
    path: FilePath,
    mode: TransferMode,
    /// Bytes already transferred. Writes advance it on submission, reads on
    /// a successful response.
    offset: u32,
    /// Read sessions are open at once; write sessions after the first ack.
    is_open: bool,
    /// Cleared by a short read chunk.
    more: bool,
}

enum Completion {
    Write(WriteCompletion),
    Close(Option<WriteCompletion>),
    Read(ReadCompletion),
}

impl Completion {
    fn fail(self, err: ClientError) {
        match self {
            Completion::Write(cb) | Completion::Close(Some(cb)) => cb(Err(err)),
            Completion::Close(None) => {}
            Completion::Read(cb) => cb(Err(err)),
        }
    }
}

struct Pending {
    seq: u64,
    session_id: u64,
    completion: Completion,
}

#[derive(Default)]
struct ClientState {
    remote: Option<NodeId>,
    session: Option<Session>,
    pending: Option<Pending>,
    next_seq: u64,
}

impl ClientState {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }
}

/// Reads or writes one file on a remote node.
///
/// One transfer is open at a time and at most one completion is pending:
/// a new request replaces the pending completion, which then resolves
/// with [`ClientError::Superseded`]. Completions run on a transport task
/// without the client lock held, so they may call back into the client.
pub struct FileClient {
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<ClientState>>,
    config: ClientConfig,
}

impl FileClient {
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            transport,
            state: Arc::new(Mutex::new(ClientState::default())),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Node the client talks to.
    pub fn remote(&self) -> Option<NodeId> {
        self.lock().remote
    }

    /// Whether a transfer has been opened and not yet closed.
    pub fn is_active(&self) -> bool {
        self.lock().session.is_some()
    }

    /// Whether the open transfer is confirmed. A write transfer becomes
    /// open with its first acknowledged write.
    pub fn is_open(&self) -> bool {
        self.lock().session.as_ref().is_some_and(|s| s.is_open)
    }

    pub fn mode(&self) -> Option<TransferMode> {
        self.lock().session.as_ref().map(|s| s.mode)
    }

    /// Byte offset of the next request. Zero when nothing is open.
    pub fn offset(&self) -> u32 {
        self.lock().session.as_ref().map_or(0, |s| s.offset)
    }

    /// Whether a submitted request still waits for its response.
    pub fn has_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Targets `remote` and resets all transfer state.
    pub fn configure(&self, remote: NodeId) -> Result<(), ClientError> {
        let mut state = self.lock();
        if state.session.is_some() {
            return Err(ClientError::AlreadyOpen);
        }
        let dropped = state.pending.take();
        state.remote = Some(remote);
        drop(state);

        if let Some(pending) = dropped {
            pending.completion.fail(ClientError::Superseded);
        }
        info!(%remote, "file client configured");
        Ok(())
    }

    /// Starts a transfer of `path`.
    ///
    /// Nothing is sent: the remote opens the file on the first request.
    pub fn open(&self, path: &str, mode: TransferMode) -> Result<(), ClientError> {
        let mut state = self.lock();
        if state.remote.is_none() {
            return Err(ClientError::NotConfigured);
        }
        if state.session.is_some() {
            return Err(ClientError::AlreadyOpen);
        }
        let path = FilePath::new(path)?;
        debug!(%path, %mode, "transfer opened");
        let id = state.next_seq();
        state.session = Some(Session {
            id,
            path,
            mode,
            offset: 0,
            is_open: mode == TransferMode::Read,
            more: true,
        });
        Ok(())
    }

    /// Writes `data` at the current offset.
    ///
    /// The offset advances as soon as the request is submitted. A failed or
    /// short write is reported through `completion` and is not rolled back;
    /// reopen and restart to recover.
    pub fn write(&self, data: &[u8], completion: WriteCompletion) -> Result<(), ClientError> {
        let mut state = self.lock();
        let remote = state.remote.ok_or(ClientError::NotConfigured)?;
        let session = state.session.as_ref().ok_or(ClientError::NotOpen)?;
        if session.mode != TransferMode::Write {
            return Err(ClientError::WrongMode(session.mode));
        }
        if data.is_empty() {
            return Err(ClientError::EmptyChunk);
        }
        if data.len() > MAX_WRITE_CHUNK {
            return Err(ClientError::ChunkTooLarge {
                len: data.len(),
                max: MAX_WRITE_CHUNK,
            });
        }
        let next = u32::try_from(data.len())
            .ok()
            .and_then(|n| session.offset.checked_add(n))
            .ok_or(ClientError::OffsetOverflow)?;
        let session_id = session.id;
        let request = Request::Write(WriteRequest {
            path: session.path.clone(),
            offset: session.offset,
            data: data.to_vec(),
        });
        debug!(%remote, offset = session.offset, len = data.len(), "submitting write");

        let superseded = self.submit(
            &mut state,
            remote,
            request,
            session_id,
            Completion::Write(completion),
        )?;
        if let Some(session) = state.session.as_mut() {
            session.offset = next;
        }
        drop(state);
        resolve_superseded(superseded);
        Ok(())
    }

    /// Requests the next chunk of the file.
    ///
    /// Refused with [`ClientError::StreamFinished`] once a chunk shorter
    /// than [`MAX_READ_CHUNK`] has been received.
    pub fn read(&self, completion: ReadCompletion) -> Result<(), ClientError> {
        let mut state = self.lock();
        let remote = state.remote.ok_or(ClientError::NotConfigured)?;
        let session = state.session.as_ref().ok_or(ClientError::NotOpen)?;
        if session.mode != TransferMode::Read {
            return Err(ClientError::WrongMode(session.mode));
        }
        if !session.more {
            return Err(ClientError::StreamFinished);
        }
        let session_id = session.id;
        let request = Request::Read(ReadRequest {
            path: session.path.clone(),
            offset: session.offset,
        });
        debug!(%remote, offset = session.offset, "submitting read");

        let superseded = self.submit(
            &mut state,
            remote,
            request,
            session_id,
            Completion::Read(completion),
        )?;
        drop(state);
        resolve_superseded(superseded);
        Ok(())
    }

    /// Ends the transfer.
    ///
    /// A write transfer with data sends the end-of-stream marker, an empty
    /// write at the current offset, and `completion` receives its ack. Read
    /// transfers and write transfers that never wrote close locally. Local
    /// state is reset either way.
    pub fn close(&self, completion: Option<WriteCompletion>) -> Result<(), ClientError> {
        let mut state = self.lock();
        let remote = state.remote.ok_or(ClientError::NotConfigured)?;
        let session = state.session.take().ok_or(ClientError::NotOpen)?;

        if session.mode == TransferMode::Read || session.offset == 0 {
            drop(state);
            debug!(path = %session.path, mode = %session.mode, "transfer closed locally");
            if let Some(cb) = completion {
                cb(Ok(()));
            }
            return Ok(());
        }

        debug!(%remote, path = %session.path, offset = session.offset, "submitting end of stream");
        let request = Request::Write(WriteRequest {
            path: session.path,
            offset: session.offset,
            data: Vec::new(),
        });
        let result = self.submit(
            &mut state,
            remote,
            request,
            session.id,
            Completion::Close(completion),
        );
        drop(state);
        resolve_superseded(result?);
        Ok(())
    }

    /// Drops the transfer and any pending completion without notifying it.
    ///
    /// Recovery for a remote that stopped answering. A late response is
    /// discarded.
    pub fn abort(&self) {
        let mut state = self.lock();
        let session = state.session.take();
        let pending = state.pending.take();
        drop(state);

        if let Some(session) = &session {
            info!(path = %session.path, offset = session.offset, "transfer aborted");
        }
        drop(pending);
    }

    fn submit(
        &self,
        state: &mut ClientState,
        remote: NodeId,
        request: Request,
        session_id: u64,
        completion: Completion,
    ) -> Result<Option<Completion>, ClientError> {
        let seq = state.next_seq();
        let shared = Arc::clone(&self.state);
        let on_response: ResponseCallback =
            Box::new(move |response| handle_response(&shared, seq, response));
        self.transport.request(remote, request, on_response)?;

        let replaced = state.pending.replace(Pending {
            seq,
            session_id,
            completion,
        });
        Ok(replaced.map(|p| p.completion))
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<ClientState>) -> MutexGuard<'_, ClientState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn resolve_superseded(completion: Option<Completion>) {
    if let Some(completion) = completion {
        debug!("pending completion superseded");
        completion.fail(ClientError::Superseded);
    }
}

fn remote_result(code: ErrorCode) -> Result<(), ClientError> {
    if code.is_ok() {
        Ok(())
    } else {
        Err(ClientError::Remote(code))
    }
}

fn handle_response(shared: &Mutex<ClientState>, seq: u64, response: Response) {
    let mut state = lock(shared);
    let Some(pending) = state.pending.take_if(|p| p.seq == seq) else {
        debug!(seq, "stale response dropped");
        return;
    };
    let session = state
        .session
        .as_mut()
        .filter(|s| s.id == pending.session_id);

    let resolve: Box<dyn FnOnce() + Send> = match (pending.completion, response) {
        (Completion::Write(cb), Response::Write(rsp)) => {
            let result = remote_result(rsp.error);
            if let (Ok(()), Some(session)) = (&result, session) {
                session.is_open = true;
            }
            Box::new(move || cb(result))
        }
        (Completion::Close(cb), Response::Write(rsp)) => {
            let result = remote_result(rsp.error);
            Box::new(move || {
                if let Some(cb) = cb {
                    cb(result);
                }
            })
        }
        (Completion::Read(cb), Response::Read(rsp)) => {
            let result = remote_result(rsp.error).map(|()| {
                if let Some(session) = session {
                    advance_read(session, rsp.data.len());
                }
                rsp.data
            });
            Box::new(move || cb(result))
        }
        (completion, _) => Box::new(move || completion.fail(ClientError::UnexpectedResponse)),
    };
    drop(state);
    resolve();
}

fn advance_read(session: &mut Session, len: usize) {
    match u32::try_from(len)
        .ok()
        .and_then(|n| session.offset.checked_add(n))
    {
        Some(next) => session.offset = next,
        None => session.more = false,
    }
    if len < MAX_READ_CHUNK {
        session.more = false;
    }
}
