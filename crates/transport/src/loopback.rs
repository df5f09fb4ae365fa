//! In-process bus.
//!
//! Every attached node gets an unbounded frame queue and a receive task.
//! Frames still go through the binary codec, so the loopback exercises the
//! same path as a real link.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use busfile_protocol::NodeId;

use crate::endpoint::{Endpoint, Link};
use crate::TransportError;

type Routes = Arc<Mutex<HashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>>>;

/// A bus connecting endpoints inside one process.
pub struct LoopbackBus {
    routes: Routes,
    cancel: CancellationToken,
}

struct LoopbackLink {
    routes: Routes,
}

impl Link for LoopbackLink {
    fn send(&self, destination: NodeId, frame: Vec<u8>) -> Result<(), TransportError> {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = routes
            .get(&destination)
            .ok_or(TransportError::NoRoute(destination))?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    /// Attaches a node and starts its receive task.
    ///
    /// Must be called inside a tokio runtime. Attaching an id twice
    /// replaces the earlier route.
    pub fn attach(&self, node: NodeId) -> Arc<Endpoint> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node, tx);

        let link = Arc::new(LoopbackLink {
            routes: Arc::clone(&self.routes),
        });
        let endpoint = Endpoint::new(node, link);

        let receiver = Arc::clone(&endpoint);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(bytes) => receiver.deliver(&bytes),
                        None => break,
                    },
                }
            }
            debug!(%node, "loopback receive task stopped");
        });

        endpoint
    }

    /// Removes a node; frames sent to it fail with `NoRoute`.
    pub fn detach(&self, node: NodeId) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&node);
    }

    /// Stops every receive task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LoopbackBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RequestHandler, Transport};
    use busfile_protocol::{
        ErrorCode, FilePath, MessageKind, Request, Response, WriteRequest, WriteResponse,
    };
    use tokio::sync::oneshot;

    struct Echo;

    impl RequestHandler for Echo {
        fn handle(&self, _source: NodeId, request: Request) -> Response {
            match request {
                Request::Write(req) => {
                    let code = ErrorCode(req.data.len() as i16);
                    Response::Write(WriteResponse::error(code))
                }
                Request::Read(_) => Response::Read(Default::default()),
            }
        }
    }

    fn node(raw: u8) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    fn write(data: &[u8]) -> Request {
        Request::Write(WriteRequest {
            path: FilePath::new("/x").unwrap(),
            offset: 0,
            data: data.to_vec(),
        })
    }

    #[tokio::test]
    async fn request_reaches_handler_and_response_returns() {
        let bus = LoopbackBus::new();
        let client = bus.attach(node(10));
        let server = bus.attach(node(20));
        server.register_handler(MessageKind::Write, Arc::new(Echo));

        let (tx, rx) = oneshot::channel();
        client
            .request(
                node(20),
                write(b"abc"),
                Box::new(move |rsp| {
                    let _ = tx.send(rsp);
                }),
            )
            .unwrap();

        let rsp = rx.await.unwrap();
        assert_eq!(rsp, Response::Write(WriteResponse::error(ErrorCode(3))));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_destination_fails_synchronously() {
        let bus = LoopbackBus::new();
        let client = bus.attach(node(10));
        let err = client
            .request(node(99), write(b""), Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, TransportError::NoRoute(_)));
    }

    #[tokio::test]
    async fn request_without_handler_never_answers() {
        let bus = LoopbackBus::new();
        let client = bus.attach(node(10));
        let _silent = bus.attach(node(20));

        let (tx, rx) = oneshot::channel::<Response>();
        client
            .request(
                node(20),
                write(b"x"),
                Box::new(move |rsp| {
                    let _ = tx.send(rsp);
                }),
            )
            .unwrap();

        let waited = tokio::time::timeout(std::time::Duration::from_millis(50), rx).await;
        assert!(waited.is_err());
        assert_eq!(client.pending_count(), 1);
    }

    #[tokio::test]
    async fn detached_node_is_unreachable() {
        let bus = LoopbackBus::new();
        let client = bus.attach(node(10));
        let _server = bus.attach(node(20));
        bus.detach(node(20));
        assert!(client.request(node(20), write(b""), Box::new(|_| {})).is_err());
    }
}
