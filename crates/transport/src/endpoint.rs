use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, trace, warn};

use busfile_protocol::{Body, Frame, MessageKind, NodeId, Request};

use crate::{RequestHandler, ResponseCallback, Transport, TransportError};

/// Moves encoded frames to another node.
///
/// `send` must not block; it hands the frame to a queue or socket and
/// returns.
pub trait Link: Send + Sync + 'static {
    fn send(&self, destination: NodeId, frame: Vec<u8>) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PendingKey {
    peer: NodeId,
    kind: MessageKind,
    transfer_id: u8,
}

/// One node's attachment to the bus.
///
/// Allocates transfer ids for outgoing requests, matches responses back
/// to their callbacks, and runs registered handlers for inbound requests.
pub struct Endpoint {
    node: NodeId,
    link: Arc<dyn Link>,
    handlers: RwLock<HashMap<MessageKind, Arc<dyn RequestHandler>>>,
    pending: Mutex<HashMap<PendingKey, ResponseCallback>>,
    next_transfer_id: AtomicU8,
}

impl Endpoint {
    pub fn new(node: NodeId, link: Arc<dyn Link>) -> Arc<Self> {
        Arc::new(Self {
            node,
            link,
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_transfer_id: AtomicU8::new(0),
        })
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Decodes and dispatches one inbound frame.
    ///
    /// Malformed frames and frames addressed to other nodes are dropped.
    pub fn deliver(self: &Arc<Self>, bytes: &[u8]) {
        match Frame::decode(bytes) {
            Ok(frame) => self.dispatch(frame),
            Err(e) => warn!(node = %self.node, error = %e, "dropping malformed frame"),
        }
    }

    /// Dispatches one decoded frame. Must run inside a tokio runtime.
    pub fn dispatch(self: &Arc<Self>, frame: Frame) {
        if frame.destination != self.node {
            trace!(node = %self.node, destination = %frame.destination, "frame for another node");
            return;
        }

        match frame.body {
            Body::Request(request) => {
                self.spawn_handler(frame.source, frame.transfer_id, request);
            }
            Body::Response(response) => {
                let key = PendingKey {
                    peer: frame.source,
                    kind: response.kind(),
                    transfer_id: frame.transfer_id,
                };
                // The guard is released before the callback runs.
                let callback = self.pending().remove(&key);
                match callback {
                    Some(callback) => callback(response),
                    None => debug!(
                        node = %self.node,
                        peer = %frame.source,
                        transfer_id = frame.transfer_id,
                        "unmatched response dropped"
                    ),
                }
            }
        }
    }

    fn spawn_handler(self: &Arc<Self>, source: NodeId, transfer_id: u8, request: Request) {
        let kind = request.kind();
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned();
        let Some(handler) = handler else {
            debug!(node = %self.node, %source, %kind, "no handler registered, request dropped");
            return;
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result =
                tokio::task::spawn_blocking(move || handler.handle(source, request)).await;
            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    warn!(node = %this.node, %source, %kind, error = %e, "request handler failed");
                    return;
                }
            };
            let frame = Frame {
                source: this.node,
                destination: source,
                transfer_id,
                body: Body::Response(response),
            };
            if let Err(e) = this.send_frame(&frame) {
                warn!(node = %this.node, %source, error = %e, "failed to send response");
            }
        });
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = frame.encode()?;
        self.link.send(frame.destination, bytes)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<PendingKey, ResponseCallback>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for Endpoint {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn request(
        &self,
        destination: NodeId,
        request: Request,
        on_response: ResponseCallback,
    ) -> Result<(), TransportError> {
        let transfer_id = self.next_transfer_id.fetch_add(1, Ordering::Relaxed);
        let key = PendingKey {
            peer: destination,
            kind: request.kind(),
            transfer_id,
        };
        let frame = Frame {
            source: self.node,
            destination,
            transfer_id,
            body: Body::Request(request),
        };
        let bytes = frame.encode()?;

        // Registered before sending so a fast response always finds it.
        if self.pending().insert(key, on_response).is_some() {
            warn!(node = %self.node, %destination, transfer_id, "transfer id reused while pending");
        }
        if let Err(e) = self.link.send(destination, bytes) {
            self.pending().remove(&key);
            return Err(e);
        }
        trace!(node = %self.node, %destination, transfer_id, "request sent");
        Ok(())
    }

    fn register_handler(&self, kind: MessageKind, handler: Arc<dyn RequestHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, handler);
    }
}
