//! Request/response transport between bus nodes.
//!
//! A node sends a request to a remote node id and later receives exactly
//! one matching response on a callback; servers register a
//! [`RequestHandler`] per message kind. The [`Endpoint`] core does the
//! transfer-id bookkeeping and dispatch; links only move encoded frames.
//!
//! Two links ship with the crate:
//! - [`LoopbackBus`]: in-process, for tests and single-process setups
//! - [`udp`]: one datagram per frame between hosts

mod endpoint;
mod loopback;
pub mod udp;

pub use endpoint::{Endpoint, Link};
pub use loopback::LoopbackBus;

use std::sync::Arc;

use busfile_protocol::{MessageKind, NodeId, Request, Response, WireError};

/// Largest encoded frame any link has to carry.
pub const MAX_FRAME_SIZE: usize = 1024;

/// Receives the single response matched to a request.
pub type ResponseCallback = Box<dyn FnOnce(Response) + Send + 'static>;

/// Errors produced by the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("no route to node {0}")]
    NoRoute(NodeId),

    #[error("link closed")]
    Closed,
}

/// Serves requests arriving from remote nodes.
///
/// Called on a blocking-capable worker thread, so implementations may do
/// synchronous I/O.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, source: NodeId, request: Request) -> Response;
}

/// Addressed request/response exchange.
pub trait Transport: Send + Sync + 'static {
    /// Node id of this end of the bus.
    fn local_node(&self) -> NodeId;

    /// Sends `request` to `destination`.
    ///
    /// Returns once the frame is handed to the link. `on_response` runs
    /// later on a transport task and is never invoked from inside this
    /// call, so callers may hold their own locks across it.
    fn request(
        &self,
        destination: NodeId,
        request: Request,
        on_response: ResponseCallback,
    ) -> Result<(), TransportError>;

    /// Routes inbound requests of `kind` to `handler`, replacing any
    /// previous registration.
    fn register_handler(&self, kind: MessageKind, handler: Arc<dyn RequestHandler>);
}
