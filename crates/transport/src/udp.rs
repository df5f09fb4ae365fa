//! UDP link: one datagram per frame.
//!
//! Peers are addressed through a static node-id table. The source address
//! of every valid inbound frame is remembered, so a server answers nodes
//! that are not in its table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use busfile_protocol::{Frame, NodeId};

use crate::endpoint::{Endpoint, Link};
use crate::{MAX_FRAME_SIZE, TransportError};

/// Sends frames as datagrams to known peers.
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    peers: RwLock<HashMap<NodeId, SocketAddr>>,
}

impl UdpLink {
    /// Records (or updates) the address of a peer.
    pub fn learn(&self, node: NodeId, addr: SocketAddr) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        if peers.insert(node, addr) != Some(addr) {
            debug!(%node, %addr, "udp: peer address learned");
        }
    }

    fn peer(&self, node: NodeId) -> Option<SocketAddr> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node)
            .copied()
    }
}

impl Link for UdpLink {
    fn send(&self, destination: NodeId, frame: Vec<u8>) -> Result<(), TransportError> {
        let addr = self
            .peer(destination)
            .ok_or(TransportError::NoRoute(destination))?;
        self.socket.try_send_to(&frame, addr)?;
        Ok(())
    }
}

/// A bound UDP endpoint and its receive task.
pub struct UdpEndpoint {
    pub endpoint: Arc<Endpoint>,
    pub link: Arc<UdpLink>,
    pub local_addr: SocketAddr,
}

/// Binds `addr`, attaches `node` and starts the receive loop.
///
/// The loop runs until `cancel` fires.
pub async fn bind(
    node: NodeId,
    addr: SocketAddr,
    peers: HashMap<NodeId, SocketAddr>,
    cancel: CancellationToken,
) -> Result<UdpEndpoint, TransportError> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    let local_addr = socket.local_addr()?;
    info!(%node, %local_addr, peers = peers.len(), "udp link bound");

    let link = Arc::new(UdpLink {
        socket: Arc::clone(&socket),
        peers: RwLock::new(peers),
    });
    let endpoint = Endpoint::new(node, link.clone());

    let receiver = Arc::clone(&endpoint);
    let learner = Arc::clone(&link);
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        loop {
            let (n, from) = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "udp: receive failed");
                        continue;
                    }
                },
            };
            match Frame::decode(&buf[..n]) {
                Ok(frame) => {
                    if frame.destination == node {
                        learner.learn(frame.source, from);
                    }
                    receiver.dispatch(frame);
                }
                Err(e) => warn!(%from, error = %e, "udp: dropping malformed datagram"),
            }
        }
        debug!(%node, "udp receive task stopped");
    });

    Ok(UdpEndpoint {
        endpoint,
        link,
        local_addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RequestHandler, Transport};
    use busfile_protocol::{
        ErrorCode, FilePath, MessageKind, ReadRequest, ReadResponse, Request, Response,
    };
    use tokio::sync::oneshot;

    struct Fixed;

    impl RequestHandler for Fixed {
        fn handle(&self, _source: NodeId, _request: Request) -> Response {
            Response::Read(ReadResponse {
                data: b"pong".to_vec(),
                error: ErrorCode::OK,
            })
        }
    }

    fn node(raw: u8) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn request_response_over_loopback_interface() {
        let cancel = CancellationToken::new();
        let server = bind(node(2), localhost(), HashMap::new(), cancel.clone())
            .await
            .unwrap();
        server
            .endpoint
            .register_handler(MessageKind::Read, Arc::new(Fixed));

        // The client knows the server; the server learns the client.
        let peers = HashMap::from([(node(2), server.local_addr)]);
        let client = bind(node(1), localhost(), peers, cancel.clone())
            .await
            .unwrap();

        let (tx, rx) = oneshot::channel();
        client
            .endpoint
            .request(
                node(2),
                Request::Read(ReadRequest {
                    path: FilePath::new("/ping").unwrap(),
                    offset: 0,
                }),
                Box::new(move |rsp| {
                    let _ = tx.send(rsp);
                }),
            )
            .unwrap();

        let rsp = tokio::time::timeout(std::time::Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        match rsp {
            Response::Read(r) => assert_eq!(r.data, b"pong"),
            other => panic!("unexpected response: {other:?}"),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_peer_has_no_route() {
        let cancel = CancellationToken::new();
        let ep = bind(node(1), localhost(), HashMap::new(), cancel.clone())
            .await
            .unwrap();
        let err = ep
            .endpoint
            .request(
                node(3),
                Request::Read(ReadRequest {
                    path: FilePath::new("/x").unwrap(),
                    offset: 0,
                }),
                Box::new(|_| {}),
            )
            .unwrap_err();
        assert!(matches!(err, TransportError::NoRoute(_)));
        cancel.cancel();
    }
}
