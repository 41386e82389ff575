//! Transport
//!
//! Non-blocking message delivery between the loops. Each loop polls its
//! transport once per tick and never awaits it, so one slow peer cannot
//! stall a tick.
//!
//! [`loopback`] builds an in-process transport over unbounded tokio
//! channels. Messages cross it as bincode bytes, exercising the same codec
//! a socket transport would.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::network::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// Connection identifier assigned by the transport.
pub type PeerId = u32;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No connection with this id.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// The other end has gone away.
    #[error("connection closed")]
    Closed,

    /// Message could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// What the server sees when polling.
#[derive(Debug)]
pub enum ServerEvent {
    /// New connection.
    Connected(PeerId),
    /// Decoded message.
    Message(PeerId, ClientMessage),
    /// Bytes that failed to decode.
    Malformed(PeerId, ProtocolError),
    /// Connection closed by the peer.
    Disconnected(PeerId),
}

/// What a client sees when polling.
#[derive(Debug)]
pub enum ClientEvent {
    /// Decoded message.
    Message(ServerMessage),
    /// Bytes that failed to decode.
    Malformed(ProtocolError),
    /// Connection closed by the server.
    Disconnected,
}

/// Server side of a transport.
pub trait ServerTransport: Send {
    /// Next pending event, if any.
    fn poll(&mut self) -> Option<ServerEvent>;

    /// Queue a message to one peer.
    fn send(&mut self, peer: PeerId, message: &ServerMessage) -> Result<(), TransportError>;

    /// Tell the peer why, then close.
    fn disconnect(&mut self, peer: PeerId, reason: &str) -> Result<(), TransportError>;

    /// Close without notice.
    fn force_disconnect(&mut self, peer: PeerId);
}

/// Client side of a transport.
pub trait ClientTransport: Send {
    /// Next pending event, if any.
    fn poll(&mut self) -> Option<ClientEvent>;

    /// Queue a message to the server.
    fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError>;
}

// =============================================================================
// LOOPBACK
// =============================================================================

enum Inbound {
    Connect(UnboundedSender<Vec<u8>>),
    Bytes(Vec<u8>),
    Close,
}

/// Create a loopback server end and a connector for its clients.
pub fn loopback() -> (LoopbackServer, LoopbackConnector) {
    let (tx, rx) = mpsc::unbounded_channel();
    let server = LoopbackServer { inbound: rx, peers: BTreeMap::new() };
    let connector = LoopbackConnector { to_server: tx, next_peer: Arc::new(AtomicU32::new(1)) };
    (server, connector)
}

/// Opens client connections to a [`LoopbackServer`].
#[derive(Clone, Debug)]
pub struct LoopbackConnector {
    to_server: UnboundedSender<(PeerId, Inbound)>,
    next_peer: Arc<AtomicU32>,
}

impl LoopbackConnector {
    /// Open a new connection.
    pub fn connect(&self) -> Result<LoopbackClient, TransportError> {
        let peer = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.to_server.send((peer, Inbound::Connect(tx))).map_err(|_| TransportError::Closed)?;
        Ok(LoopbackClient { peer, to_server: self.to_server.clone(), inbound: rx, closed: false })
    }
}

/// Server end of the loopback.
pub struct LoopbackServer {
    inbound: UnboundedReceiver<(PeerId, Inbound)>,
    peers: BTreeMap<PeerId, UnboundedSender<Vec<u8>>>,
}

impl LoopbackServer {
    /// Number of open connections.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

impl std::fmt::Debug for LoopbackServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackServer").field("peers", &self.peers.len()).finish()
    }
}

impl ServerTransport for LoopbackServer {
    fn poll(&mut self) -> Option<ServerEvent> {
        loop {
            let (peer, inbound) = self.inbound.try_recv().ok()?;
            match inbound {
                Inbound::Connect(tx) => {
                    self.peers.insert(peer, tx);
                    return Some(ServerEvent::Connected(peer));
                }
                // late bytes from a peer we already dropped
                Inbound::Bytes(_) if !self.peers.contains_key(&peer) => continue,
                Inbound::Bytes(bytes) => {
                    return Some(match ClientMessage::from_bytes(&bytes) {
                        Ok(message) => ServerEvent::Message(peer, message),
                        Err(e) => ServerEvent::Malformed(peer, e),
                    });
                }
                Inbound::Close => {
                    if self.peers.remove(&peer).is_some() {
                        return Some(ServerEvent::Disconnected(peer));
                    }
                }
            }
        }
    }

    fn send(&mut self, peer: PeerId, message: &ServerMessage) -> Result<(), TransportError> {
        let tx = self.peers.get(&peer).ok_or(TransportError::UnknownPeer(peer))?;
        let bytes = message.to_bytes()?;
        if tx.send(bytes).is_err() {
            self.peers.remove(&peer);
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn disconnect(&mut self, peer: PeerId, reason: &str) -> Result<(), TransportError> {
        let result = self.send(peer, &ServerMessage::Disconnect { reason: reason.to_string() });
        self.peers.remove(&peer);
        debug!(peer, reason, "Loopback peer disconnected");
        result
    }

    fn force_disconnect(&mut self, peer: PeerId) {
        if self.peers.remove(&peer).is_some() {
            warn!(peer, "Loopback peer force-disconnected");
        }
    }
}

/// Client end of the loopback.
pub struct LoopbackClient {
    peer: PeerId,
    to_server: UnboundedSender<(PeerId, Inbound)>,
    inbound: UnboundedReceiver<Vec<u8>>,
    closed: bool,
}

impl LoopbackClient {
    /// Id the server knows this connection by.
    pub fn peer_id(&self) -> PeerId {
        self.peer
    }

    /// Close the connection from the client side.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.to_server.send((self.peer, Inbound::Close));
        }
    }
}

impl std::fmt::Debug for LoopbackClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackClient").field("peer", &self.peer).field("closed", &self.closed).finish()
    }
}

impl ClientTransport for LoopbackClient {
    fn poll(&mut self) -> Option<ClientEvent> {
        match self.inbound.try_recv() {
            Ok(bytes) => Some(match ServerMessage::from_bytes(&bytes) {
                Ok(message) => ClientEvent::Message(message),
                Err(e) => ClientEvent::Malformed(e),
            }),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) if !self.closed => {
                self.closed = true;
                Some(ClientEvent::Disconnected)
            }
            Err(TryRecvError::Disconnected) => None,
        }
    }

    fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let bytes = message.to_bytes()?;
        self.to_server.send((self.peer, Inbound::Bytes(bytes))).map_err(|_| TransportError::Closed)
    }
}

impl Drop for LoopbackClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_send_receive() {
        let (mut server, connector) = loopback();
        let mut client = connector.connect().unwrap();
        let peer = client.peer_id();

        assert!(matches!(server.poll(), Some(ServerEvent::Connected(p)) if p == peer));
        client.send(&ClientMessage::PingCheck { tick: 4 }).unwrap();
        assert!(matches!(
            server.poll(),
            Some(ServerEvent::Message(p, ClientMessage::PingCheck { tick: 4 })) if p == peer
        ));
        assert!(server.poll().is_none());

        server.send(peer, &ServerMessage::PingCheck { tick: 9 }).unwrap();
        assert!(matches!(client.poll(), Some(ClientEvent::Message(ServerMessage::PingCheck { tick: 9 }))));
        assert!(client.poll().is_none());
    }

    #[test]
    fn test_graceful_disconnect_reaches_client() {
        let (mut server, connector) = loopback();
        let mut client = connector.connect().unwrap();
        let peer = client.peer_id();
        server.poll();

        server.disconnect(peer, "server full").unwrap();
        assert_eq!(server.peer_count(), 0);
        assert!(matches!(
            client.poll(),
            Some(ClientEvent::Message(ServerMessage::Disconnect { reason })) if reason == "server full"
        ));
        assert!(matches!(client.poll(), Some(ClientEvent::Disconnected)));
        assert!(client.poll().is_none());
        assert!(matches!(server.send(peer, &ServerMessage::PingCheck { tick: 0 }), Err(TransportError::UnknownPeer(_))));
    }

    #[test]
    fn test_client_drop_reports_disconnect() {
        let (mut server, connector) = loopback();
        let client = connector.connect().unwrap();
        let peer = client.peer_id();
        drop(client);
        assert!(matches!(server.poll(), Some(ServerEvent::Connected(_))));
        assert!(matches!(server.poll(), Some(ServerEvent::Disconnected(p)) if p == peer));
        assert!(matches!(server.send(peer, &ServerMessage::PingCheck { tick: 0 }), Err(TransportError::UnknownPeer(_))));
    }

    #[test]
    fn test_peer_ids_unique() {
        let (_server, connector) = loopback();
        let a = connector.connect().unwrap();
        let b = connector.clone().connect().unwrap();
        assert_ne!(a.peer_id(), b.peer_id());
    }
}
