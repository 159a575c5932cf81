use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Host-assigned identity of a remote player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl PeerId {
    pub fn high_half(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn low_half(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Reliable,
    Unreliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection lost")]
    ConnectionLost,

    #[error("write blocked")]
    WriteBlocked,

    #[error("unknown peer")]
    UnknownPeer,
}

/// What the host knows about its link to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSessionState {
    pub remote_ip: Ipv4Addr,
    pub connection_active: bool,
}

/// Host packet channel used by both halves of the protocol.
pub trait PeerTransport: Send + Sync {
    fn local_id(&self) -> PeerId;

    fn send(&self, peer: PeerId, bytes: Vec<u8>, reliability: Reliability) -> Result<(), TransportError>;

    fn session_state(&self, peer: PeerId) -> Option<PeerSessionState>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: PeerId,
    pub bytes: Vec<u8>,
}

struct Endpoint {
    inbox: mpsc::UnboundedSender<Datagram>,
    address: Ipv4Addr,
}

/// In-process network connecting any number of [`LoopbackTransport`]s.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    endpoints: Arc<Mutex<HashMap<PeerId, Endpoint>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(
        &self,
        id: PeerId,
        address: Ipv4Addr,
    ) -> (Arc<LoopbackTransport>, mpsc::UnboundedReceiver<Datagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Endpoint { inbox: tx, address });
        let transport = Arc::new(LoopbackTransport {
            id,
            network: self.clone(),
        });
        (transport, rx)
    }

    pub fn disconnect(&self, id: PeerId) {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

pub struct LoopbackTransport {
    id: PeerId,
    network: LoopbackNetwork,
}

impl PeerTransport for LoopbackTransport {
    fn local_id(&self) -> PeerId {
        self.id
    }

    fn send(&self, peer: PeerId, bytes: Vec<u8>, _reliability: Reliability) -> Result<(), TransportError> {
        let endpoints = self
            .network
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let endpoint = endpoints.get(&peer).ok_or(TransportError::UnknownPeer)?;
        endpoint
            .inbox
            .send(Datagram { from: self.id, bytes })
            .map_err(|_| TransportError::ConnectionLost)
    }

    fn session_state(&self, peer: PeerId) -> Option<PeerSessionState> {
        let endpoints = self
            .network
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        endpoints.get(&peer).map(|endpoint| PeerSessionState {
            remote_ip: endpoint.address,
            connection_active: !endpoint.inbox.is_closed(),
        })
    }
}
