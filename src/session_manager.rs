use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::GateContext;
use crate::error::GateError;
use crate::host::{JoinRejection, JoinRequest};
use crate::observability;
use crate::session::{ClientSession, ConnectionState};
use crate::transport_adapter::{Datagram, PeerId, TransportError};

/// Live sessions keyed by peer.
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<PeerId, Arc<ClientSession>>>,
}

impl SessionTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, Arc<ClientSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, peer: PeerId) -> Option<Arc<ClientSession>> {
        self.lock().get(&peer).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Removes `session` only if it is still the one registered for `peer`.
    pub(crate) fn remove(&self, peer: PeerId, session: &Arc<ClientSession>) -> bool {
        let mut sessions = self.lock();
        match sessions.get(&peer) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&peer);
                true
            }
            _ => false,
        }
    }
}

enum Admission {
    Readmit(Arc<ClientSession>),
    Started(Arc<ClientSession>),
    Failed(GateError),
}

/// Entry point the host calls for joins and incoming gate packets.
pub struct SessionManager {
    ctx: Arc<GateContext>,
    table: Arc<SessionTable>,
}

impl SessionManager {
    pub fn new(ctx: Arc<GateContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            table: Arc::new(SessionTable::default()),
        })
    }

    pub fn context(&self) -> &Arc<GateContext> {
        &self.ctx
    }

    pub fn session(&self, peer: PeerId) -> Option<Arc<ClientSession>> {
        self.table.get(peer)
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.table
    }

    /// Set after an internal failure; joins are then refused.
    pub fn has_failed(&self) -> bool {
        self.ctx.has_failed()
    }

    /// Holds `request` until the peer passes or fails the handshake.
    pub async fn on_connection_requested(&self, request: JoinRequest) -> Result<(), GateError> {
        let peer = request.peer;
        if !self.ctx.config.enabled {
            debug!(peer = %peer, "gate disabled, admitting");
            self.ctx.host.release_join(peer, request).await;
            return Ok(());
        }
        if self.has_failed() {
            self.ctx.host.cancel_join(peer, JoinRejection::TicketCanceled).await;
            return Err(GateError::protocol("gate stopped after an internal failure"));
        }

        let Some(origin) = self
            .ctx
            .transport
            .session_state(peer)
            .filter(|state| state.connection_active)
            .map(|state| state.remote_ip)
        else {
            warn!(peer = %peer, "join from a peer without an active link");
            self.ctx.host.cancel_join(peer, JoinRejection::TicketCanceled).await;
            return Err(TransportError::UnknownPeer.into());
        };

        let admission = {
            let mut sessions = self.table.lock();
            let validated = sessions
                .get(&peer)
                .filter(|s| s.state() == ConnectionState::Connected && s.origin() == origin)
                .cloned();
            if let Some(existing) = validated {
                Admission::Readmit(existing)
            } else {
                if let Some(old) = sessions.remove(&peer) {
                    info!(peer = %peer, "replacing previous session");
                    old.close();
                }
                match ClientSession::new(Arc::clone(&self.ctx), Arc::downgrade(&self.table), request.clone(), origin) {
                    Ok(session) => {
                        sessions.insert(peer, Arc::clone(&session));
                        Admission::Started(session)
                    }
                    Err(err) => Admission::Failed(err),
                }
            }
        };

        match admission {
            Admission::Readmit(session) => {
                session.readmit(request).await;
                Ok(())
            }
            Admission::Started(session) => {
                if let Err(err) = session.start() {
                    session.fail(err).await;
                }
                Ok(())
            }
            Admission::Failed(err) => self.internal_failure(peer, err).await,
        }
    }

    async fn internal_failure(&self, peer: PeerId, err: GateError) -> Result<(), GateError> {
        self.ctx.halt_on(&err);
        observability::record_error(err.kind());
        self.ctx.host.cancel_join(peer, JoinRejection::TicketCanceled).await;
        Err(err)
    }

    /// Decrypts with the token this side expects from `from` and hands the
    /// message to its session.
    pub async fn on_packet(&self, from: PeerId, bytes: Vec<u8>) {
        observability::record_packet_received();
        let Some(session) = self.table.get(from) else {
            debug!(peer = %from, "packet from a peer without a session");
            return;
        };
        let key = self.ctx.tokens.pending_for(from);
        match self.ctx.protocol.decode(&bytes, key.as_deref()) {
            Ok(message) => session.handle(message).await,
            Err(err) if session.payload_dispatched() => {
                debug!(peer = %from, error = %err, "dropping undecodable packet after dispatch");
            }
            Err(err) => session.fail(err.into()).await,
        }
    }

    pub fn on_peer_left(&self, peer: PeerId) {
        let removed = self.table.lock().remove(&peer);
        if let Some(session) = removed {
            session.close();
            self.ctx.tokens.forget(peer);
            info!(peer = %peer, "peer left, session dropped");
        }
    }

    /// Feeds packets from the transport until the inbox closes.
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Datagram>) {
        while let Some(Datagram { from, bytes }) = inbox.recv().await {
            self.on_packet(from, bytes).await;
        }
        debug!("transport inbox closed");
    }
}
