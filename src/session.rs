//! Per-peer handshake state machine on the server side.
//!
//! A session is created when the host holds a join. It sends Hello, runs a
//! few decoy Chatter rounds, slips the real attestation challenge into the
//! round after the last decoy, and finally releases or cancels the held join.
//! Every handler and timer re-checks the session state before acting, so a
//! late timer on a finished session does nothing.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::challenge::{AmbientArgs, SessionParameters, SESSION_SALT_LEN};
use crate::context::GateContext;
use crate::crypto::{self, IV_LEN, SALT_LEN};
use crate::error::{ErrorKind, GateError};
use crate::hasher::{self, GeneratedHasher};
use crate::host::{JoinRejection, JoinRequest};
use crate::observability;
use crate::outcome::{ValidationResultCode, ValidationResultData};
use crate::policy;
use crate::scanner;
use crate::session_manager::SessionTable;
use crate::traffic_shaping::{JitterWindow, NoiseSchedule};
use crate::transport_adapter::{PeerId, Reliability};
use crate::wire::{
    self, ChatterPacket, HelloPacket, Message, MessageHeader, MessageTarget, ValidationRequestPacket,
    ValidationResponsePacket, ValidationResultPacket,
};

const HASHER_PURPOSE: &str = "hasher";
const DECOY_SIGNATURE_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Pending,
    Chatting,
    ValidationRequested,
    ValidationResponded,
    ValidationFinalized,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        peer: PeerId,
        from: ConnectionState,
        to: ConnectionState,
    },
}

struct SessionInner {
    state: ConnectionState,
    salt: [u8; SESSION_SALT_LEN],
    hasher: GeneratedHasher,
    hasher_secret: Zeroizing<Vec<u8>>,
    signature: Vec<u8>,
    params: SessionParameters,
    chatter_round: u8,
    chatter_length: u8,
    payload_dispatched: bool,
    client_nonce: Option<String>,
    pending_join: Option<JoinRequest>,
    hello: Vec<u8>,
    result: Option<ValidationResultData>,
}

pub struct ClientSession {
    peer: PeerId,
    origin: Ipv4Addr,
    ctx: Arc<GateContext>,
    table: Weak<SessionTable>,
    closed: AtomicBool,
    inner: Mutex<SessionInner>,
}

impl ClientSession {
    /// Prepares a session for `request`: session salt, attestation module
    /// and its signature, and the Hello challenge.
    pub fn new(
        ctx: Arc<GateContext>,
        table: Weak<SessionTable>,
        request: JoinRequest,
        origin: Ipv4Addr,
    ) -> Result<Arc<Self>, GateError> {
        let salt = salt_from_secret(ctx.secret().as_bytes())?;
        let hasher_secret = crypto::derive_session_secret(ctx.secret(), HASHER_PURPOSE, &salt);
        let hasher = hasher::make_hasher(&hasher_secret, &mut OsRng)?;
        let signature = crypto::sign_bytes(&hasher.bytes, &salt);
        let params = ctx
            .challenge
            .create_parameters(&ctx.config.challenge, salt, ctx.catalog.as_ref(), &mut OsRng);

        Ok(Arc::new(Self {
            peer: request.peer,
            origin,
            table,
            closed: AtomicBool::new(false),
            inner: Mutex::new(SessionInner {
                state: ConnectionState::Pending,
                salt,
                hasher,
                hasher_secret,
                signature,
                chatter_round: 0,
                chatter_length: params.chatter_length,
                params,
                payload_dispatched: false,
                client_nonce: None,
                pending_join: Some(request),
                hello: Vec::new(),
                result: None,
            }),
            ctx,
        }))
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn origin(&self) -> Ipv4Addr {
        self.origin
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn payload_dispatched(&self) -> bool {
        self.lock().payload_dispatched
    }

    pub fn result(&self) -> Option<ValidationResultData> {
        self.lock().result.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops all handlers and timers of this session. The held join, if any,
    /// is dropped without a host call.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let dropped = self.lock().pending_join.take();
            debug!(peer = %self.peer, held_join = dropped.is_some(), "session closed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut SessionInner, to: ConnectionState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        debug!(peer = %self.peer, from = ?from, to = ?to, "session state changed");
        self.ctx.publish(SessionEvent::StateChanged {
            peer: self.peer,
            from,
            to,
        });
    }

    fn header(&self, nonce_server: Option<String>, nonce_client: Option<String>) -> MessageHeader {
        let mut header = MessageHeader::new(self.ctx.local_id, MessageTarget::Client, self.peer);
        header.nonce_server = nonce_server;
        header.nonce_client = nonce_client;
        header
    }

    fn send_raw(&self, bytes: Vec<u8>) -> Result<(), GateError> {
        self.ctx.transport.send(self.peer, bytes, Reliability::Reliable)?;
        observability::record_packet_sent();
        Ok(())
    }

    fn send(&self, message: &Message, key: Option<&str>) -> Result<(), GateError> {
        let bytes = self.ctx.protocol.encode(message, key)?;
        self.send_raw(bytes)
    }

    fn issue_token(&self) -> Result<String, GateError> {
        self.ctx
            .tokens
            .register(self.peer, true)?
            .ok_or_else(|| GateError::protocol("token registration was skipped"))
    }

    /// Sends the plaintext Hello and arms the retry and deadline timers.
    pub fn start(self: &Arc<Self>) -> Result<(), GateError> {
        let token = self.issue_token()?;
        let bytes = {
            let mut inner = self.lock();
            let hello = HelloPacket {
                header: self.header(Some(token), None),
                session_parameters: inner.params.to_bytes()?,
                client_ip_echo: u32::from(self.origin),
                challenge_response: Vec::new(),
            };
            inner.hello = self.ctx.protocol.encode(&Message::Hello(hello), None)?;
            inner.hello.clone()
        };
        observability::record_session_opened();
        info!(peer = %self.peer, origin = %self.origin, "session started");
        self.send_raw(bytes)?;
        self.spawn_hello_retry();
        self.spawn_deadline();
        Ok(())
    }

    fn spawn_hello_retry(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let timing = &session.ctx.config.timing;
            for attempt in 1..=timing.hello_retries_max {
                tokio::time::sleep(timing.hello_retry_delay()).await;
                let bytes = {
                    let inner = session.lock();
                    if session.is_closed() || inner.state != ConnectionState::Pending {
                        return;
                    }
                    inner.hello.clone()
                };
                debug!(peer = %session.peer, attempt, "re-sending hello");
                if let Err(err) = session.send_raw(bytes) {
                    warn!(peer = %session.peer, error = %err, "hello retry failed");
                    return;
                }
            }
        });
    }

    fn spawn_deadline(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(session.ctx.config.timing.validation_deadline()).await;
            session.on_deadline().await;
        });
    }

    async fn on_deadline(self: &Arc<Self>) {
        let pending = {
            let mut inner = self.lock();
            if self.is_closed() || inner.state >= ConnectionState::ValidationResponded {
                return;
            }
            self.transition(&mut inner, ConnectionState::Disconnected);
            inner.pending_join.take()
        };
        warn!(peer = %self.peer, "validation deadline passed");
        observability::record_session_timed_out();
        observability::record_error(ErrorKind::Timeout);
        if pending.is_some() {
            self.ctx
                .host
                .cancel_join(self.peer, JoinRejection::NotInGroup)
                .await;
        }
        self.dispose();
    }

    /// Routes a decoded message. Any failure rejects the session.
    pub async fn handle(self: &Arc<Self>, message: Message) {
        if self.is_closed() {
            return;
        }
        let result = match message {
            Message::Hello(packet) => self.handle_hello(packet),
            Message::Chatter(packet) => self.handle_chatter(packet),
            Message::ValidationResponse(packet) => self.handle_validation_response(packet).await,
            other => Err(GateError::protocol(format!(
                "unexpected packet {} from client",
                other.packet_id()
            ))),
        };
        if let Err(err) = result {
            self.fail(err).await;
        }
    }

    pub(crate) async fn fail(self: &Arc<Self>, err: GateError) {
        let kind = err.kind();
        observability::record_error(kind);
        if kind == ErrorKind::Security {
            warn!(target: "security", peer = %self.peer, error = %err, "security violation");
        } else {
            warn!(peer = %self.peer, kind = ?kind, error = %err, "session failed");
        }
        self.reject(err.result_code(), Vec::new()).await;
    }

    fn check_addressing(&self, header: &MessageHeader) -> Result<(), GateError> {
        header
            .check_addressing(self.ctx.local_id, self.peer, MessageTarget::Server)
            .map_err(GateError::Protocol)
    }

    fn consume_server_nonce(&self, header: &MessageHeader) -> Result<String, GateError> {
        let echo = header
            .nonce_server
            .clone()
            .ok_or_else(|| GateError::protocol("missing server nonce"))?;
        match self.ctx.tokens.validate(self.peer, &echo) {
            ValidationResultCode::ValidToken => Ok(echo),
            code => Err(GateError::Token(code)),
        }
    }

    fn check_response(&self, inner: &SessionInner, response: &[u8]) -> Result<(), GateError> {
        let ambient = AmbientArgs {
            peer_ip: self.origin,
            peer_id: self.peer,
            session_salt: inner.salt,
            catalog: self.ctx.catalog.as_ref(),
        };
        if !self.ctx.challenge.passes(&inner.params, response, &ambient)? {
            return Err(GateError::security("challenge response rejected"));
        }
        Ok(())
    }

    fn handle_hello(self: &Arc<Self>, packet: HelloPacket) -> Result<(), GateError> {
        self.check_addressing(&packet.header)?;
        let client_nonce = packet
            .header
            .nonce_client
            .clone()
            .ok_or_else(|| GateError::protocol("hello without client nonce"))?;

        let mut inner = self.lock();
        if inner.state != ConnectionState::Pending {
            return Err(GateError::protocol(format!("hello in state {:?}", inner.state)));
        }
        inner.client_nonce = Some(client_nonce);
        self.consume_server_nonce(&packet.header)?;
        self.check_response(&inner, &packet.challenge_response)?;
        self.transition(&mut inner, ConnectionState::Chatting);
        self.send_chatter(&mut inner)
    }

    fn handle_chatter(self: &Arc<Self>, packet: ChatterPacket) -> Result<(), GateError> {
        self.check_addressing(&packet.header)?;

        let mut inner = self.lock();
        if inner.payload_dispatched {
            debug!(peer = %self.peer, "ignoring chatter after payload dispatch");
            return Ok(());
        }
        if inner.state != ConnectionState::Chatting {
            return Err(GateError::protocol(format!("chatter in state {:?}", inner.state)));
        }
        self.consume_server_nonce(&packet.header)?;
        inner.client_nonce = Some(
            packet
                .header
                .nonce_client
                .clone()
                .ok_or_else(|| GateError::protocol("chatter without client nonce"))?,
        );
        self.check_response(&inner, &packet.chatter_response)?;
        self.send_chatter(&mut inner)
    }

    /// Sends the next chatter round. The round after the last decoy carries
    /// the real attestation challenge.
    fn send_chatter(self: &Arc<Self>, inner: &mut SessionInner) -> Result<(), GateError> {
        let client_nonce = inner
            .client_nonce
            .clone()
            .ok_or_else(|| GateError::protocol("no client nonce to encrypt under"))?;
        let server_nonce = self.issue_token()?;
        let params = self.ctx.challenge.create_parameters(
            &self.ctx.config.challenge,
            inner.salt,
            self.ctx.catalog.as_ref(),
            &mut OsRng,
        );
        let real = inner.chatter_round >= inner.chatter_length && !inner.payload_dispatched;
        let header = self.header(Some(server_nonce), Some(client_nonce.clone()));
        let payload = if real {
            attestation_request(inner, header.clone(), &client_nonce)?
        } else {
            decoy_request(inner, header.clone())
        };
        let packet = ChatterPacket {
            header,
            chatter_parameters: params.to_bytes()?,
            chatter_response: Vec::new(),
            chatter_payload: wire::encode(&payload)?,
        };
        inner.params = params;
        inner.chatter_round = inner.chatter_round.saturating_add(1);
        self.send(&Message::Chatter(packet), Some(&client_nonce))?;

        if real {
            inner.payload_dispatched = true;
            self.transition(inner, ConnectionState::ValidationRequested);
            self.spawn_noise();
        }
        Ok(())
    }

    fn spawn_noise(self: &Arc<Self>) {
        let timing = &self.ctx.config.timing;
        let window = match JitterWindow::from_timing(timing) {
            Ok(window) => window,
            Err(reason) => {
                warn!(reason, "noise chatter disabled");
                return;
            }
        };
        let mut schedule = NoiseSchedule::new(window, timing.noise_messages);
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(wait) = schedule.next_delay(&mut OsRng) {
                tokio::time::sleep(wait).await;
                if let Err(err) = session.send_noise() {
                    debug!(peer = %session.peer, error = %err, "noise chatter stopped");
                    return;
                }
            }
        });
    }

    fn send_noise(&self) -> Result<(), GateError> {
        let inner = self.lock();
        if self.is_closed() || inner.state == ConnectionState::Disconnected {
            return Err(GateError::protocol("session is over"));
        }
        let client_nonce = inner.client_nonce.clone();
        let header = self.header(self.ctx.tokens.pending_for(self.peer), client_nonce.clone());
        let params = self.ctx.challenge.create_parameters(
            &self.ctx.config.challenge,
            inner.salt,
            self.ctx.catalog.as_ref(),
            &mut OsRng,
        );
        let packet = ChatterPacket {
            chatter_parameters: params.to_bytes()?,
            chatter_response: Vec::new(),
            chatter_payload: wire::encode(&decoy_request(&inner, header.clone()))?,
            header,
        };
        drop(inner);
        self.send(&Message::Chatter(packet), client_nonce.as_deref())
    }

    async fn handle_validation_response(self: &Arc<Self>, packet: ValidationResponsePacket) -> Result<(), GateError> {
        self.check_addressing(&packet.header)?;
        let nonce_server = packet
            .header
            .nonce_server
            .clone()
            .ok_or_else(|| GateError::protocol("validation response without server nonce"))?;

        let (hasher_secret, slots, hasher_bytes, salt, signature) = {
            let mut inner = self.lock();
            if inner.state != ConnectionState::ValidationRequested {
                return Err(GateError::protocol(format!(
                    "validation response in state {:?}",
                    inner.state
                )));
            }
            if let Some(nonce) = &packet.header.nonce_client {
                inner.client_nonce = Some(nonce.clone());
            }
            self.transition(&mut inner, ConnectionState::ValidationResponded);
            (
                inner.hasher_secret.clone(),
                inner.hasher.slots.clone(),
                inner.hasher.bytes.clone(),
                inner.salt,
                inner.signature.clone(),
            )
        };

        let fingerprints = packet
            .plugin_hashes
            .iter()
            .map(|hash| scanner::unscramble(hash, nonce_server.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| GateError::protocol(format!("bad plugin fingerprint: {}", err)))?;

        let equivalent = hasher::make_server_equivalent(&hasher_secret, &slots).and_then(|equivalent| {
            hasher::verify(&equivalent.bytes)?;
            Ok(equivalent)
        });
        let equivalent = match equivalent {
            Ok(equivalent) => equivalent,
            Err(err) => {
                let err = GateError::from(err);
                self.ctx.halt_on(&err);
                return Err(err);
            }
        };
        // The stored module and its signature live in session memory until
        // now; a mismatch means they were altered after dispatch.
        if !crypto::verify_signature(&hasher_bytes, &salt, &signature) {
            return Err(GateError::security("attestation module signature mismatch"));
        }

        let data = policy::validate(
            &self.ctx,
            self.peer,
            &nonce_server,
            Some(packet.attestation.as_str()),
            &equivalent.bytes,
            &fingerprints,
        );
        {
            let mut inner = self.lock();
            self.transition(&mut inner, ConnectionState::ValidationFinalized);
            inner.result = Some(data.clone());
        }
        if data.success {
            self.accept(data).await;
        } else {
            self.reject(data.code, data.plugin_list).await;
        }
        Ok(())
    }

    fn send_result(&self, data: &ValidationResultData, key: Option<&str>) {
        let packet = ValidationResultPacket {
            header: self.header(None, key.map(str::to_string)),
            success: data.success,
            code: data.code,
            reason: data.code.reason().to_string(),
            plugin_list: data.plugin_list.clone(),
        };
        if let Err(err) = self.send(&Message::ValidationResult(packet), key) {
            debug!(peer = %self.peer, error = %err, "could not deliver validation result");
        }
    }

    async fn accept(self: &Arc<Self>, data: ValidationResultData) {
        let (pending, key) = {
            let mut inner = self.lock();
            if self.is_closed() || inner.state != ConnectionState::ValidationFinalized {
                return;
            }
            self.transition(&mut inner, ConnectionState::Connected);
            (inner.pending_join.take(), inner.client_nonce.clone())
        };
        observability::record_session_accepted();
        self.send_result(&data, key.as_deref());
        info!(peer = %self.peer, "connection accepted");
        if let Some(request) = pending {
            self.ctx.host.release_join(self.peer, request).await;
        }
    }

    /// Sends the rejection to the client and cancels the held join after
    /// the disconnect delay.
    async fn reject(self: &Arc<Self>, code: ValidationResultCode, plugin_list: Vec<String>) {
        let data = ValidationResultData::rejected(code, plugin_list);
        let (pending, key) = {
            let mut inner = self.lock();
            if self.is_closed() || inner.state == ConnectionState::Disconnected {
                return;
            }
            self.transition(&mut inner, ConnectionState::Disconnected);
            inner.result = Some(data.clone());
            (inner.pending_join.take(), inner.client_nonce.clone())
        };
        observability::record_session_rejected();
        self.send_result(&data, key.as_deref());
        info!(peer = %self.peer, code = ?code, reason = code.reason(), "connection rejected");

        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(session.ctx.config.timing.disconnect_delay()).await;
            if pending.is_some() {
                session
                    .ctx
                    .host
                    .cancel_join(session.peer, JoinRejection::TicketCanceled)
                    .await;
            }
            session.dispose();
        });
    }

    /// Re-admits a peer whose earlier session finished successfully.
    pub async fn readmit(&self, request: JoinRequest) {
        info!(peer = %self.peer, "re-admitting validated peer");
        self.ctx.host.release_join(self.peer, request).await;
    }

    fn dispose(self: &Arc<Self>) {
        self.closed.store(true, Ordering::Release);
        self.ctx.tokens.forget(self.peer);
        if let Some(table) = self.table.upgrade() {
            table.remove(self.peer, self);
        }
    }
}

/// 16 bytes of the instance secret at a random offset.
fn salt_from_secret(secret: &[u8]) -> Result<[u8; SESSION_SALT_LEN], GateError> {
    if secret.len() < SESSION_SALT_LEN {
        return Err(GateError::protocol("instance secret is shorter than a session salt"));
    }
    let offset = OsRng.gen_range(0..=secret.len() - SESSION_SALT_LEN);
    let mut salt = [0u8; SESSION_SALT_LEN];
    salt.copy_from_slice(&secret[offset..offset + SESSION_SALT_LEN]);
    Ok(salt)
}

/// `AES(module) || iv || salt` under the client's nonce, plus the module
/// signature.
fn attestation_request(
    inner: &SessionInner,
    header: MessageHeader,
    client_nonce: &str,
) -> Result<ValidationRequestPacket, GateError> {
    let (mut challenge, iv) = crypto::encrypt(&inner.hasher.bytes, client_nonce, &inner.salt)?;
    challenge.extend_from_slice(&iv);
    challenge.extend_from_slice(&inner.salt);
    Ok(ValidationRequestPacket {
        header,
        attestation_challenge: challenge,
        attestation_signature: inner.signature.clone(),
    })
}

/// Random bytes shaped like a real attestation challenge.
fn decoy_request(inner: &SessionInner, header: MessageHeader) -> ValidationRequestPacket {
    let padded = (inner.hasher.bytes.len() / 16 + 1) * 16;
    let mut challenge = vec![0u8; padded + IV_LEN + SALT_LEN];
    OsRng.fill_bytes(&mut challenge);
    let mut signature = vec![0u8; DECOY_SIGNATURE_LEN];
    OsRng.fill_bytes(&mut signature);
    ValidationRequestPacket {
        header,
        attestation_challenge: challenge,
        attestation_signature: signature,
    }
}
