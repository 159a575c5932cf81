//! Client half of the handshake, as run by a joining game client.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::assembly::ModuleCatalog;
use crate::challenge::{AmbientArgs, ChallengeEngine, SessionParameters, SESSION_SALT_LEN};
use crate::crypto::{self, IV_LEN, SALT_LEN};
use crate::error::GateError;
use crate::hasher::{self, ExecutionEnv};
use crate::outcome::ValidationResultCode;
use crate::protocol_engine::ProtocolEngine;
use crate::scanner;
use crate::token::TokenService;
use crate::transport_adapter::{Datagram, PeerId, PeerTransport, Reliability};
use crate::wire::{
    self, ChatterPacket, HelloPacket, Message, MessageHeader, MessageTarget, ValidationRequestPacket,
    ValidationResponsePacket, ValidationResultPacket,
};

const CLIENT_SECRET_LEN: usize = 64;
const CLIENT_TOKEN_TTL: Duration = Duration::from_secs(60);

struct AgentState {
    server: Option<PeerId>,
    origin: Ipv4Addr,
    chatter_length: u8,
    chatter_seen: u8,
    answered_hello: Option<String>,
    payload_answered: bool,
    result: Option<ValidationResultPacket>,
}

impl AgentState {
    fn new() -> Self {
        Self {
            server: None,
            origin: Ipv4Addr::UNSPECIFIED,
            chatter_length: 0,
            chatter_seen: 0,
            answered_hello: None,
            payload_answered: false,
            result: None,
        }
    }
}

pub struct ClientAgent {
    transport: Arc<dyn PeerTransport>,
    catalog: Arc<dyn ModuleCatalog>,
    engine: ChallengeEngine,
    security_marker: String,
    tokens: TokenService,
    protocol: ProtocolEngine,
    state: Mutex<AgentState>,
}

impl ClientAgent {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        catalog: Arc<dyn ModuleCatalog>,
        engine: ChallengeEngine,
        security_marker: impl Into<String>,
    ) -> Result<Self, GateError> {
        let secret = crypto::random_secret(CLIENT_SECRET_LEN);
        Ok(Self {
            transport,
            catalog,
            engine,
            security_marker: security_marker.into(),
            tokens: TokenService::new(&secret, CLIENT_TOKEN_TTL, CLIENT_TOKEN_TTL),
            protocol: ProtocolEngine::with_gate_packets()?,
            state: Mutex::new(AgentState::new()),
        })
    }

    pub fn id(&self) -> PeerId {
        self.transport.local_id()
    }

    /// Last result the server sent, if any.
    pub fn result(&self) -> Option<ValidationResultPacket> {
        self.lock().result.clone()
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_packet(&self, from: PeerId, bytes: &[u8]) -> Result<(), GateError> {
        let key = self.tokens.pending_for(from);
        let message = match self.protocol.decode(bytes, key.as_deref()) {
            Ok(message) => message,
            Err(err) if self.lock().payload_answered => {
                debug!(server = %from, error = %err, "dropping undecodable packet after attestation");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        match message {
            Message::Hello(packet) => self.on_hello(from, packet),
            Message::Chatter(packet) => self.on_chatter(from, packet),
            Message::ValidationResult(packet) => self.on_result(from, packet),
            other => Err(GateError::protocol(format!(
                "unexpected packet {} from server",
                other.packet_id()
            ))),
        }
    }

    fn check_addressing(&self, from: PeerId, header: &MessageHeader) -> Result<(), GateError> {
        header
            .check_addressing(self.id(), from, MessageTarget::Client)
            .map_err(GateError::Protocol)
    }

    /// Header for a reply to `server`, carrying a fresh client token.
    fn reply_header(&self, server: PeerId, server_nonce: &str) -> Result<MessageHeader, GateError> {
        let mut header = MessageHeader::new(self.id(), MessageTarget::Server, server);
        header.nonce_server = Some(server_nonce.to_string());
        header.nonce_client = self.tokens.register(server, true)?;
        Ok(header)
    }

    fn send(&self, server: PeerId, message: &Message, key: &str) -> Result<(), GateError> {
        let bytes = self.protocol.encode(message, Some(key))?;
        self.transport.send(server, bytes, Reliability::Reliable)?;
        Ok(())
    }

    fn ambient(&self, origin: Ipv4Addr, salt: [u8; SESSION_SALT_LEN]) -> AmbientArgs<'_> {
        AmbientArgs {
            peer_ip: origin,
            peer_id: self.id(),
            session_salt: salt,
            catalog: self.catalog.as_ref(),
        }
    }

    fn on_hello(&self, from: PeerId, packet: HelloPacket) -> Result<(), GateError> {
        self.check_addressing(from, &packet.header)?;
        let server_nonce = packet
            .header
            .nonce_server
            .clone()
            .ok_or_else(|| GateError::protocol("hello without server nonce"))?;
        let params = SessionParameters::from_bytes(&packet.session_parameters)?;
        {
            let mut state = self.lock();
            if state.answered_hello.as_deref() == Some(server_nonce.as_str()) {
                debug!(server = %from, "duplicate hello ignored");
                return Ok(());
            }
            *state = AgentState::new();
            state.server = Some(from);
            state.origin = packet.client_ip();
            state.chatter_length = params.chatter_length;
            state.answered_hello = Some(server_nonce.clone());
        }

        let response = self
            .engine
            .answer(&params, &self.ambient(packet.client_ip(), params.session_salt))?;
        let reply = HelloPacket {
            header: self.reply_header(from, &server_nonce)?,
            session_parameters: Vec::new(),
            client_ip_echo: packet.client_ip_echo,
            challenge_response: response,
        };
        debug!(server = %from, chatter_length = params.chatter_length, "answering hello");
        self.send(from, &Message::Hello(reply), &server_nonce)
    }

    fn on_chatter(&self, from: PeerId, packet: ChatterPacket) -> Result<(), GateError> {
        self.check_addressing(from, &packet.header)?;
        {
            let state = self.lock();
            if state.payload_answered || state.server != Some(from) {
                debug!(server = %from, "ignoring chatter");
                return Ok(());
            }
        }
        let server_nonce = packet
            .header
            .nonce_server
            .clone()
            .ok_or_else(|| GateError::protocol("chatter without server nonce"))?;
        let echo = packet
            .header
            .nonce_client
            .clone()
            .ok_or_else(|| GateError::protocol("chatter without client nonce"))?;
        match self.tokens.validate(from, &echo) {
            ValidationResultCode::ValidToken => {}
            code => return Err(GateError::Token(code)),
        }

        let (round, chatter_length, origin) = {
            let mut state = self.lock();
            let round = state.chatter_seen;
            state.chatter_seen = state.chatter_seen.saturating_add(1);
            (round, state.chatter_length, state.origin)
        };
        if round >= chatter_length {
            let request: ValidationRequestPacket = wire::decode(&packet.chatter_payload)?;
            return self.answer_attestation(from, request, &server_nonce, &echo);
        }

        let params = SessionParameters::from_bytes(&packet.chatter_parameters)?;
        let response = self
            .engine
            .answer(&params, &self.ambient(origin, params.session_salt))?;
        let reply = ChatterPacket {
            header: self.reply_header(from, &server_nonce)?,
            chatter_parameters: Vec::new(),
            chatter_response: response,
            chatter_payload: Vec::new(),
        };
        self.send(from, &Message::Chatter(reply), &server_nonce)
    }

    /// Decrypts, checks and runs the attestation module, then reports it
    /// together with the scrambled plugin fingerprints.
    fn answer_attestation(
        &self,
        server: PeerId,
        request: ValidationRequestPacket,
        server_nonce: &str,
        client_nonce: &str,
    ) -> Result<(), GateError> {
        let challenge = &request.attestation_challenge;
        if challenge.len() <= IV_LEN + SALT_LEN {
            return Err(GateError::protocol("attestation challenge too short"));
        }
        let (ciphertext, trailer) = challenge.split_at(challenge.len() - IV_LEN - SALT_LEN);
        let (iv, salt) = trailer.split_at(IV_LEN);
        let module = crypto::decrypt(ciphertext, client_nonce, salt, iv)?;
        if !crypto::verify_signature(&module, salt, &request.attestation_signature) {
            warn!(target: "security", server = %server, "attestation module signature mismatch");
            return Err(GateError::security("attestation module signature mismatch"));
        }

        let env = ExecutionEnv {
            catalog: self.catalog.as_ref(),
            security_marker: &self.security_marker,
        };
        let attestation = hasher::execute(&module, &env, &[])?;
        let plugin_hashes: Vec<String> = scanner::plugin_modules(self.catalog.as_ref())
            .iter()
            .map(|module| scanner::secure_fingerprint(module, server_nonce.as_bytes()))
            .collect();

        let reply = ValidationResponsePacket {
            header: self.reply_header(server, server_nonce)?,
            attestation,
            plugin_hashes,
        };
        self.lock().payload_answered = true;
        info!(server = %server, plugins = reply.plugin_hashes.len(), "sending attestation");
        self.send(server, &Message::ValidationResponse(reply), server_nonce)
    }

    fn on_result(&self, from: PeerId, packet: ValidationResultPacket) -> Result<(), GateError> {
        self.check_addressing(from, &packet.header)?;
        if packet.success {
            info!(server = %from, code = ?packet.code, "admitted");
        } else {
            warn!(server = %from, code = ?packet.code, reason = %packet.reason, plugins = ?packet.plugin_list, "rejected");
        }
        self.lock().result = Some(packet);
        Ok(())
    }

    /// Handles packets from the transport until the inbox closes.
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Datagram>) {
        while let Some(Datagram { from, bytes }) = inbox.recv().await {
            if let Err(err) = self.on_packet(from, &bytes) {
                warn!(server = %from, error = %err, "client handshake error");
            }
        }
    }
}
