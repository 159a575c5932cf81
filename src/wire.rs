//! Protocol messages and the envelope they travel in.

use std::io::{Read, Write};
use std::net::Ipv4Addr;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{self, CryptoError, SealedPayload};
use crate::outcome::ValidationResultCode;
use crate::token::unix_now;
use crate::transport_adapter::PeerId;

pub const PACKET_HELLO: u16 = 107;
pub const PACKET_CHATTER: u16 = 108;
pub const PACKET_VALIDATION_REQUEST: u16 = 110;
pub const PACKET_VALIDATION_RESPONSE: u16 = 111;
pub const PACKET_VALIDATION_RESULT: u16 = 112;

pub const COMPRESSION_THRESHOLD: usize = 1024;
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("unknown packet id {0}")]
    UnknownPacket(u16),

    #[error("packet id {0} registered twice")]
    DuplicatePacket(u16),

    #[error("payload exceeds the size limit")]
    TooLarge,

    #[error("compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("encrypted envelope but no key for sender")]
    MissingKey,

    #[error("envelope was expected to be encrypted")]
    NotEncrypted,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageTarget {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub sender_id: PeerId,
    pub target_type: MessageTarget,
    pub target: PeerId,
    pub unix_timestamp: i64,
    /// Token issued by the server, echoed by the client.
    pub nonce_server: Option<String>,
    /// Token issued by the client, echoed by the server.
    pub nonce_client: Option<String>,
}

impl MessageHeader {
    pub fn new(sender_id: PeerId, target_type: MessageTarget, target: PeerId) -> Self {
        Self {
            sender_id,
            target_type,
            target,
            unix_timestamp: unix_now(),
            nonce_server: None,
            nonce_client: None,
        }
    }

    /// Shape checks every receiver applies before looking at the body.
    pub fn check_addressing(&self, me: PeerId, from: PeerId, expected: MessageTarget) -> Result<(), String> {
        if self.sender_id != from {
            return Err(format!("sender {} does not match link peer {}", self.sender_id, from));
        }
        if self.sender_id == me || self.sender_id.0 == 0 {
            return Err("invalid sender".to_string());
        }
        if self.target != me {
            return Err(format!("addressed to {} instead of {}", self.target, me));
        }
        if self.target_type != expected {
            return Err(format!("addressed to {:?}", self.target_type));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPacket {
    pub header: MessageHeader,
    pub session_parameters: Vec<u8>,
    /// Origin address as the server sees it.
    pub client_ip_echo: u32,
    pub challenge_response: Vec<u8>,
}

impl HelloPacket {
    pub fn client_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.client_ip_echo)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatterPacket {
    pub header: MessageHeader,
    pub chatter_parameters: Vec<u8>,
    pub chatter_response: Vec<u8>,
    /// Encoded [`ValidationRequestPacket`], real or decoy.
    pub chatter_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRequestPacket {
    pub header: MessageHeader,
    /// `AES(module) || iv || salt`.
    pub attestation_challenge: Vec<u8>,
    pub attestation_signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResponsePacket {
    pub header: MessageHeader,
    pub attestation: String,
    pub plugin_hashes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResultPacket {
    pub header: MessageHeader,
    pub success: bool,
    pub code: ValidationResultCode,
    pub reason: String,
    pub plugin_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(HelloPacket),
    Chatter(ChatterPacket),
    ValidationRequest(ValidationRequestPacket),
    ValidationResponse(ValidationResponsePacket),
    ValidationResult(ValidationResultPacket),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).map_err(|e| WireError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| WireError::Decode(e.to_string()))?;
    if read != bytes.len() {
        return Err(WireError::Decode("trailing bytes".to_string()));
    }
    Ok(value)
}

impl Message {
    pub fn packet_id(&self) -> u16 {
        match self {
            Message::Hello(_) => PACKET_HELLO,
            Message::Chatter(_) => PACKET_CHATTER,
            Message::ValidationRequest(_) => PACKET_VALIDATION_REQUEST,
            Message::ValidationResponse(_) => PACKET_VALIDATION_RESPONSE,
            Message::ValidationResult(_) => PACKET_VALIDATION_RESULT,
        }
    }

    pub fn header(&self) -> &MessageHeader {
        match self {
            Message::Hello(p) => &p.header,
            Message::Chatter(p) => &p.header,
            Message::ValidationRequest(p) => &p.header,
            Message::ValidationResponse(p) => &p.header,
            Message::ValidationResult(p) => &p.header,
        }
    }

    pub fn encode_body(&self) -> Result<Vec<u8>, WireError> {
        match self {
            Message::Hello(p) => encode(p),
            Message::Chatter(p) => encode(p),
            Message::ValidationRequest(p) => encode(p),
            Message::ValidationResponse(p) => encode(p),
            Message::ValidationResult(p) => encode(p),
        }
    }

    pub fn decode_body(packet_id: u16, body: &[u8]) -> Result<Self, WireError> {
        Ok(match packet_id {
            PACKET_HELLO => Message::Hello(decode(body)?),
            PACKET_CHATTER => Message::Chatter(decode(body)?),
            PACKET_VALIDATION_REQUEST => Message::ValidationRequest(decode(body)?),
            PACKET_VALIDATION_RESPONSE => Message::ValidationResponse(decode(body)?),
            PACKET_VALIDATION_RESULT => Message::ValidationResult(decode(body)?),
            other => return Err(WireError::UnknownPacket(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub packet_id: u16,
    pub is_compressed: bool,
    pub payload: Vec<u8>,
    pub is_encrypted: bool,
    pub wrapped_key: Vec<u8>,
    pub salt: Vec<u8>,
    pub iv: Vec<u8>,
}

impl Envelope {
    /// Seals `message` under `key` (the receiver's pending token) when given.
    pub fn wrap(message: &Message, key: Option<&str>) -> Result<Self, WireError> {
        let body = message.encode_body()?;
        if body.len() > MAX_PAYLOAD {
            return Err(WireError::TooLarge);
        }
        let is_compressed = body.len() > COMPRESSION_THRESHOLD;
        let body = if is_compressed { compress(&body)? } else { body };
        let mut envelope = Envelope {
            packet_id: message.packet_id(),
            is_compressed,
            payload: body,
            is_encrypted: false,
            wrapped_key: Vec::new(),
            salt: Vec::new(),
            iv: Vec::new(),
        };
        if let Some(token) = key {
            let sealed = crypto::seal(&envelope.payload, token)?;
            envelope.payload = sealed.ciphertext;
            envelope.wrapped_key = sealed.wrapped_key;
            envelope.salt = sealed.salt;
            envelope.iv = sealed.iv;
            envelope.is_encrypted = true;
        }
        Ok(envelope)
    }

    pub fn open(&self, key: Option<&str>) -> Result<Message, WireError> {
        let body = if self.is_encrypted {
            let token = key.ok_or(WireError::MissingKey)?;
            crypto::open(
                &SealedPayload {
                    ciphertext: self.payload.clone(),
                    wrapped_key: self.wrapped_key.clone(),
                    salt: self.salt.clone(),
                    iv: self.iv.clone(),
                },
                token,
            )?
        } else {
            self.payload.clone()
        };
        let body = if self.is_compressed { decompress(&body)? } else { body };
        Message::decode_body(self.packet_id, &body)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_PAYLOAD {
            return Err(WireError::TooLarge);
        }
        decode(bytes)
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(MAX_PAYLOAD as u64 + 1)
        .read_to_end(&mut out)?;
    if out.len() > MAX_PAYLOAD {
        return Err(WireError::TooLarge);
    }
    Ok(out)
}
