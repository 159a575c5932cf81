//! Signed, time-bound, single-use tokens with one pending token per peer.
//!
//! A token is `base64("expiry|purpose|nonce|signature")` where the signature
//! is HMAC-SHA512 over `expiry|purpose|nonce` keyed by
//! `SHA256(secret ":" purpose)`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::crypto;
use crate::outcome::ValidationResultCode;
use crate::transport_adapter::PeerId;

pub const DEFAULT_PURPOSE: &str = "auth";
pub const CLOCK_SKEW_SECS: i64 = 5;
const NONCE_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token purpose must be non-empty and must not contain '|'")]
    InvalidPurpose,

    #[error("token lifetime does not fit the clock")]
    InvalidLifetime,
}

/// Why a pending token left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenEvent {
    Used(PeerId),
    Pruned(PeerId),
    Replaced(PeerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCheck {
    Valid,
    Malformed,
    BadSignature,
    Expired,
}

struct PendingToken {
    token: String,
    registered_at: i64,
}

pub struct TokenService {
    secret: Zeroizing<String>,
    ttl_secs: i64,
    stale_after_secs: i64,
    pending: Mutex<HashMap<PeerId, PendingToken>>,
    events: broadcast::Sender<TokenEvent>,
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl TokenService {
    pub fn new(secret: &str, ttl: Duration, stale_after: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            secret: Zeroizing::new(secret.to_string()),
            ttl_secs: ttl.as_secs() as i64,
            stale_after_secs: stale_after.as_secs() as i64,
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TokenEvent> {
        self.events.subscribe()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<PeerId, PendingToken>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TokenEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Mints a token for `purpose` that expires at `expiry` (unix seconds).
    pub fn generate(&self, purpose: &str, expiry: i64) -> Result<String, TokenError> {
        if purpose.is_empty() || purpose.contains('|') {
            return Err(TokenError::InvalidPurpose);
        }
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let body = format!("{}|{}|{}", expiry, purpose, STANDARD.encode(nonce));
        let key = crypto::derive_purpose_key(&self.secret, purpose);
        let signature = crypto::sign_payload(&body, key.as_slice());
        let raw = format!("{}|{}", body, STANDARD.encode(signature));
        Ok(STANDARD.encode(raw))
    }

    /// Stateless structural, signature and clock check of a token.
    pub fn check(&self, token: &str, purpose: &str, now: i64) -> TokenCheck {
        let Some(parts) = decode_parts(token) else {
            return TokenCheck::Malformed;
        };
        let key = crypto::derive_purpose_key(&self.secret, &parts.purpose);
        let body = format!("{}|{}|{}", parts.expiry, parts.purpose, parts.nonce);
        if parts.purpose != purpose
            || !crypto::verify_signature(body.as_bytes(), key.as_slice(), &parts.signature)
        {
            return TokenCheck::BadSignature;
        }
        if now - CLOCK_SKEW_SECS > parts.expiry {
            return TokenCheck::Expired;
        }
        TokenCheck::Valid
    }

    pub fn register(&self, peer: PeerId, force: bool) -> Result<Option<String>, TokenError> {
        self.register_at(peer, DEFAULT_PURPOSE, force, unix_now())
    }

    /// Issues the token `peer` must echo next. Without `force` an already
    /// pending token is kept and `None` is returned.
    pub fn register_at(
        &self,
        peer: PeerId,
        purpose: &str,
        force: bool,
        now: i64,
    ) -> Result<Option<String>, TokenError> {
        let expiry = now
            .checked_add(self.ttl_secs)
            .ok_or(TokenError::InvalidLifetime)?;
        let mut pending = self.pending();
        if pending.contains_key(&peer) && !force {
            return Ok(None);
        }
        let token = self.generate(purpose, expiry)?;
        let previous = pending.insert(
            peer,
            PendingToken {
                token: token.clone(),
                registered_at: now,
            },
        );
        drop(pending);
        if previous.is_some() {
            self.emit(TokenEvent::Replaced(peer));
        }
        Ok(Some(token))
    }

    pub fn pending_for(&self, peer: PeerId) -> Option<String> {
        self.pending().get(&peer).map(|p| p.token.clone())
    }

    pub fn is_expected(&self, peer: PeerId) -> bool {
        self.pending().contains_key(&peer)
    }

    pub fn validate(&self, peer: PeerId, token: &str) -> ValidationResultCode {
        self.validate_at(peer, token, unix_now())
    }

    pub fn validate_at(&self, peer: PeerId, token: &str, now: i64) -> ValidationResultCode {
        if decode_parts(token).is_none() {
            return ValidationResultCode::MalformedToken;
        }
        let mut pending = self.pending();
        let Some(expected) = pending.get(&peer) else {
            return ValidationResultCode::UnexpectedToken;
        };
        let purpose = decode_parts(&expected.token)
            .map(|p| p.purpose)
            .unwrap_or_else(|| DEFAULT_PURPOSE.to_string());
        let code = match self.check(token, &purpose, now) {
            TokenCheck::Malformed => ValidationResultCode::MalformedToken,
            TokenCheck::BadSignature => ValidationResultCode::InvalidToken,
            TokenCheck::Expired => ValidationResultCode::ExpiredToken,
            TokenCheck::Valid if !crypto::constant_time_eq(token.as_bytes(), expected.token.as_bytes()) => {
                ValidationResultCode::InvalidToken
            }
            TokenCheck::Valid => ValidationResultCode::ValidToken,
        };
        if code == ValidationResultCode::ValidToken {
            pending.remove(&peer);
            drop(pending);
            self.emit(TokenEvent::Used(peer));
        } else {
            debug!(peer = %peer, code = ?code, "token validation failed");
        }
        code
    }

    /// Drops a pending token without reporting it as used.
    pub fn forget(&self, peer: PeerId) {
        self.pending().remove(&peer);
    }

    pub fn prune(&self) -> usize {
        self.prune_at(unix_now())
    }

    pub fn prune_at(&self, now: i64) -> usize {
        let mut pruned = Vec::new();
        {
            let mut pending = self.pending();
            pending.retain(|peer, entry| {
                let keep = now - entry.registered_at <= self.stale_after_secs;
                if !keep {
                    pruned.push(*peer);
                }
                keep
            });
        }
        for peer in &pruned {
            self.emit(TokenEvent::Pruned(*peer));
        }
        if !pruned.is_empty() {
            debug!(count = pruned.len(), "pruned stale tokens");
        }
        pruned.len()
    }

    /// Periodic sweep of stale tokens until the service is dropped.
    pub fn spawn_pruner(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(service) => {
                        service.prune();
                    }
                    None => {
                        warn!("token service dropped, stopping pruner");
                        break;
                    }
                }
            }
        })
    }
}

struct TokenParts {
    expiry: i64,
    purpose: String,
    nonce: String,
    signature: Vec<u8>,
}

fn decode_parts(token: &str) -> Option<TokenParts> {
    if token.is_empty() {
        return None;
    }
    let raw = STANDARD.decode(token).ok()?;
    let text = String::from_utf8(raw).ok()?;
    let mut fields = text.split('|');
    let expiry = fields.next()?.parse::<i64>().ok()?;
    let purpose = fields.next()?.to_string();
    let nonce = fields.next()?.to_string();
    let signature = STANDARD.decode(fields.next()?).ok()?;
    if fields.next().is_some() || purpose.is_empty() || STANDARD.decode(&nonce).is_err() {
        return None;
    }
    Some(TokenParts {
        expiry,
        purpose,
        nonce,
        signature,
    })
}
