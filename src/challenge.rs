//! Randomized liveness challenges exchanged during Hello and Chatter.
//!
//! Each round asks the peer for a handful of byte slices derived from facts
//! both sides can compute: slices of the session salt, halves of the peer id,
//! the origin address the server sees, or the body of a method in one of the
//! security module's critical types. Answers are framed as
//! `type u8 | len i32 LE | bytes` and scored by byte similarity.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::assembly::ModuleCatalog;
use crate::config::ChallengeConfig;
use crate::il;
use crate::transport_adapter::PeerId;

pub const SESSION_SALT_LEN: usize = 16;
pub const PASS_THRESHOLD: f64 = 90.0;
pub const CHATTER_LENGTH_MIN: u8 = 1;
pub const CHATTER_LENGTH_MAX: u8 = 5;
const MAX_SLICE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RequestType {
    MethodIl,
    SaltEcho,
    LoadedModuleCount,
    PeerIdHalves,
    OriginEcho,
}

impl RequestType {
    pub fn wire_id(self) -> u8 {
        match self {
            RequestType::MethodIl => 31,
            RequestType::SaltEcho => 32,
            RequestType::LoadedModuleCount => 40,
            RequestType::PeerIdHalves => 41,
            RequestType::OriginEcho => 42,
        }
    }

    pub fn from_wire(id: u8) -> Option<Self> {
        match id {
            31 => Some(RequestType::MethodIl),
            32 => Some(RequestType::SaltEcho),
            40 => Some(RequestType::LoadedModuleCount),
            41 => Some(RequestType::PeerIdHalves),
            42 => Some(RequestType::OriginEcho),
            _ => None,
        }
    }

    /// Answers the challenger can recompute on its own side.
    pub fn is_verifiable(self) -> bool {
        !matches!(self, RequestType::LoadedModuleCount)
    }
}

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("unknown request type {0}")]
    UnknownRequest(u8),

    #[error("no provider registered for {0:?}")]
    NoProvider(RequestType),

    #[error("provider for {request:?} failed: {reason}")]
    Provider { request: RequestType, reason: String },

    #[error("malformed answer framing")]
    Framing,

    #[error("failed to encode parameters: {0}")]
    Encoding(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterRequest {
    pub request: u8,
    pub context: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParameters {
    pub requests: Vec<ParameterRequest>,
    pub chatter_length: u8,
    pub session_salt: [u8; SESSION_SALT_LEN],
}

impl SessionParameters {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChallengeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ChallengeError::Encoding(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChallengeError> {
        let (params, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ChallengeError::Encoding(e.to_string()))?;
        Ok(params)
    }
}

/// Identifies a method whose body is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodIdentifier {
    pub type_name: String,
    pub method_name: String,
    pub parameter_types: Vec<String>,
}

/// Facts a provider may draw on.
pub struct AmbientArgs<'a> {
    pub peer_ip: Ipv4Addr,
    pub peer_id: PeerId,
    pub session_salt: [u8; SESSION_SALT_LEN],
    pub catalog: &'a dyn ModuleCatalog,
}

pub type Provider = Box<dyn Fn(&[u8], &AmbientArgs<'_>) -> Result<Vec<u8>, String> + Send + Sync>;

pub struct ChallengeEngine {
    providers: HashMap<RequestType, Provider>,
}

impl Default for ChallengeEngine {
    fn default() -> Self {
        Self::with_default_providers()
    }
}

impl ChallengeEngine {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn with_default_providers() -> Self {
        let mut engine = Self::new();
        engine.register(RequestType::MethodIl, Box::new(method_il));
        engine.register(RequestType::SaltEcho, Box::new(salt_echo));
        engine.register(RequestType::LoadedModuleCount, Box::new(loaded_module_count));
        engine.register(RequestType::PeerIdHalves, Box::new(peer_id_half));
        engine.register(RequestType::OriginEcho, Box::new(origin_echo));
        engine
    }

    /// Registers or replaces the provider for `request`.
    pub fn register(&mut self, request: RequestType, provider: Provider) {
        self.providers.insert(request, provider);
    }

    pub fn create_parameters<R: Rng + ?Sized>(
        &self,
        config: &ChallengeConfig,
        salt: [u8; SESSION_SALT_LEN],
        catalog: &dyn ModuleCatalog,
        rng: &mut R,
    ) -> SessionParameters {
        let count = rng.gen_range(config.min_requests..=config.max_requests);
        let mut requests = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(kind) = config.request_types.choose(rng).copied() else {
                break;
            };
            let request = match kind {
                RequestType::MethodIl => method_request(config, catalog, rng),
                RequestType::SaltEcho => Some(salt_request(rng)),
                RequestType::PeerIdHalves => Some(ParameterRequest {
                    request: kind.wire_id(),
                    context: vec![rng.gen_range(0..=1)],
                }),
                RequestType::LoadedModuleCount | RequestType::OriginEcho => Some(ParameterRequest {
                    request: kind.wire_id(),
                    context: Vec::new(),
                }),
            };
            requests.push(request.unwrap_or_else(|| salt_request(rng)));
        }
        let scored = requests
            .iter()
            .any(|r| RequestType::from_wire(r.request).is_some_and(RequestType::is_verifiable));
        if !scored {
            requests.push(salt_request(rng));
        }
        SessionParameters {
            requests,
            chatter_length: rng.gen_range(CHATTER_LENGTH_MIN..=CHATTER_LENGTH_MAX),
            session_salt: salt,
        }
    }

    pub fn answer(&self, params: &SessionParameters, ambient: &AmbientArgs<'_>) -> Result<Vec<u8>, ChallengeError> {
        let mut out = Vec::new();
        for entry in &params.requests {
            let request =
                RequestType::from_wire(entry.request).ok_or(ChallengeError::UnknownRequest(entry.request))?;
            let provider = self
                .providers
                .get(&request)
                .ok_or(ChallengeError::NoProvider(request))?;
            let slice = provider(&entry.context, ambient)
                .map_err(|reason| ChallengeError::Provider { request, reason })?;
            out.push(request.wire_id());
            out.extend_from_slice(&(slice.len() as i32).to_le_bytes());
            out.extend_from_slice(&slice);
        }
        Ok(out)
    }

    /// Mean similarity, in percent, between `response` and what this side
    /// computes for the same parameters.
    pub fn score(
        &self,
        params: &SessionParameters,
        response: &[u8],
        ambient: &AmbientArgs<'_>,
    ) -> Result<f64, ChallengeError> {
        let expected = unpack(&self.answer(params, ambient)?)?;
        let received = unpack(response)?;

        let mut total = 0.0;
        let mut scored = 0usize;
        for (index, (request, local)) in expected.iter().enumerate() {
            if !request.is_verifiable() {
                continue;
            }
            let remote = match received.get(index) {
                Some((kind, slice)) if kind == request => slice.as_slice(),
                _ => &[],
            };
            let similarity = if *request == RequestType::MethodIl {
                byte_similarity(il::normalize(local).as_bytes(), il::normalize(remote).as_bytes())
            } else {
                byte_similarity(local, remote)
            };
            debug!(request = ?request, index, similarity, "scored challenge slice");
            total += similarity;
            scored += 1;
        }
        if scored == 0 {
            return Ok(0.0);
        }
        Ok(total / scored as f64)
    }

    pub fn passes(
        &self,
        params: &SessionParameters,
        response: &[u8],
        ambient: &AmbientArgs<'_>,
    ) -> Result<bool, ChallengeError> {
        let score = self.score(params, response, ambient)?;
        if score <= PASS_THRESHOLD {
            warn!(target: "security", peer = %ambient.peer_id, score, "challenge response below threshold");
        }
        Ok(score > PASS_THRESHOLD)
    }
}

/// Inverse of the framing written by [`ChallengeEngine::answer`], in request
/// order.
pub fn unpack(bytes: &[u8]) -> Result<Vec<(RequestType, Vec<u8>)>, ChallengeError> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let header = bytes.get(pos..pos + 5).ok_or(ChallengeError::Framing)?;
        let request = RequestType::from_wire(header[0]).ok_or(ChallengeError::UnknownRequest(header[0]))?;
        let len = i32::from_le_bytes([header[1], header[2], header[3], header[4]]);
        if len < 0 || len as usize > MAX_SLICE {
            return Err(ChallengeError::Framing);
        }
        let start = pos + 5;
        let end = start + len as usize;
        let slice = bytes.get(start..end).ok_or(ChallengeError::Framing)?;
        out.push((request, slice.to_vec()));
        pos = end;
    }
    Ok(out)
}

/// Percentage of equal bytes over the longer input, the shorter one padded
/// with zeros. Two empty inputs are identical.
pub fn byte_similarity(a: &[u8], b: &[u8]) -> f64 {
    let len = a.len().max(b.len());
    if len == 0 {
        return 100.0;
    }
    let equal = (0..len)
        .filter(|&i| a.get(i).copied().unwrap_or(0) == b.get(i).copied().unwrap_or(0))
        .count();
    equal as f64 * 100.0 / len as f64
}

fn salt_request<R: Rng + ?Sized>(rng: &mut R) -> ParameterRequest {
    let len = rng.gen_range(4..=8u8);
    let offset = rng.gen_range(0..=(SESSION_SALT_LEN as u8 - len));
    ParameterRequest {
        request: RequestType::SaltEcho.wire_id(),
        context: vec![offset, len],
    }
}

fn method_request<R: Rng + ?Sized>(
    config: &ChallengeConfig,
    catalog: &dyn ModuleCatalog,
    rng: &mut R,
) -> Option<ParameterRequest> {
    let type_name = config.critical_types.choose(rng)?;
    let Some((_, ty)) = catalog.find_type(type_name) else {
        warn!(type_name = %type_name, "critical type not found in catalog");
        return None;
    };
    let candidates: Vec<_> = ty
        .methods
        .iter()
        .filter(|m| !m.is_special_name && m.body.as_ref().is_some_and(|b| !b.is_empty()))
        .collect();
    let method = candidates.choose(rng)?;
    let identifier = MethodIdentifier {
        type_name: ty.full_name.clone(),
        method_name: method.name.clone(),
        parameter_types: method.parameter_types.clone(),
    };
    let context = bincode::serde::encode_to_vec(&identifier, bincode::config::standard()).ok()?;
    Some(ParameterRequest {
        request: RequestType::MethodIl.wire_id(),
        context,
    })
}

fn method_il(context: &[u8], ambient: &AmbientArgs<'_>) -> Result<Vec<u8>, String> {
    let (identifier, _): (MethodIdentifier, usize) =
        bincode::serde::decode_from_slice(context, bincode::config::standard()).map_err(|e| e.to_string())?;
    let (_, ty) = ambient
        .catalog
        .find_type(&identifier.type_name)
        .ok_or_else(|| format!("type {} not loaded", identifier.type_name))?;
    let method = ty
        .find_method(&identifier.method_name, &identifier.parameter_types)
        .ok_or_else(|| format!("method {} not found", identifier.method_name))?;
    Ok(method.body.clone().unwrap_or_default())
}

fn salt_echo(context: &[u8], ambient: &AmbientArgs<'_>) -> Result<Vec<u8>, String> {
    let [offset, len] = context else {
        return Err("salt echo needs offset and length".to_string());
    };
    let start = *offset as usize;
    ambient
        .session_salt
        .get(start..start + *len as usize)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| "salt slice out of range".to_string())
}

fn loaded_module_count(_: &[u8], ambient: &AmbientArgs<'_>) -> Result<Vec<u8>, String> {
    Ok((ambient.catalog.loaded_modules().len() as u32).to_le_bytes().to_vec())
}

fn peer_id_half(context: &[u8], ambient: &AmbientArgs<'_>) -> Result<Vec<u8>, String> {
    match context.first() {
        Some(0) => Ok(ambient.peer_id.high_half().to_le_bytes().to_vec()),
        Some(1) => Ok(ambient.peer_id.low_half().to_le_bytes().to_vec()),
        _ => Err("peer id half must be 0 or 1".to_string()),
    }
}

fn origin_echo(_: &[u8], ambient: &AmbientArgs<'_>) -> Result<Vec<u8>, String> {
    Ok(ambient.peer_ip.octets().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{ModuleImage, StaticCatalog, TypeInfo, TYPE_PUBLIC};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const RUNNER: &str = "CleanSpaceShared.Hasher.HasherRunner";

    fn catalog(body: Vec<u8>) -> StaticCatalog {
        let module = ModuleImage::new("CleanSpaceShared", "1.0").with_type(
            TypeInfo::new(RUNNER, TYPE_PUBLIC)
                .with_method(".ctor", &[], vec![0x02, 0x2A])
                .with_method("Run", &["System.Reflection.Assembly"], body),
        );
        StaticCatalog::new("Sandbox.Game", vec![module])
    }

    fn config() -> ChallengeConfig {
        ChallengeConfig {
            critical_types: vec![RUNNER.to_string()],
            ..ChallengeConfig::default()
        }
    }

    fn ambient(catalog: &StaticCatalog) -> AmbientArgs<'_> {
        AmbientArgs {
            peer_ip: Ipv4Addr::new(203, 0, 113, 9),
            peer_id: PeerId(76_561_198_000_000_001),
            session_salt: *b"0123456789abcdef",
            catalog,
        }
    }

    #[test]
    fn parameters_respect_bounds() {
        let cat = catalog(vec![0x02, 0x28, 0x05, 0x00, 0x00, 0x0A, 0x2A]);
        let engine = ChallengeEngine::default();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let params = engine.create_parameters(&config(), *b"0123456789abcdef", &cat, &mut rng);
            assert!((2..=4).contains(&params.requests.len()));
            assert!((CHATTER_LENGTH_MIN..=CHATTER_LENGTH_MAX).contains(&params.chatter_length));
            assert_eq!(SessionParameters::from_bytes(&params.to_bytes().unwrap()).unwrap(), params);
        }
    }

    #[test]
    fn method_requests_skip_constructors() {
        let cat = catalog(vec![0x2A]);
        let engine = ChallengeEngine::default();
        let mut rng = StdRng::seed_from_u64(5);
        let config = ChallengeConfig {
            request_types: vec![RequestType::MethodIl],
            ..config()
        };
        let params = engine.create_parameters(&config, [0; 16], &cat, &mut rng);
        for request in &params.requests {
            let (id, _): (MethodIdentifier, usize) =
                bincode::serde::decode_from_slice(&request.context, bincode::config::standard()).unwrap();
            assert_eq!(id.method_name, "Run");
        }
    }

    #[test]
    fn missing_critical_type_falls_back_to_salt_echo() {
        let cat = StaticCatalog::new("Sandbox.Game", vec![]);
        let engine = ChallengeEngine::default();
        let config = ChallengeConfig {
            request_types: vec![RequestType::MethodIl],
            ..config()
        };
        let params = engine.create_parameters(&config, [0; 16], &cat, &mut StdRng::seed_from_u64(1));
        assert!(params
            .requests
            .iter()
            .all(|r| r.request == RequestType::SaltEcho.wire_id()));
    }

    #[test]
    fn honest_answer_passes() {
        let cat = catalog(vec![0x02, 0x28, 0x05, 0x00, 0x00, 0x0A, 0x2A]);
        let engine = ChallengeEngine::default();
        let mut rng = StdRng::seed_from_u64(11);
        let params = engine.create_parameters(&config(), *b"0123456789abcdef", &cat, &mut rng);
        let answer = engine.answer(&params, &ambient(&cat)).unwrap();
        assert_eq!(engine.score(&params, &answer, &ambient(&cat)).unwrap(), 100.0);
        assert!(engine.passes(&params, &answer, &ambient(&cat)).unwrap());
    }

    #[test]
    fn il_differing_only_in_token_rows_still_passes() {
        let server = catalog(vec![0x02, 0x28, 0x05, 0x00, 0x00, 0x0A, 0x2A]);
        let client = catalog(vec![0x02, 0x28, 0x11, 0x00, 0x00, 0x0A, 0x2A]);
        let engine = ChallengeEngine::default();
        let config = ChallengeConfig {
            request_types: vec![RequestType::MethodIl],
            ..config()
        };
        let params = engine.create_parameters(&config, [1; 16], &server, &mut StdRng::seed_from_u64(2));
        let answer = engine.answer(&params, &ambient(&client)).unwrap();
        assert!(engine.passes(&params, &answer, &ambient(&server)).unwrap());
    }

    #[test]
    fn one_altered_salt_byte_fails() {
        let cat = catalog(vec![0x2A]);
        let engine = ChallengeEngine::default();
        let params = SessionParameters {
            requests: vec![ParameterRequest {
                request: RequestType::SaltEcho.wire_id(),
                context: vec![2, 8],
            }],
            chatter_length: 1,
            session_salt: *b"0123456789abcdef",
        };
        let mut answer = engine.answer(&params, &ambient(&cat)).unwrap();
        let last = answer.len() - 1;
        answer[last] ^= 0xFF;
        let score = engine.score(&params, &answer, &ambient(&cat)).unwrap();
        assert_eq!(score, 87.5);
        assert!(!engine.passes(&params, &answer, &ambient(&cat)).unwrap());
    }

    #[test]
    fn empty_answer_to_unscored_round_fails() {
        let cat = catalog(vec![0x2A]);
        let engine = ChallengeEngine::default();
        let count_only = SessionParameters {
            requests: vec![
                ParameterRequest {
                    request: RequestType::LoadedModuleCount.wire_id(),
                    context: vec![],
                };
                2
            ],
            chatter_length: 1,
            session_salt: [0; 16],
        };
        assert_eq!(engine.score(&count_only, &[], &ambient(&cat)).unwrap(), 0.0);
        assert!(!engine.passes(&count_only, &[], &ambient(&cat)).unwrap());

        let empty = SessionParameters {
            requests: Vec::new(),
            ..count_only
        };
        assert!(!engine.passes(&empty, &[], &ambient(&cat)).unwrap());
    }

    #[test]
    fn rounds_always_carry_a_scored_request() {
        let cat = catalog(vec![0x2A]);
        let engine = ChallengeEngine::default();
        let config = ChallengeConfig {
            request_types: vec![RequestType::LoadedModuleCount],
            ..config()
        };
        let mut rng = StdRng::seed_from_u64(4);
        for _ in 0..20 {
            let params = engine.create_parameters(&config, [3; 16], &cat, &mut rng);
            assert!(params
                .requests
                .iter()
                .any(|r| r.request == RequestType::SaltEcho.wire_id()));
            let answer = engine.answer(&params, &ambient(&cat)).unwrap();
            assert!(engine.passes(&params, &answer, &ambient(&cat)).unwrap());
        }
    }

    #[test]
    fn every_repeated_slice_is_scored() {
        let cat = catalog(vec![0x2A]);
        let engine = ChallengeEngine::default();
        let params = SessionParameters {
            requests: vec![
                ParameterRequest {
                    request: RequestType::SaltEcho.wire_id(),
                    context: vec![0, 4],
                },
                ParameterRequest {
                    request: RequestType::SaltEcho.wire_id(),
                    context: vec![8, 4],
                },
            ],
            chatter_length: 1,
            session_salt: *b"0123456789abcdef",
        };
        let mut answer = engine.answer(&params, &ambient(&cat)).unwrap();
        // first slice sits after its 5-byte header
        for byte in &mut answer[5..9] {
            *byte ^= 0xFF;
        }
        assert_eq!(engine.score(&params, &answer, &ambient(&cat)).unwrap(), 50.0);
        assert!(!engine.passes(&params, &answer, &ambient(&cat)).unwrap());
    }

    #[test]
    fn unregistered_provider_fails() {
        let cat = catalog(vec![0x2A]);
        let mut engine = ChallengeEngine::new();
        engine.register(RequestType::SaltEcho, Box::new(salt_echo));
        let params = SessionParameters {
            requests: vec![ParameterRequest {
                request: RequestType::OriginEcho.wire_id(),
                context: vec![],
            }],
            chatter_length: 1,
            session_salt: [0; 16],
        };
        assert!(matches!(
            engine.answer(&params, &ambient(&cat)),
            Err(ChallengeError::NoProvider(RequestType::OriginEcho))
        ));
        let unknown = SessionParameters {
            requests: vec![ParameterRequest { request: 99, context: vec![] }],
            ..params
        };
        assert!(matches!(
            engine.answer(&unknown, &ambient(&cat)),
            Err(ChallengeError::UnknownRequest(99))
        ));
    }

    #[test]
    fn ambient_providers() {
        let cat = catalog(vec![0x2A]);
        let a = ambient(&cat);
        assert_eq!(origin_echo(&[], &a).unwrap(), vec![203, 0, 113, 9]);
        assert_eq!(
            peer_id_half(&[1], &a).unwrap(),
            a.peer_id.low_half().to_le_bytes().to_vec()
        );
        assert!(peer_id_half(&[2], &a).is_err());
        assert_eq!(salt_echo(&[0, 4], &a).unwrap(), b"0123".to_vec());
        assert!(salt_echo(&[14, 4], &a).is_err());
        assert_eq!(loaded_module_count(&[], &a).unwrap(), 1u32.to_le_bytes().to_vec());
    }

    #[test]
    fn similarity_edges() {
        assert_eq!(byte_similarity(&[], &[]), 100.0);
        assert_eq!(byte_similarity(&[1, 2, 3, 4], &[1, 2, 3, 4]), 100.0);
        assert_eq!(byte_similarity(&[1, 2, 3, 4], &[1, 2]), 50.0);
        assert_eq!(byte_similarity(&[1, 0], &[1]), 100.0);
        assert_eq!(byte_similarity(&[5], &[]), 0.0);
    }

    #[test]
    fn truncated_framing_is_rejected() {
        assert!(matches!(unpack(&[32, 4, 0, 0, 0, 1]), Err(ChallengeError::Framing)));
        assert!(matches!(unpack(&[32, 0xFF, 0xFF, 0xFF, 0xFF]), Err(ChallengeError::Framing)));
        assert!(matches!(unpack(&[77, 0, 0, 0, 0]), Err(ChallengeError::UnknownRequest(77))));
    }

    proptest! {
        #[test]
        fn unpack_inverts_answer_framing(
            slices in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..40), 1..5)
        ) {
            let kinds = [RequestType::MethodIl, RequestType::SaltEcho, RequestType::PeerIdHalves, RequestType::OriginEcho];
            let mut bytes = Vec::new();
            let mut expected = Vec::new();
            for (kind, slice) in kinds.iter().zip(&slices) {
                bytes.push(kind.wire_id());
                bytes.extend_from_slice(&(slice.len() as i32).to_le_bytes());
                bytes.extend_from_slice(slice);
                expected.push((*kind, slice.clone()));
            }
            prop_assert_eq!(unpack(&bytes).unwrap(), expected);
        }
    }
}
