//! Plugin integrity gate for a multiplayer game server.
//!
//! Before a join is completed the server runs a challenge-response handshake
//! with the client: liveness challenges, a per-session attestation module the
//! client must run against its security module, and a fingerprint list of the
//! client's plugins that is checked against the configured list policy.

pub mod assembly;
pub mod challenge;
pub mod client;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod hasher;
pub mod host;
pub mod il;
pub mod logging;
pub mod observability;
pub mod outcome;
pub mod policy;
pub mod protocol_engine;
pub mod scanner;
pub mod session;
pub mod session_manager;
pub mod token;
pub mod traffic_shaping;
pub mod transport_adapter;
pub mod wire;

pub use client::ClientAgent;
pub use config::GateConfig;
pub use context::GateContext;
pub use error::{ErrorKind, GateError};
pub use outcome::{ValidationResultCode, ValidationResultData};
pub use session::{ClientSession, ConnectionState, SessionEvent};
pub use session_manager::SessionManager;
pub use transport_adapter::PeerId;
