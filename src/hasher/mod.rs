//! Attestation modules: generation, verification and execution.
//!
//! The server generates a small `CSHM` module per session that folds three
//! randomly chosen structural views of the security module into
//! `base64(SHA256(view) XOR secret)`. The client verifies and runs it against
//! its own loaded security module; the server rebuilds the same program with
//! the module passed as an argument and compares the results.
//!
//! The verifier is a contract check on a tiny instruction set, not an
//! isolation boundary.

pub mod executor;
pub mod factory;
pub mod module;
pub mod slots;
pub mod verifier;

use thiserror::Error;

pub use executor::{execute, ExecutionEnv, HasherArg};
pub use factory::{make_hasher, make_server_equivalent, GeneratedHasher, HasherFlavor};
pub use verifier::{verify, VerifyError};

#[derive(Debug, Error)]
pub enum AttestationError {
    #[error("attestation module failed to compile: {}", .0.join("; "))]
    Compile(Vec<String>),

    #[error("security violation: {0}")]
    Security(#[from] VerifyError),

    #[error("attestation module has no entry point")]
    MissingEntryPoint,

    #[error("entry point takes {expected} arguments, {got} given")]
    ArgumentMismatch { expected: usize, got: usize },

    #[error("attestation failed: {0}")]
    Execution(String),
}
