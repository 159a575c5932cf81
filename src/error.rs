use thiserror::Error;

use crate::challenge::ChallengeError;
use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::hasher::{AttestationError, VerifyError};
use crate::outcome::ValidationResultCode;
use crate::token::TokenError;
use crate::transport_adapter::TransportError;
use crate::wire::WireError;

/// Failure classes a session can end on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Protocol,
    Security,
    Timeout,
    Token,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("token rejected: {0:?}")]
    Token(ValidationResultCode),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Attestation(#[from] AttestationError),

    #[error(transparent)]
    Challenge(#[from] ChallengeError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    TokenService(#[from] TokenError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GateError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        GateError::Protocol(msg.into())
    }

    pub fn security(msg: impl Into<String>) -> Self {
        GateError::Security(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GateError::Protocol(_) | GateError::Challenge(_) | GateError::Wire(_) => {
                ErrorKind::Protocol
            }
            GateError::Security(_) | GateError::Verify(_) | GateError::Crypto(_) => {
                ErrorKind::Security
            }
            GateError::Attestation(AttestationError::Security(_)) => ErrorKind::Security,
            GateError::Attestation(_) => ErrorKind::Infrastructure,
            GateError::Timeout(_) => ErrorKind::Timeout,
            GateError::Token(_) => ErrorKind::Token,
            GateError::TokenService(_) | GateError::Transport(_) | GateError::Config(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Failures to build or run this side's own attestation module.
    pub fn halts_gate(&self) -> bool {
        matches!(self, GateError::Attestation(_))
    }

    /// Code reported to the peer when this error ends its session.
    pub fn result_code(&self) -> ValidationResultCode {
        match self {
            GateError::Token(code) => *code,
            GateError::Security(_) | GateError::Verify(_) | GateError::Attestation(_) => {
                ValidationResultCode::RejectedCleanSpaceHash
            }
            _ => ValidationResultCode::FailedCommunication,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_failures() {
        assert_eq!(GateError::protocol("wrong sender").kind(), ErrorKind::Protocol);
        assert_eq!(GateError::security("bad signature").kind(), ErrorKind::Security);
        assert_eq!(GateError::Timeout("hello").kind(), ErrorKind::Timeout);
        assert_eq!(
            GateError::Token(ValidationResultCode::ExpiredToken).kind(),
            ErrorKind::Token
        );
        let missing = GateError::Attestation(AttestationError::MissingEntryPoint);
        assert_eq!(missing.kind(), ErrorKind::Infrastructure);
    }

    #[test]
    fn token_errors_surface_their_code() {
        let err = GateError::Token(ValidationResultCode::UnexpectedToken);
        assert_eq!(err.result_code(), ValidationResultCode::UnexpectedToken);
        assert_eq!(
            GateError::protocol("x").result_code(),
            ValidationResultCode::FailedCommunication
        );
    }
}
