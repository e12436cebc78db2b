use std::fmt;
use thiserror::Error;

pub type Result<T, E = ConnectionError> = std::result::Result<T, E>;

/// A step of the handshake, reported alongside the failure that aborted it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum HandshakePhase {
    EngineInit,
    Bootstrap,
    ChainAssignment,
    SessionConstruction,
    ApplicationBinding,
}

impl HandshakePhase {
    pub fn name(self) -> &'static str {
        match self {
            HandshakePhase::EngineInit => "engine-init",
            HandshakePhase::Bootstrap => "bootstrap",
            HandshakePhase::ChainAssignment => "chain-assignment",
            HandshakePhase::SessionConstruction => "session-construction",
            HandshakePhase::ApplicationBinding => "application-binding",
        }
    }
}

impl fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Cloneable so one attempt's result can be handed to every caller waiting on it.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConnectionError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("persistent storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("handshake failed during {phase}: {cause}")]
    HandshakePhase { phase: HandshakePhase, cause: String },

    #[error("application {0} not found on the backend")]
    ApplicationNotFound(String),

    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("connection is not ready")]
    NotReady,

    #[error("connection attempt aborted: {0}")]
    AttemptAborted(String),
}

impl ConnectionError {
    pub fn handshake(phase: HandshakePhase, cause: impl Into<String>) -> Self {
        ConnectionError::HandshakePhase {
            phase,
            cause: cause.into(),
        }
    }

    /// Text the crash classifier looks at when deciding on an automatic retry.
    pub fn cause(&self) -> Option<&str> {
        match self {
            ConnectionError::HandshakePhase { cause, .. } => Some(cause),
            ConnectionError::QueryFailed(cause) => Some(cause),
            _ => None,
        }
    }
}
