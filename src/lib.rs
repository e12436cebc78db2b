//! Connection lifecycle for a client of a microchain application backend.
//!
//! [`ConnectionManager`] owns the one connection: it loads or creates the
//! session identity, runs the handshake through a [`Backend`], throttles
//! reconnects and publishes [`ConnectionSnapshot`]s. Ambient runtime errors are
//! fed to [`ConnectionManager::report_ambient_error`], which classifies them
//! with the [`detector`] rules.

pub mod backend;
pub mod config;
pub mod connector;
pub mod detector;
pub mod error;
pub mod graphql_backend;
pub mod manager;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use backend::{
    Backend,
    BackendError,
};
pub use config::ConnectionConfig;
pub use connector::{
    Connection,
    Connector,
    PendingConnection,
};
pub use detector::{
    Classification,
    Disposition,
    ErrorReport,
};
pub use error::{
    ConnectionError,
    HandshakePhase,
    Result,
};
pub use graphql_backend::GraphQlBackend;
pub use manager::{
    ConnectionManager,
    ConnectionSnapshot,
    ConnectionStatus,
    LifecycleEvent,
    ReconnectOutcome,
    ReconnectReason,
    ReconnectRequester,
};
pub use session_store::{
    FileIdentityStorage,
    Identity,
    IdentityStorage,
    InMemoryIdentityStorage,
};
