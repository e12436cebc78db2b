use serde_json::Value;
use session_store::Identity;
use std::future::Future;
use thiserror::Error;
use url::Url;

/// Failure reported by the backend SDK. Only the text survives; the connector
/// attaches the handshake phase.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The external blockchain SDK as seen by the connector.
///
/// Every handle type is opaque to this crate. Implementations must be cheap to
/// share across tasks since one backend serves every connection attempt.
pub trait Backend: Send + Sync + 'static {
    type Faucet: Send + Sync + 'static;
    type Wallet: Send + Sync + 'static;
    type Session: Send + Sync + 'static;
    type Application: Send + Sync + 'static;

    /// Bring up the execution engine. May be called more than once.
    fn init_engine(&self) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn faucet(&self, url: &Url) -> Result<Self::Faucet, BackendError>;

    /// Ask the faucet for a fresh session wallet.
    fn create_wallet(
        &self,
        faucet: &Self::Faucet,
    ) -> impl Future<Output = Result<Self::Wallet, BackendError>> + Send;

    /// Ask the faucet to assign a chain owned by `owner`; returns the chain id.
    fn claim_chain(
        &self,
        faucet: &Self::Faucet,
        wallet: &mut Self::Wallet,
        owner: &str,
    ) -> impl Future<Output = Result<String, BackendError>> + Send;

    fn open_session(
        &self,
        wallet: &Self::Wallet,
        identity: &Identity,
    ) -> impl Future<Output = Result<Self::Session, BackendError>> + Send;

    /// `Ok(None)` when the backend has no application under that id.
    fn application(
        &self,
        session: &Self::Session,
        application_id: &str,
    ) -> impl Future<Output = Result<Option<Self::Application>, BackendError>> + Send;

    fn query(
        &self,
        application: &Self::Application,
        request: Value,
    ) -> impl Future<Output = Result<Value, BackendError>> + Send;
}
