use crate::{
    backend::{
        Backend,
        BackendError,
    },
    error::{
        ConnectionError,
        HandshakePhase,
        Result,
    },
};
use serde::{
    Serialize,
    de::DeserializeOwned,
};
use session_store::Identity;
use std::{
    fmt,
    sync::Arc,
};
use tracing::{
    debug,
    info,
};
use url::Url;

const ALREADY_INITIALIZED_MARKER: &str = "already initialized";

/// A session that has completed the handshake but has no application bound yet.
/// Never handed to consumers.
pub struct PendingConnection<B: Backend> {
    faucet: B::Faucet,
    wallet: B::Wallet,
    session: B::Session,
    address: String,
    chain_id: String,
}

impl<B: Backend> PendingConnection<B> {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }
}

/// Every handle needed to talk to the bound application. Only
/// [`Connector::bind_application`] produces one.
pub struct Connection<B: Backend> {
    // owned for the lifetime of the connection, never read back
    #[allow(dead_code)]
    faucet: B::Faucet,
    #[allow(dead_code)]
    wallet: B::Wallet,
    #[allow(dead_code)]
    session: B::Session,
    application: B::Application,
    address: String,
    chain_id: String,
    application_id: String,
}

impl<B: Backend> Connection<B> {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn application(&self) -> &B::Application {
        &self.application
    }
}

impl<B: Backend> fmt::Debug for Connection<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("chain_id", &self.chain_id)
            .field("application_id", &self.application_id)
            .finish_non_exhaustive()
    }
}

pub struct Connector<B> {
    backend: Arc<B>,
}

impl<B> Clone for Connector<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: Backend> Connector<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Runs engine init, wallet bootstrap, chain assignment and session
    /// construction in that order. The first failure aborts the handshake.
    pub async fn connect(
        &self,
        faucet_url: &Url,
        identity: &Identity,
    ) -> Result<PendingConnection<B>> {
        let backend = &self.backend;

        match backend.init_engine().await {
            Ok(()) => debug!("execution engine initialized"),
            Err(err) if is_already_initialized(&err) => {
                debug!("execution engine was already initialized")
            }
            Err(err) => return Err(phase_error(HandshakePhase::EngineInit, err)),
        }

        info!(faucet = %faucet_url, "requesting session wallet");
        let faucet = backend
            .faucet(faucet_url)
            .map_err(|e| phase_error(HandshakePhase::Bootstrap, e))?;
        let mut wallet = backend
            .create_wallet(&faucet)
            .await
            .map_err(|e| phase_error(HandshakePhase::Bootstrap, e))?;

        info!(owner = identity.address(), "claiming session chain");
        let chain_id = backend
            .claim_chain(&faucet, &mut wallet, identity.address())
            .await
            .map_err(|e| phase_error(HandshakePhase::ChainAssignment, e))?;

        let session = backend
            .open_session(&wallet, identity)
            .await
            .map_err(|e| phase_error(HandshakePhase::SessionConstruction, e))?;
        info!(chain_id = %chain_id, "session established");

        Ok(PendingConnection {
            faucet,
            wallet,
            session,
            address: identity.address().to_string(),
            chain_id,
        })
    }

    pub async fn bind_application(
        &self,
        pending: PendingConnection<B>,
        application_id: &str,
    ) -> Result<Connection<B>> {
        let application = self
            .backend
            .application(&pending.session, application_id)
            .await
            .map_err(|e| phase_error(HandshakePhase::ApplicationBinding, e))?
            .ok_or_else(|| ConnectionError::ApplicationNotFound(application_id.to_string()))?;
        info!(application_id, chain_id = %pending.chain_id, "application bound");

        let PendingConnection {
            faucet,
            wallet,
            session,
            address,
            chain_id,
        } = pending;
        Ok(Connection {
            faucet,
            wallet,
            session,
            application,
            address,
            chain_id,
            application_id: application_id.to_string(),
        })
    }

    /// Serializes `request`, runs it against the bound application and decodes
    /// the response. Independent calls are not ordered relative to each other.
    pub async fn query<Req, Resp>(
        &self,
        connection: &Connection<B>,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request).map_err(|e| {
            ConnectionError::QueryFailed(format!("failed to encode request: {e}"))
        })?;
        let response = self
            .backend
            .query(&connection.application, payload)
            .await
            .map_err(|e| ConnectionError::QueryFailed(e.message))?;
        serde_json::from_value(response).map_err(|e| {
            ConnectionError::QueryFailed(format!("failed to decode response: {e}"))
        })
    }
}

fn is_already_initialized(err: &BackendError) -> bool {
    err.message
        .to_ascii_lowercase()
        .contains(ALREADY_INITIALIZED_MARKER)
}

fn phase_error(phase: HandshakePhase, err: BackendError) -> ConnectionError {
    ConnectionError::handshake(phase, err.message)
}
