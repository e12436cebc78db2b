use crate::backend::{
    Backend,
    BackendError,
};
use serde_json::{
    Value,
    json,
};
use session_store::Identity;
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::{
        Arc,
        Mutex,
        PoisonError,
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
    },
    time::Duration,
};
use url::Url;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MockCall {
    EngineInit,
    Bootstrap,
    ChainAssignment,
    SessionConstruction,
    ApplicationBinding,
    Query,
}

#[derive(Debug)]
pub struct MockWallet {
    pub id: usize,
    pub chain_id: Option<String>,
}

#[derive(Default)]
struct MockState {
    calls: Mutex<HashMap<MockCall, usize>>,
    failures: Mutex<HashMap<MockCall, VecDeque<String>>>,
    application_missing: AtomicBool,
    bootstrap_delay: Mutex<Option<Duration>>,
    next_chain: AtomicUsize,
}

/// Scriptable stand-in for the blockchain SDK. Clones share counters and
/// failure scripts so a test can keep a handle after handing one to a manager.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self, call: MockCall) -> usize {
        let calls = self
            .state
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        calls.get(&call).copied().unwrap_or_default()
    }

    /// The next `call` fails with `message`. Queued failures are consumed in order.
    pub fn fail_next(&self, call: MockCall, message: impl Into<String>) {
        let mut failures = self
            .state
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        failures.entry(call).or_default().push_back(message.into());
    }

    pub fn set_application_missing(&self, missing: bool) {
        self.state
            .application_missing
            .store(missing, Ordering::SeqCst);
    }

    /// Makes wallet creation take `delay`, widening the window in which
    /// concurrent callers overlap.
    pub fn set_bootstrap_delay(&self, delay: Duration) {
        *self
            .state
            .bootstrap_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    fn record(&self, call: MockCall) -> Result<usize, BackendError> {
        let count = {
            let mut calls = self
                .state
                .calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let count = calls.entry(call).or_default();
            *count += 1;
            *count
        };
        let failure = self
            .state
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&call)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(message) => Err(BackendError::new(message)),
            None => Ok(count),
        }
    }

    fn bootstrap_delay(&self) -> Option<Duration> {
        *self
            .state
            .bootstrap_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Backend for MockBackend {
    type Faucet = Url;
    type Wallet = MockWallet;
    type Session = String;
    type Application = String;

    async fn init_engine(&self) -> Result<(), BackendError> {
        self.record(MockCall::EngineInit).map(|_| ())
    }

    fn faucet(&self, url: &Url) -> Result<Url, BackendError> {
        Ok(url.clone())
    }

    async fn create_wallet(&self, _faucet: &Url) -> Result<MockWallet, BackendError> {
        if let Some(delay) = self.bootstrap_delay() {
            tokio::time::sleep(delay).await;
        }
        let id = self.record(MockCall::Bootstrap)?;
        Ok(MockWallet { id, chain_id: None })
    }

    async fn claim_chain(
        &self,
        _faucet: &Url,
        wallet: &mut MockWallet,
        _owner: &str,
    ) -> Result<String, BackendError> {
        self.record(MockCall::ChainAssignment)?;
        let n = self.state.next_chain.fetch_add(1, Ordering::SeqCst) + 1;
        let chain_id = format!("chain-{n}");
        wallet.chain_id = Some(chain_id.clone());
        Ok(chain_id)
    }

    async fn open_session(
        &self,
        wallet: &MockWallet,
        identity: &Identity,
    ) -> Result<String, BackendError> {
        self.record(MockCall::SessionConstruction)?;
        Ok(format!(
            "session:{}:{}",
            wallet.chain_id.as_deref().unwrap_or("none"),
            identity.address()
        ))
    }

    async fn application(
        &self,
        session: &String,
        application_id: &str,
    ) -> Result<Option<String>, BackendError> {
        self.record(MockCall::ApplicationBinding)?;
        if self.state.application_missing.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(format!("{session}/{application_id}")))
    }

    async fn query(&self, _application: &String, request: Value) -> Result<Value, BackendError> {
        self.record(MockCall::Query)?;
        Ok(json!({ "data": request }))
    }
}
