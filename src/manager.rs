use crate::{
    backend::Backend,
    config::{
        ConnectionConfig,
        ValidatedConfig,
    },
    connector::{
        Connection,
        Connector,
    },
    detector::{
        self,
        Classification,
        Disposition,
        ErrorReport,
    },
    error::{
        ConnectionError,
        Result,
    },
};
use futures::{
    FutureExt,
    future::{
        BoxFuture,
        Shared,
    },
};
use serde::{
    Serialize,
    de::DeserializeOwned,
};
use session_store::{
    Identity,
    IdentityStorage,
};
use std::{
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        Weak,
    },
};
use tokio::{
    sync::{
        broadcast,
        mpsc,
    },
    task::JoinHandle,
    time::{
        self,
        Instant,
    },
};
use tracing::{
    debug,
    error,
    info,
    warn,
};


const EVENT_CHANNEL_CAPACITY: usize = 64;
// a crash reported while a request is pending coalesces into it
const RECONNECT_QUEUE_SLOTS: usize = 1;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ConnectionStatus {
    #[default]
    Uninitialized,
    Connecting,
    Ready,
    Error(String),
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Uninitialized => write!(f, "uninitialized"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Ready => write!(f, "ready"),
            ConnectionStatus::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Read-only view of the connection handed to the rest of the application.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub address: Option<String>,
    pub chain_id: Option<String>,
    pub last_error: Option<String>,
}

impl ConnectionSnapshot {
    pub fn is_ready(&self) -> bool {
        self.status == ConnectionStatus::Ready
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LifecycleEvent {
    StatusChanged(ConnectionSnapshot),
    /// The identity was cleared; the consuming application should reload.
    ReloadRequested,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReconnectOutcome {
    /// A new handshake ran to completion.
    Completed,
    /// Another attempt was already running; its result was awaited instead.
    Joined,
    /// Inside the cooldown window; nothing happened.
    Throttled,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReconnectReason {
    AmbientCrash,
    QueryCrash,
    Requested,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AttemptKind {
    Initialize,
    Retry,
    Reconnect,
}

impl AttemptKind {
    fn label(self) -> &'static str {
        match self {
            AttemptKind::Initialize => "initialize",
            AttemptKind::Retry => "retry",
            AttemptKind::Reconnect => "reconnect",
        }
    }

    // reconnects are already the crash response; the detector will ask again
    fn retries_on_crash(self) -> bool {
        !matches!(self, AttemptKind::Reconnect)
    }
}

type AttemptFuture = Shared<BoxFuture<'static, Result<()>>>;

struct State<B: Backend> {
    snapshot: ConnectionSnapshot,
    connection: Option<Arc<Connection<B>>>,
    identity: Option<Identity>,
    in_flight: Option<AttemptFuture>,
    // bumped by every attempt and by reset; results from an older epoch are dropped
    epoch: u64,
    initialized: bool,
    last_reconnect_start: Option<Instant>,
    last_failure: Option<ConnectionError>,
}

impl<B: Backend> State<B> {
    fn joinable(&self) -> Option<AttemptFuture> {
        self.in_flight.clone()
    }
}

impl<B: Backend> Default for State<B> {
    fn default() -> Self {
        Self {
            snapshot: ConnectionSnapshot::default(),
            connection: None,
            identity: None,
            in_flight: None,
            epoch: 0,
            initialized: false,
            last_reconnect_start: None,
            last_failure: None,
        }
    }
}

struct Inner<B: Backend, S> {
    config: ConnectionConfig,
    connector: Connector<B>,
    storage: S,
    state: Mutex<State<B>>,
    events: broadcast::Sender<LifecycleEvent>,
    requester: ReconnectRequester,
    reconnect_rx: Mutex<Option<mpsc::Receiver<ReconnectReason>>>,
}

/// Fills the single reconnect slot. Cheap to clone and hand to code that
/// should not own the manager.
#[derive(Clone, Debug)]
pub struct ReconnectRequester {
    sender: mpsc::Sender<ReconnectReason>,
}

impl ReconnectRequester {
    /// Returns `false` if a request is already pending.
    pub fn request(&self, reason: ReconnectReason) -> bool {
        match self.sender.try_send(reason) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(?reason, "reconnect already pending");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(?reason, "reconnect queue closed");
                false
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.sender.capacity() == 0
    }
}

/// Owns the single live connection to the backend application.
///
/// Construct one per application and pass clones to consumers; clones share
/// all state.
pub struct ConnectionManager<B: Backend, S> {
    inner: Arc<Inner<B, S>>,
}

impl<B: Backend, S> Clone for ConnectionManager<B, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend, S: IdentityStorage + 'static> ConnectionManager<B, S> {
    pub fn new(config: ConnectionConfig, backend: B, storage: S) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(RECONNECT_QUEUE_SLOTS);
        Self {
            inner: Arc::new(Inner {
                config,
                connector: Connector::new(backend),
                storage,
                state: Mutex::new(State::default()),
                events,
                requester: ReconnectRequester {
                    sender: reconnect_tx,
                },
                reconnect_rx: Mutex::new(Some(reconnect_rx)),
            }),
        }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.lock_state().snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock_state().connection.is_some()
    }

    pub fn backend(&self) -> &B {
        self.inner.connector.backend()
    }

    /// Establishes the connection. Runs the handshake at most once per manager;
    /// after that recovery goes through [`reconnect`](Self::reconnect) and
    /// [`retry`](Self::retry). Concurrent callers share one attempt.
    ///
    /// Once initialized, returns the error of the latest failed attempt while no
    /// connection is held, so `initialize().await?` never precedes a `NotReady`.
    pub async fn initialize(&self) -> Result<()> {
        let attempt = {
            let mut state = self.inner.lock_state();
            match state.joinable() {
                Some(attempt) => attempt,
                None if state.initialized => {
                    if state.connection.is_some() {
                        return Ok(());
                    }
                    return Err(state
                        .last_failure
                        .clone()
                        .unwrap_or(ConnectionError::NotReady));
                }
                None => self.inner.launch(AttemptKind::Initialize, &mut state),
            }
        };
        attempt.await
    }

    /// User-initiated retry. Ignores the reconnect cooldown.
    pub async fn retry(&self) -> Result<()> {
        let attempt = {
            let mut state = self.inner.lock_state();
            match state.joinable() {
                Some(attempt) => attempt,
                None => self.inner.launch(AttemptKind::Retry, &mut state),
            }
        };
        attempt.await
    }

    /// Drops the current connection and runs the handshake again with the
    /// cached identity. A call within the cooldown of the previous reconnect's
    /// start is a no-op.
    pub async fn reconnect(&self) -> Result<ReconnectOutcome> {
        let (attempt, outcome) = {
            let mut state = self.inner.lock_state();
            if let Some(attempt) = state.joinable() {
                (attempt, ReconnectOutcome::Joined)
            } else {
                let now = Instant::now();
                if let Some(last) = state.last_reconnect_start
                    && now.duration_since(last) < self.inner.config.reconnect_cooldown
                {
                    debug!(
                        since_last_ms = now.duration_since(last).as_millis() as u64,
                        "reconnect throttled"
                    );
                    return Ok(ReconnectOutcome::Throttled);
                }
                state.last_reconnect_start = Some(now);
                (
                    self.inner.launch(AttemptKind::Reconnect, &mut state),
                    ReconnectOutcome::Completed,
                )
            }
        };
        attempt.await?;
        Ok(outcome)
    }

    /// Logout. Clears the persisted identity and asks the host to reload; any
    /// attempt still running is disowned.
    #[doc(alias = "disconnect")]
    pub fn reset(&self) -> Result<()> {
        session_store::clear_identity(&self.inner.storage).map_err(storage_unavailable)?;
        let mut state = self.inner.lock_state();
        state.epoch += 1;
        state.in_flight = None;
        state.connection = None;
        state.identity = None;
        state.initialized = false;
        state.last_reconnect_start = None;
        state.last_failure = None;
        self.inner
            .publish(&mut state, ConnectionSnapshot::default());
        let _ = self.inner.events.send(LifecycleEvent::ReloadRequested);
        info!("session identity cleared; reload requested");
        Ok(())
    }

    /// Entry point for the host's global error hooks. Returns whether the host
    /// should suppress the error's default handling. Never waits for the
    /// reconnect it may request.
    pub fn report_ambient_error(&self, report: &ErrorReport) -> Disposition {
        let classification = detector::classify(report);
        match classification {
            Classification::NetworkTransient { pattern } => {
                warn!(
                    pattern,
                    source = ?report.source,
                    message = %report.message,
                    "backend temporarily unreachable"
                );
            }
            Classification::EngineCrash { pattern } => {
                warn!(
                    pattern,
                    source = ?report.source,
                    message = %report.message,
                    "engine crash signature detected"
                );
                self.request_reconnect(ReconnectReason::AmbientCrash);
            }
            Classification::Unclassified => {}
        }
        classification.disposition()
    }

    /// Puts a request in the reconnect slot. Returns `false` if a request is
    /// already pending.
    pub fn request_reconnect(&self, reason: ReconnectReason) -> bool {
        self.inner.requester.request(reason)
    }

    pub fn reconnect_requester(&self) -> ReconnectRequester {
        self.inner.requester.clone()
    }

    pub fn reconnect_pending(&self) -> bool {
        self.inner.requester.is_pending()
    }

    /// Drains the reconnect slot one request at a time until every manager
    /// clone is dropped. Only the first worker gets the queue; any later call
    /// returns at once.
    pub async fn run_reconnect_worker(&self) {
        let Some(receiver) = self.inner.take_reconnect_receiver() else {
            warn!("reconnect worker already running");
            return;
        };
        reconnect_worker(Arc::downgrade(&self.inner), receiver).await;
    }

    /// [`run_reconnect_worker`](Self::run_reconnect_worker) on its own task.
    pub fn spawn_reconnect_worker(&self) -> JoinHandle<()> {
        let receiver = self.inner.take_reconnect_receiver();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let Some(receiver) = receiver else {
                warn!("reconnect worker already running");
                return;
            };
            reconnect_worker(weak, receiver).await;
        })
    }

    pub async fn query<Req, Resp>(&self, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let connection = self
            .inner
            .lock_state()
            .connection
            .clone()
            .ok_or(ConnectionError::NotReady)?;
        let result = self.inner.connector.query(&connection, request).await;
        if let Err(err) = &result
            && err.cause().is_some_and(detector::is_crash_signature)
        {
            warn!(%err, "query hit an engine crash signature");
            self.request_reconnect(ReconnectReason::QueryCrash);
        }
        result
    }
}

async fn reconnect_worker<B: Backend, S: IdentityStorage + 'static>(
    inner: Weak<Inner<B, S>>,
    mut receiver: mpsc::Receiver<ReconnectReason>,
) {
    while let Some(reason) = receiver.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let manager = ConnectionManager { inner };
        match manager.reconnect().await {
            Ok(outcome) => debug!(?reason, ?outcome, "reconnect request handled"),
            Err(err) => warn!(?reason, %err, "reconnect request failed"),
        }
    }
    debug!("reconnect worker stopped");
}

impl<B: Backend, S: IdentityStorage + 'static> Inner<B, S> {
    fn lock_state(&self) -> MutexGuard<'_, State<B>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_reconnect_receiver(&self) -> Option<mpsc::Receiver<ReconnectReason>> {
        self.reconnect_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn publish(&self, state: &mut State<B>, snapshot: ConnectionSnapshot) {
        state.snapshot = snapshot.clone();
        let _ = self.events.send(LifecycleEvent::StatusChanged(snapshot));
    }

    /// Retires the live connection, publishes `Connecting` and spawns the
    /// attempt. Must be called with the state lock held.
    fn launch(self: &Arc<Self>, kind: AttemptKind, state: &mut State<B>) -> AttemptFuture {
        state.epoch += 1;
        let epoch = state.epoch;
        state.connection = None;
        let snapshot = ConnectionSnapshot {
            status: ConnectionStatus::Connecting,
            address: state.identity.as_ref().map(|id| id.address().to_string()),
            chain_id: None,
            last_error: None,
        };
        self.publish(state, snapshot);
        info!(attempt = kind.label(), epoch, "connection attempt started");

        let task = {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = inner.establish(kind).await;
                inner.finish(epoch, kind, outcome)
            })
        };
        let inner = Arc::clone(self);
        let future = task
            .map(move |joined| match joined {
                Ok(result) => result,
                Err(join_error) => {
                    let err = ConnectionError::AttemptAborted(join_error.to_string());
                    inner.finish(epoch, kind, Err(err))
                }
            })
            .boxed()
            .shared();
        state.in_flight = Some(future.clone());
        future
    }

    async fn establish(&self, kind: AttemptKind) -> Result<(Identity, Connection<B>)> {
        let config = self.config.validate()?;
        let identity = self.identity()?;

        let mut crash_retry_left = kind.retries_on_crash();
        loop {
            match self.handshake(&config, &identity).await {
                Ok(connection) => return Ok((identity, connection)),
                Err(err)
                    if crash_retry_left
                        && err.cause().is_some_and(detector::is_crash_signature) =>
                {
                    crash_retry_left = false;
                    warn!(
                        %err,
                        delay_ms = self.config.crash_retry_delay.as_millis() as u64,
                        "handshake hit an engine crash signature; retrying once"
                    );
                    time::sleep(self.config.crash_retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn handshake(
        &self,
        config: &ValidatedConfig,
        identity: &Identity,
    ) -> Result<Connection<B>> {
        let pending = self
            .connector
            .connect(&config.faucet_url, identity)
            .await?;
        self.connector
            .bind_application(pending, &config.application_id)
            .await
    }

    fn identity(&self) -> Result<Identity> {
        if let Some(identity) = self.lock_state().identity.clone() {
            return Ok(identity);
        }
        session_store::get_or_create_identity(&self.storage).map_err(storage_unavailable)
    }

    fn finish(
        &self,
        epoch: u64,
        kind: AttemptKind,
        outcome: Result<(Identity, Connection<B>)>,
    ) -> Result<()> {
        let mut state = self.lock_state();
        if state.epoch != epoch {
            debug!(
                attempt = kind.label(),
                epoch, "discarding result of superseded attempt"
            );
            return Err(ConnectionError::AttemptAborted(
                "superseded by a newer attempt or reset".to_string(),
            ));
        }
        state.in_flight = None;

        match outcome {
            Ok((identity, connection)) => {
                let snapshot = ConnectionSnapshot {
                    status: ConnectionStatus::Ready,
                    address: Some(connection.address().to_string()),
                    chain_id: Some(connection.chain_id().to_string()),
                    last_error: None,
                };
                info!(
                    attempt = kind.label(),
                    chain_id = connection.chain_id(),
                    "connection ready"
                );
                state.identity = Some(identity);
                state.connection = Some(Arc::new(connection));
                state.initialized = true;
                state.last_failure = None;
                self.publish(&mut state, snapshot);
                Ok(())
            }
            Err(err) => {
                error!(attempt = kind.label(), %err, "connection attempt failed");
                let snapshot = ConnectionSnapshot {
                    status: ConnectionStatus::Error(err.to_string()),
                    address: state.identity.as_ref().map(|id| id.address().to_string()),
                    chain_id: None,
                    last_error: Some(err.to_string()),
                };
                state.last_failure = Some(err.clone());
                self.publish(&mut state, snapshot);
                Err(err)
            }
        }
    }
}

fn storage_unavailable(err: anyhow::Error) -> ConnectionError {
    ConnectionError::StorageUnavailable(format!("{err:#}"))
}
