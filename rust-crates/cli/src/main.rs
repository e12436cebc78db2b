use clap::Parser;
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use portfolio_connection::{
    ConnectionConfig,
    ConnectionManager,
    ConnectionSnapshot,
    FileIdentityStorage,
    GraphQlBackend,
    LifecycleEvent,
};
use serde_json::Value;
use session_store::{
    clear_identity,
    resolve_session_dir,
};
use std::sync::OnceLock;
use tokio::sync::broadcast::{
    self,
    error::RecvError,
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};
use url::Url;

const LOG_DIR: &str = "logs";
const LOG_FILE_PREFIX: &str = "portfolio-connect.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Connect to a portfolio application backend and report connection status",
    long_about = None
)]
struct Args {
    /// Faucet GraphQL endpoint. Falls back to PORTFOLIO_FAUCET_URL.
    #[arg(short, long)]
    faucet_url: Option<String>,

    /// Node service serving the application. Not needed with --logout.
    #[arg(short, long, required_unless_present = "logout")]
    node_url: Option<Url>,

    /// Falls back to PORTFOLIO_APPLICATION_ID.
    #[arg(short, long)]
    application_id: Option<String>,

    /// Where the session identity lives (default ~/.portfolio/session).
    #[arg(long)]
    identity_dir: Option<String>,

    /// JSON request to send once the connection is ready.
    #[arg(short, long)]
    query: Option<String>,

    /// Clear the stored identity and exit.
    #[arg(long, default_value = "false")]
    logout: bool,

    /// Write logs to a daily rolling file instead of stderr.
    #[arg(short, long, default_value = "false")]
    tracing: bool,
}

impl Args {
    fn connection_config(&self, base: ConnectionConfig) -> ConnectionConfig {
        ConnectionConfig {
            faucet_url: self.faucet_url.clone().or(base.faucet_url),
            application_id: self.application_id.clone().or(base.application_id),
            ..base
        }
    }
}

fn init_tracing(to_file: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = if to_file {
        let appender = rolling::daily(LOG_DIR, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = LOG_GUARD.set(guard);
        fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
    };
    installed.map_err(|e| eyre!("failed to install tracing subscriber: {e}"))
}

async fn handle_interupt() {
    match tokio::signal::ctrl_c().await {
        Ok(_) => tracing::info!("Received interrupt, exiting"),
        Err(_) => tracing::warn!("Received interrupt error, exiting anyway"),
    }
}

fn describe(snapshot: &ConnectionSnapshot) -> String {
    let mut line = format!("status: {}", snapshot.status);
    if let Some(address) = &snapshot.address {
        line.push_str(&format!(" | address: {address}"));
    }
    if let Some(chain_id) = &snapshot.chain_id {
        line.push_str(&format!(" | chain: {chain_id}"));
    }
    line
}

async fn print_events(mut events: broadcast::Receiver<LifecycleEvent>) {
    loop {
        match events.recv().await {
            Ok(LifecycleEvent::StatusChanged(snapshot)) => {
                println!("{}", describe(&snapshot))
            }
            Ok(LifecycleEvent::ReloadRequested) => {
                println!("identity cleared; restart to continue")
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "status printer fell behind")
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    init_tracing(args.tracing)?;

    let session_dir = resolve_session_dir(args.identity_dir.as_deref());
    let storage = FileIdentityStorage::open(&session_dir).map_err(|e| {
        eyre!("opening identity store at {}: {e:#}", session_dir.display())
    })?;

    if args.logout {
        clear_identity(&storage).map_err(|e| eyre!("clearing stored identity: {e:#}"))?;
        println!("identity cleared from {}", session_dir.display());
        return Ok(());
    }

    let node_url = args
        .node_url
        .clone()
        .ok_or_else(|| eyre!("--node-url is required to connect"))?;
    let config = args.connection_config(
        ConnectionConfig::from_env().wrap_err("reading connection settings from environment")?,
    );
    let backend = GraphQlBackend::new(node_url.clone())?;
    let manager = ConnectionManager::new(config, backend, storage);

    let printer = tokio::spawn(print_events(manager.subscribe()));
    let worker = manager.spawn_reconnect_worker();
    tracing::info!(%node_url, "starting portfolio-connect");

    manager
        .initialize()
        .await
        .wrap_err("failed to connect to the application backend")?;

    if let Some(raw) = &args.query {
        let request: Value =
            serde_json::from_str(raw).wrap_err("--query must be valid JSON")?;
        let response: Value = manager.query(&request).await?;
        println!("{}", serde_json::to_string_pretty(&response)?);
    }

    handle_interupt().await;
    worker.abort();
    printer.abort();
    Ok(())
}
