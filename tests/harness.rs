#![allow(non_snake_case)]

mod crash_recovery;

use portfolio_connection::{
    ConnectionConfig,
    ConnectionStatus,
    LifecycleEvent,
};
use std::time::Duration;
use tokio::sync::broadcast;

pub fn local_config() -> ConnectionConfig {
    ConnectionConfig::new("http://localhost:8079", "portfolio-app")
        .with_reconnect_cooldown(Duration::from_secs(5))
        .with_crash_retry_delay(Duration::from_millis(250))
}

/// Statuses received until the connection settles on `Ready` or `Error`.
pub async fn statuses_until_settled(
    events: &mut broadcast::Receiver<LifecycleEvent>,
) -> Vec<ConnectionStatus> {
    let mut seen = Vec::new();
    let collect = async {
        loop {
            match events.recv().await {
                Ok(LifecycleEvent::StatusChanged(snapshot)) => {
                    let settled = matches!(
                        snapshot.status,
                        ConnectionStatus::Ready | ConnectionStatus::Error(_)
                    );
                    seen.push(snapshot.status);
                    if settled {
                        return;
                    }
                }
                Ok(LifecycleEvent::ReloadRequested) => {}
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(60), collect)
        .await
        .expect("connection never settled");
    seen
}
