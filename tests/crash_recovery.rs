use crate::{
    local_config,
    statuses_until_settled,
};
use portfolio_connection::{
    ConnectionManager,
    ConnectionStatus,
    Disposition,
    ErrorReport,
    InMemoryIdentityStorage,
    ReconnectOutcome,
    test_helpers::{
        MockBackend,
        MockCall,
    },
};
use std::time::Duration;

const ENGINE_STACK: &str = "RuntimeError: unreachable
    at wasm-function[4021]:0x3b2c1
    at linera_web_bg.wasm:0x3b2c1";

fn ready_manager_parts() -> (
    ConnectionManager<MockBackend, InMemoryIdentityStorage>,
    MockBackend,
) {
    let backend = MockBackend::new();
    let manager = ConnectionManager::new(
        local_config(),
        backend.clone(),
        InMemoryIdentityStorage::new(),
    );
    (manager, backend)
}

#[tokio::test(start_paused = true)]
async fn report_ambient_error__engine_trap__reconnects_once() {
    // given
    let (manager, backend) = ready_manager_parts();
    manager.initialize().await.unwrap();
    let worker = manager.spawn_reconnect_worker();
    let mut events = manager.subscribe();
    let address = manager.snapshot().address;

    // when
    let disposition = manager
        .report_ambient_error(&ErrorReport::error_event("unreachable").with_stack(ENGINE_STACK));
    let statuses = statuses_until_settled(&mut events).await;

    // then
    assert_eq!(disposition, Disposition::SuppressAndReconnect);
    assert_eq!(
        statuses,
        vec![ConnectionStatus::Connecting, ConnectionStatus::Ready]
    );
    assert_eq!(backend.calls(MockCall::Bootstrap), 2);
    assert_eq!(manager.snapshot().address, address);
    worker.abort();
}

#[tokio::test(start_paused = true)]
async fn report_ambient_error__engine_trap_and_failing_backend__settles_on_error() {
    // given
    let (manager, backend) = ready_manager_parts();
    manager.initialize().await.unwrap();
    let worker = manager.spawn_reconnect_worker();
    let mut events = manager.subscribe();
    backend.fail_next(MockCall::ChainAssignment, "faucet returned 503");

    // when
    manager.report_ambient_error(
        &ErrorReport::unhandled_rejection("unreachable").with_stack(ENGINE_STACK),
    );
    let statuses = statuses_until_settled(&mut events).await;

    // then
    assert_eq!(statuses.first(), Some(&ConnectionStatus::Connecting));
    assert!(matches!(statuses.last(), Some(ConnectionStatus::Error(_))));
    assert_eq!(backend.calls(MockCall::Bootstrap), 2);
    worker.abort();
}

#[tokio::test(start_paused = true)]
async fn report_ambient_error__trap_burst__reconnects_once_per_cooldown() {
    // given
    let (manager, backend) = ready_manager_parts();
    manager.initialize().await.unwrap();
    let worker = manager.spawn_reconnect_worker();
    let mut events = manager.subscribe();
    let report = ErrorReport::error_event("RuntimeError: unreachable").with_stack(ENGINE_STACK);

    // when
    manager.report_ambient_error(&report);
    statuses_until_settled(&mut events).await;
    for _ in 0..5 {
        manager.report_ambient_error(&report);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // then
    assert_eq!(backend.calls(MockCall::Bootstrap), 2);
    assert!(manager.snapshot().is_ready());
    worker.abort();
}

#[tokio::test(start_paused = true)]
async fn report_ambient_error__network_fault__leaves_connection_alone() {
    // given
    let (manager, backend) = ready_manager_parts();
    manager.initialize().await.unwrap();
    let worker = manager.spawn_reconnect_worker();

    // when
    let report = ErrorReport::unhandled_rejection(
        "TypeError: NetworkError when attempting to fetch resource.",
    );
    let disposition = manager.report_ambient_error(&report);
    tokio::time::sleep(Duration::from_secs(1)).await;

    // then
    assert_eq!(disposition, Disposition::Suppress);
    assert_eq!(backend.calls(MockCall::Bootstrap), 1);
    assert!(manager.snapshot().is_ready());
    worker.abort();
}

#[tokio::test(start_paused = true)]
async fn reconnect__after_cooldown_expires__runs_again() {
    // given
    let (manager, backend) = ready_manager_parts();
    manager.initialize().await.unwrap();
    manager.reconnect().await.unwrap();

    // when
    let throttled = manager.reconnect().await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;
    let completed = manager.reconnect().await.unwrap();

    // then
    assert_eq!(throttled, ReconnectOutcome::Throttled);
    assert_eq!(completed, ReconnectOutcome::Completed);
    assert_eq!(backend.calls(MockCall::Bootstrap), 3);
}
