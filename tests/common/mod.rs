//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::{future::Future, time::Duration};

use farmnet::{
    backoff::BackoffConfig,
    connection::{ConfirmedConnection, Connection, ConnectionExt},
    Context, ConnectionEvent, Endpoint, Envelope, Message, TransportConfig, TransportError,
};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// Upper bound on any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(10);

/// Short timers so tests finish quickly, with enough retries that roles started in any order find each other.
pub fn fast_config() -> TransportConfig {
    TransportConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_secs(2),
        reconnect: BackoffConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            max_retries: Some(50),
        },
        poll_timeout: Duration::from_millis(20),
        terminate_timeout: Duration::from_secs(2),
        linger: Duration::from_millis(200),
        histogram_flush_interval: Duration::from_millis(50),
        stats_interval: Duration::from_secs(60),
        ..TransportConfig::default()
    }
}

pub fn context() -> Context {
    init_tracing();
    Context::new(fast_config())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn inproc(name: &str) -> Endpoint {
    Endpoint::inproc(name)
}

/// Next event of `connection`, failing the test on error or after [`WAIT`].
pub async fn next_event<C: Connection>(connection: &mut C) -> ConnectionEvent {
    tokio::time::timeout(WAIT, connection.next_event())
        .await
        .expect("timed out waiting for a connection event")
        .expect("connection failed")
}

/// Skips events until an EVENT arrives.
pub async fn next_message<C: Connection>(connection: &mut C) -> Envelope {
    loop {
        if let ConnectionEvent::Event(envelope) = next_event(connection).await {
            return envelope;
        }
    }
}

/// Skips events until TERMINATE arrives.
pub async fn next_terminate<C: Connection>(connection: &mut C) {
    while !matches!(
        next_event(connection).await,
        ConnectionEvent::Terminate { .. }
    ) {}
}

/// Sends one EVENT and waits for its CONFIRM.
pub async fn send_confirmed(connection: &mut ConfirmedConnection, message: Message) {
    connection.send(message).expect("send");
    while !matches!(next_event(connection).await, ConnectionEvent::Confirmed) {}
}

/// Polls `condition` until it holds, failing the test after [`WAIT`].
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

pub fn spawn_role<F>(role: F) -> JoinHandle<Result<(), TransportError>>
where
    F: Future<Output = Result<(), TransportError>> + Send + 'static,
{
    tokio::spawn(role)
}

/// Waits for a spawned role to return.
pub async fn join(handle: JoinHandle<Result<(), TransportError>>) -> Result<(), TransportError> {
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("role did not finish")
        .expect("role panicked")
}
