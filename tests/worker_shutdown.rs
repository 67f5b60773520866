//! TERMINATE reaching a worker that still waits for a CONFIRM.

mod common;

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use common::*;
use farmnet::{
    backoff::BackoffConfig,
    connection::{ConfirmedInput, ConnectionEvent, InputKind, LoadBalancedConnection},
    role::Worker,
    Context, Counters, Envelope, ErrorKind, Link, Message, TransportConfig,
};
use tokio::task::JoinHandle;

struct Harness {
    dispatcher: LoadBalancedConnection,
    downstream: ConfirmedInput,
    worker: JoinHandle<Result<(), farmnet::TransportError>>,
    counters: Arc<Counters>,
}

async fn start(ctx: &Context, prefix: &str) -> Harness {
    let input = inproc(&format!("{prefix}-in"));
    let output = inproc(&format!("{prefix}-out"));
    let mut dispatcher = LoadBalancedConnection::open(ctx, &Link::bind(input.clone()), Arc::default())
        .await
        .unwrap();
    let downstream = ConfirmedInput::open(ctx, &Link::bind(output.clone()), Arc::default())
        .await
        .unwrap();

    let counters = Arc::new(Counters::default());
    let worker = Worker::new(
        ctx,
        "worker",
        InputKind::LoadBalanced,
        &Link::connect(input),
        &Link::connect(output),
        counters.clone(),
    )
    .await
    .unwrap();
    let worker = spawn_role(worker.run());

    while !matches!(
        next_event(&mut dispatcher).await,
        ConnectionEvent::PeerReady(_)
    ) {}

    Harness {
        dispatcher,
        downstream,
        worker,
        counters,
    }
}

/// Hands the worker one event and returns it as seen downstream, unconfirmed.
async fn put_in_flight(harness: &mut Harness) -> Envelope {
    harness.dispatcher.dispatch(Message::event_from("in-flight")).unwrap();
    let envelope = next_message(&mut harness.downstream).await;
    assert_eq!(envelope.message.frames(), &[Bytes::from("in-flight")]);
    envelope
}

#[tokio::test]
async fn terminate_waits_for_outstanding_confirm() {
    let ctx = context();
    let mut harness = start(&ctx, "p6").await;
    let envelope = put_in_flight(&mut harness).await;

    assert_eq!(harness.dispatcher.broadcast_terminate(), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!harness.worker.is_finished());

    harness.downstream.confirm(envelope.identity).unwrap();
    next_terminate(&mut harness.downstream).await;
    join(harness.worker).await.unwrap();

    let stats = harness.counters.snapshot();
    assert_eq!(stats.confirms_received, 1);
    assert_eq!(stats.terminates_received, 1);
    assert_eq!(stats.drain_timeouts, 0);
}

#[tokio::test]
async fn terminate_gives_up_after_timeout() {
    init_tracing();
    let ctx = Context::new(TransportConfig {
        terminate_timeout: Duration::from_millis(300),
        ..fast_config()
    });
    let mut harness = start(&ctx, "p6-timeout").await;
    let _unconfirmed = put_in_flight(&mut harness).await;

    harness.dispatcher.broadcast_terminate();
    next_terminate(&mut harness.downstream).await;
    join(harness.worker).await.unwrap();

    let stats = harness.counters.snapshot();
    assert_eq!(stats.confirms_received, 0);
    assert_eq!(stats.drain_timeouts, 1);
}

#[tokio::test]
async fn events_after_terminate_are_left_to_the_dispatcher() {
    let ctx = context();
    let mut harness = start(&ctx, "p6-late").await;
    let envelope = put_in_flight(&mut harness).await;

    // READY for the first event comes back before its CONFIRM.
    while !matches!(
        next_event(&mut harness.dispatcher).await,
        ConnectionEvent::PeerReady(_)
    ) {}
    harness.dispatcher.broadcast_terminate();
    harness.dispatcher.dispatch(Message::event_from("late")).unwrap();

    harness.downstream.confirm(envelope.identity).unwrap();
    next_terminate(&mut harness.downstream).await;
    join(harness.worker).await.unwrap();

    // The worker never released the late event, so losing it reinjects it.
    while !matches!(
        next_event(&mut harness.dispatcher).await,
        ConnectionEvent::PeerLost(_)
    ) {}
    assert_eq!(harness.dispatcher.backlog_len(), 1);
    assert_eq!(harness.counters.snapshot().events_sent, 1);
}

#[tokio::test]
async fn dropped_events_still_ask_for_more() {
    let ctx = context();
    let mut dispatcher =
        LoadBalancedConnection::open(&ctx, &Link::bind(inproc("drop-in")), Arc::default())
            .await
            .unwrap();
    let mut downstream =
        ConfirmedInput::open(&ctx, &Link::bind(inproc("drop-out")), Arc::default())
            .await
            .unwrap();

    let counters = Arc::new(Counters::default());
    let worker = Worker::new(
        &ctx,
        "filtering worker",
        InputKind::LoadBalanced,
        &Link::connect(inproc("drop-in")),
        &Link::connect(inproc("drop-out")),
        counters.clone(),
    )
    .await
    .unwrap()
    .with_processor(|frames: Vec<Bytes>| (frames[0] != Bytes::from("noise")).then_some(frames));
    let worker = spawn_role(worker.run());

    while !matches!(next_event(&mut dispatcher).await, ConnectionEvent::PeerReady(_)) {}
    dispatcher.dispatch(Message::event_from("noise")).unwrap();
    while !matches!(next_event(&mut dispatcher).await, ConnectionEvent::PeerReady(_)) {}
    dispatcher.dispatch(Message::event_from("signal")).unwrap();

    let envelope = next_message(&mut downstream).await;
    assert_eq!(envelope.message.frames(), &[Bytes::from("signal")]);
    downstream.confirm(envelope.identity).unwrap();

    dispatcher.broadcast_terminate();
    next_terminate(&mut downstream).await;
    join(worker).await.unwrap();
    assert_eq!(counters.snapshot().events_sent, 1);
}

#[tokio::test]
async fn unreachable_peers_end_the_worker_with_a_fatal_error() {
    init_tracing();
    let ctx = Context::new(TransportConfig {
        reconnect: BackoffConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            max_retries: Some(3),
        },
        ..fast_config()
    });

    let counters = Arc::new(Counters::default());
    let worker = Worker::new(
        &ctx,
        "stranded worker",
        InputKind::LoadBalanced,
        &Link::connect(inproc("never-bound-in")),
        &Link::connect(inproc("never-bound-out")),
        counters.clone(),
    )
    .await
    .unwrap();

    let err = join(spawn_role(worker.run())).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReconnectExhausted);
    assert!(err.is_fatal());
    assert!(counters.snapshot().reconnects_exhausted >= 1);
    assert_eq!(counters.snapshot().events_sent, 0);
}
