//! A whole farm in one process: source, distributor, two workers, collector, final collector and its sinks.

mod common;

use std::{collections::HashSet, sync::Arc};

use bytes::Bytes;
use common::*;
use farmnet::{
    connection::{ConfirmedConnection, ConnectionEvent, InputKind, RawConnection},
    role::{Collector, Distributor, DualRawFanOut, FinalCollectorWithRoi, LoadBalancedForward, Worker},
    Context, Counters, Link, Message,
};

const EVENTS: usize = 10;

struct Farm {
    source: ConfirmedConnection,
    source_counters: Arc<Counters>,
    final_counters: Arc<Counters>,
    storage: RawConnection,
    roi: Option<RawConnection>,
    roles: Vec<tokio::task::JoinHandle<Result<(), farmnet::TransportError>>>,
}

async fn sink_consumer(ctx: &Context, name: &str) -> RawConnection {
    let mut consumer = RawConnection::source(ctx, &Link::connect(inproc(name)), Arc::default())
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut consumer).await,
        ConnectionEvent::PeerJoined(_)
    ));
    consumer
}

async fn start_farm(prefix: &str, with_roi: bool) -> Farm {
    let ctx = context();
    let ep = |name: &str| inproc(&format!("{prefix}-{name}"));
    let mut roles = Vec::new();

    let final_counters = Arc::new(Counters::default());
    let output = DualRawFanOut::open(
        &ctx,
        &Link::bind(ep("storage")),
        &Link::bind(ep("roi")),
        final_counters.clone(),
    )
    .await
    .unwrap();
    let storage = sink_consumer(&ctx, &format!("{prefix}-storage")).await;
    let roi = if with_roi {
        Some(sink_consumer(&ctx, &format!("{prefix}-roi")).await)
    } else {
        None
    };
    let final_collector = FinalCollectorWithRoi::new(
        &ctx,
        "final",
        InputKind::LoadBalanced,
        &Link::connect(ep("collector-out")),
        output,
        final_counters.clone(),
    )
    .await
    .unwrap();
    roles.push(spawn_role(final_collector.run()));

    let collector_counters = Arc::new(Counters::default());
    let output = LoadBalancedForward::open(
        &ctx,
        &Link::bind(ep("collector-out")),
        collector_counters.clone(),
    )
    .await
    .unwrap();
    let collector = Collector::new(
        &ctx,
        "collector",
        InputKind::Confirmed,
        &Link::bind(ep("collector-in")),
        output,
        collector_counters,
    )
    .await
    .unwrap();
    roles.push(spawn_role(collector.run()));

    let distributor = Distributor::new(
        &ctx,
        "distributor",
        InputKind::Confirmed,
        &Link::bind(ep("source")),
        &Link::bind(ep("workers")),
        Arc::default(),
    )
    .await
    .unwrap();
    roles.push(spawn_role(distributor.run()));

    for i in 0..2 {
        let worker = Worker::new(
            &ctx,
            format!("worker-{i}"),
            InputKind::LoadBalanced,
            &Link::connect(ep("workers")),
            &Link::connect(ep("collector-in")),
            Arc::default(),
        )
        .await
        .unwrap();
        roles.push(spawn_role(worker.run()));
    }

    let source_counters = Arc::new(Counters::default());
    let source = ConfirmedConnection::open(&ctx, &Link::connect(ep("source")), source_counters.clone())
        .await
        .unwrap();

    Farm {
        source,
        source_counters,
        final_counters,
        storage,
        roi,
        roles,
    }
}

fn payload(i: usize) -> Bytes {
    Bytes::from(format!("event-{i}"))
}

async fn inject_and_terminate(farm: &mut Farm) {
    for i in 0..EVENTS {
        send_confirmed(&mut farm.source, Message::event(vec![payload(i)])).await;
    }
    assert!(farm.source.send_control(Message::terminate()));
}

async fn drain_sink(sink: &mut RawConnection) -> HashSet<Bytes> {
    let mut received = HashSet::new();
    while received.len() < EVENTS {
        let envelope = next_message(sink).await;
        received.insert(envelope.message.frames().concat().into());
    }
    received
}

#[tokio::test]
async fn every_event_reaches_both_sinks() {
    let mut farm = start_farm("e2e", true).await;
    inject_and_terminate(&mut farm).await;

    let expected: HashSet<Bytes> = (0..EVENTS).map(payload).collect();
    assert_eq!(drain_sink(&mut farm.storage).await, expected);
    let roi = farm.roi.as_mut().unwrap();
    assert_eq!(drain_sink(roi).await, expected);

    for role in farm.roles.drain(..) {
        join(role).await.unwrap();
    }

    assert_eq!(farm.source_counters.snapshot().confirms_received, EVENTS as u64);
    let final_stats = farm.final_counters.snapshot();
    assert_eq!(final_stats.raw_writes, 2 * EVENTS as u64);
    assert_eq!(final_stats.sink_degraded, 0);
}

#[tokio::test]
async fn missing_roi_sink_degrades_without_stalling() {
    let mut farm = start_farm("e2e-no-roi", false).await;
    inject_and_terminate(&mut farm).await;

    let expected: HashSet<Bytes> = (0..EVENTS).map(payload).collect();
    assert_eq!(drain_sink(&mut farm.storage).await, expected);

    for role in farm.roles.drain(..) {
        join(role).await.unwrap();
    }

    assert_eq!(farm.source_counters.snapshot().confirms_received, EVENTS as u64);
    let final_stats = farm.final_counters.snapshot();
    assert_eq!(final_stats.raw_writes, EVENTS as u64);
    assert_eq!(final_stats.sink_degraded, EVENTS as u64);
}
