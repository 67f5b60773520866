//! A raw sink that stops reading pauses the final collector instead of growing its queue.

mod common;

use std::{future::poll_fn, sync::Arc};

use bytes::Bytes;
use common::*;
use farmnet::{
    role::{DualRawFanOut, Output},
    Connection, Context, Counters, Endpoint, Link, Message, TransportConfig,
};
use tokio::{io::AsyncReadExt, net::TcpListener};

const HIGH_WATER: usize = 64 * 1024;

async fn stalled_sink() -> (TcpListener, Link) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, Link::connect(Endpoint::tcp("127.0.0.1", port)))
}

/// Polls the fan-out's connections until both sinks report a peer.
async fn wait_connected(fan_out: &mut DualRawFanOut) {
    let mut joined = 0;
    tokio::time::timeout(WAIT, async {
        while joined < 2 {
            let event = poll_fn(|cx| {
                for connection in fan_out.connections() {
                    if let std::task::Poll::Ready(event) = connection.poll_event(cx) {
                        return std::task::Poll::Ready(event);
                    }
                }
                std::task::Poll::Pending
            })
            .await
            .unwrap();
            if matches!(event, farmnet::ConnectionEvent::PeerJoined(_)) {
                joined += 1;
            }
        }
    })
    .await
    .expect("sinks never connected");
}

#[tokio::test]
async fn unread_sink_stops_acceptance_until_drained() {
    init_tracing();
    let ctx = Context::new(TransportConfig {
        sink_high_water: HIGH_WATER,
        ..fast_config()
    });

    let (storage_listener, storage) = stalled_sink().await;
    let (roi_listener, roi) = stalled_sink().await;
    let counters = Arc::new(Counters::default());
    let mut fan_out = DualRawFanOut::open(&ctx, &storage, &roi, counters.clone())
        .await
        .unwrap();

    let (storage_stream, _) = storage_listener.accept().await.unwrap();
    let (roi_stream, _) = roi_listener.accept().await.unwrap();
    wait_connected(&mut fan_out).await;
    assert!(fan_out.can_accept());

    // Nothing yields between writes, so no session gets to flush.
    let blob = Bytes::from(vec![7u8; 4096]);
    let mut forwarded = 0;
    while fan_out.can_accept() {
        fan_out.forward(Message::event(vec![blob.clone()])).unwrap();
        forwarded += 1;
        assert!(forwarded <= HIGH_WATER / blob.len(), "queue grew past the high-water mark");
    }
    assert_eq!(forwarded, HIGH_WATER / blob.len());
    assert_eq!(counters.snapshot().sink_degraded, 0);

    let drain = |mut stream: tokio::net::TcpStream| {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            while stream.read(&mut buf).await.is_ok_and(|n| n > 0) {}
        })
    };
    let storage_reader = drain(storage_stream);
    let roi_reader = drain(roi_stream);

    wait_until(|| fan_out.can_accept()).await;

    fan_out.shutdown().await;
    storage_reader.await.unwrap();
    roi_reader.await.unwrap();
}

#[tokio::test]
async fn absent_sink_never_blocks() {
    init_tracing();
    let ctx = Context::new(TransportConfig {
        sink_high_water: HIGH_WATER,
        ..fast_config()
    });

    let counters = Arc::new(Counters::default());
    let mut fan_out = DualRawFanOut::open(
        &ctx,
        &Link::connect(inproc("backpressure-storage")),
        &Link::connect(inproc("backpressure-roi")),
        counters.clone(),
    )
    .await
    .unwrap();

    let blob = Bytes::from(vec![7u8; 4096]);
    for _ in 0..64 {
        assert!(fan_out.can_accept());
        fan_out.forward(Message::event(vec![blob.clone()])).unwrap();
    }
    assert_eq!(counters.snapshot().sink_degraded, 128);

    fan_out.shutdown().await;
}
