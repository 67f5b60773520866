//! A two-level histogram tree: leaves feed a proxy server, which feeds the root next to a direct leaf.

mod common;

use std::sync::Arc;

use common::*;
use farmnet::{
    connection::{ConfirmedConnection, InputKind},
    histogram::{self, Histogram, HistogramSet, MemoryHistogramStore},
    role::{ProxyHistogramServer, RawHistogramServer},
    Context, Counters, Link, Message,
};

fn energy(fills: &[f64]) -> HistogramSet {
    let mut h = Histogram::new(20, 0.0, 100.0);
    for x in fills {
        h.fill(*x);
    }
    let mut hits = Histogram::new(4, 0.0, 4.0);
    hits.fill_n(1.5, fills.len() as u64);
    [("energy".to_string(), h), ("hits".to_string(), hits)]
        .into_iter()
        .collect()
}

async fn leaf(ctx: &Context, parent: &str) -> ConfirmedConnection {
    ConfirmedConnection::open(ctx, &Link::connect(inproc(parent)), Arc::default())
        .await
        .unwrap()
}

async fn report(leaf: &mut ConfirmedConnection, source: &str, set: &HistogramSet) {
    let message = histogram::encode_message(source, set, 6).await.unwrap();
    send_confirmed(leaf, message).await;
}

#[tokio::test]
async fn root_stores_the_merge_of_every_latest_update() {
    let ctx = context();
    let store = MemoryHistogramStore::new();

    let root_counters = Arc::new(Counters::default());
    let root = RawHistogramServer::new(
        &ctx,
        "root",
        InputKind::Confirmed,
        &Link::bind(inproc("hist-root")),
        store.clone(),
        root_counters.clone(),
    )
    .await
    .unwrap();
    let root = spawn_role(root.run());

    let proxy_counters = Arc::new(Counters::default());
    let proxy = ProxyHistogramServer::new(
        &ctx,
        "proxy",
        "proxy-a",
        InputKind::Confirmed,
        &Link::bind(inproc("hist-proxy")),
        &Link::connect(inproc("hist-root")),
        proxy_counters.clone(),
    )
    .await
    .unwrap();
    let proxy = spawn_role(proxy.run());

    let first = energy(&[10.0, 20.0, 30.0]);
    let second = energy(&[55.0, 99.0]);
    let direct = energy(&[5.0]);

    let mut leaf_1 = leaf(&ctx, "hist-proxy").await;
    let mut leaf_2 = leaf(&ctx, "hist-proxy").await;
    let mut leaf_3 = leaf(&ctx, "hist-root").await;

    // Superseded by the next report from the same source.
    report(&mut leaf_1, "leaf-1", &energy(&[1.0])).await;
    report(&mut leaf_1, "leaf-1", &first).await;
    report(&mut leaf_2, "leaf-2", &second).await;
    report(&mut leaf_3, "leaf-3", &direct).await;

    assert!(leaf_1.send_control(Message::terminate()));
    assert!(leaf_2.send_control(Message::terminate()));
    join(proxy).await.unwrap();

    assert!(leaf_3.send_control(Message::terminate()));
    join(root).await.unwrap();

    let expected = HistogramSet::merged([&first, &second, &direct]).unwrap();
    assert_eq!(store.latest(), Some(expected));
    assert_eq!(proxy_counters.snapshot().histograms_merged, 3);
    assert!(proxy_counters.snapshot().histograms_flushed >= 1);
    assert!(root_counters.snapshot().histograms_flushed >= 1);
}

#[tokio::test]
async fn incompatible_update_is_dropped_and_the_rest_kept() {
    let ctx = context();
    let store = MemoryHistogramStore::new();
    let counters = Arc::new(Counters::default());
    let root = RawHistogramServer::new(
        &ctx,
        "root",
        InputKind::Confirmed,
        &Link::bind(inproc("hist-mismatch")),
        store.clone(),
        counters.clone(),
    )
    .await
    .unwrap();
    let root = spawn_role(root.run());

    let good = energy(&[42.0]);
    let mut coarse = Histogram::new(2, 0.0, 100.0);
    coarse.fill(42.0);
    let bad: HistogramSet = [("energy".to_string(), coarse)].into_iter().collect();

    let mut leaf_1 = leaf(&ctx, "hist-mismatch").await;
    report(&mut leaf_1, "leaf-1", &good).await;
    report(&mut leaf_1, "leaf-2", &bad).await;
    assert!(leaf_1.send_control(Message::terminate()));
    join(root).await.unwrap();

    assert_eq!(store.latest(), Some(good));
    assert_eq!(counters.snapshot().histogram_mismatches, 1);
    assert_eq!(counters.snapshot().histograms_merged, 1);
}
