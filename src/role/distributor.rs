//! The single entry point of a farm.

use std::sync::Arc;

use crate::{
    config::TransportConfig,
    connection::{ConnectionEvent, InputKind, LoadBalancedConnection, Upstream},
    endpoint::Link,
    error::TransportError,
    metrics::Counters,
    reactor::{Reactor, ReactorEvent, Source, TimerId},
    socket::Context,
};

const OUTPUT: usize = 0;
const INPUT: usize = 1;

/// Reads events from a confirmed or raw source and fans them out to workers over a load-balanced connection.
///
/// Exactly one upstream event is read per dispatch, and only while a worker is READY and nothing is queued, so
/// a saturated farm stops reading its source rather than buffering. When the upstream finishes the distributor
/// waits for every dispatched event to be released, broadcasts TERMINATE to the workers and returns.
#[derive(Debug)]
pub struct Distributor {
    description: String,
    upstream: Upstream,
    output: LoadBalancedConnection,
    reactor: Reactor,
    stats: TimerId,
    config: TransportConfig,
    counters: Arc<Counters>,
}

impl Distributor {
    /// Opens the upstream and the load-balanced output.
    pub async fn new(
        ctx: &Context,
        description: impl Into<String>,
        input_kind: InputKind,
        input: &Link,
        output: &Link,
        counters: Arc<Counters>,
    ) -> Result<Self, TransportError> {
        let config = ctx.config().clone();
        let upstream = Upstream::open(ctx, input_kind, input, counters.clone()).await?;
        let output = LoadBalancedConnection::open(ctx, output, counters.clone()).await?;
        let mut reactor = Reactor::new(config.poll_timeout);
        let stats = reactor.interval("stats", config.stats_interval);
        Ok(Distributor {
            description: description.into(),
            upstream,
            output,
            reactor,
            stats,
            config,
            counters,
        })
    }

    /// Runs until the upstream is finished and the workers have been told to terminate.
    pub async fn run(mut self) -> Result<(), TransportError> {
        tracing::info!(role = %self.description, "distributor running");
        let mut paused = false;

        while !self.upstream.is_finished() {
            let read = self.output.has_ready_peer() && self.output.backlog_len() == 0;
            let saturated = !read && self.output.balancer().peer_count() > 0;
            if saturated && !paused {
                Counters::incr(&self.counters.backpressure_pauses);
                tracing::debug!(role = %self.description, "no worker ready, pausing upstream");
            }
            paused = saturated;

            let event = self
                .reactor
                .poll(&mut [
                    Source::new(&mut self.output),
                    Source::new(&mut self.upstream).when(read),
                ])
                .await?;

            match event {
                ReactorEvent::Connection {
                    source: INPUT,
                    event: ConnectionEvent::Event(envelope),
                } => {
                    self.output.dispatch(envelope.message)?;
                    self.upstream.acknowledge(envelope.identity)?;
                }
                ReactorEvent::Connection {
                    source: INPUT,
                    event: ConnectionEvent::Terminate { from },
                } => {
                    tracing::info!(role = %self.description, peer = %from, "upstream terminated");
                }
                ReactorEvent::Connection {
                    source: OUTPUT,
                    event: ConnectionEvent::PeerLost(identity),
                } => {
                    tracing::info!(role = %self.description, worker = %identity, "worker left");
                }
                ReactorEvent::Timer(id) if id == self.stats => {
                    super::log_stats(&self.description, &self.counters);
                }
                _ => {}
            }
        }

        self.drain().await;
        Ok(())
    }

    async fn drain(&mut self) {
        tracing::info!(
            role = %self.description,
            backlog = self.output.backlog_len(),
            "upstream finished, draining"
        );
        let deadline = self.reactor.timer("drain");
        self.reactor.arm(deadline, super::drain_deadline(&self.config));

        while !self.output.is_idle() {
            match self.reactor.poll(&mut [Source::new(&mut self.output)]).await {
                Ok(ReactorEvent::Timer(id)) if id == deadline => {
                    Counters::incr(&self.counters.drain_timeouts);
                    tracing::error!(
                        role = %self.description,
                        backlog = self.output.backlog_len(),
                        "gave up waiting for workers to release their events"
                    );
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(role = %self.description, error = %err, "output failed while draining");
                    break;
                }
            }
        }

        self.output.broadcast_terminate();
        self.output.shutdown().await;
        self.upstream.shutdown(self.config.linger).await;
        super::log_stats(&self.description, &self.counters);
        tracing::info!(role = %self.description, "distributor terminated");
    }
}
