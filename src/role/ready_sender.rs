//! A zero-latency sink for exercising dispatchers.

use std::sync::Arc;

use crate::{
    config::TransportConfig,
    connection::{ConnectionEvent, InputKind, Upstream},
    endpoint::Link,
    error::TransportError,
    metrics::Counters,
    reactor::{Reactor, ReactorEvent, Source, TimerId},
    socket::Context,
};

/// Acknowledges every event the moment it arrives and does nothing else.
///
/// Useful to check a dispatcher's fairness and correctness in isolation: the number of events each sender
/// received is in its `events_received` counter.
#[derive(Debug)]
pub struct ReadySender {
    description: String,
    upstream: Upstream,
    reactor: Reactor,
    stats: TimerId,
    config: TransportConfig,
    counters: Arc<Counters>,
}

impl ReadySender {
    /// Opens the input, a load-balanced consumer unless told otherwise.
    pub async fn new(
        ctx: &Context,
        description: impl Into<String>,
        input_kind: InputKind,
        input: &Link,
        counters: Arc<Counters>,
    ) -> Result<Self, TransportError> {
        let config = ctx.config().clone();
        let upstream = Upstream::open(ctx, input_kind, input, counters.clone()).await?;
        let mut reactor = Reactor::new(config.poll_timeout);
        let stats = reactor.interval("stats", config.stats_interval);
        Ok(ReadySender {
            description: description.into(),
            upstream,
            reactor,
            stats,
            config,
            counters,
        })
    }

    /// Runs until TERMINATE.
    pub async fn run(mut self) -> Result<(), TransportError> {
        tracing::info!(role = %self.description, "ready sender running");
        while !self.upstream.is_finished() {
            match self
                .reactor
                .poll(&mut [Source::new(&mut self.upstream)])
                .await?
            {
                ReactorEvent::Connection {
                    event: ConnectionEvent::Event(envelope),
                    ..
                } => self.upstream.acknowledge(envelope.identity)?,
                ReactorEvent::Timer(id) if id == self.stats => {
                    super::log_stats(&self.description, &self.counters);
                }
                _ => {}
            }
        }

        self.upstream.shutdown(self.config.linger).await;
        tracing::info!(
            role = %self.description,
            received = self.counters.snapshot().events_received,
            "ready sender terminated"
        );
        Ok(())
    }
}
