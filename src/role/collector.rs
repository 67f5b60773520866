//! Collectors: terminate one flow-control discipline and re-originate another.
//!
//! A single [`Collector`] type does the receiving, acknowledging and draining. What happens to each event is
//! decided by its [`Output`] strategy:
//!
//! - [`LoadBalancedForward`]: re-dispatch to whichever downstream peer is READY ([`Collector`]).
//! - [`ConfirmedForward`]: forward over another confirmed hop ([`ProxyCollector`]).
//! - [`DualRawFanOut`]: write to a storage sink and a region-of-interest sink ([`FinalCollectorWithRoi`]).
//!
//! Upstream acknowledgements always follow the output's acceptance of the event, so backpressure travels from
//! the slowest downstream hop all the way back to the source.

use std::{fmt, future::Future, sync::Arc};

use crate::{
    config::TransportConfig,
    connection::{
        ConfirmedConnection, Connection, ConnectionEvent, InputKind, LoadBalancedConnection,
        RawConnection, Upstream,
    },
    endpoint::Link,
    error::TransportError,
    message::Message,
    metrics::Counters,
    reactor::{Reactor, ReactorEvent, Source, TimerId},
    socket::Context,
};

/// What a [`Collector`] does with the events it receives.
pub trait Output: Send {
    /// Whether another event can be forwarded right now. The collector stops reading upstream while this is
    /// false.
    fn can_accept(&self) -> bool;

    /// Forwards one event.
    fn forward(&mut self, message: Message) -> Result<(), TransportError>;

    /// Whether everything forwarded has been acknowledged downstream.
    fn is_idle(&self) -> bool;

    /// Propagates TERMINATE downstream, where the discipline has a notion of it.
    fn terminate(&mut self);

    /// The connections the reactor must poll, in priority order.
    fn connections(&mut self) -> Vec<&mut dyn Connection>;

    /// Closes every connection.
    fn shutdown(&mut self) -> impl Future<Output = ()> + Send;
}

/// Re-dispatches over a load-balanced connection.
#[derive(Debug)]
pub struct LoadBalancedForward(LoadBalancedConnection);

impl LoadBalancedForward {
    /// Opens the load-balanced output.
    pub async fn open(
        ctx: &Context,
        link: &Link,
        counters: Arc<Counters>,
    ) -> Result<Self, TransportError> {
        Ok(LoadBalancedForward(
            LoadBalancedConnection::open(ctx, link, counters).await?,
        ))
    }
}

impl Output for LoadBalancedForward {
    fn can_accept(&self) -> bool {
        self.0.has_ready_peer() && self.0.backlog_len() == 0
    }

    fn forward(&mut self, message: Message) -> Result<(), TransportError> {
        self.0.dispatch(message)
    }

    fn is_idle(&self) -> bool {
        self.0.is_idle()
    }

    fn terminate(&mut self) {
        self.0.broadcast_terminate();
    }

    fn connections(&mut self) -> Vec<&mut dyn Connection> {
        vec![&mut self.0]
    }

    async fn shutdown(&mut self) {
        self.0.shutdown().await;
    }
}

/// Forwards over another confirmed hop.
#[derive(Debug)]
pub struct ConfirmedForward(ConfirmedConnection);

impl ConfirmedForward {
    /// Opens the confirmed output.
    pub async fn open(
        ctx: &Context,
        link: &Link,
        counters: Arc<Counters>,
    ) -> Result<Self, TransportError> {
        Ok(ConfirmedForward(
            ConfirmedConnection::open(ctx, link, counters).await?,
        ))
    }
}

impl Output for ConfirmedForward {
    fn can_accept(&self) -> bool {
        self.0.can_send()
    }

    fn forward(&mut self, message: Message) -> Result<(), TransportError> {
        self.0.send(message)
    }

    fn is_idle(&self) -> bool {
        !self.0.is_pending()
    }

    fn terminate(&mut self) {
        self.0.send_control(Message::terminate());
    }

    fn connections(&mut self) -> Vec<&mut dyn Connection> {
        vec![&mut self.0]
    }

    async fn shutdown(&mut self) {
        self.0.shutdown().await;
    }
}

/// Writes every event to a storage sink and a region-of-interest sink.
///
/// A sink that does not accept a write is counted in `sink_degraded` and logged; the event is acknowledged
/// upstream regardless, so a missing sink degrades output instead of stalling the farm. A sink that is connected
/// but has `sink_high_water` bytes queued pauses upstream reads until it catches up.
#[derive(Debug)]
pub struct DualRawFanOut {
    storage: RawConnection,
    roi: RawConnection,
    counters: Arc<Counters>,
}

impl DualRawFanOut {
    /// Opens both raw sinks.
    pub async fn open(
        ctx: &Context,
        storage: &Link,
        roi: &Link,
        counters: Arc<Counters>,
    ) -> Result<Self, TransportError> {
        Ok(DualRawFanOut {
            storage: RawConnection::sink(ctx, "storage", storage, counters.clone()).await?,
            roi: RawConnection::sink(ctx, "roi", roi, counters.clone()).await?,
            counters,
        })
    }

    fn write(sink: &mut RawConnection, counters: &Counters, message: Message) {
        if let Err(err) = sink.write(message.into_frames()) {
            counters.record_error(err.kind());
            tracing::warn!(sink = sink.name(), error = %err, "raw write not accepted");
        }
    }
}

impl Output for DualRawFanOut {
    /// An absent sink never blocks, its writes are dropped. A connected sink that is not reading does.
    fn can_accept(&self) -> bool {
        !self.storage.is_congested() && !self.roi.is_congested()
    }

    fn forward(&mut self, message: Message) -> Result<(), TransportError> {
        DualRawFanOut::write(&mut self.storage, &self.counters, message.clone());
        DualRawFanOut::write(&mut self.roi, &self.counters, message);
        Ok(())
    }

    fn is_idle(&self) -> bool {
        true
    }

    fn terminate(&mut self) {}

    fn connections(&mut self) -> Vec<&mut dyn Connection> {
        vec![&mut self.storage, &mut self.roi]
    }

    async fn shutdown(&mut self) {
        self.storage.shutdown().await;
        self.roi.shutdown().await;
    }
}

/// Terminates many confirmed upstreams and re-dispatches over a load-balanced connection.
pub type LoadBalancedCollector = Collector<LoadBalancedForward>;

/// Terminates many confirmed upstreams and forwards over one confirmed hop.
pub type ProxyCollector = Collector<ConfirmedForward>;

/// The terminal collector, fanning every event out to storage and region-of-interest sinks.
pub type FinalCollectorWithRoi = Collector<DualRawFanOut>;

/// A collector parameterized by its [`Output`] strategy. See the [module docs](self).
pub struct Collector<O = LoadBalancedForward> {
    description: String,
    upstream: Upstream,
    output: O,
    reactor: Reactor,
    stats: TimerId,
    config: TransportConfig,
    counters: Arc<Counters>,
}

impl<O> fmt::Debug for Collector<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("description", &self.description)
            .field("upstream", &self.upstream.kind())
            .finish_non_exhaustive()
    }
}

impl<O> Collector<O>
where
    O: Output,
{
    /// Opens the upstream. The output is opened by the caller, see the strategy types.
    pub async fn new(
        ctx: &Context,
        description: impl Into<String>,
        input_kind: InputKind,
        input: &Link,
        output: O,
        counters: Arc<Counters>,
    ) -> Result<Self, TransportError> {
        let config = ctx.config().clone();
        let upstream = Upstream::open(ctx, input_kind, input, counters.clone()).await?;
        let mut reactor = Reactor::new(config.poll_timeout);
        let stats = reactor.interval("stats", config.stats_interval);
        Ok(Collector {
            description: description.into(),
            upstream,
            output,
            reactor,
            stats,
            config,
            counters,
        })
    }

    /// Runs until every upstream peer has terminated or left, then drains the output and propagates TERMINATE.
    pub async fn run(mut self) -> Result<(), TransportError> {
        tracing::info!(role = %self.description, "collector running");

        while !self.upstream.is_finished() {
            let read = self.output.can_accept();
            let mut sources: Vec<Source<'_>> = self
                .output
                .connections()
                .into_iter()
                .map(Source::new)
                .collect();
            let input = sources.len();
            sources.push(Source::new(&mut self.upstream).when(read));

            let event = self.reactor.poll(&mut sources).await?;
            drop(sources);

            match event {
                ReactorEvent::Connection {
                    source,
                    event: ConnectionEvent::Event(envelope),
                } if source == input => {
                    self.output.forward(envelope.message)?;
                    self.upstream.acknowledge(envelope.identity)?;
                }
                ReactorEvent::Connection {
                    source,
                    event: ConnectionEvent::Terminate { from },
                } if source == input => {
                    tracing::info!(role = %self.description, peer = %from, "upstream peer terminated");
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
        tracing::info!(role = %self.description, "upstream finished, draining");
        let deadline = self.reactor.timer("drain");
        self.reactor
            .arm(deadline, super::drain_deadline(&self.config));

        while !self.output.is_idle() {
            let mut sources: Vec<Source<'_>> = self
                .output
                .connections()
                .into_iter()
                .map(Source::new)
                .collect();
            match self.reactor.poll(&mut sources).await {
                Ok(ReactorEvent::Timer(id)) if id == deadline => {
                    Counters::incr(&self.counters.drain_timeouts);
                    tracing::error!(role = %self.description, "gave up waiting for downstream acknowledgements");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(role = %self.description, error = %err, "output failed while draining");
                    break;
                }
            }
        }

        self.output.terminate();
        self.output.shutdown().await;
        self.upstream.shutdown(self.config.linger).await;
        super::log_stats(&self.description, &self.counters);
        tracing::info!(role = %self.description, "collector terminated");
    }
}
