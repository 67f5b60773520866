//! Processes dispatched events and forwards the results downstream.

use std::{fmt, sync::Arc};

use bytes::Bytes;

use crate::{
    config::TransportConfig,
    connection::{ConfirmedConnection, ConnectionEvent, InputKind, Upstream},
    endpoint::Link,
    error::TransportError,
    message::{Envelope, Message},
    metrics::Counters,
    reactor::{Reactor, ReactorEvent, Source, TimerId},
    socket::Context,
};

const OUTPUT: usize = 0;
const INPUT: usize = 1;

/// The per-event work a [`Worker`] performs.
///
/// Reconstruction and filtering live behind this trait. Returning `None` drops the event: the worker still
/// asks for the next one but sends nothing downstream.
pub trait EventProcessor: Send {
    /// Turns the payload frames of one event into the frames to forward.
    fn process(&mut self, frames: Vec<Bytes>) -> Option<Vec<Bytes>>;
}

impl<F> EventProcessor for F
where
    F: FnMut(Vec<Bytes>) -> Option<Vec<Bytes>> + Send,
{
    fn process(&mut self, frames: Vec<Bytes>) -> Option<Vec<Bytes>> {
        self(frames)
    }
}

/// Forwards every event unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct Passthrough;

impl EventProcessor for Passthrough {
    fn process(&mut self, frames: Vec<Bytes>) -> Option<Vec<Bytes>> {
        Some(frames)
    }
}

/// Where a [`Worker`] is in its event cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for an assignment.
    Idle,
    /// Running the processor on an event.
    Processing,
    /// The processed event was sent downstream and is not confirmed yet.
    AwaitingConfirm,
    /// Drained and done.
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            WorkerState::Idle => "idle",
            WorkerState::Processing => "processing",
            WorkerState::AwaitingConfirm => "awaiting confirm",
            WorkerState::Terminated => "terminated",
        };
        f.write_str(state)
    }
}

/// A worker: load-balanced input, confirmed output.
///
/// READY goes upstream as soon as an event has been processed, together with the EVENT going downstream, so
/// the next assignment can be on its way while the CONFIRM is outstanding. Such an assignment is held, not
/// processed, until the CONFIRM arrives. On TERMINATE the worker finishes what it has already accepted, waits
/// for the last CONFIRM for at most the terminate timeout, forwards TERMINATE downstream and returns.
pub struct Worker<P = Passthrough> {
    description: String,
    upstream: Upstream,
    output: ConfirmedConnection,
    processor: P,
    state: WorkerState,
    deferred: Option<Envelope>,
    terminating: bool,
    reactor: Reactor,
    stats: TimerId,
    drain: TimerId,
    config: TransportConfig,
    counters: Arc<Counters>,
}

impl<P> fmt::Debug for Worker<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("description", &self.description)
            .field("state", &self.state)
            .field("deferred", &self.deferred.is_some())
            .field("terminating", &self.terminating)
            .finish_non_exhaustive()
    }
}

impl Worker<Passthrough> {
    /// Opens the input and the confirmed output.
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
        let output = ConfirmedConnection::open(ctx, output, counters.clone()).await?;
        let mut reactor = Reactor::new(config.poll_timeout);
        let stats = reactor.interval("stats", config.stats_interval);
        let drain = reactor.timer("drain");
        Ok(Worker {
            description: description.into(),
            upstream,
            output,
            processor: Passthrough,
            state: WorkerState::Idle,
            deferred: None,
            terminating: false,
            reactor,
            stats,
            drain,
            config,
            counters,
        })
    }
}

impl<P> Worker<P>
where
    P: EventProcessor,
{
    /// Replaces the event processor.
    pub fn with_processor<Q: EventProcessor>(self, processor: Q) -> Worker<Q> {
        Worker {
            description: self.description,
            upstream: self.upstream,
            output: self.output,
            processor,
            state: self.state,
            deferred: self.deferred,
            terminating: self.terminating,
            reactor: self.reactor,
            stats: self.stats,
            drain: self.drain,
            config: self.config,
            counters: self.counters,
        }
    }

    /// The current state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Runs until TERMINATE has been received and everything accepted before it is drained.
    pub async fn run(mut self) -> Result<(), TransportError> {
        tracing::info!(role = %self.description, "worker running");

        loop {
            if self.state == WorkerState::Idle {
                if let Some(envelope) = self.deferred.take() {
                    self.handle(envelope)?;
                    continue;
                }
                if self.terminating || self.upstream.is_finished() {
                    break;
                }
            }

            let event = self
                .reactor
                .poll(&mut [
                    Source::new(&mut self.output),
                    Source::new(&mut self.upstream),
                ])
                .await?;

            match event {
                ReactorEvent::Connection {
                    source: OUTPUT,
                    event: ConnectionEvent::Confirmed,
                } => {
                    self.transition(WorkerState::Idle);
                }
                ReactorEvent::Connection {
                    source: INPUT,
                    event: ConnectionEvent::Event(envelope),
                } => self.accept(envelope)?,
                ReactorEvent::Connection {
                    source: INPUT,
                    event: ConnectionEvent::Terminate { from },
                } => {
                    if !self.terminating {
                        tracing::info!(role = %self.description, peer = %from, state = %self.state, "TERMINATE received");
                        self.terminating = true;
                        self.reactor
                            .arm(self.drain, super::drain_deadline(&self.config));
                    }
                }
                ReactorEvent::Timer(id) if id == self.drain => {
                    Counters::incr(&self.counters.drain_timeouts);
                    tracing::error!(
                        role = %self.description,
                        state = %self.state,
                        deferred = self.deferred.is_some(),
                        "gave up waiting for CONFIRM while terminating"
                    );
                    break;
                }
                ReactorEvent::Timer(id) if id == self.stats => {
                    super::log_stats(&self.description, &self.counters);
                }
                _ => {}
            }
        }

        self.finish().await;
        Ok(())
    }

    fn accept(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        if self.terminating {
            // Left unacknowledged: the dispatcher reinjects it once this session ends.
            tracing::warn!(role = %self.description, peer = %envelope.identity, "event after TERMINATE not accepted");
            return Ok(());
        }
        if self.state == WorkerState::Idle && self.deferred.is_none() {
            return self.handle(envelope);
        }
        if self.deferred.is_some() {
            Counters::incr(&self.counters.protocol_violations);
            return Err(TransportError::violation(
                "second assignment while one is already held",
            ));
        }
        self.deferred = Some(envelope);
        Ok(())
    }

    fn handle(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        self.transition(WorkerState::Processing);
        let Envelope { identity, message } = envelope;
        match self.processor.process(message.into_frames()) {
            Some(frames) => {
                self.output.send(Message::event(frames))?;
                self.transition(WorkerState::AwaitingConfirm);
            }
            None => {
                tracing::debug!(role = %self.description, "event dropped by processor");
                self.transition(WorkerState::Idle);
            }
        }
        self.upstream.acknowledge(identity)
    }

    fn transition(&mut self, to: WorkerState) {
        tracing::trace!(role = %self.description, from = %self.state, %to, "state change");
        self.state = to;
    }

    async fn finish(&mut self) {
        self.transition(WorkerState::Terminated);
        self.output.send_control(Message::terminate());
        self.output.shutdown().await;
        self.upstream.shutdown(self.config.linger).await;
        super::log_stats(&self.description, &self.counters);
        tracing::info!(role = %self.description, "worker terminated");
    }
}
