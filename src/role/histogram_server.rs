//! Histogram merge servers.
//!
//! Both servers keep the latest [`HistogramSet`] of every source and merge them on a fixed timer. A
//! [`ProxyHistogramServer`] forwards the merge to its parent under its own source name, so servers stack into a
//! tree. A [`RawHistogramServer`] is the root and hands the merge to a [`HistogramStore`].

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    config::TransportConfig,
    connection::{ConfirmedConnection, ConnectionEvent, InputKind, Upstream},
    endpoint::Link,
    error::TransportError,
    histogram::{self, HistogramSet, HistogramStore},
    message::{Message, Tag},
    metrics::Counters,
    reactor::{Reactor, ReactorEvent, Source, TimerId},
    socket::Context,
};

const OUTPUT: usize = 0;

/// The latest set per source and their merge.
#[derive(Debug, Default)]
pub struct HistogramMerger {
    latest: BTreeMap<String, HistogramSet>,
    merged: HistogramSet,
    changed: bool,
}

impl HistogramMerger {
    /// An empty merger.
    pub fn new() -> Self {
        HistogramMerger::default()
    }

    /// Replaces the set of `source` and recomputes the merge.
    ///
    /// An update whose binning conflicts with another source's is dropped and the previous state kept.
    pub fn update(&mut self, source: String, set: HistogramSet) -> Result<(), TransportError> {
        let mut merged = HistogramSet::merged(
            self.latest
                .iter()
                .filter(|(name, _)| **name != source)
                .map(|(_, set)| set),
        )?;
        merged.merge(&set)?;
        self.latest.insert(source, set);
        self.merged = merged;
        self.changed = true;
        Ok(())
    }

    /// The current merge of every source.
    pub fn merged(&self) -> &HistogramSet {
        &self.merged
    }

    /// Whether the merge changed since the last flush.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Records that the current merge has been flushed.
    pub fn mark_flushed(&mut self) {
        self.changed = false;
    }

    /// Number of sources seen.
    pub fn sources(&self) -> usize {
        self.latest.len()
    }
}

async fn ingest(
    merger: &mut HistogramMerger,
    message: &Message,
    limit: usize,
    role: &str,
    counters: &Counters,
) {
    if message.tag() != Tag::Event {
        return;
    }
    let result = match histogram::decode_message(message, limit).await {
        Ok((source, set)) => merger.update(source, set),
        Err(err) => Err(err.into()),
    };
    match result {
        Ok(()) => Counters::incr(&counters.histograms_merged),
        Err(err) => {
            counters.record_error(err.kind());
            tracing::warn!(role, error = %err, "histogram update dropped");
        }
    }
}

/// Merges histograms from its children and forwards the merge to a parent over a confirmed connection.
///
/// The merge is sent on every flush tick on which it changed, unless the previous flush has not been confirmed
/// yet, which bounds the output rate independently of how often children report.
#[derive(Debug)]
pub struct ProxyHistogramServer {
    description: String,
    source_name: String,
    upstream: Upstream,
    output: ConfirmedConnection,
    merger: HistogramMerger,
    reactor: Reactor,
    flush: TimerId,
    stats: TimerId,
    config: TransportConfig,
    counters: Arc<Counters>,
}

impl ProxyHistogramServer {
    /// Opens the input and the confirmed output. `source_name` identifies this server to its parent.
    pub async fn new(
        ctx: &Context,
        description: impl Into<String>,
        source_name: impl Into<String>,
        input_kind: InputKind,
        input: &Link,
        output: &Link,
        counters: Arc<Counters>,
    ) -> Result<Self, TransportError> {
        let config = ctx.config().clone();
        let upstream = Upstream::open(ctx, input_kind, input, counters.clone()).await?;
        let output = ConfirmedConnection::open(ctx, output, counters.clone()).await?;
        let mut reactor = Reactor::new(config.poll_timeout);
        let flush = reactor.interval("flush", config.histogram_flush_interval);
        let stats = reactor.interval("stats", config.stats_interval);
        Ok(ProxyHistogramServer {
            description: description.into(),
            source_name: source_name.into(),
            upstream,
            output,
            merger: HistogramMerger::new(),
            reactor,
            flush,
            stats,
            config,
            counters,
        })
    }

    /// Runs until every child has terminated or left, then performs a final flush.
    pub async fn run(mut self) -> Result<(), TransportError> {
        tracing::info!(role = %self.description, source = %self.source_name, "proxy histogram server running");

        while !self.upstream.is_finished() {
            let event = self
                .reactor
                .poll(&mut [
                    Source::new(&mut self.output),
                    Source::new(&mut self.upstream),
                ])
                .await?;
            match event {
                ReactorEvent::Connection {
                    source,
                    event: ConnectionEvent::Event(envelope),
                } if source != OUTPUT => {
                    ingest(
                        &mut self.merger,
                        &envelope.message,
                        self.config.max_message_size,
                        &self.description,
                        &self.counters,
                    )
                    .await;
                    self.upstream.acknowledge(envelope.identity)?;
                }
                ReactorEvent::Timer(id) if id == self.flush => self.flush().await?,
                ReactorEvent::Timer(id) if id == self.stats => {
                    super::log_stats(&self.description, &self.counters);
                }
                _ => {}
            }
        }

        self.finish().await
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        if !self.merger.is_changed() {
            return Ok(());
        }
        if !self.output.can_send() {
            tracing::debug!(role = %self.description, "previous flush not confirmed yet");
            return Ok(());
        }
        let message = histogram::encode_message(
            &self.source_name,
            self.merger.merged(),
            self.config.compression_level,
        )
        .await?;
        self.output.send(message)?;
        self.merger.mark_flushed();
        Counters::incr(&self.counters.histograms_flushed);
        tracing::debug!(role = %self.description, sources = self.merger.sources(), "merge forwarded");
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), TransportError> {
        tracing::info!(role = %self.description, "children finished, final flush");
        let deadline = self.reactor.timer("drain");
        self.reactor
            .arm(deadline, super::drain_deadline(&self.config));

        while self.merger.is_changed() || self.output.is_pending() {
            self.flush().await?;
            if !self.output.is_pending() {
                break;
            }
            match self.reactor.poll(&mut [Source::new(&mut self.output)]).await? {
                ReactorEvent::Timer(id) if id == deadline => {
                    Counters::incr(&self.counters.drain_timeouts);
                    tracing::error!(role = %self.description, "final flush not confirmed");
                    break;
                }
                _ => {}
            }
        }

        self.output.send_control(Message::terminate());
        self.output.shutdown().await;
        self.upstream.shutdown(self.config.linger).await;
        super::log_stats(&self.description, &self.counters);
        tracing::info!(role = %self.description, "proxy histogram server terminated");
        Ok(())
    }
}

/// The root of a histogram tree: merges and periodically hands the result to a [`HistogramStore`].
#[derive(Debug)]
pub struct RawHistogramServer<S> {
    description: String,
    upstream: Upstream,
    store: S,
    merger: HistogramMerger,
    reactor: Reactor,
    flush: TimerId,
    stats: TimerId,
    config: TransportConfig,
    counters: Arc<Counters>,
}

impl<S> RawHistogramServer<S>
where
    S: HistogramStore,
{
    /// Opens the input.
    pub async fn new(
        ctx: &Context,
        description: impl Into<String>,
        input_kind: InputKind,
        input: &Link,
        store: S,
        counters: Arc<Counters>,
    ) -> Result<Self, TransportError> {
        let config = ctx.config().clone();
        let upstream = Upstream::open(ctx, input_kind, input, counters.clone()).await?;
        let mut reactor = Reactor::new(config.poll_timeout);
        let flush = reactor.interval("flush", config.histogram_flush_interval);
        let stats = reactor.interval("stats", config.stats_interval);
        Ok(RawHistogramServer {
            description: description.into(),
            upstream,
            store,
            merger: HistogramMerger::new(),
            reactor,
            flush,
            stats,
            config,
            counters,
        })
    }

    /// Runs until every child has terminated or left, then stores the final merge.
    pub async fn run(mut self) -> Result<(), TransportError> {
        tracing::info!(role = %self.description, "raw histogram server running");

        while !self.upstream.is_finished() {
            let event = self
                .reactor
                .poll(&mut [Source::new(&mut self.upstream)])
                .await?;
            match event {
                ReactorEvent::Connection {
                    event: ConnectionEvent::Event(envelope),
                    ..
                } => {
                    ingest(
                        &mut self.merger,
                        &envelope.message,
                        self.config.max_message_size,
                        &self.description,
                        &self.counters,
                    )
                    .await;
                    self.upstream.acknowledge(envelope.identity)?;
                }
                ReactorEvent::Timer(id) if id == self.flush => self.flush(),
                ReactorEvent::Timer(id) if id == self.stats => {
                    super::log_stats(&self.description, &self.counters);
                }
                _ => {}
            }
        }

        self.flush();
        self.upstream.shutdown(self.config.linger).await;
        super::log_stats(&self.description, &self.counters);
        tracing::info!(role = %self.description, "raw histogram server terminated");
        Ok(())
    }

    fn flush(&mut self) {
        if !self.merger.is_changed() {
            return;
        }
        match self.store.store(self.merger.merged()) {
            Ok(()) => {
                self.merger.mark_flushed();
                Counters::incr(&self.counters.histograms_flushed);
                tracing::debug!(role = %self.description, sources = self.merger.sources(), "merge stored");
            }
            Err(err) => {
                self.counters.record_error(err.kind());
                tracing::error!(role = %self.description, error = %err, "storing merge failed, will retry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::Histogram;

    fn set(bins: usize, fills: &[f64]) -> HistogramSet {
        let mut h = Histogram::new(bins, 0.0, 10.0);
        for x in fills {
            h.fill(*x);
        }
        [("energy".to_string(), h)].into_iter().collect()
    }

    #[test]
    fn latest_update_per_source_replaces_the_previous_one() {
        let mut merger = HistogramMerger::new();
        merger.update("a".into(), set(10, &[1.0])).unwrap();
        merger.update("b".into(), set(10, &[2.0])).unwrap();
        merger.update("a".into(), set(10, &[1.0, 3.0])).unwrap();

        assert_eq!(merger.sources(), 2);
        assert_eq!(merger.merged().get("energy").unwrap().entries(), 3);
        assert!(merger.is_changed());
        merger.mark_flushed();
        assert!(!merger.is_changed());
    }

    #[test]
    fn incompatible_update_is_dropped() {
        let mut merger = HistogramMerger::new();
        merger.update("a".into(), set(10, &[1.0])).unwrap();
        merger.mark_flushed();

        let err = merger.update("b".into(), set(5, &[1.0])).unwrap_err();
        assert!(matches!(err, TransportError::HistogramMismatch(_)));
        assert_eq!(merger.sources(), 1);
        assert!(!merger.is_changed());
        assert_eq!(merger.merged().get("energy").unwrap().entries(), 1);
    }
}
