//! Untagged blob streams without flow control.

use std::{
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;

use super::{Connection, ConnectionEvent};
use crate::{
    endpoint::{Link, SocketMode},
    error::TransportError,
    message::{Envelope, Message},
    metrics::Counters,
    socket::{self, Socket, SocketEvent, SocketOptions},
};

/// A raw connection, either a sink that is written to or a source that is read from.
///
/// Writes go to the oldest connected peer. With no peer connected a write fails with
/// [`TransportError::SinkDegraded`] and the blob is not kept. A connected peer that stops reading is reported
/// through [`RawConnection::is_congested`] so the writer can hold back.
#[derive(Debug)]
pub struct RawConnection {
    name: &'static str,
    socket: Socket,
    linger: Duration,
    counters: Arc<Counters>,
}

impl RawConnection {
    /// Opens a sink. Connect-mode sinks retry forever since a missing sink only degrades output.
    pub async fn sink(
        ctx: &socket::Context,
        name: &'static str,
        link: &Link,
        counters: Arc<Counters>,
    ) -> Result<Self, TransportError> {
        let options = SocketOptions::raw(ctx.config());
        RawConnection::open(ctx, name, link, options, counters).await
    }

    /// Opens a source. Connect-mode sources give up after the configured reconnect attempts.
    pub async fn source(
        ctx: &socket::Context,
        link: &Link,
        counters: Arc<Counters>,
    ) -> Result<Self, TransportError> {
        let options = SocketOptions {
            reconnect: ctx.config().reconnect.clone(),
            ..SocketOptions::raw(ctx.config())
        };
        RawConnection::open(ctx, "source", link, options, counters).await
    }

    async fn open(
        ctx: &socket::Context,
        name: &'static str,
        link: &Link,
        options: SocketOptions,
        counters: Arc<Counters>,
    ) -> Result<Self, TransportError> {
        let socket = Socket::open(ctx, &link.endpoint, link.mode, options).await?;
        Ok(RawConnection {
            name,
            socket,
            linger: ctx.config().linger,
            counters,
        })
    }

    /// Writes one blob made of the concatenated `frames`.
    pub fn write(&mut self, frames: Vec<Bytes>) -> Result<(), TransportError> {
        let Some(peer) = self.socket.first_peer() else {
            return Err(TransportError::SinkDegraded(self.name));
        };
        self.socket
            .send(peer, Message::event(frames))
            .map_err(|_| TransportError::SinkDegraded(self.name))?;
        Counters::incr(&self.counters.raw_writes);
        Ok(())
    }

    /// The name used in logs and errors.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether a peer is connected.
    pub fn is_connected(&self) -> bool {
        self.socket.first_peer().is_some()
    }

    /// Whether the connected peer has fallen behind by at least
    /// [`sink_high_water`](crate::config::TransportConfig::sink_high_water) bytes. False with no peer.
    pub fn is_congested(&self) -> bool {
        self.socket
            .first_peer()
            .is_some_and(|peer| self.socket.is_congested(peer))
    }

    /// Bytes written but not yet handed to the connected peer's stream.
    pub fn queued_bytes(&self) -> usize {
        self.socket
            .first_peer()
            .map_or(0, |peer| self.socket.queued_bytes(peer))
    }

    /// Socket mode of the connection.
    pub fn mode(&self) -> SocketMode {
        self.socket.mode()
    }

    /// Closes the socket after letting queued blobs flush.
    pub async fn shutdown(&mut self) {
        self.socket.shutdown(self.linger).await;
    }
}

impl Connection for RawConnection {
    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Result<ConnectionEvent, TransportError>> {
        let event = match std::task::ready!(self.socket.poll_event(cx)) {
            SocketEvent::Connected(identity) => {
                tracing::info!(sink = self.name, peer = %identity, "raw peer connected");
                ConnectionEvent::PeerJoined(identity)
            }
            SocketEvent::Message(identity, message) => {
                Counters::incr(&self.counters.events_received);
                ConnectionEvent::Event(Envelope::new(identity, message))
            }
            SocketEvent::Disconnected(identity, reason) => {
                tracing::info!(sink = self.name, peer = %identity, %reason, "raw peer left");
                ConnectionEvent::PeerLost(identity)
            }
            SocketEvent::Exhausted { attempts } => {
                Counters::incr(&self.counters.reconnects_exhausted);
                return Poll::Ready(Err(TransportError::ReconnectExhausted {
                    endpoint: self.socket.endpoint().to_string(),
                    attempts,
                }))
            }
            SocketEvent::Closed => return Poll::Ready(Err(TransportError::Closed)),
        };
        Poll::Ready(Ok(event))
    }
}
