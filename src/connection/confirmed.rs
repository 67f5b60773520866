//! Point-to-point delivery with at most one unconfirmed EVENT in flight.
//!
//! The sending half is a [`ConfirmedConnection`]: every [`send`](ConfirmedConnection::send) creates a pending
//! acknowledgement that must be cleared by a CONFIRM before the next send. The receiving half is a
//! [`ConfirmedInput`], which tracks, per peer, whether an EVENT is still waiting to be confirmed.
//!
//! The single in-flight rule is the only backpressure on this path: a sender cannot move on until the receiver
//! has at least dequeued the previous message. It also preserves order trivially.

use std::{
    collections::HashSet,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use super::{Connection, ConnectionEvent};
use crate::{
    endpoint::{Link, SocketMode},
    error::TransportError,
    message::{Envelope, Identity, Message, Tag},
    metrics::Counters,
    socket::{self, Socket, SocketEvent, SocketOptions},
};

/// The unconfirmed message of a [`ConfirmedConnection`].
#[derive(Debug)]
struct PendingAck {
    message: Message,
    /// Whether the message reached a live session. Cleared when that session is lost so the message is sent
    /// again once a new one is established.
    transmitted: bool,
}

/// The sending half of a confirmed connection.
#[derive(Debug)]
pub struct ConfirmedConnection {
    socket: Socket,
    peer: Option<Identity>,
    pending: Option<PendingAck>,
    ever_connected: bool,
    linger: Duration,
    counters: Arc<Counters>,
}

impl ConfirmedConnection {
    /// Opens the socket described by `link` with tagged framing.
    pub async fn open(
        ctx: &socket::Context,
        link: &Link,
        counters: Arc<Counters>,
    ) -> Result<Self, TransportError> {
        let options = SocketOptions::tagged(ctx.config());
        let socket = Socket::open(ctx, &link.endpoint, link.mode, options).await?;
        Ok(ConfirmedConnection {
            socket,
            peer: None,
            pending: None,
            ever_connected: false,
            linger: ctx.config().linger,
            counters,
        })
    }

    /// Sends an EVENT and records it as pending.
    ///
    /// Fails with a protocol violation if the previous message has not been confirmed yet, or if the message
    /// exceeds `max_message_size`. A message sent before any peer is connected is parked and transmitted as
    /// soon as one is.
    pub fn send(&mut self, message: Message) -> Result<(), TransportError> {
        if self.pending.is_some() {
            Counters::incr(&self.counters.protocol_violations);
            return Err(TransportError::violation(
                "send while the previous message is awaiting CONFIRM",
            ));
        }
        if let Err(err) = self.socket.validate(&message) {
            Counters::incr(&self.counters.protocol_violations);
            return Err(err);
        }
        let mut pending = PendingAck {
            message,
            transmitted: false,
        };
        self.transmit(&mut pending);
        self.pending = Some(pending);
        Ok(())
    }

    /// Sends a control message such as TERMINATE to the connected peer, bypassing the pending acknowledgement.
    ///
    /// Returns whether a peer was there to take it.
    pub fn send_control(&mut self, message: Message) -> bool {
        let tag = message.tag();
        match self.peer.map(|peer| self.socket.send(peer, message)) {
            Some(Ok(())) => true,
            Some(Err(err)) => {
                self.counters.record_error(err.kind());
                tracing::warn!(%tag, error = %err, "control message not delivered");
                false
            }
            None => {
                tracing::warn!(%tag, endpoint = %self.socket.endpoint(), "no peer for control message");
                false
            }
        }
    }

    /// Whether a new message may be sent.
    pub fn can_send(&self) -> bool {
        self.pending.is_none()
    }

    /// Whether a message is awaiting CONFIRM.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether a peer session is currently established.
    pub fn is_connected(&self) -> bool {
        self.peer.is_some()
    }

    /// Drops any pending acknowledgement.
    pub fn close(&mut self) {
        if self.pending.take().is_some() {
            tracing::debug!(endpoint = %self.socket.endpoint(), "dropped pending acknowledgement");
        }
    }

    /// Closes the connection and lets queued frames flush.
    pub async fn shutdown(&mut self) {
        self.close();
        self.socket.shutdown(self.linger).await;
    }

    fn transmit(&mut self, pending: &mut PendingAck) {
        let Some(peer) = self.peer else {
            Counters::incr(&self.counters.transient_unavailable);
            tracing::debug!(endpoint = %self.socket.endpoint(), "no peer yet, message parked");
            return;
        };
        match self.socket.send(peer, pending.message.clone()) {
            Ok(()) => {
                pending.transmitted = true;
                Counters::incr(&self.counters.events_sent);
            }
            Err(err) => {
                self.counters.record_error(err.kind());
                tracing::debug!(peer = %peer, error = %err, "send deferred");
            }
        }
    }

    fn retransmit(&mut self) {
        if let Some(mut pending) = self.pending.take() {
            if !pending.transmitted {
                self.transmit(&mut pending);
            }
            self.pending = Some(pending);
        }
    }
}

impl Connection for ConfirmedConnection {
    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Result<ConnectionEvent, TransportError>> {
        loop {
            let event = match std::task::ready!(self.socket.poll_event(cx)) {
                SocketEvent::Connected(identity) => {
                    if self.ever_connected && self.socket.mode() == SocketMode::Connect {
                        Counters::incr(&self.counters.reconnects);
                        tracing::info!(endpoint = %self.socket.endpoint(), peer = %identity, "reconnected");
                    }
                    self.ever_connected = true;
                    if self.peer.is_none() {
                        self.peer = Some(identity);
                        self.retransmit();
                    }
                    ConnectionEvent::PeerJoined(identity)
                }
                SocketEvent::Message(identity, message) => match message.tag() {
                    Tag::Confirm => {
                        if self.pending.take().is_none() {
                            Counters::incr(&self.counters.protocol_violations);
                            return Poll::Ready(Err(TransportError::violation(format!(
                                "CONFIRM from {identity} without a pending message"
                            ))));
                        }
                        Counters::incr(&self.counters.confirms_received);
                        ConnectionEvent::Confirmed
                    }
                    Tag::Terminate => {
                        Counters::incr(&self.counters.terminates_received);
                        ConnectionEvent::Terminate { from: identity }
                    }
                    tag => {
                        tracing::warn!(peer = %identity, %tag, "unexpected message on confirmed output");
                        continue;
                    }
                },
                SocketEvent::Disconnected(identity, reason) => {
                    if self.peer != Some(identity) {
                        continue;
                    }
                    Counters::incr(&self.counters.peers_lost);
                    tracing::warn!(peer = %identity, %reason, "downstream peer lost");
                    if let Some(pending) = &mut self.pending {
                        pending.transmitted = false;
                    }
                    self.peer = self.socket.first_peer();
                    if self.peer.is_some() {
                        self.retransmit();
                    }
                    ConnectionEvent::PeerLost(identity)
                }
                SocketEvent::Exhausted { attempts } => {
                    Counters::incr(&self.counters.reconnects_exhausted);
                    return Poll::Ready(Err(TransportError::ReconnectExhausted {
                        endpoint: self.socket.endpoint().to_string(),
                        attempts,
                    }));
                }
                SocketEvent::Closed => return Poll::Ready(Err(TransportError::Closed)),
            };
            return Poll::Ready(Ok(event));
        }
    }
}

/// The receiving half of a confirmed connection.
///
/// Each EVENT must be confirmed before its peer may send another. [`receive`](ConfirmedInput::receive) confirms
/// immediately; roles that must finish their own writes first take events through the reactor and call
/// [`confirm`](ConfirmedInput::confirm) themselves.
#[derive(Debug)]
pub struct ConfirmedInput {
    socket: Socket,
    unconfirmed: HashSet<Identity>,
    /// Peers that left while their EVENT was unconfirmed.
    departed: HashSet<Identity>,
    counters: Arc<Counters>,
}

impl ConfirmedInput {
    /// Opens the socket described by `link` with tagged framing.
    pub async fn open(
        ctx: &socket::Context,
        link: &Link,
        counters: Arc<Counters>,
    ) -> Result<Self, TransportError> {
        let options = SocketOptions::tagged(ctx.config());
        let socket = Socket::open(ctx, &link.endpoint, link.mode, options).await?;
        Ok(ConfirmedInput {
            socket,
            unconfirmed: HashSet::new(),
            departed: HashSet::new(),
            counters,
        })
    }

    /// Waits for the next EVENT and confirms it right away. Returns `None` once a peer sends TERMINATE.
    pub async fn receive(&mut self) -> Result<Option<Envelope>, TransportError> {
        loop {
            match std::future::poll_fn(|cx| self.poll_event(cx)).await? {
                ConnectionEvent::Event(envelope) => {
                    self.confirm(envelope.identity)?;
                    return Ok(Some(envelope));
                }
                ConnectionEvent::Terminate { .. } => return Ok(None),
                _ => {}
            }
        }
    }

    /// Confirms the outstanding EVENT of `identity`.
    ///
    /// Confirming a peer that has nothing outstanding is a protocol violation. Confirming a peer whose session
    /// has since ended is a no-op.
    pub fn confirm(&mut self, identity: Identity) -> Result<(), TransportError> {
        if self.departed.remove(&identity) {
            tracing::debug!(peer = %identity, "confirm for a departed peer dropped");
            return Ok(());
        }
        if !self.unconfirmed.remove(&identity) {
            Counters::incr(&self.counters.protocol_violations);
            return Err(TransportError::violation(format!(
                "CONFIRM for {identity} without an outstanding message"
            )));
        }
        match self.socket.send(identity, Message::confirm()) {
            Ok(()) => {
                Counters::incr(&self.counters.confirms_sent);
                Ok(())
            }
            Err(err) => {
                self.counters.record_error(err.kind());
                tracing::debug!(peer = %identity, error = %err, "confirm not delivered");
                Ok(())
            }
        }
    }

    /// Whether `identity` has an EVENT awaiting confirmation.
    pub fn is_unconfirmed(&self, identity: Identity) -> bool {
        self.unconfirmed.contains(&identity)
    }

    /// Socket mode of the input.
    pub fn mode(&self) -> SocketMode {
        self.socket.mode()
    }

    /// Lets queued CONFIRMs flush and closes the socket.
    pub async fn shutdown(&mut self, linger: Duration) {
        self.socket.shutdown(linger).await;
    }
}

impl Connection for ConfirmedInput {
    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Result<ConnectionEvent, TransportError>> {
        loop {
            let event = match std::task::ready!(self.socket.poll_event(cx)) {
                SocketEvent::Connected(identity) => ConnectionEvent::PeerJoined(identity),
                SocketEvent::Message(identity, message) => match message.tag() {
                    Tag::Event => {
                        if !self.unconfirmed.insert(identity) {
                            Counters::incr(&self.counters.protocol_violations);
                            self.socket.disconnect(identity);
                            return Poll::Ready(Err(TransportError::violation(format!(
                                "second EVENT from {identity} before CONFIRM"
                            ))));
                        }
                        Counters::incr(&self.counters.events_received);
                        ConnectionEvent::Event(Envelope::new(identity, message))
                    }
                    Tag::Terminate => {
                        Counters::incr(&self.counters.terminates_received);
                        ConnectionEvent::Terminate { from: identity }
                    }
                    tag => {
                        tracing::warn!(peer = %identity, %tag, "unexpected message on confirmed input");
                        continue;
                    }
                },
                SocketEvent::Disconnected(identity, reason) => {
                    if self.unconfirmed.remove(&identity) {
                        self.departed.insert(identity);
                    }
                    Counters::incr(&self.counters.peers_lost);
                    tracing::info!(peer = %identity, %reason, "upstream peer left");
                    ConnectionEvent::PeerLost(identity)
                }
                SocketEvent::Exhausted { attempts } => {
                    Counters::incr(&self.counters.reconnects_exhausted);
                    return Poll::Ready(Err(TransportError::ReconnectExhausted {
                        endpoint: self.socket.endpoint().to_string(),
                        attempts,
                    }));
                }
                SocketEvent::Closed => return Poll::Ready(Err(TransportError::Closed)),
            };
            return Poll::Ready(Ok(event));
        }
    }
}
