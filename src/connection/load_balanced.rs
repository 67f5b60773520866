//! Fan-out to whichever peer signalled READY first.
//!
//! A [`LoadBalancer`] holds the per-peer state of one load-balanced connection: which peers are READY, in the
//! order they became ready, which message each BUSY peer is working on, and a backlog of messages that arrived
//! while no peer was READY. It performs no I/O. Every operation returns the [`Dispatch`] the caller must
//! transmit, which keeps the policy testable on its own.
//!
//! [`LoadBalancedConnection`] drives a load balancer from a bound socket, and [`LoadBalancedInput`] is the
//! consumer half that announces readiness.
//!
//! # Guarantees
//! - **Fairness**: the READY peer that has waited longest is always chosen next.
//! - **No loss**: a message sent to a peer that goes away before its next READY is put back at the head of the
//!   backlog and handed to another peer.

use std::{
    collections::{HashMap, HashSet, VecDeque},
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

/// A message assigned to a peer. The caller must transmit it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dispatch {
    /// The chosen peer.
    pub identity: Identity,
    /// The message to send.
    pub message: Message,
}

#[derive(Debug)]
enum PeerState {
    Ready,
    Busy { in_flight: Message },
}

/// What happened when a peer was evicted.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Eviction {
    /// The peer's in-flight message was put back into the backlog.
    pub reinjected: bool,
    /// The backlog head was immediately handed to another READY peer.
    pub redispatch: Option<Dispatch>,
}

/// Peer readiness bookkeeping for a load-balanced connection.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    peers: HashMap<Identity, PeerState>,
    ready: VecDeque<Identity>,
    backlog: VecDeque<Message>,
}

impl LoadBalancer {
    /// Creates an empty load balancer.
    pub fn new() -> Self {
        LoadBalancer::default()
    }

    /// Marks a peer READY, registering it if this is its first READY.
    ///
    /// A BUSY peer's in-flight message is released. If messages are waiting in the backlog the oldest one is
    /// assigned to this peer right away.
    pub fn on_ready(&mut self, identity: Identity) -> Option<Dispatch> {
        if let Some(PeerState::Ready) = self.peers.get(&identity) {
            tracing::debug!(peer = %identity, "duplicate READY ignored");
            return None;
        }
        self.peers.insert(identity, PeerState::Ready);
        match self.backlog.pop_front() {
            Some(message) => Some(self.assign(identity, message)),
            None => {
                self.ready.push_back(identity);
                None
            }
        }
    }

    /// Assigns a message to the READY peer that has waited longest, or queues it if no peer is READY.
    pub fn dispatch(&mut self, message: Message) -> Option<Dispatch> {
        match self.ready.pop_front() {
            Some(identity) => Some(self.assign(identity, message)),
            None => {
                self.backlog.push_back(message);
                None
            }
        }
    }

    /// Removes a peer. Its in-flight message, if any, goes back to the head of the backlog.
    pub fn on_disconnect(&mut self, identity: Identity) -> Eviction {
        let Some(state) = self.peers.remove(&identity) else {
            return Eviction::default();
        };
        match state {
            PeerState::Ready => {
                self.ready.retain(|peer| *peer != identity);
                Eviction::default()
            }
            PeerState::Busy { in_flight } => {
                self.backlog.push_front(in_flight);
                let redispatch = match self.ready.pop_front() {
                    Some(next) => self
                        .backlog
                        .pop_front()
                        .map(|message| self.assign(next, message)),
                    None => None,
                };
                Eviction {
                    reinjected: true,
                    redispatch,
                }
            }
        }
    }

    /// Whether a peer is waiting for work.
    pub fn has_ready_peer(&self) -> bool {
        !self.ready.is_empty()
    }

    /// No backlog and no in-flight messages.
    pub fn is_idle(&self) -> bool {
        self.backlog.is_empty()
            && self
                .peers
                .values()
                .all(|state| matches!(state, PeerState::Ready))
    }

    /// Messages waiting for a READY peer.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Registered peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Registered peers in no particular order.
    pub fn peers(&self) -> impl Iterator<Item = Identity> + '_ {
        self.peers.keys().copied()
    }

    fn assign(&mut self, identity: Identity, message: Message) -> Dispatch {
        self.peers.insert(
            identity,
            PeerState::Busy {
                in_flight: message.clone(),
            },
        );
        Dispatch { identity, message }
    }
}

/// The dispatching half of a load-balanced connection.
#[derive(Debug)]
pub struct LoadBalancedConnection {
    socket: Socket,
    balancer: LoadBalancer,
    linger: Duration,
    counters: Arc<Counters>,
}

impl LoadBalancedConnection {
    /// Opens the socket described by `link` with tagged framing.
    pub async fn open(
        ctx: &socket::Context,
        link: &Link,
        counters: Arc<Counters>,
    ) -> Result<Self, TransportError> {
        let options = SocketOptions::tagged(ctx.config());
        let socket = Socket::open(ctx, &link.endpoint, link.mode, options).await?;
        Ok(LoadBalancedConnection {
            socket,
            balancer: LoadBalancer::new(),
            linger: ctx.config().linger,
            counters,
        })
    }

    /// Hands a message to the next READY peer, or to the backlog if none is READY.
    ///
    /// A message larger than `max_message_size` is refused with a protocol violation before it reaches the
    /// backlog, so it can never be reinjected from peer to peer.
    pub fn dispatch(&mut self, message: Message) -> Result<(), TransportError> {
        if let Err(err) = self.socket.validate(&message) {
            Counters::incr(&self.counters.protocol_violations);
            return Err(err);
        }
        if let Some(dispatch) = self.balancer.dispatch(message) {
            self.transmit(dispatch);
        }
        Ok(())
    }

    /// Sends TERMINATE to every connected peer.
    pub fn broadcast_terminate(&mut self) -> usize {
        let peers: Vec<_> = self.socket.peers().collect();
        let mut delivered = 0;
        for peer in peers {
            if self.socket.send(peer, Message::terminate()).is_ok() {
                delivered += 1;
            }
        }
        tracing::info!(endpoint = %self.socket.endpoint(), peers = delivered, "broadcast TERMINATE");
        delivered
    }

    /// Whether a peer is waiting for work.
    pub fn has_ready_peer(&self) -> bool {
        self.balancer.has_ready_peer()
    }

    /// Whether every dispatched message has been released by a READY and nothing is queued.
    pub fn is_idle(&self) -> bool {
        self.balancer.is_idle()
    }

    /// Messages waiting for a READY peer.
    pub fn backlog_len(&self) -> usize {
        self.balancer.backlog_len()
    }

    /// The underlying load balancer.
    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Closes the socket after letting queued frames flush.
    pub async fn shutdown(&mut self) {
        self.socket.shutdown(self.linger).await;
    }

    fn transmit(&mut self, dispatch: Dispatch) {
        let identity = dispatch.identity;
        match self.socket.send(identity, dispatch.message) {
            Ok(()) => Counters::incr(&self.counters.events_sent),
            Err(err) => {
                // The session is already gone; treat it like a disconnect so nothing is lost.
                tracing::debug!(peer = %identity, error = %err, "dispatch failed");
                self.evict(identity);
            }
        }
    }

    fn evict(&mut self, identity: Identity) {
        let eviction = self.balancer.on_disconnect(identity);
        if eviction.reinjected {
            Counters::incr(&self.counters.reinjected);
            tracing::warn!(peer = %identity, "in-flight message reinjected");
        }
        if let Some(dispatch) = eviction.redispatch {
            self.transmit(dispatch);
        }
    }
}

impl Connection for LoadBalancedConnection {
    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Result<ConnectionEvent, TransportError>> {
        loop {
            let event = match std::task::ready!(self.socket.poll_event(cx)) {
                SocketEvent::Connected(identity) => {
                    tracing::debug!(peer = %identity, "peer connected");
                    ConnectionEvent::PeerJoined(identity)
                }
                SocketEvent::Message(identity, message) => match message.tag() {
                    Tag::Ready => {
                        Counters::incr(&self.counters.ready_received);
                        if let Some(dispatch) = self.balancer.on_ready(identity) {
                            self.transmit(dispatch);
                        }
                        ConnectionEvent::PeerReady(identity)
                    }
                    Tag::Terminate => {
                        Counters::incr(&self.counters.terminates_received);
                        self.evict(identity);
                        ConnectionEvent::Terminate { from: identity }
                    }
                    tag => {
                        tracing::warn!(peer = %identity, %tag, "unexpected message on load-balanced output");
                        continue;
                    }
                },
                SocketEvent::Disconnected(identity, reason) => {
                    Counters::incr(&self.counters.peers_lost);
                    tracing::warn!(peer = %identity, %reason, "peer lost");
                    self.evict(identity);
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

/// The consuming half of a load-balanced connection.
///
/// Sends READY whenever a session is established and again after each event via
/// [`ready`](LoadBalancedInput::ready).
#[derive(Debug)]
pub struct LoadBalancedInput {
    socket: Socket,
    outstanding: HashSet<Identity>,
    ever_connected: bool,
    counters: Arc<Counters>,
}

impl LoadBalancedInput {
    /// Opens the socket described by `link` with tagged framing.
    pub async fn open(
        ctx: &socket::Context,
        link: &Link,
        counters: Arc<Counters>,
    ) -> Result<Self, TransportError> {
        let options = SocketOptions::tagged(ctx.config());
        let socket = Socket::open(ctx, &link.endpoint, link.mode, options).await?;
        Ok(LoadBalancedInput {
            socket,
            outstanding: HashSet::new(),
            ever_connected: false,
            counters,
        })
    }

    /// Releases the outstanding event of `identity` and asks for the next one.
    pub fn ready(&mut self, identity: Identity) -> Result<(), TransportError> {
        if !self.outstanding.remove(&identity) {
            Counters::incr(&self.counters.protocol_violations);
            return Err(TransportError::violation(format!(
                "READY for {identity} without an outstanding event"
            )));
        }
        self.send_ready(identity);
        Ok(())
    }

    /// Whether an event from `identity` has not been released yet.
    pub fn is_outstanding(&self, identity: Identity) -> bool {
        self.outstanding.contains(&identity)
    }

    /// Socket mode of the input.
    pub fn mode(&self) -> SocketMode {
        self.socket.mode()
    }

    /// Closes the socket after letting queued frames flush.
    pub async fn shutdown(&mut self, linger: Duration) {
        self.socket.shutdown(linger).await;
    }

    fn send_ready(&mut self, identity: Identity) {
        match self.socket.send(identity, Message::ready()) {
            Ok(()) => Counters::incr(&self.counters.ready_sent),
            Err(err) => {
                self.counters.record_error(err.kind());
                tracing::debug!(peer = %identity, error = %err, "READY not delivered");
            }
        }
    }
}

impl Connection for LoadBalancedInput {
    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Result<ConnectionEvent, TransportError>> {
        loop {
            let event = match std::task::ready!(self.socket.poll_event(cx)) {
                SocketEvent::Connected(identity) => {
                    if self.ever_connected && self.socket.mode() == SocketMode::Connect {
                        Counters::incr(&self.counters.reconnects);
                        tracing::info!(endpoint = %self.socket.endpoint(), peer = %identity, "reconnected");
                    }
                    self.ever_connected = true;
                    self.send_ready(identity);
                    ConnectionEvent::PeerJoined(identity)
                }
                SocketEvent::Message(identity, message) => match message.tag() {
                    Tag::Event => {
                        if !self.outstanding.insert(identity) {
                            Counters::incr(&self.counters.protocol_violations);
                            return Poll::Ready(Err(TransportError::violation(format!(
                                "EVENT from {identity} while the previous one is unreleased"
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
                        tracing::warn!(peer = %identity, %tag, "unexpected message on load-balanced input");
                        continue;
                    }
                },
                SocketEvent::Disconnected(identity, reason) => {
                    self.outstanding.remove(&identity);
                    Counters::incr(&self.counters.peers_lost);
                    tracing::warn!(peer = %identity, %reason, "dispatcher lost");
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

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn event(n: u32) -> Message {
        Message::event_from(Bytes::from(n.to_be_bytes().to_vec()))
    }

    fn ids(n: u64) -> Vec<Identity> {
        (1..=n).map(Identity::from_raw).collect()
    }

    #[test]
    fn oldest_ready_peer_is_chosen_first() {
        let mut lb = LoadBalancer::new();
        let [a, b, c] = ids(3)[..] else { unreachable!() };
        for peer in [b, a, c] {
            assert_eq!(lb.on_ready(peer), None);
        }

        assert_eq!(lb.dispatch(event(1)).unwrap().identity, b);
        assert_eq!(lb.dispatch(event(2)).unwrap().identity, a);
        assert_eq!(lb.dispatch(event(3)).unwrap().identity, c);
        assert!(!lb.has_ready_peer());
        assert!(!lb.is_idle());
    }

    #[test]
    fn backlog_drains_to_next_ready_peer() {
        let mut lb = LoadBalancer::new();
        let a = Identity::from_raw(1);
        assert_eq!(lb.dispatch(event(1)), None);
        assert_eq!(lb.dispatch(event(2)), None);
        assert_eq!(lb.backlog_len(), 2);

        let first = lb.on_ready(a).unwrap();
        assert_eq!(first.message, event(1));
        let second = lb.on_ready(a).unwrap();
        assert_eq!(second.message, event(2));

        assert_eq!(lb.on_ready(a), None);
        assert!(lb.is_idle());
    }

    #[test]
    fn lost_peer_message_is_reinjected_to_another_peer() {
        let mut lb = LoadBalancer::new();
        let [a, b] = ids(2)[..] else { unreachable!() };
        lb.on_ready(a);
        let sent = lb.dispatch(event(7)).unwrap();
        assert_eq!(sent.identity, a);

        assert!(lb.dispatch(event(8)).is_none());
        let eviction = lb.on_disconnect(a);
        assert!(eviction.reinjected);
        assert_eq!(eviction.redispatch, None);
        assert_eq!(lb.backlog_len(), 2);

        // The reinjected message goes out before the one queued after it.
        let next = lb.on_ready(b).unwrap();
        assert_eq!(next, Dispatch { identity: b, message: event(7) });
        assert_eq!(lb.on_ready(b).unwrap().message, event(8));
    }

    #[test]
    fn eviction_redispatches_when_a_peer_is_ready() {
        let mut lb = LoadBalancer::new();
        let [a, b] = ids(2)[..] else { unreachable!() };
        lb.on_ready(a);
        lb.dispatch(event(1));
        lb.on_ready(b);

        let eviction = lb.on_disconnect(a);
        assert_eq!(
            eviction.redispatch,
            Some(Dispatch {
                identity: b,
                message: event(1)
            })
        );
        assert_eq!(lb.peer_count(), 1);
    }

    #[test]
    fn ready_peer_eviction_leaves_no_trace() {
        let mut lb = LoadBalancer::new();
        let [a, b] = ids(2)[..] else { unreachable!() };
        lb.on_ready(a);
        lb.on_ready(b);
        assert_eq!(lb.on_disconnect(a), Eviction::default());
        assert_eq!(lb.dispatch(event(1)).unwrap().identity, b);
        assert_eq!(lb.on_disconnect(Identity::from_raw(99)), Eviction::default());
    }

    #[test]
    fn no_ready_peer_is_chosen_twice_while_another_waits() {
        let mut lb = LoadBalancer::new();
        let peers = ids(5);
        for peer in &peers {
            lb.on_ready(*peer);
        }

        let mut chosen = HashSet::new();
        for n in 0..peers.len() as u32 {
            let dispatch = lb.dispatch(event(n)).unwrap();
            assert!(chosen.insert(dispatch.identity));
            // Immediately ready again: it must queue behind the ones still waiting.
            lb.on_ready(dispatch.identity);
        }
        assert_eq!(chosen.len(), peers.len());
    }

    #[test]
    fn saturated_round_robin_is_even() {
        let mut lb = LoadBalancer::new();
        let peers = ids(4);
        for peer in &peers {
            lb.on_ready(*peer);
        }
        let mut counts: HashMap<Identity, u32> = HashMap::new();
        for n in 0..1000 {
            assert!(lb.has_ready_peer(), "dispatch {n} would pause upstream");
            let dispatch = lb.dispatch(event(n)).unwrap();
            *counts.entry(dispatch.identity).or_default() += 1;
            lb.on_ready(dispatch.identity);
        }
        assert!(counts.values().all(|count| *count == 250));
    }
}
