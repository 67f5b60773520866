//! Flow-controlled connections built on top of [sockets](crate::socket).
//!
//! A connection owns a socket and one flow-control discipline. The role that owns it polls it through the
//! [`Reactor`](crate::reactor::Reactor), which turns socket traffic into [`ConnectionEvent`]s after the
//! connection has applied its own bookkeeping (pending acknowledgements, peer readiness, reinjection).
//!
//! # Disciplines
//! - [`ConfirmedConnection`] / [`ConfirmedInput`]: point-to-point, at most one unconfirmed EVENT in flight.
//! - [`LoadBalancedConnection`] / [`LoadBalancedInput`]: fan-out to whichever peer signalled READY first.
//! - [`RawConnection`]: untagged blobs without any flow control.
//! - [`Upstream`]: the single input of a role, one of the consumer halves above.
//!
//! Sends never block. A connection that cannot take another message says so through `can_send`,
//! `has_ready_peer` and friends, and roles simply stop reading their input until it can.

use std::{
    future::{poll_fn, Future},
    task::{Context, Poll},
};

use crate::{
    error::TransportError,
    message::{Envelope, Identity},
};

pub mod confirmed;
pub mod load_balanced;
pub mod raw;
pub mod upstream;

pub use confirmed::{ConfirmedConnection, ConfirmedInput};
pub use load_balanced::{Dispatch, LoadBalancedConnection, LoadBalancedInput, LoadBalancer};
pub use raw::RawConnection;
pub use upstream::{InputKind, Upstream};

/// Something a connection wants its role to know about.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// An EVENT arrived.
    Event(Envelope),
    /// A peer asked us to drain and exit.
    Terminate {
        /// The peer that sent TERMINATE.
        from: Identity,
    },
    /// The outstanding EVENT of a confirmed output was acknowledged.
    Confirmed,
    /// A load-balanced peer signalled READY.
    PeerReady(Identity),
    /// A transport session was established.
    PeerJoined(Identity),
    /// A transport session ended.
    PeerLost(Identity),
}

/// A pollable source of [`ConnectionEvent`]s.
///
/// Errors returned from `poll_event` are terminal for the connection: a protocol violation, exhausted reconnect
/// attempts, or a socket that has shut down.
pub trait Connection: Send {
    /// Polls for the next event.
    fn poll_event(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<ConnectionEvent, TransportError>>;
}

/// Async helpers for [`Connection`]s.
pub trait ConnectionExt: Connection {
    /// Waits for the next event.
    fn next_event(&mut self) -> impl Future<Output = Result<ConnectionEvent, TransportError>> + Send
    where
        Self: Sized,
    {
        poll_fn(move |cx| self.poll_event(cx))
    }
}

impl<C> ConnectionExt for C where C: Connection + ?Sized {}
