//! The single input of a role.

use std::{
    collections::HashSet,
    fmt,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use super::{Connection, ConnectionEvent, ConfirmedInput, LoadBalancedInput, RawConnection};
use crate::{
    endpoint::{Link, SocketMode},
    error::TransportError,
    message::Identity,
    metrics::Counters,
    socket,
};

/// Which flow-control discipline an upstream speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum InputKind {
    /// EVENT/CONFIRM, one message in flight per peer.
    Confirmed,
    /// READY/EVENT, fed by a load-balanced dispatcher.
    LoadBalanced,
    /// Untagged blobs with no acknowledgement.
    Raw,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputKind::Confirmed => f.write_str("confirmed"),
            InputKind::LoadBalanced => f.write_str("load-balanced"),
            InputKind::Raw => f.write_str("raw"),
        }
    }
}

#[derive(Debug)]
enum Input {
    Confirmed(ConfirmedInput),
    LoadBalanced(LoadBalancedInput),
    Raw(RawConnection),
}

/// A role's input, with end-of-stream tracking.
///
/// A connect-mode upstream is finished when its peer sends TERMINATE; losing the peer only triggers a reconnect.
/// A bind-mode upstream treats a peer that goes away as if it had sent TERMINATE, and is finished once every
/// peer it has seen has terminated or left.
#[derive(Debug)]
pub struct Upstream {
    input: Input,
    mode: SocketMode,
    active: HashSet<Identity>,
    seen_any: bool,
    terminated: bool,
}

impl Upstream {
    /// Opens an input of the given kind.
    pub async fn open(
        ctx: &socket::Context,
        kind: InputKind,
        link: &Link,
        counters: Arc<Counters>,
    ) -> Result<Self, TransportError> {
        let input = match kind {
            InputKind::Confirmed => {
                Input::Confirmed(ConfirmedInput::open(ctx, link, counters).await?)
            }
            InputKind::LoadBalanced => {
                Input::LoadBalanced(LoadBalancedInput::open(ctx, link, counters).await?)
            }
            InputKind::Raw => Input::Raw(RawConnection::source(ctx, link, counters).await?),
        };
        tracing::info!(%kind, %link, "upstream opened");
        Ok(Upstream {
            input,
            mode: link.mode,
            active: HashSet::new(),
            seen_any: false,
            terminated: false,
        })
    }

    /// The input's discipline.
    pub fn kind(&self) -> InputKind {
        match self.input {
            Input::Confirmed(_) => InputKind::Confirmed,
            Input::LoadBalanced(_) => InputKind::LoadBalanced,
            Input::Raw(_) => InputKind::Raw,
        }
    }

    /// Acknowledges the event last received from `identity`: CONFIRM for confirmed inputs, READY for
    /// load-balanced ones, nothing for raw ones. A peer that has left in the meantime is skipped.
    pub fn acknowledge(&mut self, identity: Identity) -> Result<(), TransportError> {
        match &mut self.input {
            Input::Confirmed(input) => input.confirm(identity),
            Input::LoadBalanced(input) if input.is_outstanding(identity) => input.ready(identity),
            _ => Ok(()),
        }
    }

    /// Whether no more events will arrive.
    pub fn is_finished(&self) -> bool {
        match self.mode {
            SocketMode::Connect => self.terminated,
            SocketMode::Bind => self.seen_any && self.active.is_empty(),
        }
    }

    /// Closes the input after letting queued acknowledgements flush.
    pub async fn shutdown(&mut self, linger: Duration) {
        match &mut self.input {
            Input::Confirmed(input) => input.shutdown(linger).await,
            Input::LoadBalanced(input) => input.shutdown(linger).await,
            Input::Raw(input) => input.shutdown().await,
        }
    }

    fn poll_input(&mut self, cx: &mut Context<'_>) -> Poll<Result<ConnectionEvent, TransportError>> {
        match &mut self.input {
            Input::Confirmed(input) => input.poll_event(cx),
            Input::LoadBalanced(input) => input.poll_event(cx),
            Input::Raw(input) => input.poll_event(cx),
        }
    }
}

impl Connection for Upstream {
    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Result<ConnectionEvent, TransportError>> {
        let event = match std::task::ready!(self.poll_input(cx))? {
            ConnectionEvent::PeerJoined(identity) => {
                self.seen_any = true;
                self.active.insert(identity);
                ConnectionEvent::PeerJoined(identity)
            }
            ConnectionEvent::Terminate { from } => {
                self.active.remove(&from);
                if self.mode == SocketMode::Connect {
                    self.terminated = true;
                }
                ConnectionEvent::Terminate { from }
            }
            ConnectionEvent::PeerLost(identity)
                if self.mode == SocketMode::Bind && self.active.remove(&identity) =>
            {
                tracing::info!(peer = %identity, "upstream peer gone, treating as TERMINATE");
                ConnectionEvent::Terminate { from: identity }
            }
            event => event,
        };
        Poll::Ready(Ok(event))
    }
}
