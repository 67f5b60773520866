//! The per-role poll loop.
//!
//! A [`Reactor`] waits on a set of connections and timers at once and returns the first thing that happened as a
//! [`ReactorEvent`]. It owns the timers but not the connections: a role passes mutable borrows of its connections
//! on every call as [`Source`]s, each with a read-interest flag. Disabling a source is how a role applies
//! backpressure: its socket keeps running, but nothing is read from it until the role can handle more.
//!
//! Sources are polled in the order given, so a role lists its outputs before its input and acknowledgements
//! from downstream are always seen before new work from upstream. Every wait is bounded by the configured
//! poll timeout, after which [`ReactorEvent::Idle`] is returned.
//!
//! ```no_run
//! # use std::time::Duration;
//! # use farmnet::reactor::{Reactor, ReactorEvent, Source};
//! # async fn run(output: &mut impl farmnet::connection::Connection, input: &mut impl farmnet::connection::Connection) -> Result<(), farmnet::error::TransportError> {
//! let mut reactor = Reactor::new(Duration::from_millis(100));
//! let flush = reactor.interval("flush", Duration::from_secs(5));
//! loop {
//!     match reactor.poll(&mut [Source::new(&mut *output), Source::new(&mut *input).when(true)]).await? {
//!         ReactorEvent::Connection { source, event } => { /* ... */ }
//!         ReactorEvent::Timer(id) if id == flush => { /* ... */ }
//!         _ => {}
//!     }
//! }
//! # }
//! ```

use std::{
    future::{poll_fn, Future},
    task::Poll,
    time::Duration,
};

use tokio::time::Instant;

use crate::{
    connection::{Connection, ConnectionEvent},
    error::TransportError,
};

/// Identifies a timer registered with a [`Reactor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

#[derive(Debug)]
struct Timer {
    name: &'static str,
    deadline: Option<Instant>,
    period: Option<Duration>,
}

/// A connection handed to [`Reactor::poll`].
pub struct Source<'a> {
    connection: &'a mut dyn Connection,
    enabled: bool,
}

impl<'a> Source<'a> {
    /// An enabled source.
    pub fn new(connection: &'a mut dyn Connection) -> Self {
        Source {
            connection,
            enabled: true,
        }
    }

    /// Sets read interest.
    pub fn when(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

impl std::fmt::Debug for Source<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// What woke the reactor.
#[derive(Debug)]
pub enum ReactorEvent {
    /// A source produced an event. `source` is its index in the slice passed to [`Reactor::poll`].
    Connection {
        /// Index of the source.
        source: usize,
        /// The event.
        event: ConnectionEvent,
    },
    /// A timer fired.
    Timer(TimerId),
    /// Nothing happened within the poll timeout.
    Idle,
}

/// Timers plus a bounded wait over a role's connections.
#[derive(Debug)]
pub struct Reactor {
    poll_timeout: Duration,
    timers: Vec<Timer>,
}

impl Reactor {
    /// Creates a reactor whose waits never exceed `poll_timeout`.
    pub fn new(poll_timeout: Duration) -> Self {
        Reactor {
            poll_timeout,
            timers: Vec::new(),
        }
    }

    /// Registers a periodic timer that first fires one `period` from now.
    pub fn interval(&mut self, name: &'static str, period: Duration) -> TimerId {
        self.push(Timer {
            name,
            deadline: Some(Instant::now() + period),
            period: Some(period),
        })
    }

    /// Registers a one-shot timer that is not armed yet.
    pub fn timer(&mut self, name: &'static str) -> TimerId {
        self.push(Timer {
            name,
            deadline: None,
            period: None,
        })
    }

    /// Arms a timer to fire at `deadline`.
    pub fn arm(&mut self, id: TimerId, deadline: Instant) {
        if let Some(timer) = self.timers.get_mut(id.0) {
            timer.deadline = Some(deadline);
        }
    }

    /// Disarms a timer.
    pub fn disarm(&mut self, id: TimerId) {
        if let Some(timer) = self.timers.get_mut(id.0) {
            timer.deadline = None;
        }
    }

    /// Whether a timer is armed.
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.timers
            .get(id.0)
            .is_some_and(|timer| timer.deadline.is_some())
    }

    /// The name a timer was registered with.
    pub fn timer_name(&self, id: TimerId) -> &'static str {
        self.timers.get(id.0).map_or("unknown", |timer| timer.name)
    }

    /// Waits for the next event from an enabled source, a due timer, or the poll timeout.
    ///
    /// Due timers are reported before any source is polled. An error from a source is returned as is.
    pub async fn poll(
        &mut self,
        sources: &mut [Source<'_>],
    ) -> Result<ReactorEvent, TransportError> {
        let now = Instant::now();
        if let Some(id) = self.fire(now) {
            return Ok(ReactorEvent::Timer(id));
        }

        let mut wake = now + self.poll_timeout;
        if let Some(deadline) = self.next_deadline() {
            wake = wake.min(deadline);
        }
        let sleep = tokio::time::sleep_until(wake);
        tokio::pin!(sleep);

        let ready = poll_fn(|cx| {
            for (index, source) in sources.iter_mut().enumerate() {
                if !source.enabled {
                    continue;
                }
                if let Poll::Ready(result) = source.connection.poll_event(cx) {
                    return Poll::Ready(Some(result.map(|event| ReactorEvent::Connection {
                        source: index,
                        event,
                    })));
                }
            }
            sleep.as_mut().poll(cx).map(|()| None)
        })
        .await;

        match ready {
            Some(result) => result,
            None => Ok(self
                .fire(Instant::now())
                .map_or(ReactorEvent::Idle, ReactorEvent::Timer)),
        }
    }

    fn push(&mut self, timer: Timer) -> TimerId {
        self.timers.push(timer);
        TimerId(self.timers.len() - 1)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().filter_map(|timer| timer.deadline).min()
    }

    fn fire(&mut self, now: Instant) -> Option<TimerId> {
        let (index, timer) = self
            .timers
            .iter_mut()
            .enumerate()
            .filter(|(_, timer)| timer.deadline.is_some_and(|deadline| deadline <= now))
            .min_by_key(|(_, timer)| timer.deadline)?;
        timer.deadline = timer.period.map(|period| {
            let next = timer.deadline.unwrap_or(now) + period;
            // Skip missed ticks rather than firing in a burst.
            if next <= now {
                now + period
            } else {
                next
            }
        });
        tracing::trace!(timer = timer.name, "timer fired");
        Some(TimerId(index))
    }
}
