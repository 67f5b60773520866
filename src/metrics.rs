//! Monitoring counters shared by the connections of one role.
//!
//! Counters are plain atomics behind an [`Arc`](std::sync::Arc) so that a role, its connections and whoever
//! observes the process (stats logging, `--stats-file`, tests) can all read them without locking.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::ErrorKind;

macro_rules! counters {
    ($( $(#[$doc:meta])* $name:ident ),* $(,)?) => {
        /// Monotonic event and error counters for one role.
        #[derive(Debug, Default)]
        pub struct Counters {
            $( $(#[$doc])* pub $name: AtomicU64, )*
        }

        /// A point-in-time copy of [`Counters`].
        #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
        pub struct CounterSnapshot {
            $( $(#[$doc])* pub $name: u64, )*
        }

        impl Counters {
            /// Reads every counter.
            pub fn snapshot(&self) -> CounterSnapshot {
                CounterSnapshot {
                    $( $name: self.$name.load(Ordering::Relaxed), )*
                }
            }
        }
    };
}

counters! {
    /// EVENT messages received from upstream.
    events_received,
    /// EVENT messages sent downstream.
    events_sent,
    /// CONFIRM messages sent.
    confirms_sent,
    /// CONFIRM messages received.
    confirms_received,
    /// READY messages sent.
    ready_sent,
    /// READY messages received.
    ready_received,
    /// TERMINATE messages received.
    terminates_received,
    /// Raw blobs written to sinks.
    raw_writes,
    /// Messages put back into a load-balanced backlog after their peer was lost.
    reinjected,
    /// Poll cycles in which upstream reads were paused for lack of a ready peer.
    backpressure_pauses,
    /// Sends deferred because the peer was not connected yet.
    transient_unavailable,
    /// Flow-control rule violations.
    protocol_violations,
    /// Peers lost to disconnects or heartbeat timeouts.
    peers_lost,
    /// Successful reconnects of connect-mode sockets.
    reconnects,
    /// Connect-mode sockets that ran out of reconnect attempts.
    reconnects_exhausted,
    /// Raw sink writes that were not accepted.
    sink_degraded,
    /// Terminations that gave up waiting for an outstanding CONFIRM/READY.
    drain_timeouts,
    /// Histogram sets merged.
    histograms_merged,
    /// Histogram sets flushed to a parent or store.
    histograms_flushed,
    /// Histogram updates dropped for incompatible binning.
    histogram_mismatches,
    /// Codec, I/O and other errors without a counter of their own.
    other_errors,
}

impl Counters {
    /// Adds one to a counter.
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an error under its kind.
    pub fn record_error(&self, kind: ErrorKind) {
        let counter = match kind {
            ErrorKind::TransientPeerUnavailable => &self.transient_unavailable,
            ErrorKind::ProtocolViolation => &self.protocol_violations,
            ErrorKind::PeerLost => &self.peers_lost,
            ErrorKind::SinkDegraded => &self.sink_degraded,
            ErrorKind::ReconnectExhausted => &self.reconnects_exhausted,
            ErrorKind::HistogramMismatch => &self.histogram_mismatches,
            ErrorKind::Other => &self.other_errors,
        };
        Counters::incr(counter);
    }
}
