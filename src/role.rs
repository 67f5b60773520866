//! The named roles a farm is built from.
//!
//! Every role owns exactly one [`Upstream`](crate::connection::Upstream) and one or more downstream
//! connections, and runs a single [`Reactor`](crate::reactor::Reactor) loop until its upstream is finished.
//! Roles are constructed with `new` (which binds or starts dialing every socket) and consumed by `run`, which
//! returns `Ok(())` after a graceful drain and an error for anything fatal.
//!
//! | Role | Input | Output |
//! |------|-------|--------|
//! | [`Distributor`] | confirmed or raw | load-balanced |
//! | [`Worker`] | load-balanced | confirmed |
//! | [`Collector`] | confirmed | load-balanced ([`LoadBalancedForward`]) |
//! | [`ProxyCollector`] | confirmed | confirmed ([`ConfirmedForward`]) |
//! | [`FinalCollectorWithRoi`] | confirmed or load-balanced | two raw sinks ([`DualRawFanOut`]) |
//! | [`ReadySender`] | load-balanced | none |
//! | [`ProxyHistogramServer`] | confirmed | confirmed, on a timer |
//! | [`RawHistogramServer`] | confirmed | a [`HistogramStore`](crate::histogram::HistogramStore) |

use tokio::time::Instant;

use crate::{config::TransportConfig, metrics::Counters};

pub mod collector;
pub mod distributor;
pub mod histogram_server;
pub mod ready_sender;
pub mod worker;

pub use collector::{
    Collector, ConfirmedForward, DualRawFanOut, FinalCollectorWithRoi, LoadBalancedForward,
    Output, ProxyCollector,
};
pub use distributor::Distributor;
pub use histogram_server::{HistogramMerger, ProxyHistogramServer, RawHistogramServer};
pub use ready_sender::ReadySender;
pub use worker::{EventProcessor, Passthrough, Worker, WorkerState};

/// Logs a snapshot of a role's counters.
pub(crate) fn log_stats(role: &str, counters: &Counters) {
    tracing::info!(role, stats = ?counters.snapshot(), "counters");
}

/// The point in time after which a drain gives up.
pub(crate) fn drain_deadline(config: &TransportConfig) -> Instant {
    Instant::now() + config.terminate_timeout
}
