//! Operational tuning for sockets, connections and roles.
//!
//! All values are illustrative defaults. Every field can be set from a TOML file, durations in milliseconds:
//!
//! ```toml
//! heartbeat_interval_ms = 1000
//! heartbeat_timeout_ms = 10000
//! histogram_flush_interval_ms = 5000
//!
//! [reconnect]
//! initial_delay_ms = 100
//! max_delay_ms = 5000
//! max_retries = 10
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;

/// Default interval between heartbeats on an idle tagged session.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Default silence after which a peer is considered lost.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 10_000;

/// Default upper bound on a single reactor wait.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

/// Default period between histogram flushes.
pub const DEFAULT_HISTOGRAM_FLUSH_INTERVAL_MS: u64 = 5_000;

/// Default largest accepted frame (64 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Default bytes that may wait in a connected raw sink's queue before the writer stops accepting (16 MiB).
pub const DEFAULT_SINK_HIGH_WATER: usize = 16 * 1024 * 1024;

/// Configuration shared by every connection of a role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Interval between heartbeats sent on an idle tagged session.
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// A peer that stays silent for this long is dropped.
    #[serde(rename = "heartbeat_timeout_ms", with = "duration_ms")]
    pub heartbeat_timeout: Duration,
    /// Reconnect policy for connect-mode sockets.
    pub reconnect: BackoffConfig,
    /// Upper bound on how long a reactor poll waits without any event.
    #[serde(rename = "poll_timeout_ms", with = "duration_ms")]
    pub poll_timeout: Duration,
    /// How long a terminating role waits for outstanding CONFIRM/READY before giving up.
    #[serde(rename = "terminate_timeout_ms", with = "duration_ms")]
    pub terminate_timeout: Duration,
    /// How long a closing socket may keep flushing queued frames.
    #[serde(rename = "linger_ms", with = "duration_ms")]
    pub linger: Duration,
    /// Period of the histogram merge flush.
    #[serde(rename = "histogram_flush_interval_ms", with = "duration_ms")]
    pub histogram_flush_interval: Duration,
    /// Period of the counter snapshot log line.
    #[serde(rename = "stats_interval_ms", with = "duration_ms")]
    pub stats_interval: Duration,
    /// Largest frame accepted from or sent to a peer.
    pub max_message_size: usize,
    /// zlib level for histogram payloads, 0 (stored) to 9.
    pub compression_level: u32,
    /// Queued bytes above which a connected raw sink stops accepting writes.
    #[serde(rename = "sink_high_water_bytes")]
    pub sink_high_water: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            reconnect: BackoffConfig::default(),
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            terminate_timeout: Duration::from_secs(10),
            linger: Duration::from_secs(1),
            histogram_flush_interval: Duration::from_millis(DEFAULT_HISTOGRAM_FLUSH_INTERVAL_MS),
            stats_interval: Duration::from_secs(10),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            compression_level: 6,
            sink_high_water: DEFAULT_SINK_HIGH_WATER,
        }
    }
}

impl TransportConfig {
    /// Parses a configuration from TOML. Missing fields keep their defaults.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Reads and parses a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|err| anyhow::anyhow!("invalid config {}: {err}", path.display()))
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
