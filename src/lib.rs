#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod backoff;
pub mod cli;
pub mod codec;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod histogram;
pub mod message;
pub mod metrics;
pub mod reactor;
pub mod role;
pub mod socket;

pub use config::TransportConfig;
pub use connection::{Connection, ConnectionEvent, ConnectionExt};
pub use endpoint::{Endpoint, Link, SocketMode};
pub use error::{ErrorKind, TransportError};
pub use message::{Envelope, Identity, Message, Tag};
pub use metrics::{CounterSnapshot, Counters};
pub use socket::Context;
