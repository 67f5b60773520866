//! Defines error handling constructs for farmnet.
//!
//! Every failure the transport layer can observe is expressed as a [`TransportError`]. The errors fall into a
//! small number of [`ErrorKind`]s, each of which is counted in the role's monitoring [`Counters`](crate::metrics::Counters).
//! Only protocol violations and exhausted reconnects are fatal to a process; everything else is retried, evicted
//! or downgraded to best effort by the connection that observed it.

use std::{fmt, io};

use crate::message::Identity;

/// Why a peer session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The local side closed the session.
    Closed,
    /// The remote side closed the stream.
    Eof,
    /// Nothing was heard from the peer within the heartbeat timeout.
    HeartbeatTimeout,
    /// The peer sent a frame that could not be decoded.
    Protocol(String),
    /// The underlying stream failed.
    Io(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "closed"),
            DisconnectReason::Eof => write!(f, "end of stream"),
            DisconnectReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            DisconnectReason::Protocol(err) => write!(f, "protocol error: {err}"),
            DisconnectReason::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

/// An error that occurs while encoding or decoding frames and payloads.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame announced a length above the configured maximum.
    #[error("frame of {len} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge {
        /// The announced length.
        len: usize,
        /// The configured maximum.
        max: usize,
    },
    /// The frame carried a tag byte this version does not understand.
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    /// The frame ended before all announced payload frames were read.
    #[error("truncated frame")]
    Truncated,
    /// A histogram payload was missing a frame.
    #[error("missing payload frame `{0}`")]
    MissingFrame(&'static str),
    /// Serializing a payload failed.
    #[error("encode failed: {0}")]
    Encode(String),
    /// Deserializing a payload failed.
    #[error("decode failed: {0}")]
    Decode(String),
    /// The underlying stream failed while framing.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer is not connected or not ready yet. Retried on the next poll cycle.
    #[error("peer {0} is not available yet")]
    TransientPeerUnavailable(Identity),
    /// A flow-control rule was broken, such as a second send before CONFIRM.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// A peer disconnected or missed its heartbeats.
    #[error("peer {identity} lost: {reason}")]
    PeerLost {
        /// The peer that went away.
        identity: Identity,
        /// Why the session ended.
        reason: DisconnectReason,
    },
    /// One of the raw sinks did not accept a write.
    #[error("sink `{0}` is degraded")]
    SinkDegraded(&'static str),
    /// A connect-mode socket ran out of reconnect attempts.
    #[error("reconnect to {endpoint} exhausted after {attempts} attempts")]
    ReconnectExhausted {
        /// The endpoint that could not be reached.
        endpoint: String,
        /// How many attempts were made.
        attempts: u32,
    },
    /// An endpoint string could not be parsed.
    #[error("invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint {
        /// The offending endpoint string.
        endpoint: String,
        /// What is wrong with it.
        reason: &'static str,
    },
    /// Two histograms with the same name had different binning.
    #[error("histogram `{0}` has incompatible binning")]
    HistogramMismatch(String),
    /// Encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// An I/O error from binding, accepting or storing.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The socket behind a connection has shut down.
    #[error("connection closed")]
    Closed,
}

/// Coarse classification of [`TransportError`]s, used for counters and exit handling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Peer not yet connected or ready.
    TransientPeerUnavailable,
    /// Configuration or programming error.
    ProtocolViolation,
    /// Disconnect or heartbeat timeout.
    PeerLost,
    /// A raw sink refused a write.
    SinkDegraded,
    /// Reconnect attempts exhausted.
    ReconnectExhausted,
    /// Histograms with incompatible binning.
    HistogramMismatch,
    /// Everything else: bad input, I/O, codec failures.
    Other,
}

impl TransportError {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::TransientPeerUnavailable(_) => ErrorKind::TransientPeerUnavailable,
            TransportError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            TransportError::PeerLost { .. } => ErrorKind::PeerLost,
            TransportError::SinkDegraded(_) => ErrorKind::SinkDegraded,
            TransportError::ReconnectExhausted { .. } => ErrorKind::ReconnectExhausted,
            TransportError::HistogramMismatch(_) => ErrorKind::HistogramMismatch,
            TransportError::InvalidEndpoint { .. }
            | TransportError::Codec(_)
            | TransportError::Io(_)
            | TransportError::Closed => ErrorKind::Other,
        }
    }

    /// Whether this error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ProtocolViolation | ErrorKind::ReconnectExhausted
        )
    }

    pub(crate) fn violation(msg: impl fmt::Display) -> Self {
        TransportError::ProtocolViolation(msg.to_string())
    }
}
