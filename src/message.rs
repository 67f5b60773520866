//! Addressed message envelopes exchanged between farm processes.
//!
//! A [`Message`] is a control [`Tag`] followed by zero or more opaque payload frames. The transport never looks
//! inside the payload. When a message travels through a bound socket it is paired with the [`Identity`] of the
//! peer it came from (or is going to) in an [`Envelope`].

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;

use crate::error::CodecError;

static IDENTITY_COUNTER: AtomicU64 = AtomicU64::new(1);

/// An opaque, per-session handle for a connected peer.
///
/// Identities are assigned by the local socket when a transport session is established and are never reused
/// within a process. A peer that reconnects is a new session and gets a new identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(u64);

impl Identity {
    /// Allocates the next unused identity.
    pub fn generate() -> Self {
        Identity(IDENTITY_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a raw value. Intended for tests and tooling.
    pub const fn from_raw(raw: u64) -> Self {
        Identity(raw)
    }

    /// Returns the raw value.
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({:#x})", self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// The control tag carried by every message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// "I am idle, give me work", or at session start "register me".
    Ready = 1,
    /// A data message with payload frames.
    Event = 2,
    /// Acknowledges receipt of the previous EVENT.
    Confirm = 3,
    /// Asks the receiver to drain and exit.
    Terminate = 4,
    /// Keep-alive exchanged by sockets. Never surfaced to connections.
    Heartbeat = 5,
}

impl Tag {
    /// Decodes a tag byte.
    pub fn from_u8(byte: u8) -> Result<Self, CodecError> {
        match byte {
            1 => Ok(Tag::Ready),
            2 => Ok(Tag::Event),
            3 => Ok(Tag::Confirm),
            4 => Ok(Tag::Terminate),
            5 => Ok(Tag::Heartbeat),
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tag::Ready => "READY",
            Tag::Event => "EVENT",
            Tag::Confirm => "CONFIRM",
            Tag::Terminate => "TERMINATE",
            Tag::Heartbeat => "HEARTBEAT",
        };
        f.write_str(name)
    }
}

/// A control tag plus ordered payload frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    tag: Tag,
    frames: Vec<Bytes>,
}

impl Message {
    /// Creates a message from a tag and frames.
    pub fn new(tag: Tag, frames: Vec<Bytes>) -> Self {
        Message { tag, frames }
    }

    /// An EVENT with the given payload frames.
    pub fn event(frames: Vec<Bytes>) -> Self {
        Message::new(Tag::Event, frames)
    }

    /// An EVENT with a single payload frame.
    pub fn event_from(payload: impl Into<Bytes>) -> Self {
        Message::new(Tag::Event, vec![payload.into()])
    }

    /// A frameless READY.
    pub fn ready() -> Self {
        Message::new(Tag::Ready, Vec::new())
    }

    /// A frameless CONFIRM.
    pub fn confirm() -> Self {
        Message::new(Tag::Confirm, Vec::new())
    }

    /// A frameless TERMINATE.
    pub fn terminate() -> Self {
        Message::new(Tag::Terminate, Vec::new())
    }

    pub(crate) fn heartbeat() -> Self {
        Message::new(Tag::Heartbeat, Vec::new())
    }

    /// Returns the control tag.
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Returns the payload frames.
    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    /// Consumes the message, returning its payload frames.
    pub fn into_frames(self) -> Vec<Bytes> {
        self.frames
    }

    /// Total payload size in bytes.
    pub fn payload_len(&self) -> usize {
        self.frames.iter().map(Bytes::len).sum()
    }
}

/// A message together with the identity of the peer it belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// The peer the message came from or is addressed to.
    pub identity: Identity,
    /// The message itself.
    pub message: Message,
}

impl Envelope {
    /// Pairs a message with an identity.
    pub fn new(identity: Identity, message: Message) -> Self {
        Envelope { identity, message }
    }
}
