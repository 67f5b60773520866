//! Length-prefixed framing for tagged and raw streams.
//!
//! Tagged frames carry a control tag and any number of payload frames:
//!
//! ```text
//! u32 BE length | u8 tag | u16 BE frame count | (u32 BE frame length | frame bytes)*
//! ```
//!
//! Raw frames carry a single opaque blob and no tag. They are what external storage and ROI consumers, and raw
//! event sources, speak:
//!
//! ```text
//! u32 BE length | blob bytes
//! ```

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    error::CodecError,
    message::{Message, Tag},
};

/// Bytes of the length prefix in front of every frame.
pub const LENGTH_PREFIX_LEN: usize = 4;
/// Bytes of the tag and frame count that open a tagged body.
pub const TAGGED_HEADER_LEN: usize = 3;
/// Bytes of the length prefix in front of every payload frame of a tagged body.
pub const FRAME_PREFIX_LEN: usize = 4;

/// Which wire format a stream uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    /// Control tag plus payload frames.
    Tagged,
    /// A single untagged blob per frame.
    Raw,
}

/// A [`Decoder`]/[`Encoder`] for [`Message`]s in either [`FrameFormat`].
#[derive(Clone, Debug)]
pub struct MessageCodec {
    format: FrameFormat,
    max_len: usize,
}

impl MessageCodec {
    /// Creates a codec that rejects frames longer than `max_len` bytes.
    pub fn new(format: FrameFormat, max_len: usize) -> Self {
        MessageCodec { format, max_len }
    }

    /// Returns the wire format.
    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Checks that `msg` can be written in this format and returns its body length.
    ///
    /// Sockets run this before queueing a message so that an unencodable message is refused to its sender
    /// instead of failing inside a session.
    pub fn validate(&self, msg: &Message) -> Result<usize, CodecError> {
        match self.format {
            FrameFormat::Raw if msg.tag() != Tag::Event => {
                return Err(CodecError::Encode(format!(
                    "raw streams only carry events, got {}",
                    msg.tag()
                )));
            }
            FrameFormat::Tagged if msg.frames().len() > u16::MAX as usize => {
                return Err(CodecError::Encode(format!(
                    "{} frames exceed u16",
                    msg.frames().len()
                )));
            }
            _ => {}
        }
        let len = self.body_len(msg);
        if len > self.max_len || len > u32::MAX as usize {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_len,
            });
        }
        Ok(len)
    }

    fn body_len(&self, msg: &Message) -> usize {
        match self.format {
            FrameFormat::Raw => msg.payload_len(),
            FrameFormat::Tagged => {
                TAGGED_HEADER_LEN
                    + msg
                        .frames()
                        .iter()
                        .map(|frame| FRAME_PREFIX_LEN + frame.len())
                        .sum::<usize>()
            }
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_len,
            });
        }
        if src.len() < LENGTH_PREFIX_LEN + len {
            src.reserve(LENGTH_PREFIX_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let mut body = src.split_to(len).freeze();

        match self.format {
            FrameFormat::Raw => Ok(Some(Message::event(vec![body]))),
            FrameFormat::Tagged => {
                if body.len() < TAGGED_HEADER_LEN {
                    return Err(CodecError::Truncated);
                }
                let tag = Tag::from_u8(body.get_u8())?;
                let count = body.get_u16() as usize;
                let mut frames = Vec::with_capacity(count);
                for _ in 0..count {
                    if body.remaining() < FRAME_PREFIX_LEN {
                        return Err(CodecError::Truncated);
                    }
                    let frame_len = body.get_u32() as usize;
                    if body.remaining() < frame_len {
                        return Err(CodecError::Truncated);
                    }
                    frames.push(body.split_to(frame_len));
                }
                Ok(Some(Message::new(tag, frames)))
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let len = self.validate(&msg)?;
        dst.reserve(LENGTH_PREFIX_LEN + len);
        dst.put_u32(len as u32);

        match self.format {
            FrameFormat::Raw => {
                for frame in msg.frames() {
                    dst.put_slice(frame);
                }
            }
            FrameFormat::Tagged => {
                dst.put_u8(msg.tag() as u8);
                dst.put_u16(msg.frames().len() as u16);
                for frame in msg.frames() {
                    dst.put_u32(frame.len() as u32);
                    dst.put_slice(frame);
                }
            }
        }

        Ok(())
    }
}
