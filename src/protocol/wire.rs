//! Wire protocol framing
//!
//! `<u32 length><u8 id><payload>` frames as a tokio-util codec.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::message::{Message, WireError};

/// Largest frame accepted from a peer; a 16 KiB block plus headers fits easily
pub const MAX_MESSAGE_LENGTH: usize = 2 * 1024 * 1024;

/// Codec for length-prefixed peer messages
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, WireError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length > MAX_MESSAGE_LENGTH {
            return Err(WireError::FrameTooLarge {
                length,
                max: MAX_MESSAGE_LENGTH,
            });
        }

        // wait for the rest of the frame without consuming the prefix
        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        if length == 0 {
            trace!("Decoded keep-alive");
            return Ok(Some(Message::KeepAlive));
        }

        let frame = buf.split_to(length);
        let message = Message::parse(frame[0], &frame[1..])?;
        trace!("Decoded {:?} ({} bytes)", message.message_id(), length);
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = WireError;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), WireError> {
        message.encode(buf);
        Ok(())
    }
}
