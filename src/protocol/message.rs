//! BitTorrent protocol messages
//!
//! Defines the message set spoken after the handshake.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tracing::trace;

/// Errors raised while framing or parsing wire data
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("unknown message id {0}")]
    UnknownMessageId(u8),

    #[error("{id:?} payload is {actual} bytes, expected {expected}")]
    BadPayloadLength {
        id: MessageId,
        expected: usize,
        actual: usize,
    },

    #[error("frame of {length} bytes exceeds limit of {max}")]
    FrameTooLarge { length: usize, max: usize },
}

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            _ => Err(WireError::UnknownMessageId(value)),
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
        }
    }

    /// Append the length-prefixed wire form to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(4 + self.length() as usize);
        buf.put_u32(self.length());

        let Some(id) = self.message_id() else {
            return;
        };
        buf.put_u8(id as u8);

        match self {
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::KeepAlive | Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Parse the body of a non-empty frame: `id` followed by `payload`
    pub fn parse(id: u8, mut payload: &[u8]) -> Result<Self, WireError> {
        let id = MessageId::try_from(id)?;
        trace!("Parsing {:?} with {} payload bytes", id, payload.len());

        let expect = |expected: usize| {
            if payload.len() == expected {
                Ok(())
            } else {
                Err(WireError::BadPayloadLength {
                    id,
                    expected,
                    actual: payload.len(),
                })
            }
        };

        let message = match id {
            MessageId::Choke => {
                expect(0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect(0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect(0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect(0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect(4)?;
                Message::Have {
                    piece_index: payload.get_u32(),
                }
            }
            MessageId::Bitfield => Message::Bitfield {
                bitfield: payload.to_vec(),
            },
            MessageId::Request | MessageId::Cancel => {
                expect(12)?;
                let index = payload.get_u32();
                let begin = payload.get_u32();
                let length = payload.get_u32();
                if id == MessageId::Request {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(WireError::BadPayloadLength {
                        id,
                        expected: 8,
                        actual: payload.len(),
                    });
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece {
                    index,
                    begin,
                    block: payload.to_vec(),
                }
            }
        };

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_fixed_messages() {
        assert_eq!(Message::KeepAlive.serialize(), vec![0, 0, 0, 0]);
        assert_eq!(Message::Interested.serialize(), vec![0, 0, 0, 1, 2]);
        assert_eq!(
            Message::Have { piece_index: 0x01020304 }.serialize(),
            vec![0, 0, 0, 5, 4, 1, 2, 3, 4]
        );
        assert_eq!(
            Message::Request { index: 1, begin: 16384, length: 16384 }.serialize(),
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn test_parse_piece() {
        let frame = Message::Piece { index: 10, begin: 32, block: vec![1, 2, 3] }.serialize();
        let parsed = Message::parse(frame[4], &frame[5..]).unwrap();
        assert_eq!(parsed, Message::Piece { index: 10, begin: 32, block: vec![1, 2, 3] });
    }

    #[test]
    fn test_parse_rejects_bad_lengths() {
        assert!(matches!(
            Message::parse(4, &[0, 0, 1]),
            Err(WireError::BadPayloadLength { id: MessageId::Have, expected: 4, actual: 3 })
        ));
        assert!(Message::parse(6, &[0; 11]).is_err());
        assert!(Message::parse(8, &[0; 13]).is_err());
        assert!(Message::parse(7, &[0; 7]).is_err());
        assert!(Message::parse(0, &[1]).is_err());
    }

    #[test]
    fn test_parse_empty_bitfield_and_block() {
        assert_eq!(Message::parse(5, &[]).unwrap(), Message::Bitfield { bitfield: vec![] });
        assert_eq!(
            Message::parse(7, &[0; 8]).unwrap(),
            Message::Piece { index: 0, begin: 0, block: vec![] }
        );
    }

    #[test]
    fn test_message_id_from_u8() {
        assert_eq!(MessageId::try_from(0).unwrap(), MessageId::Choke);
        assert_eq!(MessageId::try_from(8).unwrap(), MessageId::Cancel);
        assert!(matches!(MessageId::try_from(9), Err(WireError::UnknownMessageId(9))));
        assert!(MessageId::try_from(20).is_err());
    }

    #[test]
    fn test_message_length() {
        assert_eq!(Message::KeepAlive.length(), 0);
        assert_eq!(Message::Choke.length(), 1);
        assert_eq!(Message::Have { piece_index: 0 }.length(), 5);
        assert_eq!(Message::Cancel { index: 0, begin: 0, length: 0 }.length(), 13);
        assert_eq!(Message::Piece { index: 0, begin: 0, block: vec![1, 2, 3] }.length(), 12);
    }
}
