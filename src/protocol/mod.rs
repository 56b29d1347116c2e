//! BitTorrent protocol module
//!
//! Implements the BitTorrent peer wire protocol.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{Handshake, HANDSHAKE_LENGTH, PEER_ID_PREFIX, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId, WireError};
pub use wire::{MessageCodec, MAX_MESSAGE_LENGTH};
