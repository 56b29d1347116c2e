//! BitTorrent handshake protocol
//!
//! The fixed 68-byte frame exchanged before any length-prefixed message.

use bytes::{BufMut, BytesMut};
use tracing::{debug, info, trace, warn};

use super::message::WireError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total size of a handshake frame on the wire
pub const HANDSHAKE_LENGTH: usize = 68;

/// Client prefix carried in the first eight bytes of our peer id
pub const PEER_ID_PREFIX: &[u8; 8] = b"-TL0100-";

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Extension bits; we advertise none and ignore the peer's
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake with info_hash and peer_id
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        debug!("Creating new handshake for info_hash: {}", hex::encode(info_hash));
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Generate a random peer ID with the client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        info!("Generated new peer ID: {}", hex::encode(peer_id));
        peer_id
    }

    /// Serialize the handshake to its 68-byte wire form
    pub fn serialize(&self) -> [u8; HANDSHAKE_LENGTH] {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LENGTH);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);

        let mut frame = [0u8; HANDSHAKE_LENGTH];
        frame.copy_from_slice(&buf);
        frame
    }

    /// Deserialize a handshake, checking the protocol header
    pub fn deserialize(data: &[u8]) -> Result<Self, WireError> {
        trace!("Deserializing handshake from {} bytes", data.len());

        if data.len() != HANDSHAKE_LENGTH {
            return Err(WireError::InvalidHandshake(format!(
                "expected {} bytes, got {}",
                HANDSHAKE_LENGTH,
                data.len()
            )));
        }

        if data[0] != PROTOCOL_LENGTH {
            warn!("Invalid protocol length: expected {}, got {}", PROTOCOL_LENGTH, data[0]);
            return Err(WireError::InvalidHandshake(format!(
                "protocol length {} instead of {}",
                data[0], PROTOCOL_LENGTH
            )));
        }

        if &data[1..20] != PROTOCOL_STRING.as_bytes() {
            warn!("Invalid protocol string");
            return Err(WireError::InvalidHandshake("unknown protocol string".to_string()));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        debug!(
            "Handshake info_hash: {}, peer_id: {}",
            hex::encode(info_hash),
            String::from_utf8_lossy(&peer_id[..8])
        );

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let frame = Handshake::new([1u8; 20], [2u8; 20]).serialize();

        assert_eq!(frame.len(), 68);
        assert_eq!(frame[0], 19);
        assert_eq!(&frame[1..20], b"BitTorrent protocol");
        assert_eq!(&frame[20..28], &[0u8; 8]);
        assert_eq!(&frame[28..48], &[1u8; 20]);
        assert_eq!(&frame[48..68], &[2u8; 20]);
    }

    #[test]
    fn test_handshake_serialize_deserialize() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let parsed = Handshake::deserialize(&handshake.serialize()).unwrap();
        assert_eq!(parsed, handshake);
    }

    #[test]
    fn test_reserved_bits_are_ignored() {
        let mut frame = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        frame[25] = 0x10;
        let parsed = Handshake::deserialize(&frame).unwrap();
        assert_eq!(parsed.info_hash, [1u8; 20]);
    }

    #[test]
    fn test_rejects_bad_header() {
        let mut frame = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        frame[0] = 18;
        assert!(matches!(
            Handshake::deserialize(&frame),
            Err(WireError::InvalidHandshake(_))
        ));

        let mut frame = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        frame[1] = b'b';
        assert!(Handshake::deserialize(&frame).is_err());

        assert!(Handshake::deserialize(&frame[..67]).is_err());
    }

    #[test]
    fn test_generate_peer_id() {
        let a = Handshake::generate_peer_id();
        let b = Handshake::generate_peer_id();
        assert_eq!(&a[..8], b"-TL0100-");
        assert_ne!(a, b);
    }
}
