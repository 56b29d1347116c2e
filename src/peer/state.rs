//! Peer state module
//!
//! Connection-local state of one remote peer: lifecycle, choke/interest
//! flags and the pieces the peer advertises.

use std::fmt;
use std::net::SocketAddr;

/// Lifecycle of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// TCP connect in progress
    #[default]
    Connecting,
    /// Handshake frames being exchanged
    Handshaking,
    /// Handshake accepted; messages flow
    Active,
    /// Handshake rejected or the stream broke; terminal
    Failed,
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }
}

/// Pieces advertised by a remote peer, most significant bit first.
///
/// Sized from whatever the peer sends, so it is never trusted to match the
/// torrent's piece count: reads past the end are simply "not present" and
/// `set_piece` grows the buffer as needed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
}

impl Bitfield {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a raw bitfield payload as sent on the wire
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Check if the peer has piece `index`
    pub fn has_piece(&self, index: usize) -> bool {
        self.bytes
            .get(index / 8)
            .map_or(false, |byte| byte & (0x80 >> (index % 8)) != 0)
    }

    /// Mark piece `index` present, zero-extending the buffer if needed
    pub fn set_piece(&mut self, index: usize) {
        let byte = index / 8;
        if byte >= self.bytes.len() {
            self.bytes.resize(byte + 1, 0);
        }
        self.bytes[byte] |= 0x80 >> (index % 8);
    }

    /// Number of pieces marked present
    pub fn count(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }
}

/// State of the remote side of one connection
#[derive(Debug, Clone)]
pub struct Peer {
    /// Remote address, when the stream is a socket
    pub addr: Option<SocketAddr>,
    /// Remote peer id from its handshake
    pub peer_id: Option<[u8; 20]>,
    /// Current lifecycle state
    pub state: ConnectionState,
    /// We told the peer we are interested
    pub am_interested: bool,
    /// The peer is choking us
    pub choked: bool,
    /// The peer told us it is interested
    pub peer_interested: bool,
    /// Pieces the peer has
    pub bitfield: Bitfield,
}

impl Peer {
    /// Create a new peer; every connection starts choked
    pub fn new(addr: Option<SocketAddr>) -> Self {
        Self {
            addr,
            peer_id: None,
            state: ConnectionState::Connecting,
            am_interested: false,
            choked: true,
            peer_interested: false,
            bitfield: Bitfield::new(),
        }
    }

    /// Check if we can request blocks from the peer
    pub fn can_request(&self) -> bool {
        self.state.is_active() && !self.choked && self.am_interested
    }

    /// Client prefix from the peer id, for logs
    pub fn client(&self) -> Option<String> {
        self.peer_id
            .map(|id| String::from_utf8_lossy(&id[..8]).into_owned())
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "{}", addr),
            None => write!(f, "<stream>"),
        }
    }
}
