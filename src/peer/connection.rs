//! Peer connection module
//!
//! Handshake plus framed message exchange with one remote peer.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::peer::state::{Bitfield, ConnectionState, Peer};
use crate::protocol::{Handshake, Message, MessageCodec, WireError, HANDSHAKE_LENGTH};

/// Upper bound on `Have` indexes tracked before the piece count is known
const DEFAULT_PIECE_LIMIT: usize = 1 << 20;

/// Errors that end a peer connection
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("info hash mismatch: expected {expected}, got {actual}")]
    InfoHashMismatch { expected: String, actual: String },

    #[error("connection closed by peer")]
    Closed,

    #[error("timed out: {0}")]
    Timeout(&'static str),
}

/// An established connection to one peer.
///
/// Only constructed by a successful handshake, and owned by a single worker.
pub struct PeerConnection<S> {
    framed: Framed<S, MessageCodec>,
    /// Remote peer state
    pub peer: Peer,
    piece_limit: usize,
}

impl PeerConnection<TcpStream> {
    /// Connect to `addr` and perform the handshake, each step bounded by its timeout
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        local_peer_id: [u8; 20],
        connect_timeout: Duration,
        handshake_timeout: Duration,
    ) -> Result<Self, PeerError> {
        debug!("Connecting to peer: {}", addr);

        let socket = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout("connect"))??;

        let connection = timeout(
            handshake_timeout,
            Self::handshake_at(socket, Some(addr), info_hash, local_peer_id),
        )
        .await
        .map_err(|_| PeerError::Timeout("handshake"))??;

        info!(
            "Handshake complete with {} ({})",
            addr,
            connection.peer.client().unwrap_or_default()
        );
        Ok(connection)
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Exchange handshakes over `stream` and verify the remote info hash
    pub async fn handshake(stream: S, info_hash: [u8; 20], local_peer_id: [u8; 20]) -> Result<Self, PeerError> {
        Self::handshake_at(stream, None, info_hash, local_peer_id).await
    }

    async fn handshake_at(
        mut stream: S,
        addr: Option<SocketAddr>,
        info_hash: [u8; 20],
        local_peer_id: [u8; 20],
    ) -> Result<Self, PeerError> {
        let mut peer = Peer::new(addr);
        peer.state = ConnectionState::Handshaking;

        let ours = Handshake::new(info_hash, local_peer_id).serialize();
        let mut theirs = [0u8; HANDSHAKE_LENGTH];

        // write and read at once so neither side can stall the other
        let exchanged = {
            let (mut reader, mut writer) = tokio::io::split(&mut stream);
            tokio::try_join!(
                async {
                    writer.write_all(&ours).await?;
                    writer.flush().await
                },
                reader.read_exact(&mut theirs),
            )
        };
        if let Err(e) = exchanged {
            peer.state = ConnectionState::Failed;
            return Err(e.into());
        }

        let remote = Handshake::deserialize(&theirs).map_err(|e| {
            warn!("Bad handshake from {}: {}", peer, e);
            e
        })?;

        if remote.info_hash != info_hash {
            warn!("Handshake from {} has the wrong info hash", peer);
            return Err(PeerError::InfoHashMismatch {
                expected: hex::encode(info_hash),
                actual: hex::encode(remote.info_hash),
            });
        }

        peer.peer_id = Some(remote.peer_id);
        peer.state = ConnectionState::Active;
        debug!("Handshake accepted from {}", peer);

        Ok(Self {
            framed: Framed::new(stream, MessageCodec),
            peer,
            piece_limit: DEFAULT_PIECE_LIMIT,
        })
    }

    /// Ignore `Have` announcements at or beyond `piece_count`
    pub fn with_piece_count(mut self, piece_count: usize) -> Self {
        self.piece_limit = piece_count;
        self
    }

    /// Read the next message, applying its effect on connection state.
    ///
    /// Keep-alives return `Ok(None)`. Cancel-safe: a partially received frame
    /// stays buffered for the next call.
    pub async fn read_message(&mut self) -> Result<Option<Message>, PeerError> {
        let message = match self.framed.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                self.peer.state = ConnectionState::Failed;
                return Err(e.into());
            }
            None => {
                self.peer.state = ConnectionState::Failed;
                return Err(PeerError::Closed);
            }
        };

        match &message {
            Message::KeepAlive => {
                trace!("< keepalive from {}", self.peer);
                return Ok(None);
            }
            Message::Choke => {
                debug!("< choke from {}", self.peer);
                self.peer.choked = true;
            }
            Message::Unchoke => {
                debug!("< unchoke from {}", self.peer);
                self.peer.choked = false;
            }
            Message::Interested => self.peer.peer_interested = true,
            Message::NotInterested => self.peer.peer_interested = false,
            Message::Have { piece_index } => {
                let index = *piece_index as usize;
                if index < self.piece_limit {
                    self.peer.bitfield.set_piece(index);
                } else {
                    debug!("Ignoring have {} from {}", index, self.peer);
                }
            }
            Message::Bitfield { bitfield } => {
                self.peer.bitfield = Bitfield::from_bytes(bitfield.clone());
                debug!("< bitfield from {} ({} pieces)", self.peer, self.peer.bitfield.count());
            }
            Message::Request { .. } | Message::Piece { .. } | Message::Cancel { .. } => {}
        }

        Ok(Some(message))
    }

    /// Send a message and flush it
    pub async fn send_message(&mut self, message: Message) -> Result<(), PeerError> {
        trace!("> {:?} to {}", message.message_id(), self.peer);
        if let Err(e) = self.framed.send(message).await {
            self.peer.state = ConnectionState::Failed;
            return Err(e.into());
        }
        Ok(())
    }

    /// Send interested message to the peer
    pub async fn send_interested(&mut self) -> Result<(), PeerError> {
        self.send_message(Message::Interested).await?;
        self.peer.am_interested = true;
        Ok(())
    }

    /// Send not interested message to the peer
    pub async fn send_not_interested(&mut self) -> Result<(), PeerError> {
        self.send_message(Message::NotInterested).await?;
        self.peer.am_interested = false;
        Ok(())
    }

    /// Request a block of piece `index`
    pub async fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        self.send_message(Message::Request { index, begin, length }).await
    }

    pub async fn send_keepalive(&mut self) -> Result<(), PeerError> {
        self.send_message(Message::KeepAlive).await
    }

    /// Flush and shut down the write side
    pub async fn close(&mut self) -> Result<(), PeerError> {
        debug!("Closing connection to {}", self.peer);
        self.framed.close().await?;
        Ok(())
    }

    /// Check if the peer is choking us
    pub fn is_choked(&self) -> bool {
        self.peer.choked
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.peer.bitfield.has_piece(index)
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.peer.bitfield
    }

    /// Check if the connection is usable
    pub fn is_active(&self) -> bool {
        self.peer.state.is_active()
    }
}
