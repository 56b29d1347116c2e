//! Per-peer download session
//!
//! Drives one established connection: asks for pieces once unchoked, feeds
//! arriving blocks to the piece store and writes verified pieces to disk.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{interval_at, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::download::config::DownloadConfig;
use crate::peer::{PeerConnection, PeerError};
use crate::protocol::Message;
use crate::storage::{BlockOutcome, DiskError, DiskWriter, PieceError, PieceState, PieceStore};

/// Size of one block request
pub const BLOCK_SIZE: usize = 16 * 1024;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a peer session ended
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Peer(#[from] PeerError),

    /// The peer sent a block that does not fit the piece
    #[error("bad block from peer: {0}")]
    Block(#[from] PieceError),

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error("peer kept us choked for {0:?}")]
    UnchokeTimeout(Duration),

    #[error("peer silent for {0:?}")]
    Idle(Duration),

    /// Requests went unanswered, or the peer stopped reading our writes
    #[error("peer made no progress for {0:?}")]
    Stalled(Duration),

    #[error("session cancelled")]
    Cancelled,
}

impl SessionError {
    /// Disk failures stop the whole download; everything else only drops the peer
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Disk(_))
    }
}

/// One worker's exclusive use of a peer connection
pub struct PeerSession<'a, S> {
    conn: PeerConnection<S>,
    store: &'a PieceStore,
    disk: &'a DiskWriter,
    config: &'a DownloadConfig,
    downloaded: &'a AtomicU64,
    /// Piece whose blocks are requested from this peer
    current: Option<usize>,
    /// Requested blocks of `current` not yet answered
    pending: usize,
    /// Last request sent or block received for `current`
    last_block: Instant,
    choked_since: Instant,
}

impl<'a, S> PeerSession<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        conn: PeerConnection<S>,
        store: &'a PieceStore,
        disk: &'a DiskWriter,
        config: &'a DownloadConfig,
        downloaded: &'a AtomicU64,
    ) -> Self {
        Self {
            conn: conn.with_piece_count(store.piece_count()),
            store,
            disk,
            config,
            downloaded,
            current: None,
            pending: 0,
            last_block: Instant::now(),
            choked_since: Instant::now(),
        }
    }

    /// Run until the torrent completes, `cancel` fires or the peer fails.
    ///
    /// An unfinished piece goes back to the store and the connection is
    /// closed however the session ends.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<(), SessionError> {
        let result = match self.drive(cancel).await {
            Err(SessionError::Cancelled) => Ok(()),
            result => result,
        };

        self.drop_current();
        if cancel.is_cancelled() {
            // a peer that stopped reading would hold up the flush
            trace!("Dropping {} without flushing", self.conn.peer);
            return result;
        }
        match timeout(CLOSE_TIMEOUT, self.conn.close()).await {
            Ok(Err(e)) => trace!("Close of {} failed: {}", self.conn.peer, e),
            Err(_) => trace!("Close of {} timed out", self.conn.peer),
            Ok(Ok(())) => {}
        }
        result
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<(), SessionError> {
        let write_limit = self.config.idle_timeout;
        send_within(cancel, write_limit, self.conn.send_interested()).await?;

        let keepalive_every = self.config.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + keepalive_every, keepalive_every);
        let mut last_heard = Instant::now();

        loop {
            if self.store.is_complete() {
                debug!("Torrent complete, leaving {}", self.conn.peer);
                return Ok(());
            }
            self.check_current()?;
            if self.current.is_none() && self.conn.peer.can_request() {
                self.request_next_piece(cancel).await?;
            }

            let choked = self.conn.is_choked();
            let waiting = self.current.is_some();
            let unchoke_deadline = self.choked_since + self.config.unchoke_timeout;
            let idle_deadline = last_heard + self.config.idle_timeout;
            let block_deadline = self.last_block + self.config.idle_timeout;

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = keepalive.tick() => {
                    send_within(cancel, write_limit, self.conn.send_keepalive()).await?;
                    // pieces released by other workers may make this peer useful again
                    self.express_interest(cancel).await?;
                }
                _ = sleep_until(unchoke_deadline), if choked => {
                    return Err(SessionError::UnchokeTimeout(self.config.unchoke_timeout));
                }
                _ = sleep_until(idle_deadline) => {
                    return Err(SessionError::Idle(self.config.idle_timeout));
                }
                _ = sleep_until(block_deadline), if waiting && !choked => {
                    return Err(SessionError::Stalled(self.config.idle_timeout));
                }
                message = self.conn.read_message() => {
                    last_heard = Instant::now();
                    if let Some(message) = message? {
                        self.handle_message(message, cancel).await?;
                    }
                }
            }
        }
    }

    /// Let go of `current` once its requests can no longer finish it.
    ///
    /// Another worker may verify the shared piece, or reset it after a hash
    /// mismatch and so discard blocks this session already delivered.
    fn check_current(&mut self) -> Result<(), SessionError> {
        let Some(index) = self.current else {
            return Ok(());
        };
        match self.store.state(index) {
            Some(PieceState::Needed) if self.pending > 0 => self.store.mark_requested(index)?,
            Some(PieceState::Requested | PieceState::Downloaded) if self.pending > 0 => {}
            Some(PieceState::Verified) | None => self.drop_current(),
            Some(_) => {
                debug!("Piece {} still incomplete after all its blocks arrived", index);
                self.drop_current();
            }
        }
        Ok(())
    }

    fn drop_current(&mut self) {
        if let Some(index) = self.current.take() {
            self.store.release_piece(index);
        }
        self.pending = 0;
    }

    async fn express_interest(&mut self, cancel: &CancellationToken) -> Result<(), SessionError> {
        if !self.conn.peer.am_interested && self.store.pick_piece(self.conn.bitfield()).is_some() {
            send_within(cancel, self.config.idle_timeout, self.conn.send_interested()).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: Message, cancel: &CancellationToken) -> Result<(), SessionError> {
        match message {
            Message::Choke => {
                self.choked_since = Instant::now();
                // a choking peer drops our outstanding requests
                self.drop_current();
            }
            Message::Have { .. } | Message::Bitfield { .. } => self.express_interest(cancel).await?,
            Message::Piece { index, begin, block } => {
                self.receive_block(index as usize, begin, &block).await?;
            }
            Message::Request { index, .. } => {
                trace!("Ignoring request for piece {} from {}", index, self.conn.peer);
            }
            Message::KeepAlive
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::Cancel { .. } => {}
        }
        Ok(())
    }

    /// Claim a piece the peer has and request all of its blocks
    async fn request_next_piece(&mut self, cancel: &CancellationToken) -> Result<(), SessionError> {
        let write_limit = self.config.idle_timeout;
        let claimed = self
            .store
            .claim_piece(self.conn.bitfield())
            .and_then(|index| Some((index, self.store.piece_len(index)?)));

        let Some((index, length)) = claimed else {
            if self.conn.peer.am_interested {
                debug!("{} has nothing we need", self.conn.peer);
                send_within(cancel, write_limit, self.conn.send_not_interested()).await?;
            }
            return Ok(());
        };

        // owned before the first write so an early exit releases it
        self.current = Some(index);
        self.pending = 0;
        self.last_block = Instant::now();

        trace!("Requesting piece {} ({} bytes) from {}", index, length, self.conn.peer);
        for begin in (0..length).step_by(BLOCK_SIZE) {
            let size = BLOCK_SIZE.min(length - begin);
            send_within(
                cancel,
                write_limit,
                self.conn.send_request(index as u32, begin as u32, size as u32),
            )
            .await?;
            self.pending += 1;
        }
        Ok(())
    }

    async fn receive_block(&mut self, index: usize, begin: u32, block: &[u8]) -> Result<(), SessionError> {
        let outcome = self.store.receive_block(index, begin, block)?;
        if self.current == Some(index) {
            self.pending = self.pending.saturating_sub(1);
            self.last_block = Instant::now();
        }
        let finished = match outcome {
            BlockOutcome::Pending => false,
            BlockOutcome::Verified(data) => {
                self.disk.write_piece(index, &data).await?;
                self.downloaded.fetch_add(data.len() as u64, Ordering::Relaxed);
                info!(
                    "Piece {} done ({}/{})",
                    index,
                    self.store.verified_count(),
                    self.store.piece_count()
                );
                true
            }
            BlockOutcome::HashMismatch => {
                debug!("Piece {} from {} failed verification", index, self.conn.peer);
                true
            }
            BlockOutcome::AlreadyVerified => true,
        };

        if finished && self.current == Some(index) {
            self.current = None;
            self.pending = 0;
        }
        Ok(())
    }
}

/// Run one socket write, giving up when `cancel` fires or the peer stops
/// reading for `limit`
async fn send_within<F>(cancel: &CancellationToken, limit: Duration, write: F) -> Result<(), SessionError>
where
    F: Future<Output = Result<(), PeerError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        written = timeout(limit, write) => match written {
            Ok(result) => Ok(result?),
            Err(_) => Err(SessionError::Stalled(limit)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::test_support::{serve, Seeder, TestTorrent};
    use tempfile::TempDir;
    use tokio::io::{duplex, DuplexStream};

    const PEER_ID: [u8; 20] = *b"-TL0100-testtesttest";
    const REMOTE_ID: [u8; 20] = *b"-RM0001-remoteremote";

    /// Remote end of a single-piece torrent that has the piece
    async fn open_remote(stream: DuplexStream, info_hash: [u8; 20], unchoke: bool) -> PeerConnection<DuplexStream> {
        let mut conn = PeerConnection::handshake(stream, info_hash, REMOTE_ID).await.unwrap();
        conn.send_message(Message::Bitfield { bitfield: vec![0x80] }).await.unwrap();
        if unchoke {
            conn.send_message(Message::Unchoke).await.unwrap();
        }
        conn
    }

    fn fast_config() -> DownloadConfig {
        DownloadConfig {
            unchoke_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_secs(5),
            ..DownloadConfig::default()
        }
    }

    async fn run_session(torrent: &TestTorrent, seeder: Seeder, config: &DownloadConfig) -> (Result<(), SessionError>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = torrent.store();
        let disk = torrent.disk(dir.path()).await;
        let downloaded = AtomicU64::new(0);

        let (local, remote) = duplex(1 << 16);
        let seeder_task = tokio::spawn(serve(remote, seeder));

        let conn = PeerConnection::handshake(local, torrent.info_hash, PEER_ID).await.unwrap();
        let cancel = CancellationToken::new();
        let result = PeerSession::new(conn, &store, &disk, config, &downloaded)
            .run(&cancel)
            .await;

        if result.is_ok() {
            assert!(store.is_complete());
            assert_eq!(downloaded.load(Ordering::Relaxed), torrent.data.len() as u64);
        }
        disk.close().await.unwrap();
        let _ = seeder_task.await;
        (result, dir)
    }

    #[tokio::test]
    async fn test_downloads_every_piece() {
        // 40 KiB pieces need three block requests each; last piece is short
        let torrent = TestTorrent::new(40 * 1024, 100 * 1024);
        let (result, dir) = run_session(&torrent, Seeder::new(&torrent), &fast_config()).await;

        result.unwrap();
        assert_eq!(std::fs::read(dir.path().join("payload.bin")).unwrap(), torrent.data);
    }

    #[tokio::test]
    async fn test_recovers_from_corrupt_piece() {
        let torrent = TestTorrent::new(16 * 1024, 48 * 1024);
        let mut seeder = Seeder::new(&torrent);
        seeder.corrupt_first = Some(1);

        let (result, dir) = run_session(&torrent, seeder, &fast_config()).await;

        result.unwrap();
        assert_eq!(std::fs::read(dir.path().join("payload.bin")).unwrap(), torrent.data);
    }

    #[tokio::test]
    async fn test_drops_peer_that_never_unchokes() {
        let torrent = TestTorrent::new(16 * 1024, 32 * 1024);
        let mut seeder = Seeder::new(&torrent);
        seeder.unchoke = false;

        let (result, _dir) = run_session(&torrent, seeder, &fast_config()).await;
        assert!(matches!(result, Err(SessionError::UnchokeTimeout(_))));
    }

    #[tokio::test]
    async fn test_peer_hangup_releases_piece() {
        let torrent = TestTorrent::new(16 * 1024, 32 * 1024);
        let mut seeder = Seeder::new(&torrent);
        seeder.hang_up_after = Some(0);

        let dir = TempDir::new().unwrap();
        let store = torrent.store();
        let disk = torrent.disk(dir.path()).await;
        let downloaded = AtomicU64::new(0);

        let (local, remote) = duplex(1 << 16);
        let seeder_task = tokio::spawn(serve(remote, seeder));
        let conn = PeerConnection::handshake(local, torrent.info_hash, PEER_ID).await.unwrap();

        let config = fast_config();
        let result = PeerSession::new(conn, &store, &disk, &config, &downloaded)
            .run(&CancellationToken::new())
            .await;

        assert!(matches!(result, Err(SessionError::Peer(_))));
        assert!(!result.as_ref().unwrap_err().is_fatal());
        assert_eq!(store.state(0), Some(PieceState::Needed));
        assert_eq!(store.verified_count(), 0);
        let _ = seeder_task.await;
    }

    #[tokio::test]
    async fn test_cancel_ends_session() {
        let torrent = TestTorrent::new(16 * 1024, 32 * 1024);
        let mut seeder = Seeder::new(&torrent);
        seeder.unchoke = false;

        let dir = TempDir::new().unwrap();
        let store = torrent.store();
        let disk = torrent.disk(dir.path()).await;
        let downloaded = AtomicU64::new(0);

        let (local, remote) = duplex(1 << 16);
        let seeder_task = tokio::spawn(serve(remote, seeder));
        let conn = PeerConnection::handshake(local, torrent.info_hash, PEER_ID).await.unwrap();

        let config = DownloadConfig::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = timeout(
            Duration::from_secs(5),
            PeerSession::new(conn, &store, &disk, &config, &downloaded).run(&cancel),
        )
        .await
        .expect("session ignored cancellation");
        assert!(result.is_ok());
        assert_eq!(store.verified_count(), 0);
        let _ = seeder_task.await;
    }

    #[tokio::test]
    async fn test_cancel_interrupts_blocked_write() {
        // 64 requests overflow the small pipe the remote never drains
        let torrent = TestTorrent::new(1 << 20, 1 << 20);
        let dir = TempDir::new().unwrap();
        let store = torrent.store();
        let disk = torrent.disk(dir.path()).await;
        let downloaded = AtomicU64::new(0);

        let (local, remote) = duplex(256);
        let info_hash = torrent.info_hash;
        let remote_task = tokio::spawn(async move {
            let _conn = open_remote(remote, info_hash, true).await;
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let conn = PeerConnection::handshake(local, torrent.info_hash, PEER_ID).await.unwrap();

        let config = DownloadConfig::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let result = timeout(
            Duration::from_secs(3),
            PeerSession::new(conn, &store, &disk, &config, &downloaded).run(&cancel),
        )
        .await
        .expect("blocked write ignored cancellation");
        assert!(result.is_ok());
        assert_eq!(store.state(0), Some(PieceState::Needed));
        remote_task.abort();
    }

    #[tokio::test]
    async fn test_rerequests_piece_reset_by_another_worker() {
        let torrent = TestTorrent::new(2 * BLOCK_SIZE, 2 * BLOCK_SIZE);
        let dir = TempDir::new().unwrap();
        let store = torrent.store();
        let disk = torrent.disk(dir.path()).await;
        let downloaded = AtomicU64::new(0);
        let config = fast_config();
        let cancel = CancellationToken::new();

        let (local, remote) = duplex(1 << 16);
        let session = async {
            let conn = PeerConnection::handshake(local, torrent.info_hash, PEER_ID).await.unwrap();
            PeerSession::new(conn, &store, &disk, &config, &downloaded).run(&cancel).await
        };
        let remote_side = async {
            let mut conn = open_remote(remote, torrent.info_hash, true).await;
            let mut reset = false;
            loop {
                let (index, begin, length) = match conn.read_message().await {
                    Ok(Some(Message::Request { index, begin, length })) => (index, begin, length),
                    Ok(_) => continue,
                    Err(_) => return reset,
                };
                if begin > 0 && !reset {
                    // a second worker sharing the piece delivers a bad tail,
                    // failing the hash and discarding what this session sent
                    store.receive_block(0, begin, &vec![0xAA; BLOCK_SIZE]).unwrap();
                    reset = true;
                }
                let start = begin as usize;
                let block = torrent.data[start..start + length as usize].to_vec();
                if conn.send_message(Message::Piece { index, begin, block }).await.is_err() {
                    return reset;
                }
            }
        };

        let (result, reset) = timeout(Duration::from_secs(10), async { tokio::join!(session, remote_side) })
            .await
            .expect("session stalled on a reset piece");
        result.unwrap();
        assert!(reset);
        assert!(store.is_complete());

        disk.close().await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("payload.bin")).unwrap(), torrent.data);
    }

    #[tokio::test]
    async fn test_drops_peer_that_ignores_requests() {
        let torrent = TestTorrent::new(2 * BLOCK_SIZE, 2 * BLOCK_SIZE);
        let dir = TempDir::new().unwrap();
        let store = torrent.store();
        let disk = torrent.disk(dir.path()).await;
        let downloaded = AtomicU64::new(0);
        let config = DownloadConfig {
            idle_timeout: Duration::from_millis(300),
            ..DownloadConfig::default()
        };
        let cancel = CancellationToken::new();

        let (local, remote) = duplex(1 << 16);
        let session = async {
            let conn = PeerConnection::handshake(local, torrent.info_hash, PEER_ID).await.unwrap();
            PeerSession::new(conn, &store, &disk, &config, &downloaded).run(&cancel).await
        };
        // keep-alives only; requests are never answered
        let remote_side = async {
            let mut conn = open_remote(remote, torrent.info_hash, true).await;
            for _ in 0..30 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if conn.send_message(Message::KeepAlive).await.is_err() {
                    break;
                }
            }
        };

        let (result, ()) = timeout(Duration::from_secs(10), async { tokio::join!(session, remote_side) })
            .await
            .unwrap();
        assert!(matches!(result, Err(SessionError::Stalled(_))));
        assert_eq!(store.state(0), Some(PieceState::Needed));
    }

    #[tokio::test]
    async fn test_sends_keepalive_while_quiet() {
        let torrent = TestTorrent::new(BLOCK_SIZE, BLOCK_SIZE);
        let dir = TempDir::new().unwrap();
        let store = torrent.store();
        let disk = torrent.disk(dir.path()).await;
        let downloaded = AtomicU64::new(0);
        let config = DownloadConfig {
            keepalive_interval: Duration::from_millis(50),
            ..DownloadConfig::default()
        };
        let cancel = CancellationToken::new();

        let (local, remote) = duplex(1 << 16);
        let session = async {
            let conn = PeerConnection::handshake(local, torrent.info_hash, PEER_ID).await.unwrap();
            PeerSession::new(conn, &store, &disk, &config, &downloaded).run(&cancel).await
        };
        // stays choking and silent; the zero-length frame must still arrive
        let remote_side = async {
            let mut conn = open_remote(remote, torrent.info_hash, false).await;
            loop {
                match conn.read_message().await {
                    Ok(None) => break,
                    Ok(Some(_)) => continue,
                    Err(e) => panic!("connection failed before a keep-alive: {}", e),
                }
            }
            cancel.cancel();
            conn
        };

        let (result, _conn) = timeout(Duration::from_secs(5), async { tokio::join!(session, remote_side) })
            .await
            .expect("no keep-alive was sent");
        assert!(result.is_ok());
    }

    #[test]
    fn test_only_disk_errors_are_fatal() {
        assert!(SessionError::Disk(DiskError::Closed).is_fatal());
        assert!(!SessionError::Peer(PeerError::Closed).is_fatal());
        assert!(!SessionError::Idle(Duration::from_secs(1)).is_fatal());
        assert!(!SessionError::Stalled(Duration::from_secs(1)).is_fatal());
    }
}
