//! Download orchestration
//!
//! One announce task feeds peer addresses into a bounded queue; a pool of
//! workers each take an address, run a peer session and come back for the
//! next; the run loop watches for completion, fatal errors and cancellation.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::download::config::DownloadConfig;
use crate::download::worker::PeerSession;
use crate::error::TorrentError;
use crate::peer::PeerConnection;
use crate::protocol::Handshake;
use crate::storage::{DiskWriter, PieceStore};
use crate::tracker::{AnnounceRequest, Announcer, TrackerEvent};

/// Outcome of a download run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSummary {
    pub completed: bool,
    pub verified_pieces: usize,
    pub total_pieces: usize,
    /// Bytes fetched from peers in this run
    pub downloaded_bytes: u64,
    /// Bytes still missing
    pub bytes_left: u64,
    pub elapsed_secs: f64,
}

/// Point-in-time view of a running download
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub verified_pieces: usize,
    pub total_pieces: usize,
    pub downloaded_bytes: u64,
    pub bytes_left: u64,
    pub total_bytes: u64,
    pub active_peers: usize,
}

impl Progress {
    /// Fraction verified, 0.0 to 1.0
    pub fn fraction(&self) -> f64 {
        if self.total_pieces == 0 {
            0.0
        } else {
            self.verified_pieces as f64 / self.total_pieces as f64
        }
    }
}

/// State shared by every task of a run
struct Swarm {
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    store: Arc<PieceStore>,
    disk: Arc<DiskWriter>,
    announcer: Arc<dyn Announcer>,
    config: DownloadConfig,
    downloaded: AtomicU64,
    active_peers: AtomicUsize,
    /// Addresses queued or connected; never queued twice
    known: Mutex<HashSet<SocketAddr>>,
}

impl Swarm {
    fn announce_request(&self, event: TrackerEvent) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.config.port,
            uploaded: 0,
            downloaded: self.downloaded.load(Ordering::Relaxed),
            left: self.store.bytes_left(),
            event,
        }
    }

    fn known(&self) -> std::sync::MutexGuard<'_, HashSet<SocketAddr>> {
        self.known.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Downloads one torrent from the swarm
pub struct Downloader {
    swarm: Arc<Swarm>,
}

impl Downloader {
    pub fn new(
        info_hash: [u8; 20],
        store: Arc<PieceStore>,
        disk: Arc<DiskWriter>,
        announcer: Arc<dyn Announcer>,
        config: DownloadConfig,
    ) -> Self {
        Self {
            swarm: Arc::new(Swarm {
                info_hash,
                peer_id: Handshake::generate_peer_id(),
                store,
                disk,
                announcer,
                config,
                downloaded: AtomicU64::new(0),
                active_peers: AtomicUsize::new(0),
                known: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.swarm.peer_id
    }

    pub fn progress(&self) -> Progress {
        let swarm = &self.swarm;
        Progress {
            verified_pieces: swarm.store.verified_count(),
            total_pieces: swarm.store.piece_count(),
            downloaded_bytes: swarm.downloaded.load(Ordering::Relaxed),
            bytes_left: swarm.store.bytes_left(),
            total_bytes: swarm.store.total_length(),
            active_peers: swarm.active_peers.load(Ordering::Relaxed),
        }
    }

    /// Download until every piece is verified or `cancel` fires.
    ///
    /// Cancellation is a normal end and yields a partial summary. A disk
    /// failure stops every task and is returned as the error. The disk
    /// writer is closed in every case.
    pub async fn run(&self, cancel: CancellationToken) -> Result<DownloadSummary, TorrentError> {
        let started = Instant::now();
        let swarm = &self.swarm;
        let shutdown = cancel.child_token();

        info!(
            "Starting download: {} pieces, {} workers",
            swarm.store.piece_count(),
            swarm.config.max_peers
        );

        let (tx, rx) = mpsc::channel(swarm.config.peer_queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut tasks = JoinSet::new();
        tasks.spawn(announce_loop(swarm.clone(), tx, shutdown.clone()));
        for id in 0..swarm.config.max_peers.max(1) {
            tasks.spawn(worker_loop(id, swarm.clone(), rx.clone(), shutdown.clone()));
        }

        let mut fatal = None;
        let mut ticker = interval(swarm.config.poll_interval);
        while !shutdown.is_cancelled() {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = ticker.tick() => {
                    if swarm.store.is_complete() {
                        info!("All {} pieces verified", swarm.store.piece_count());
                        shutdown.cancel();
                    }
                }
                Some(joined) = tasks.join_next() => {
                    if let Some(e) = task_failure(joined) {
                        error!("Stopping download: {}", e);
                        fatal = Some(e);
                        shutdown.cancel();
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Some(e) = task_failure(joined) {
                fatal.get_or_insert(e);
            }
        }

        if let Err(e) = swarm.disk.close().await {
            fatal.get_or_insert(e.into());
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        let summary = DownloadSummary {
            completed: swarm.store.is_complete(),
            verified_pieces: swarm.store.verified_count(),
            total_pieces: swarm.store.piece_count(),
            downloaded_bytes: swarm.downloaded.load(Ordering::Relaxed),
            bytes_left: swarm.store.bytes_left(),
            elapsed_secs: started.elapsed().as_secs_f64(),
        };
        info!(
            "Download {}: {}/{} pieces in {:.1}s",
            if summary.completed { "complete" } else { "stopped" },
            summary.verified_pieces,
            summary.total_pieces,
            summary.elapsed_secs
        );
        Ok(summary)
    }
}

fn task_failure(joined: Result<Result<(), TorrentError>, tokio::task::JoinError>) -> Option<TorrentError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => {
            warn!("Download task died: {}", e);
            None
        }
    }
}

/// Announce periodically, queueing every new peer address
async fn announce_loop(
    swarm: Arc<Swarm>,
    peers: mpsc::Sender<SocketAddr>,
    shutdown: CancellationToken,
) -> Result<(), TorrentError> {
    let mut event = TrackerEvent::Started;

    while !shutdown.is_cancelled() {
        let request = swarm.announce_request(event);
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = swarm.announcer.announce(&request) => result,
        };

        let wait = match result {
            Ok(response) => {
                event = TrackerEvent::None;
                info!("Tracker returned {} peers", response.peers.len());
                for addr in response.peers {
                    if !swarm.known().insert(addr) {
                        continue;
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        sent = peers.send(addr) => {
                            if sent.is_err() {
                                swarm.known().remove(&addr);
                            }
                        }
                    }
                }
                Duration::from_secs(response.interval.into()).max(swarm.config.min_announce_interval)
            }
            Err(e) => {
                warn!("Announce failed: {}", e);
                swarm.config.announce_retry
            }
        };

        debug!("Next announce in {:?}", wait);
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = sleep(wait) => {}
        }
    }

    // best effort; the run is over either way
    let event = if swarm.store.is_complete() {
        TrackerEvent::Completed
    } else {
        TrackerEvent::Stopped
    };
    let request = swarm.announce_request(event);
    match timeout(swarm.config.final_announce_timeout, swarm.announcer.announce(&request)).await {
        Ok(Ok(_)) => debug!("Sent {} announce", event.as_str()),
        Ok(Err(e)) => debug!("Final announce failed: {}", e),
        Err(_) => debug!("Final announce timed out"),
    }
    Ok(())
}

/// Take addresses off the queue and download from each until shutdown
async fn worker_loop(
    id: usize,
    swarm: Arc<Swarm>,
    peers: Arc<tokio::sync::Mutex<mpsc::Receiver<SocketAddr>>>,
    shutdown: CancellationToken,
) -> Result<(), TorrentError> {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => None,
            addr = async { peers.lock().await.recv().await } => addr,
        };
        let Some(addr) = next else {
            return Ok(());
        };

        debug!("Worker {} taking peer {}", id, addr);
        swarm.active_peers.fetch_add(1, Ordering::Relaxed);
        let result = download_from(&swarm, addr, &shutdown).await;
        swarm.active_peers.fetch_sub(1, Ordering::Relaxed);
        swarm.known().remove(&addr);

        if let Err(e) = result {
            if e.is_fatal() {
                return Err(e.into());
            }
            debug!("Dropped peer {}: {}", addr, e);
        }
    }
}

async fn download_from(
    swarm: &Swarm,
    addr: SocketAddr,
    shutdown: &CancellationToken,
) -> Result<(), super::worker::SessionError> {
    let config = &swarm.config;
    let connect = PeerConnection::connect(
        addr,
        swarm.info_hash,
        swarm.peer_id,
        config.connect_timeout,
        config.handshake_timeout,
    );
    let conn = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        conn = connect => conn?,
    };

    PeerSession::new(conn, &swarm.store, &swarm.disk, config, &swarm.downloaded)
        .run(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::test_support::{seed_on, Seeder, TestTorrent};
    use crate::tracker::{AnnounceResponse, TrackerError};
    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    /// Tracker stand-in that hands out a fixed peer list and records events
    struct MockAnnouncer {
        peers: Vec<SocketAddr>,
        fail: bool,
        events: Mutex<Vec<TrackerEvent>>,
    }

    impl MockAnnouncer {
        fn new(peers: Vec<SocketAddr>) -> Self {
            Self {
                peers,
                fail: false,
                events: Mutex::new(Vec::new()),
            }
        }

        fn events(&self) -> Vec<TrackerEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Announcer for MockAnnouncer {
        async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
            self.events.lock().unwrap().push(request.event);
            if self.fail {
                return Err(TrackerError::Http("connection refused".into()));
            }
            let mut response = AnnounceResponse::new(1800);
            response.peers = self.peers.clone();
            Ok(response)
        }
    }

    fn test_config() -> DownloadConfig {
        DownloadConfig {
            max_peers: 4,
            poll_interval: Duration::from_millis(20),
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            ..DownloadConfig::default()
        }
    }

    async fn downloader(
        torrent: &TestTorrent,
        dir: &TempDir,
        announcer: Arc<MockAnnouncer>,
    ) -> (Downloader, Arc<PieceStore>) {
        let store = Arc::new(torrent.store());
        let disk = Arc::new(torrent.disk(dir.path()).await);
        let downloader = Downloader::new(torrent.info_hash, store.clone(), disk, announcer, test_config());
        (downloader, store)
    }

    #[tokio::test]
    async fn test_download_from_local_seeders() {
        let torrent = TestTorrent::new(32 * 1024, 200 * 1024 + 123);
        let dir = TempDir::new().unwrap();

        let mut addrs = Vec::new();
        for _ in 0..2 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            addrs.push(listener.local_addr().unwrap());
            tokio::spawn(seed_on(listener, Seeder::new(&torrent)));
        }
        // a dead address must not hold anything up
        addrs.push("127.0.0.1:1".parse().unwrap());

        let announcer = Arc::new(MockAnnouncer::new(addrs));
        let (downloader, store) = downloader(&torrent, &dir, announcer.clone()).await;

        let summary = timeout(Duration::from_secs(20), downloader.run(CancellationToken::new()))
            .await
            .expect("download did not finish")
            .unwrap();

        assert!(summary.completed);
        assert_eq!(summary.verified_pieces, torrent.hashes.len());
        assert_eq!(summary.downloaded_bytes, torrent.data.len() as u64);
        assert_eq!(summary.bytes_left, 0);
        assert!(store.is_complete());
        assert_eq!(std::fs::read(dir.path().join("payload.bin")).unwrap(), torrent.data);

        let events = announcer.events();
        assert_eq!(events.first(), Some(&TrackerEvent::Started));
        assert_eq!(events.last(), Some(&TrackerEvent::Completed));
        assert_eq!(downloader.progress().fraction(), 1.0);
    }

    #[tokio::test]
    async fn test_cancel_returns_partial_summary() {
        let torrent = TestTorrent::new(16 * 1024, 64 * 1024);
        let dir = TempDir::new().unwrap();
        let announcer = Arc::new(MockAnnouncer {
            fail: true,
            ..MockAnnouncer::new(Vec::new())
        });
        let (downloader, _store) = downloader(&torrent, &dir, announcer.clone()).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let summary = timeout(Duration::from_secs(10), downloader.run(cancel))
            .await
            .expect("run ignored cancellation")
            .unwrap();

        assert!(!summary.completed);
        assert_eq!(summary.verified_pieces, 0);
        assert_eq!(summary.bytes_left, torrent.data.len() as u64);
        assert_eq!(announcer.events(), vec![TrackerEvent::Started, TrackerEvent::Stopped]);
    }

    #[tokio::test]
    async fn test_already_complete_finishes_without_peers() {
        let torrent = TestTorrent::new(16 * 1024, 32 * 1024);
        let dir = TempDir::new().unwrap();
        let announcer = Arc::new(MockAnnouncer::new(Vec::new()));
        let (downloader, store) = downloader(&torrent, &dir, announcer).await;

        for index in 0..store.piece_count() {
            store.mark_verified(index).unwrap();
        }

        let summary = timeout(Duration::from_secs(5), downloader.run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap();
        assert!(summary.completed);
        assert_eq!(summary.downloaded_bytes, 0);
    }

    #[tokio::test]
    async fn test_disk_failure_aborts_run() {
        let torrent = TestTorrent::new(16 * 1024, 64 * 1024);
        let dir = TempDir::new().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(seed_on(listener, Seeder::new(&torrent)));

        // every piece write fails once the writer is closed
        let store = Arc::new(torrent.store());
        let disk = Arc::new(torrent.disk(dir.path()).await);
        disk.close().await.unwrap();

        let announcer = Arc::new(MockAnnouncer::new(vec![addr]));
        let downloader = Downloader::new(torrent.info_hash, store, disk, announcer.clone(), test_config());

        let result = timeout(Duration::from_secs(10), downloader.run(CancellationToken::new()))
            .await
            .expect("run kept going after a disk failure");
        assert!(matches!(result, Err(TorrentError::StorageError { .. })));
        assert_eq!(announcer.events().last(), Some(&TrackerEvent::Stopped));
    }

    #[test]
    fn test_summary_serializes() {
        let summary = DownloadSummary {
            completed: true,
            verified_pieces: 3,
            total_pieces: 3,
            downloaded_bytes: 1024,
            bytes_left: 0,
            elapsed_secs: 1.5,
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"completed\":true"));
        assert_eq!(serde_json::from_str::<DownloadSummary>(&json).unwrap(), summary);
    }
}
