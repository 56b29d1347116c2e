//! Download tuning knobs

use std::time::Duration;

/// Default BitTorrent listen port reported to trackers
pub const DEFAULT_PORT: u16 = 6881;

/// Timing and sizing of a download run
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadConfig {
    /// Concurrent peer workers
    pub max_peers: usize,
    /// Port reported in announces; nothing listens on it
    pub port: u16,
    /// Queued peer addresses waiting for a worker
    pub peer_queue_capacity: usize,
    /// Wait before retrying a failed announce
    pub announce_retry: Duration,
    /// Floor on the tracker's re-announce interval
    pub min_announce_interval: Duration,
    /// Bound on the final `completed`/`stopped` announce
    pub final_announce_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Drop a peer that keeps us choked this long
    pub unchoke_timeout: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Drop a peer that sends nothing for this long
    pub idle_timeout: Duration,
    /// How often completion is checked
    pub poll_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_peers: 30,
            port: DEFAULT_PORT,
            peer_queue_capacity: 200,
            announce_retry: Duration::from_secs(60),
            min_announce_interval: Duration::from_secs(30),
            final_announce_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(60),
            unchoke_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
        }
    }
}
