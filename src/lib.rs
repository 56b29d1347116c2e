//! torrent-leech
//!
//! A download-only BitTorrent client: parses a .torrent, announces to its
//! tracker, downloads and verifies pieces from peers and writes them into
//! the torrent's file layout.

pub mod bencode;
pub mod cli;
pub mod download;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::TorrentError;

pub use bencode::{DecodeError, Value};
pub use cli::{CliArgs, Config, ProgressDisplay};
pub use download::{DownloadConfig, DownloadSummary, Downloader, Progress};
pub use peer::{Bitfield, PeerConnection, PeerError};
pub use protocol::{Handshake, Message, MessageId};
pub use storage::{DiskWriter, PieceStore};
pub use torrent::{TorrentInfo, TorrentParser};
#[cfg(feature = "download")]
pub use tracker::HttpTracker;
pub use tracker::{Announcer, TrackerError};
