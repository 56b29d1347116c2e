//! Download module
//!
//! Ties the tracker, peer connections, piece store and disk writer together.

pub mod config;
pub mod downloader;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{DownloadConfig, DEFAULT_PORT};
pub use downloader::{DownloadSummary, Downloader, Progress};
pub use worker::{PeerSession, SessionError, BLOCK_SIZE};
