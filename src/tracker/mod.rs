//! Tracker module
//!
//! Announces to the swarm's tracker and returns peer addresses.

#[cfg(feature = "download")]
pub mod http;
pub mod response;

use async_trait::async_trait;
use thiserror::Error;

use crate::bencode::DecodeError;

#[cfg(feature = "download")]
pub use http::HttpTracker;
pub use response::{parse_announce_response, parse_compact_peers, AnnounceResponse, TrackerEvent};

/// Errors from an announce
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("http error: {0}")]
    Http(String),

    #[error("bencode error: {0}")]
    Bencode(#[from] DecodeError),

    #[error("tracker returned error: {0}")]
    Failure(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
}

/// Parameters of one announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
}

/// Something that can resolve a swarm into peer addresses
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError>;
}
