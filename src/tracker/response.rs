//! Tracker announce responses
//!
//! Decodes the bencoded reply to an HTTP announce.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tracing::{debug, warn};

use super::TrackerError;
use crate::bencode::{self, Value};

/// Announce event reported to the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackerEvent {
    /// Regular re-announce
    #[default]
    None,
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    /// Query-string value; empty for a regular announce
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }
}

/// Parsed tracker reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds to wait before the next announce
    pub interval: u32,
    pub min_interval: Option<u32>,
    /// Seeders, when reported
    pub complete: Option<u32>,
    /// Leechers, when reported
    pub incomplete: Option<u32>,
    pub peers: Vec<SocketAddr>,
    pub warning_message: Option<String>,
}

impl AnnounceResponse {
    pub fn new(interval: u32) -> Self {
        Self {
            interval,
            min_interval: None,
            complete: None,
            incomplete: None,
            peers: Vec::new(),
            warning_message: None,
        }
    }
}

/// Parse a tracker reply body
pub fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let value = bencode::decode(body)?;
    let dict = value
        .as_dict()
        .ok_or_else(|| TrackerError::InvalidResponse("expected a dictionary".into()))?;

    if let Some(reason) = dict.get(b"failure reason".as_slice()) {
        let reason = String::from_utf8_lossy(reason.as_bytes().unwrap_or_default()).into_owned();
        return Err(TrackerError::Failure(reason));
    }

    let interval = dict
        .get(b"interval".as_slice())
        .and_then(Value::as_int)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| TrackerError::InvalidResponse("missing interval".into()))?;

    let counter = |key: &[u8]| {
        dict.get(key)
            .and_then(Value::as_int)
            .and_then(|v| u32::try_from(v).ok())
    };

    let mut response = AnnounceResponse::new(interval);
    response.min_interval = counter(b"min interval");
    response.complete = counter(b"complete");
    response.incomplete = counter(b"incomplete");
    response.warning_message = dict
        .get(b"warning message".as_slice())
        .and_then(Value::as_str)
        .map(String::from);

    response.peers = match dict.get(b"peers".as_slice()) {
        Some(Value::Bytes(compact)) => parse_compact_peers(compact),
        Some(Value::List(list)) => parse_dict_peers(list),
        Some(_) => return Err(TrackerError::InvalidResponse("peers has an unknown shape".into())),
        None => Vec::new(),
    };

    if let Some(warning) = &response.warning_message {
        warn!("Tracker warning: {}", warning);
    }
    debug!(
        "Announce response: interval {}s, {} peers",
        response.interval,
        response.peers.len()
    );
    Ok(response)
}

/// Parse 6-byte `ip:port` records; a trailing partial record is dropped
pub fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    if bytes.len() % 6 != 0 {
        warn!("Compact peer list has {} trailing bytes", bytes.len() % 6);
    }

    bytes
        .chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([c[4], c[5]]))
        })
        .filter(|addr| addr.port() != 0)
        .collect()
}

fn parse_dict_peers(list: &[Value]) -> Vec<SocketAddr> {
    list.iter()
        .filter_map(|peer| {
            let ip = peer.get(b"ip")?.as_str()?.parse::<IpAddr>().ok()?;
            let port = u16::try_from(peer.get(b"port")?.as_int()?).ok()?;
            (port != 0).then(|| SocketAddr::new(ip, port))
        })
        .collect()
}
