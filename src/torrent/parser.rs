//! Torrent file parser
//!
//! Handles parsing of .torrent files and extracting metadata.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use tracing::{debug, error, info, trace};

use crate::bencode::{self, Value};
use crate::error::TorrentError;
use crate::torrent::info::{TorrentFile, TorrentInfo};

type Dict = BTreeMap<Vec<u8>, Value>;

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root = bencode::decode(data).map_err(TorrentError::from)?;
        Self::convert_to_torrent_info(&root)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    fn convert_to_torrent_info(root: &Value) -> Result<TorrentInfo> {
        let root_dict = root
            .as_dict()
            .ok_or_else(|| TorrentError::parse_error("Root must be a dictionary"))?;

        let announce = required_str(root_dict, b"announce")?;
        let announce_list = Self::parse_announce_list(root_dict);

        let info_value = root_dict
            .get(b"info".as_slice())
            .ok_or_else(|| TorrentError::parse_error("Missing info dictionary"))?;
        let info_dict = info_value
            .as_dict()
            .ok_or_else(|| TorrentError::parse_error("info must be a dictionary"))?;

        // Re-encoding is canonical, so unsorted input still hashes the same as
        // the torrent's author computed it
        let info_hash = TorrentInfo::generate_info_hash(&bencode::encode(info_value));
        debug!("Info hash: {}", hex::encode(info_hash));

        let name = required_str(info_dict, b"name")?;
        validate_component(&name, "name")?;

        let piece_length = required_int(info_dict, b"piece length")?;
        if piece_length <= 0 {
            return Err(TorrentError::validation_error_with_field(
                format!("piece length must be positive, got {}", piece_length),
                "piece length",
            )
            .into());
        }
        let piece_length = piece_length as u64;

        let pieces_bytes = info_dict
            .get(b"pieces".as_slice())
            .and_then(Value::as_bytes)
            .ok_or_else(|| TorrentError::parse_error("Missing pieces field"))?;
        let pieces = TorrentInfo::parse_piece_hashes(pieces_bytes)?;

        let (length, files) = match (info_dict.get(b"length".as_slice()), info_dict.get(b"files".as_slice())) {
            (Some(_), Some(_)) => {
                return Err(TorrentError::parse_error("info has both length and files").into());
            }
            (Some(_), None) => (Some(non_negative(required_int(info_dict, b"length")?, "length")?), None),
            (None, Some(list)) => (None, Some(Self::parse_files(list)?)),
            (None, None) => {
                return Err(TorrentError::parse_error("Neither length nor files found in info dict").into());
            }
        };

        let torrent = TorrentInfo {
            announce,
            announce_list,
            info_hash,
            piece_length,
            pieces,
            name,
            length,
            files,
        };

        let total = torrent.total_size();
        if total == 0 {
            return Err(TorrentError::validation_error_with_field("torrent contains no data", "length").into());
        }
        let expected_pieces = total.div_ceil(piece_length);
        if expected_pieces != torrent.pieces.len() as u64 {
            return Err(TorrentError::validation_error_with_field(
                format!(
                    "{} bytes at piece length {} needs {} pieces, found {}",
                    total,
                    piece_length,
                    expected_pieces,
                    torrent.pieces.len()
                ),
                "pieces",
            )
            .into());
        }

        info!(
            "Successfully parsed torrent '{}' ({} bytes, {} pieces)",
            torrent.name,
            total,
            torrent.pieces.len()
        );
        Ok(torrent)
    }

    /// Backup tiers; malformed entries are skipped rather than rejected
    fn parse_announce_list(root: &Dict) -> Vec<Vec<String>> {
        let Some(tiers) = root.get(b"announce-list".as_slice()).and_then(Value::as_list) else {
            return Vec::new();
        };

        tiers
            .iter()
            .filter_map(Value::as_list)
            .map(|urls| {
                urls.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|tier| !tier.is_empty())
            .collect()
    }

    fn parse_files(list: &Value) -> Result<Vec<TorrentFile>> {
        let entries = list
            .as_list()
            .ok_or_else(|| TorrentError::parse_error("files must be a list"))?;
        if entries.is_empty() {
            return Err(TorrentError::parse_error("files list is empty").into());
        }

        let mut files = Vec::with_capacity(entries.len());
        let mut total: u64 = 0;
        for entry in entries {
            let file_dict = entry
                .as_dict()
                .ok_or_else(|| TorrentError::parse_error("file entry must be a dictionary"))?;

            let length = non_negative(required_int(file_dict, b"length")?, "files.length")?;
            total = total.checked_add(length).ok_or_else(|| {
                TorrentError::validation_error_with_field("total file length overflows u64", "files.length")
            })?;

            let components = file_dict
                .get(b"path".as_slice())
                .and_then(Value::as_list)
                .ok_or_else(|| TorrentError::parse_error("Missing file path"))?;
            if components.is_empty() {
                return Err(TorrentError::parse_error("file path is empty").into());
            }

            let mut path = Vec::with_capacity(components.len());
            for component in components {
                let component = component
                    .as_str()
                    .ok_or_else(|| TorrentError::parse_error("path component must be a UTF-8 string"))?;
                validate_component(component, "files.path")?;
                path.push(component.to_string());
            }

            trace!("File entry {:?} ({} bytes)", path, length);
            files.push(TorrentFile { path, length });
        }

        Ok(files)
    }
}

fn required_str(dict: &Dict, key: &[u8]) -> Result<String> {
    dict.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            TorrentError::parse_error(format!("Missing or invalid {} field", String::from_utf8_lossy(key))).into()
        })
}

fn required_int(dict: &Dict, key: &[u8]) -> Result<i64> {
    dict.get(key).and_then(Value::as_int).ok_or_else(|| {
        TorrentError::parse_error(format!("Missing or invalid {} field", String::from_utf8_lossy(key))).into()
    })
}

fn non_negative(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| {
        TorrentError::validation_error_with_field(format!("{} must not be negative, got {}", field, value), field)
            .into()
    })
}

/// Reject names that would escape or collapse the output directory
fn validate_component(component: &str, field: &str) -> Result<()> {
    let bad = component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
        || component.contains('\0');
    if bad {
        return Err(TorrentError::parse_error_with_source(
            format!("unsafe path component {:?}", component),
            field,
        )
        .into());
    }
    Ok(())
}
