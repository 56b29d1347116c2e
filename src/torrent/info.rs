//! Torrent information structures
//!
//! Provides the parsed metainfo and its flattened file layout.

use std::path::PathBuf;

use anyhow::Result;
use sha1::{Digest, Sha1};

use crate::error::TorrentError;

/// A file listed in a multi-file torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path components relative to the torrent directory
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

/// A file placed in the flattened byte stream of the torrent.
///
/// `offset` is where the file's first byte sits in the concatenation of all
/// files; the entries of one torrent are contiguous and non-overlapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the output directory
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

/// Parsed torrent metainfo
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Primary tracker announce URL
    pub announce: String,
    /// Backup tracker tiers from `announce-list`, in file order
    pub announce_list: Vec<Vec<String>>,
    /// SHA1 hash of the canonically encoded info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes
    pub piece_length: u64,
    /// Expected SHA1 of every piece
    pub pieces: Vec<[u8; 20]>,
    /// Torrent name
    pub name: String,
    /// Single file size (None for multi-file torrents)
    pub length: Option<u64>,
    /// Files in multi-file torrents (None for single-file torrents)
    pub files: Option<Vec<TorrentFile>>,
}

impl TorrentInfo {
    /// Calculate total size of all files in torrent
    pub fn total_size(&self) -> u64 {
        match (&self.length, &self.files) {
            (Some(length), _) => *length,
            (None, Some(files)) => files.iter().fold(0u64, |total, f| total.saturating_add(f.length)),
            (None, None) => 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Check if this is a multi-file torrent
    pub fn is_multi_file(&self) -> bool {
        self.files.is_some()
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Every tracker URL to try, primary first, without duplicates
    pub fn announce_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        for url in std::iter::once(&self.announce).chain(self.announce_list.iter().flatten()) {
            if !url.is_empty() && !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }

    /// Lay the torrent's files out along the flattened byte stream.
    ///
    /// Single-file torrents map to `<name>`; multi-file torrents map to
    /// `<name>/<path...>`.
    pub fn file_entries(&self) -> Vec<FileEntry> {
        match &self.files {
            Some(files) => {
                let mut offset = 0;
                files
                    .iter()
                    .map(|file| {
                        let mut path = PathBuf::from(&self.name);
                        path.extend(&file.path);
                        let entry = FileEntry {
                            path,
                            length: file.length,
                            offset,
                        };
                        offset += file.length;
                        entry
                    })
                    .collect()
            }
            None => vec![FileEntry {
                path: PathBuf::from(&self.name),
                length: self.length.unwrap_or(0),
                offset: 0,
            }],
        }
    }

    /// Generate info hash from info dictionary bytes
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Parse piece hashes from concatenated bytes in torrent file
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::validation_error_with_field(
                format!("pieces length must be a multiple of 20, got {}", pieces_bytes.len()),
                "pieces",
            )
            .into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    /// Get piece hash for a specific piece index
    pub fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        self.pieces.get(index).copied()
    }

    /// Length of piece `index`; the last piece holds the remainder
    pub fn piece_size(&self, index: usize) -> Option<u64> {
        self.piece_range(index).map(|(start, end)| end - start)
    }

    /// Get byte range for a specific piece
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }

        let start = (index as u64).saturating_mul(self.piece_length);
        let end = std::cmp::min(start.saturating_add(self.piece_length), self.total_size());
        Some((start, end))
    }
}
