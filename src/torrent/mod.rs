//! Torrent file handling module
//!
//! Parses .torrent metainfo and describes the files it lays out.

pub mod info;
pub mod parser;

pub use info::{FileEntry, TorrentFile, TorrentInfo};
pub use parser::TorrentParser;
