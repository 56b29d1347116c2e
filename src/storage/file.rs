//! File storage module
//!
//! Maps piece-relative byte ranges onto the torrent's files and performs the
//! disk I/O.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};

use crate::storage::piece::PieceStore;
use crate::torrent::{FileEntry, TorrentInfo};

/// Errors from the disk writer; every I/O failure names the file involved
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("failed to {op} '{}': {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("range at offset {offset} runs past end of torrent ({total} bytes)")]
    OffsetOutOfRange { offset: u64, total: u64 },

    #[error("disk writer is closed")]
    Closed,
}

impl DiskError {
    /// File the error happened on, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            DiskError::Io { path, .. } => Some(path),
            DiskError::OffsetOutOfRange { .. } | DiskError::Closed => None,
        }
    }
}

/// A contiguous run of bytes inside one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Index into the writer's file entries
    pub file: usize,
    /// Offset inside that file
    pub file_offset: u64,
    pub len: usize,
}

/// Writes verified pieces into the torrent's file layout.
///
/// All reads and writes go through one lock, so piece writes never interleave.
#[derive(Debug)]
pub struct DiskWriter {
    root: PathBuf,
    entries: Vec<FileEntry>,
    piece_length: u64,
    total_length: u64,
    files: Mutex<Option<Vec<File>>>,
}

impl DiskWriter {
    /// Create every file (and its directories) under `root` at its full length
    pub async fn new(
        root: impl Into<PathBuf>,
        entries: Vec<FileEntry>,
        piece_length: u64,
        total_length: u64,
    ) -> Result<Self, DiskError> {
        let root = root.into();
        info!("Preparing {} file(s) under {}", entries.len(), root.display());

        let mut files = Vec::with_capacity(entries.len());
        for entry in &entries {
            let path = root.join(&entry.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error("create directory", parent, e))?;
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await
                .map_err(|e| io_error("create", &path, e))?;
            file.set_len(entry.length)
                .await
                .map_err(|e| io_error("set length of", &path, e))?;

            debug!("Created {} ({} bytes)", path.display(), entry.length);
            files.push(file);
        }

        Ok(Self {
            root,
            entries,
            piece_length,
            total_length,
            files: Mutex::new(Some(files)),
        })
    }

    /// Create the writer for a torrent's layout under `root`
    pub async fn from_torrent(root: impl Into<PathBuf>, info: &TorrentInfo) -> Result<Self, DiskError> {
        Self::new(root, info.file_entries(), info.piece_length, info.total_size()).await
    }

    /// Split `len` bytes at absolute `offset` into per-file runs
    pub fn segments(&self, offset: u64, len: usize) -> Result<Vec<Segment>, DiskError> {
        let end = offset
            .checked_add(len as u64)
            .filter(|end| *end <= self.total_length)
            .ok_or(DiskError::OffsetOutOfRange {
                offset,
                total: self.total_length,
            })?;

        let mut segments = Vec::new();
        let mut cursor = offset;
        for (file, entry) in self.entries.iter().enumerate() {
            if cursor >= end {
                break;
            }
            let file_end = entry.offset + entry.length;
            if file_end <= cursor || entry.length == 0 {
                continue;
            }

            let take = file_end.min(end) - cursor;
            segments.push(Segment {
                file,
                file_offset: cursor - entry.offset,
                len: take as usize,
            });
            cursor += take;
        }

        Ok(segments)
    }

    /// Write a verified piece at its position in the layout
    pub async fn write_piece(&self, index: usize, data: &[u8]) -> Result<(), DiskError> {
        let offset = index as u64 * self.piece_length;
        let segments = self.segments(offset, data.len())?;
        trace!("Writing piece {} as {} segment(s)", index, segments.len());

        let mut guard = self.files.lock().await;
        let files = guard.as_mut().ok_or(DiskError::Closed)?;

        let mut written = 0;
        for segment in segments {
            let path = self.root.join(&self.entries[segment.file].path);
            let file = &mut files[segment.file];

            file.seek(SeekFrom::Start(segment.file_offset))
                .await
                .map_err(|e| io_error("seek in", &path, e))?;
            file.write_all(&data[written..written + segment.len])
                .await
                .map_err(|e| io_error("write to", &path, e))?;
            file.flush().await.map_err(|e| io_error("flush", &path, e))?;
            written += segment.len;
        }

        debug!("Wrote piece {} ({} bytes)", index, data.len());
        Ok(())
    }

    /// Read `length` bytes of piece `index` back from disk
    pub async fn read_piece(&self, index: usize, length: usize) -> Result<Vec<u8>, DiskError> {
        let offset = index as u64 * self.piece_length;
        let segments = self.segments(offset, length)?;

        let mut guard = self.files.lock().await;
        let files = guard.as_mut().ok_or(DiskError::Closed)?;

        let mut data = vec![0u8; length];
        let mut read = 0;
        for segment in segments {
            let path = self.root.join(&self.entries[segment.file].path);
            let file = &mut files[segment.file];

            file.seek(SeekFrom::Start(segment.file_offset))
                .await
                .map_err(|e| io_error("seek in", &path, e))?;
            file.read_exact(&mut data[read..read + segment.len])
                .await
                .map_err(|e| io_error("read from", &path, e))?;
            read += segment.len;
        }

        Ok(data)
    }

    /// Hash the pieces already on disk and mark matching ones verified.
    ///
    /// Returns how many pieces were found intact.
    pub async fn verify_existing(&self, store: &PieceStore) -> Result<usize, DiskError> {
        let mut found = 0;
        for index in 0..store.piece_count() {
            let (Some(length), Some(expected)) = (store.piece_len(index), store.hash(index)) else {
                continue;
            };

            let data = self.read_piece(index, length).await?;
            let digest: [u8; 20] = Sha1::digest(&data).into();
            if digest == expected && store.mark_verified(index).is_ok() {
                found += 1;
            }
        }

        if found > 0 {
            info!("Found {}/{} pieces already on disk", found, store.piece_count());
        }
        Ok(found)
    }

    /// Flush and release all file handles; later calls are no-ops
    pub async fn close(&self) -> Result<(), DiskError> {
        let Some(files) = self.files.lock().await.take() else {
            return Ok(());
        };

        for (entry, mut file) in self.entries.iter().zip(files) {
            let path = self.root.join(&entry.path);
            file.flush().await.map_err(|e| io_error("flush", &path, e))?;
            file.sync_all().await.map_err(|e| io_error("sync", &path, e))?;
        }

        debug!("Closed {} file(s)", self.entries.len());
        Ok(())
    }

    /// Absolute path of every file in the layout
    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|e| self.root.join(&e.path)).collect()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> DiskError {
    error!("Failed to {} '{}': {}", op, path.display(), source);
    DiskError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}
