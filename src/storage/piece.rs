//! Piece storage module
//!
//! Tracks the download and verification state of every piece and decides
//! which piece a peer should serve next.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::peer::Bitfield;
use crate::torrent::TorrentInfo;

/// Errors reported by the piece store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PieceError {
    #[error("piece {index} does not exist (torrent has {count})")]
    InvalidPiece { index: usize, count: usize },

    #[error("block {begin}+{len} overruns piece {index} of {piece_len} bytes")]
    BlockOutOfRange {
        index: usize,
        begin: u32,
        len: usize,
        piece_len: usize,
    },
}

/// Status of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceState {
    /// Not being downloaded
    #[default]
    Needed,
    /// Handed to a worker
    Requested,
    /// Every byte received, hash not yet checked
    Downloaded,
    /// Hash matched; terminal
    Verified,
}

/// What happened to a block handed to [`PieceStore::receive_block`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Stored; the piece still has gaps
    Pending,
    /// The block completed the piece and the hash matched; carries the piece bytes
    Verified(Vec<u8>),
    /// The block completed the piece but the hash did not match; the piece is Needed again
    HashMismatch,
    /// The piece was already verified and the block was dropped
    AlreadyVerified,
}

/// One piece of the torrent
#[derive(Debug)]
pub struct Piece {
    index: usize,
    hash: [u8; 20],
    length: usize,
    state: PieceState,
    buffer: Vec<u8>,
    /// Received byte ranges, sorted and non-overlapping
    received: Vec<(usize, usize)>,
}

impl Piece {
    /// Create a new piece
    pub fn new(index: usize, length: usize, hash: [u8; 20]) -> Self {
        Self {
            index,
            hash,
            length,
            state: PieceState::Needed,
            buffer: Vec::new(),
            received: Vec::new(),
        }
    }

    pub fn state(&self) -> PieceState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Bytes received so far
    pub fn received_bytes(&self) -> usize {
        self.received.iter().map(|(start, end)| end - start).sum()
    }

    fn is_filled(&self) -> bool {
        self.received.first() == Some(&(0, self.length))
    }

    /// Copy `data` into the buffer at `begin` and record the range as covered
    fn add_block(&mut self, begin: usize, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.buffer.len() != self.length {
            self.buffer = vec![0u8; self.length];
        }
        let end = begin + data.len();
        self.buffer[begin..end].copy_from_slice(data);

        // merge [begin, end) into the sorted range list
        let mut merged = (begin, end);
        let mut ranges = Vec::with_capacity(self.received.len() + 1);
        for &(start, stop) in &self.received {
            if stop < merged.0 || start > merged.1 {
                ranges.push((start, stop));
            } else {
                merged = (merged.0.min(start), merged.1.max(stop));
            }
        }
        ranges.push(merged);
        ranges.sort_unstable();
        self.received = ranges;
    }

    fn verify(&self) -> bool {
        let digest: [u8; 20] = Sha1::digest(&self.buffer).into();
        digest == self.hash
    }

    /// Drop all received data and return to Needed
    fn reset(&mut self) {
        self.buffer = Vec::new();
        self.received.clear();
        self.state = PieceState::Needed;
    }
}

/// Per-piece state for a whole torrent.
///
/// Each piece sits behind its own lock so workers on different pieces never
/// contend; a piece's state and buffer only change under that lock.
#[derive(Debug)]
pub struct PieceStore {
    pieces: Vec<Mutex<Piece>>,
    piece_length: u64,
    total_length: u64,
    verified: AtomicUsize,
}

impl PieceStore {
    /// Create a store for `hashes.len()` pieces; the last piece holds the remainder
    pub fn new(hashes: Vec<[u8; 20]>, piece_length: u64, total_length: u64) -> Self {
        let pieces = hashes
            .into_iter()
            .enumerate()
            .map(|(index, hash)| {
                let start = (index as u64).saturating_mul(piece_length);
                let length = total_length.saturating_sub(start).min(piece_length) as usize;
                Mutex::new(Piece::new(index, length, hash))
            })
            .collect::<Vec<_>>();

        debug!("Piece store created with {} pieces", pieces.len());
        Self {
            pieces,
            piece_length,
            total_length,
            verified: AtomicUsize::new(0),
        }
    }

    pub fn from_torrent(info: &TorrentInfo) -> Self {
        Self::new(info.pieces.clone(), info.piece_length, info.total_size())
    }

    fn piece(&self, index: usize) -> Result<MutexGuard<'_, Piece>, PieceError> {
        self.pieces
            .get(index)
            .map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
            .ok_or(PieceError::InvalidPiece {
                index,
                count: self.pieces.len(),
            })
    }

    /// Lowest-index piece the peer has that is not yet verified
    pub fn pick_piece(&self, peer: &Bitfield) -> Option<usize> {
        (0..self.pieces.len()).find(|&index| {
            peer.has_piece(index)
                && self
                    .piece(index)
                    .map_or(false, |p| p.state != PieceState::Verified)
        })
    }

    /// Needed → Requested; any other state is left alone
    pub fn mark_requested(&self, index: usize) -> Result<(), PieceError> {
        let mut piece = self.piece(index)?;
        if piece.state == PieceState::Needed {
            piece.state = PieceState::Requested;
        }
        Ok(())
    }

    /// Pick a piece for a peer and mark it requested in one step.
    ///
    /// Pieces nobody is working on come first. When the peer has none of
    /// those, a piece already requested elsewhere is returned so the
    /// download's tail is not held up by one slow peer.
    pub fn claim_piece(&self, peer: &Bitfield) -> Option<usize> {
        for index in 0..self.pieces.len() {
            if !peer.has_piece(index) {
                continue;
            }
            let Ok(mut piece) = self.piece(index) else { continue };
            if piece.state == PieceState::Needed {
                piece.state = PieceState::Requested;
                trace!("Claimed piece {}", index);
                return Some(index);
            }
        }

        let endgame = (0..self.pieces.len()).find(|&index| {
            peer.has_piece(index)
                && self
                    .piece(index)
                    .map_or(false, |p| p.state == PieceState::Requested)
        });
        if let Some(index) = endgame {
            debug!("End game: sharing piece {}", index);
        }
        endgame
    }

    /// Give up on a requested piece so another peer can take it
    pub fn release_piece(&self, index: usize) {
        if let Ok(mut piece) = self.piece(index) {
            if piece.state == PieceState::Requested {
                piece.state = PieceState::Needed;
            }
        }
    }

    /// Store a block; verifies the piece once every byte is present
    pub fn receive_block(&self, index: usize, begin: u32, data: &[u8]) -> Result<BlockOutcome, PieceError> {
        let mut piece = self.piece(index)?;

        let start = begin as usize;
        if start.checked_add(data.len()).map_or(true, |end| end > piece.length) {
            return Err(PieceError::BlockOutOfRange {
                index,
                begin,
                len: data.len(),
                piece_len: piece.length,
            });
        }

        if piece.state == PieceState::Verified {
            return Ok(BlockOutcome::AlreadyVerified);
        }

        piece.add_block(start, data);
        if !piece.is_filled() {
            return Ok(BlockOutcome::Pending);
        }

        piece.state = PieceState::Downloaded;
        if piece.verify() {
            piece.state = PieceState::Verified;
            piece.received.clear();
            self.verified.fetch_add(1, Ordering::SeqCst);
            debug!("Piece {} verified", piece.index);
            Ok(BlockOutcome::Verified(std::mem::take(&mut piece.buffer)))
        } else {
            warn!("Piece {} failed hash check, discarding", piece.index);
            piece.reset();
            Ok(BlockOutcome::HashMismatch)
        }
    }

    /// Mark a piece verified without downloading it (data already on disk)
    pub fn mark_verified(&self, index: usize) -> Result<(), PieceError> {
        let mut piece = self.piece(index)?;
        if piece.state != PieceState::Verified {
            piece.buffer = Vec::new();
            piece.received.clear();
            piece.state = PieceState::Verified;
            self.verified.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn state(&self, index: usize) -> Option<PieceState> {
        self.piece(index).ok().map(|p| p.state)
    }

    /// Expected SHA1 of piece `index`
    pub fn hash(&self, index: usize) -> Option<[u8; 20]> {
        self.piece(index).ok().map(|p| p.hash)
    }

    /// True once every piece is verified; a store without pieces is never complete
    pub fn is_complete(&self) -> bool {
        !self.pieces.is_empty() && self.verified_count() == self.pieces.len()
    }

    /// Verified pieces as a MSB-first bitfield
    pub fn bitfield(&self) -> Vec<u8> {
        let mut bitfield = vec![0u8; self.pieces.len().div_ceil(8)];
        for index in 0..self.pieces.len() {
            if self.state(index) == Some(PieceState::Verified) {
                bitfield[index / 8] |= 0x80 >> (index % 8);
            }
        }
        bitfield
    }

    pub fn verified_count(&self) -> usize {
        self.verified.load(Ordering::SeqCst)
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Length of piece `index`
    pub fn piece_len(&self, index: usize) -> Option<usize> {
        self.piece(index).ok().map(|p| p.length)
    }

    /// Bytes still to be verified
    pub fn bytes_left(&self) -> u64 {
        (0..self.pieces.len())
            .filter_map(|index| self.piece(index).ok())
            .filter(|p| p.state != PieceState::Verified)
            .map(|p| p.length as u64)
            .sum()
    }

    /// Download progress (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.pieces.is_empty() {
            0.0
        } else {
            self.verified_count() as f64 / self.pieces.len() as f64
        }
    }
}
