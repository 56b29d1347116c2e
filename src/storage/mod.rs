//! Storage module
//!
//! Piece bookkeeping in memory and piece persistence on disk.

pub mod file;
pub mod piece;

// Re-export piece types
pub use piece::{BlockOutcome, Piece, PieceError, PieceState, PieceStore};

// Re-export file storage types
pub use file::{DiskError, DiskWriter, Segment};
