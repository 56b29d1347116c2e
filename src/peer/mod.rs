//! Peer management module
//!
//! Handles a single peer connection and its state.

pub mod connection;
pub mod state;

// Re-export main types
pub use connection::{PeerConnection, PeerError};
pub use state::{Bitfield, ConnectionState, Peer};
