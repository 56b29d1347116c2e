//! Bencode codec
//!
//! Canonical encoder and decoder for the serialization format used by
//! metainfo files and tracker responses.

pub mod decode;
pub mod encode;
pub mod error;
pub mod value;

pub use decode::{decode, decode_prefix};
pub use encode::{encode, encode_into};
pub use error::DecodeError;
pub use value::Value;
