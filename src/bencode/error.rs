use thiserror::Error;

/// Errors produced while decoding bencoded input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid integer: {0:?}")]
    InvalidInteger(String),

    #[error("invalid string length prefix")]
    InvalidStringLength,

    #[error("string declares {expected} bytes but only {remaining} remain")]
    TruncatedString { expected: usize, remaining: usize },

    #[error("unsupported type marker 0x{byte:02x} at offset {offset}")]
    UnsupportedType { byte: u8, offset: usize },

    #[error("dictionary key at offset {offset} is not a byte string")]
    BadKeyType { offset: usize },

    #[error("duplicate dictionary key at offset {offset}")]
    DuplicateKey { offset: usize },

    #[error("trailing data after value at offset {offset}")]
    TrailingData { offset: usize },

    #[error("nesting too deep")]
    NestingTooDeep,
}
