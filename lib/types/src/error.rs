use thiserror::Error;

/// An error produced while reading or writing the binary module format.
///
/// These errors are recoverable at the caller level: they abort the current
/// module load, not the process.
#[derive(Debug, Error, PartialEq)]
pub enum SerializeError {
    /// A read ran past the end of the input.
    #[error("expected data but found end of stream")]
    UnexpectedEof,

    /// A LEB128 encoding was overlong, truncated, or had invalid bits in its
    /// final byte.
    #[error("Invalid LEB encoding: invalid final byte")]
    InvalidLebEncoding,

    /// A value fell outside the range its encoding permits.
    #[error("out-of-range value: {min}<={value}<={max}")]
    OutOfRange {
        /// The smallest permitted value.
        min: i128,
        /// The value that was observed.
        value: i128,
        /// The largest permitted value.
        max: i128,
    },

    /// A value that must match a known constant did not.
    #[error("{message}: loaded {loaded} but was expecting {expected}")]
    ConstantMismatch {
        /// What the constant identifies, e.g. "magic number".
        message: String,
        /// The value found in the stream.
        loaded: u64,
        /// The value that was expected.
        expected: u64,
    },

    /// A length-prefixed string was not valid UTF-8.
    #[error("invalid UTF-8 in string")]
    InvalidUtf8,
}
