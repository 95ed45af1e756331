//! File handling errors.

use thiserror::Error;

/// Errors produced while partitioning or framing file parts
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilesError {
    /// Part size of zero
    #[error("part size must be at least 1 byte")]
    ZeroPartSize,

    /// Payload too small to hold a part message header
    #[error("payload of {len} bytes is too short for a part message (minimum {min})")]
    MessageTooShort {
        /// Actual payload length
        len: usize,
        /// Minimum payload length
        min: usize,
    },

    /// Part data larger than the message can carry
    #[error("part of {len} bytes exceeds the maximum part size of {max} bytes")]
    PartTooLarge {
        /// Part length
        len: usize,
        /// Maximum part length
        max: usize,
    },
}
