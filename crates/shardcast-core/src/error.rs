//! Error types for file transfers
//!
//! Errors are categorized to support the retry policy of the sending
//! pipeline and to tell callers which failures need their intervention.
//!
//! # Error Categories
//!
//! - **Validation**: rejected synchronously by `send`, never retried
//! - **Transient**: network or channel failures; affected parts re-enter the
//!   pipeline unchanged
//! - **Permanent**: exhausted cyphers, missing transfers, precondition
//!   violations and integrity failures
//!
//! # Example
//!
//! ```no_run
//! use shardcast_core::TransferError;
//!
//! fn handle_error(err: TransferError) {
//!     if err.is_transient() {
//!         println!("Transient error, parts will be requeued: {}", err);
//!     } else {
//!         println!("Permanent error: {}", err);
//!     }
//! }
//! ```

use shardcast_crypto::TransferId;
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in file transfer operations
#[derive(Debug, Error, Clone)]
pub enum TransferError {
    // ============ Input Validation ============
    /// File name longer than allowed
    #[error("length of filename ({len}) greater than max allowed length ({max})")]
    FileNameTooLong {
        /// Actual length in bytes
        len: usize,
        /// Maximum length in bytes
        max: usize,
    },

    /// File type longer than allowed
    #[error("length of file type ({len}) greater than max allowed length ({max})")]
    FileTypeTooLong {
        /// Actual length in bytes
        len: usize,
        /// Maximum length in bytes
        max: usize,
    },

    /// File larger than allowed
    #[error("size of file ({size} bytes) greater than max allowed size ({max} bytes)")]
    FileTooLarge {
        /// Actual size in bytes
        size: usize,
        /// Maximum size in bytes
        max: usize,
    },

    /// Preview larger than allowed
    #[error("size of preview ({size} bytes) greater than max allowed size ({max} bytes)")]
    PreviewTooLarge {
        /// Actual size in bytes
        size: usize,
        /// Maximum size in bytes
        max: usize,
    },

    /// File with no content
    #[error("cannot transfer an empty file")]
    EmptyFile,

    /// Network not healthy when a send was requested
    #[error("cannot initiate file transfer of {0:?} when network is not healthy")]
    NetworkUnhealthy(String),

    // ============ Transfer State ============
    /// Transfer not found
    #[error("could not find transfer {}", hex::encode(&.0[..8]))]
    TransferNotFound(TransferId),

    /// Close requested before the transfer reached a terminal status
    #[error("cannot close transfer {} that has not completed or failed", hex::encode(&.0[..8]))]
    TransferNotTerminal(TransferId),

    /// Receive requested before every part arrived
    #[error("cannot get incomplete file: missing {missing} of {total} parts")]
    Incomplete {
        /// Parts not yet received
        missing: u16,
        /// Total parts
        total: u16,
    },

    /// Part number beyond the transfer's part count
    #[error("part number {part_num} out of range of max {}", .num_parts.saturating_sub(1))]
    PartOutOfRange {
        /// Offending part number
        part_num: u16,
        /// Number of parts in the transfer
        num_parts: u16,
    },

    /// Cypher pool empty
    #[error("no unused fingerprints remain in the cypher pool")]
    FingerprintsExhausted,

    /// Transfer failed because a part could not be sent again
    #[error("file transfer failed: ran out of retries.")]
    OutOfRetries,

    /// Reassembled file does not match its transfer MAC
    #[error("transfer MAC mismatch: integrity verification failed")]
    MacMismatch,

    // ============ Infrastructure ============
    /// Network client operation failed
    #[error("Network error: {0}")]
    Network(Cow<'static, str>),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Part framing failed
    #[error("File error: {0}")]
    Files(#[from] shardcast_files::FilesError),

    /// Storage I/O error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    /// Channel send/receive error
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),
}

impl TransferError {
    /// Returns true if the error rejects caller input before any network call
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TransferError::FileNameTooLong { .. }
                | TransferError::FileTypeTooLong { .. }
                | TransferError::FileTooLarge { .. }
                | TransferError::PreviewTooLarge { .. }
                | TransferError::EmptyFile
                | TransferError::NetworkUnhealthy(_)
        )
    }

    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::Network(_) | TransferError::Timeout(_) | TransferError::Channel(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransferError::TransferNotFound(_)
                | TransferError::TransferNotTerminal(_)
                | TransferError::Incomplete { .. }
                | TransferError::PartOutOfRange { .. }
                | TransferError::FingerprintsExhausted
                | TransferError::OutOfRetries
                | TransferError::MacMismatch
                | TransferError::InvalidConfig(_)
                | TransferError::InvalidState(_)
        ) || self.is_validation()
    }

    /// Create a network error with static context (zero allocation)
    #[must_use]
    pub const fn network(context: &'static str) -> Self {
        TransferError::Network(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        TransferError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        TransferError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create a channel error with static context (zero allocation)
    #[must_use]
    pub const fn channel(context: &'static str) -> Self {
        TransferError::Channel(Cow::Borrowed(context))
    }
}

impl From<shardcast_crypto::CryptoError> for TransferError {
    fn from(err: shardcast_crypto::CryptoError) -> Self {
        TransferError::Crypto(err.to_string())
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Serialization(err.to_string().into())
    }
}

impl From<bincode::Error> for TransferError {
    fn from(err: bincode::Error) -> Self {
        TransferError::Serialization(err.to_string().into())
    }
}

impl From<toml::de::Error> for TransferError {
    fn from(err: toml::de::Error) -> Self {
        TransferError::InvalidConfig(err.to_string().into())
    }
}

impl From<toml::ser::Error> for TransferError {
    fn from(err: toml::ser::Error) -> Self {
        TransferError::Serialization(err.to_string().into())
    }
}

/// Result type for file transfer operations
pub type Result<T> = std::result::Result<T, TransferError>;
