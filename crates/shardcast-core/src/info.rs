//! Transfer announcement
//!
//! A [`TransferInfo`] is everything a recipient needs to receive a file:
//! the transfer key that seeds the cypher pool, the part count and retry
//! budget that size it, and the MAC that verifies the reassembled file.
//! The sender hands the marshalled blob to the application, which delivers
//! it out of band.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use shardcast_crypto::{FileId, RecipientId, TransferKey, TransferMac};

/// Metadata announcing an outgoing transfer to its recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferInfo {
    /// Identity the parts are addressed to
    pub recipient: RecipientId,
    /// Content-derived file ID
    pub file_id: FileId,
    /// File name
    pub file_name: String,
    /// File type
    pub file_type: String,
    /// Transfer key
    pub key: TransferKey,
    /// MAC over the whole file
    pub mac: TransferMac,
    /// Number of parts
    pub num_parts: u16,
    /// File size in bytes
    pub size: u32,
    /// Retry budget the cypher pool was sized with
    pub retry: f32,
    /// Preview of the file contents
    pub preview: Vec<u8>,
}

impl TransferInfo {
    /// Encode for out-of-band delivery
    ///
    /// # Errors
    ///
    /// Returns `TransferError::Serialization` if encoding fails.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a blob produced by [`TransferInfo::marshal`]
    ///
    /// # Errors
    ///
    /// Returns `TransferError::Serialization` on malformed input.
    pub fn unmarshal(blob: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(blob)?)
    }

    /// Size of the cypher pool for this transfer
    #[must_use]
    pub fn num_fingerprints(&self) -> usize {
        crate::calc_num_fingerprints(self.num_parts, self.retry)
    }
}
