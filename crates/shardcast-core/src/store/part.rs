//! Queued part handle

use super::SentTransfer;
use crate::error::{Result, TransferError};
use shardcast_crypto::{EncryptedPart, TransferId};
use std::sync::{Arc, Weak};

/// Reference to one part of an outgoing transfer.
///
/// Handles travel through the sending queues. They do not keep the transfer
/// alive: once a transfer is closed, its queued handles resolve to nothing
/// and are dropped by the pipeline.
#[derive(Debug, Clone)]
pub struct Part {
    transfer: Weak<SentTransfer>,
    tid: TransferId,
    part_num: u16,
}

impl Part {
    /// Handle for `part_num` of `transfer`
    #[must_use]
    pub fn new(transfer: &Arc<SentTransfer>, part_num: u16) -> Self {
        Self {
            transfer: Arc::downgrade(transfer),
            tid: transfer.tid(),
            part_num,
        }
    }

    /// Transfer ID
    #[must_use]
    pub fn tid(&self) -> TransferId {
        self.tid
    }

    /// Part number
    #[must_use]
    pub fn part_num(&self) -> u16 {
        self.part_num
    }

    /// Owning transfer, if it still exists
    #[must_use]
    pub fn transfer(&self) -> Option<Arc<SentTransfer>> {
        self.transfer.upgrade()
    }

    /// Encrypt this part for a message of `max_payload` bytes.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::TransferNotFound` if the transfer was closed,
    /// or whatever [`SentTransfer::encrypted_part`] returns.
    pub async fn encrypted_part(&self, max_payload: usize) -> Result<Option<EncryptedPart>> {
        let transfer = self
            .transfer()
            .ok_or(TransferError::TransferNotFound(self.tid))?;
        transfer.encrypted_part(self.part_num, max_payload).await
    }
}
