//! Progress reports handed to callers

use crate::error::TransferError;
use crate::status::{PartBitmap, PartStatus, PartStatusVector};
use std::sync::Arc;

/// Callback receiving outgoing transfer progress
pub type SentProgressCallback = Arc<dyn Fn(&SentProgress) + Send + Sync>;

/// Callback receiving incoming transfer progress
pub type ReceivedProgressCallback = Arc<dyn Fn(&ReceivedProgress) + Send + Sync>;

/// Snapshot of per-part status of an outgoing transfer
#[derive(Debug, Clone)]
pub struct SentPartTracker {
    statuses: PartStatusVector,
}

impl SentPartTracker {
    pub(crate) fn new(statuses: PartStatusVector) -> Self {
        Self { statuses }
    }

    /// Status of one part, `None` if out of range
    #[must_use]
    pub fn status(&self, part_num: u16) -> Option<PartStatus> {
        self.statuses.status(part_num)
    }

    /// Number of parts
    #[must_use]
    pub fn num_parts(&self) -> u16 {
        self.statuses.num_parts()
    }
}

/// Snapshot of per-part status of an incoming transfer
#[derive(Debug, Clone)]
pub struct ReceivedPartTracker {
    received: PartBitmap,
}

impl ReceivedPartTracker {
    pub(crate) fn new(received: PartBitmap) -> Self {
        Self { received }
    }

    /// `Received` or `Unsent`, `None` if out of range
    #[must_use]
    pub fn status(&self, part_num: u16) -> Option<PartStatus> {
        if part_num >= self.received.num_parts() {
            None
        } else if self.received.is_set(part_num) {
            Some(PartStatus::Received)
        } else {
            Some(PartStatus::Unsent)
        }
    }

    /// Part numbers received so far
    #[must_use]
    pub fn received_parts(&self) -> Vec<u16> {
        (0..self.received.num_parts())
            .filter(|p| self.received.is_set(*p))
            .collect()
    }

    /// Number of parts
    #[must_use]
    pub fn num_parts(&self) -> u16 {
        self.received.num_parts()
    }
}

/// Progress of an outgoing transfer
#[derive(Debug, Clone)]
pub struct SentProgress {
    /// Every part was received
    pub completed: bool,
    /// Parts sent and awaiting confirmation
    pub sent: u16,
    /// Parts confirmed received
    pub received: u16,
    /// Total parts
    pub total: u16,
    /// Per-part status
    pub parts: SentPartTracker,
    /// Set once the transfer has failed
    pub error: Option<TransferError>,
}

/// Progress of an incoming transfer
#[derive(Debug, Clone)]
pub struct ReceivedProgress {
    /// Every part arrived
    pub completed: bool,
    /// Parts arrived
    pub received: u16,
    /// Total parts
    pub total: u16,
    /// Per-part status
    pub parts: ReceivedPartTracker,
    /// Unused on this side; present for symmetry with sent progress
    pub error: Option<TransferError>,
}

fn error_fingerprint(error: Option<&TransferError>) -> String {
    error.map_or_else(|| "<nil>".to_string(), ToString::to_string)
}

impl SentProgress {
    /// Comparison key; equal fingerprints carry no new information
    #[must_use]
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.completed,
            self.sent,
            self.received,
            self.total,
            error_fingerprint(self.error.as_ref())
        )
    }
}

impl ReceivedProgress {
    /// Comparison key; equal fingerprints carry no new information
    #[must_use]
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.completed,
            self.received,
            self.total,
            error_fingerprint(self.error.as_ref())
        )
    }
}
