//! Part and transfer status tracking
//!
//! Sent parts move through an explicit transition table:
//!
//! ```text
//!            mark_sent                mark_received
//!   Unsent ─────────────▶ Sent ─────────────────────▶ Received
//!     ▲  ◀───────────────  │                             ▲
//!     │   mark_for_resend  │                             │
//!     └────────────────────┴──────── mark_received ──────┘
//! ```
//!
//! `Received` is absorbing. Received transfers only need to know whether a
//! part has arrived, so they use a [`PartBitmap`].

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a single outgoing part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PartStatus {
    /// Waiting to be (re)sent
    Unsent = 0,
    /// Sent on a successful round, not yet confirmed
    Sent = 1,
    /// Confirmed received by the recipient
    Received = 2,
}

impl PartStatus {
    /// Whether the transition table allows moving from `self` to `to`
    #[must_use]
    pub const fn can_transition(self, to: PartStatus) -> bool {
        matches!(
            (self, to),
            (PartStatus::Unsent, PartStatus::Sent)
                | (PartStatus::Sent, PartStatus::Unsent)
                | (PartStatus::Unsent, PartStatus::Received)
                | (PartStatus::Sent, PartStatus::Received)
        )
    }

    const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PartStatus::Unsent),
            1 => Some(PartStatus::Sent),
            2 => Some(PartStatus::Received),
            _ => None,
        }
    }
}

/// Status of an outgoing transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Parts are still being sent
    Running,
    /// Every part was received
    Completed,
    /// The cypher pool ran out before every part was sent
    Failed,
}

impl TransferStatus {
    /// Completed or failed
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Per-part status of an outgoing transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<u8>", try_from = "Vec<u8>")]
pub struct PartStatusVector {
    states: Vec<PartStatus>,
    sent: u16,
    received: u16,
}

impl PartStatusVector {
    /// All parts `Unsent`
    #[must_use]
    pub fn new(num_parts: u16) -> Self {
        Self {
            states: vec![PartStatus::Unsent; usize::from(num_parts)],
            sent: 0,
            received: 0,
        }
    }

    /// Number of parts tracked
    #[must_use]
    pub fn num_parts(&self) -> u16 {
        self.states.len() as u16
    }

    /// Status of one part
    #[must_use]
    pub fn status(&self, part_num: u16) -> Option<PartStatus> {
        self.states.get(usize::from(part_num)).copied()
    }

    /// Parts currently `Sent`
    #[must_use]
    pub fn num_sent(&self) -> u16 {
        self.sent
    }

    /// Parts currently `Received`
    #[must_use]
    pub fn num_received(&self) -> u16 {
        self.received
    }

    /// Every part is `Received`
    #[must_use]
    pub fn is_complete(&self) -> bool {
        usize::from(self.received) == self.states.len()
    }

    /// Part numbers currently in `status`
    #[must_use]
    pub fn parts_with(&self, status: PartStatus) -> Vec<u16> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == status)
            .map(|(i, _)| i as u16)
            .collect()
    }

    /// Move a part to `to` if the transition table allows it.
    ///
    /// Returns whether the status changed. Disallowed transitions, including
    /// any transition out of `Received`, leave the vector untouched.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::PartOutOfRange` for an unknown part number.
    pub fn transition(&mut self, part_num: u16, to: PartStatus) -> Result<bool> {
        let num_parts = self.num_parts();
        let slot = self
            .states
            .get_mut(usize::from(part_num))
            .ok_or(TransferError::PartOutOfRange {
                part_num,
                num_parts,
            })?;

        let from = *slot;
        if !from.can_transition(to) {
            if from != to {
                tracing::debug!(part_num, ?from, ?to, "Ignoring disallowed part transition");
            }
            return Ok(false);
        }

        *slot = to;
        match from {
            PartStatus::Sent => self.sent -= 1,
            PartStatus::Received => self.received -= 1,
            PartStatus::Unsent => {}
        }
        match to {
            PartStatus::Sent => self.sent += 1,
            PartStatus::Received => self.received += 1,
            PartStatus::Unsent => {}
        }
        Ok(true)
    }
}

impl From<PartStatusVector> for Vec<u8> {
    fn from(vector: PartStatusVector) -> Self {
        vector.states.into_iter().map(|s| s as u8).collect()
    }
}

impl TryFrom<Vec<u8>> for PartStatusVector {
    type Error = String;

    fn try_from(bytes: Vec<u8>) -> std::result::Result<Self, Self::Error> {
        if bytes.len() > usize::from(u16::MAX) {
            return Err(format!("part status vector too long: {}", bytes.len()));
        }

        let states = bytes
            .into_iter()
            .map(|b| PartStatus::from_u8(b).ok_or_else(|| format!("invalid part status {b}")))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let count = |status| states.iter().filter(|s| **s == status).count() as u16;

        Ok(Self {
            sent: count(PartStatus::Sent),
            received: count(PartStatus::Received),
            states,
        })
    }
}

/// Received-bit per part of an incoming transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "BitmapRecord", try_from = "BitmapRecord")]
pub struct PartBitmap {
    bits: Vec<u8>,
    num_parts: u16,
    count: u16,
}

#[derive(Serialize, Deserialize)]
struct BitmapRecord {
    num_parts: u16,
    bits: Vec<u8>,
}

impl PartBitmap {
    /// No part received
    #[must_use]
    pub fn new(num_parts: u16) -> Self {
        Self {
            bits: vec![0u8; usize::from(num_parts).div_ceil(8)],
            num_parts,
            count: 0,
        }
    }

    /// Number of parts tracked
    #[must_use]
    pub fn num_parts(&self) -> u16 {
        self.num_parts
    }

    /// Number of parts received
    #[must_use]
    pub fn count(&self) -> u16 {
        self.count
    }

    /// Whether a part was received
    #[must_use]
    pub fn is_set(&self, part_num: u16) -> bool {
        part_num < self.num_parts && self.bits[usize::from(part_num / 8)] & (1 << (part_num % 8)) != 0
    }

    /// Every part received
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.count == self.num_parts
    }

    /// Mark a part received; returns false if it already was.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::PartOutOfRange` for an unknown part number.
    pub fn set(&mut self, part_num: u16) -> Result<bool> {
        if part_num >= self.num_parts {
            return Err(TransferError::PartOutOfRange {
                part_num,
                num_parts: self.num_parts,
            });
        }
        if self.is_set(part_num) {
            return Ok(false);
        }

        self.bits[usize::from(part_num / 8)] |= 1 << (part_num % 8);
        self.count += 1;
        Ok(true)
    }

    /// Part numbers not yet received
    #[must_use]
    pub fn missing(&self) -> Vec<u16> {
        (0..self.num_parts).filter(|p| !self.is_set(*p)).collect()
    }
}

impl From<PartBitmap> for BitmapRecord {
    fn from(bitmap: PartBitmap) -> Self {
        Self {
            num_parts: bitmap.num_parts,
            bits: bitmap.bits,
        }
    }
}

impl TryFrom<BitmapRecord> for PartBitmap {
    type Error = String;

    fn try_from(record: BitmapRecord) -> std::result::Result<Self, Self::Error> {
        let expected = usize::from(record.num_parts).div_ceil(8);
        if record.bits.len() != expected {
            return Err(format!(
                "bitmap has {} bytes, expected {expected}",
                record.bits.len()
            ));
        }

        let mut bitmap = Self::new(record.num_parts);
        for part_num in 0..record.num_parts {
            if record.bits[usize::from(part_num / 8)] & (1 << (part_num % 8)) != 0 {
                bitmap.bits[usize::from(part_num / 8)] |= 1 << (part_num % 8);
                bitmap.count += 1;
            }
        }
        Ok(bitmap)
    }
}
