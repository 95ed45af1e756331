//! Mix network client interface
//!
//! The transfer engine does not implement transport. It drives a
//! [`Network`] that sends fixed-size messages in rounds, reports per-round
//! success, and dispatches inbound messages by fingerprint to registered
//! [`MessageProcessor`]s.

pub mod memory;

use crate::BoxFuture;
use crate::error::Result;
use shardcast_crypto::{Fingerprint, PART_MAC_SIZE, RecipientId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Identifier of one network round
pub type RoundId = u64;

/// One outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetedMessage {
    /// Identity the message is addressed to
    pub recipient: RecipientId,
    /// Fingerprint the recipient listens on
    pub fingerprint: Fingerprint,
    /// Encrypted part message
    pub payload: Vec<u8>,
    /// Detached part MAC
    pub mac: [u8; PART_MAC_SIZE],
}

/// One inbound message matched to a registered fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Identity the message was addressed to
    pub recipient: RecipientId,
    /// Matched fingerprint
    pub fingerprint: Fingerprint,
    /// Encrypted part message
    pub payload: Vec<u8>,
    /// Detached part MAC
    pub mac: [u8; PART_MAC_SIZE],
    /// Round the message arrived in
    pub round: RoundId,
}

impl IncomingMessage {
    /// Inbound view of a message that was sent in `round`
    #[must_use]
    pub fn from_targeted(message: TargetedMessage, round: RoundId) -> Self {
        Self {
            recipient: message.recipient,
            fingerprint: message.fingerprint,
            payload: message.payload,
            mac: message.mac,
            round,
        }
    }
}

/// Outcome of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundResult {
    /// Whether the round delivered its messages into the network
    pub succeeded: bool,
    /// When the round resolved
    pub completed_at: Instant,
}

/// Handler bound to one (recipient, fingerprint) pair
pub trait MessageProcessor: Send + Sync {
    /// Handle a message that matched the fingerprint
    fn process(&self, message: IncomingMessage) -> BoxFuture<'_, ()>;
}

/// Messaging client consumed by the transfer engine
pub trait Network: Send + Sync {
    /// Largest payload one message can carry
    fn max_message_length(&self) -> usize;

    /// Send all messages in a single round
    fn send_many(
        &self,
        messages: Vec<TargetedMessage>,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<RoundId>>;

    /// Wait for `round` to resolve.
    ///
    /// An error means the outcome is unknown and is treated as a failure.
    fn round_results(&self, round: RoundId, timeout: Duration) -> BoxFuture<'_, Result<RoundResult>>;

    /// Route messages for `(recipient, fingerprint)` to `processor`.
    ///
    /// A fingerprint is removed by the network once it matches a message.
    fn add_fingerprint(
        &self,
        recipient: RecipientId,
        fingerprint: Fingerprint,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<()>;

    /// Stop routing one fingerprint
    fn delete_fingerprint(&self, recipient: &RecipientId, fingerprint: &Fingerprint);

    /// Stop routing every fingerprint of `recipient`
    fn delete_all_fingerprints_for(&self, recipient: &RecipientId);

    /// Current health
    fn is_healthy(&self) -> bool;

    /// Subscribe to health changes; dropping the receiver unsubscribes
    fn health_watch(&self) -> watch::Receiver<bool>;
}
