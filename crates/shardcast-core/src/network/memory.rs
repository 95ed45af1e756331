//! In-process network
//!
//! [`MemoryNetwork`] resolves every round immediately and dispatches
//! messages to fingerprint processors registered on the same instance, so a
//! sender and a receiver sharing one network exchange files without any
//! transport. Failure knobs let tests fail rounds, fail send calls, drop
//! messages inside successful rounds and toggle health.

use super::{IncomingMessage, MessageProcessor, Network, RoundId, RoundResult, TargetedMessage};
use crate::BoxFuture;
use crate::error::{Result, TransferError};
use dashmap::DashMap;
use shardcast_crypto::{Fingerprint, RecipientId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

/// In-process mix network
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<MemoryNetworkInner>,
}

struct MemoryNetworkInner {
    max_message_length: usize,
    next_round: AtomicU64,
    rounds: DashMap<RoundId, bool>,
    fingerprints: DashMap<(RecipientId, Fingerprint), Arc<dyn MessageProcessor>>,
    health: watch::Sender<bool>,
    deliver: AtomicBool,
    outbox: Mutex<Vec<IncomingMessage>>,
    fail_rounds: AtomicUsize,
    fail_sends: AtomicUsize,
    drop_messages: AtomicUsize,
    messages_sent: AtomicUsize,
    messages_dropped: AtomicUsize,
}

/// Decrement `counter` if positive; true if it was
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryNetwork {
    /// Healthy network delivering messages of up to `max_message_length` bytes
    #[must_use]
    pub fn new(max_message_length: usize) -> Self {
        let (health, _) = watch::channel(true);
        Self {
            inner: Arc::new(MemoryNetworkInner {
                max_message_length,
                next_round: AtomicU64::new(1),
                rounds: DashMap::new(),
                fingerprints: DashMap::new(),
                health,
                deliver: AtomicBool::new(true),
                outbox: Mutex::new(Vec::new()),
                fail_rounds: AtomicUsize::new(0),
                fail_sends: AtomicUsize::new(0),
                drop_messages: AtomicUsize::new(0),
                messages_sent: AtomicUsize::new(0),
                messages_dropped: AtomicUsize::new(0),
            }),
        }
    }

    /// Change health, notifying watchers
    pub fn set_healthy(&self, healthy: bool) {
        self.inner.health.send_replace(healthy);
    }

    /// When disabled, messages of successful rounds are held in an outbox
    /// instead of being dispatched
    pub fn set_delivery(&self, enabled: bool) {
        self.inner.deliver.store(enabled, Ordering::Release);
    }

    /// Fail the next `n` rounds
    pub fn fail_next_rounds(&self, n: usize) {
        self.inner.fail_rounds.store(n, Ordering::Release);
    }

    /// Make the next `n` `send_many` calls return an error
    pub fn fail_next_sends(&self, n: usize) {
        self.inner.fail_sends.store(n, Ordering::Release);
    }

    /// Silently lose the next `n` messages of successful rounds
    pub fn drop_next_messages(&self, n: usize) {
        self.inner.drop_messages.store(n, Ordering::Release);
    }

    /// Messages accepted by successful rounds
    #[must_use]
    pub fn messages_sent(&self) -> usize {
        self.inner.messages_sent.load(Ordering::Acquire)
    }

    /// Messages lost by `drop_next_messages`
    #[must_use]
    pub fn messages_dropped(&self) -> usize {
        self.inner.messages_dropped.load(Ordering::Acquire)
    }

    /// Registered fingerprints across all recipients
    #[must_use]
    pub fn num_fingerprints(&self) -> usize {
        self.inner.fingerprints.len()
    }

    /// Whether `(recipient, fingerprint)` is registered
    #[must_use]
    pub fn has_fingerprint(&self, recipient: &RecipientId, fingerprint: &Fingerprint) -> bool {
        self.inner
            .fingerprints
            .contains_key(&(*recipient, *fingerprint))
    }

    /// Drain messages held while delivery was disabled
    pub async fn take_outbox(&self) -> Vec<IncomingMessage> {
        std::mem::take(&mut *self.inner.outbox.lock().await)
    }

    /// Dispatch one message to its processor and wait for it to finish.
    ///
    /// Returns false if no processor is registered for the fingerprint.
    pub async fn deliver(&self, message: IncomingMessage) -> bool {
        let Some((_, processor)) = self
            .inner
            .fingerprints
            .remove(&(message.recipient, message.fingerprint))
        else {
            tracing::trace!(fingerprint = %message.fingerprint, "No processor for fingerprint");
            return false;
        };

        processor.process(message).await;
        true
    }

    fn dispatch(&self, message: IncomingMessage) {
        let network = self.clone();
        tokio::spawn(async move {
            network.deliver(message).await;
        });
    }
}

impl Network for MemoryNetwork {
    fn max_message_length(&self) -> usize {
        self.inner.max_message_length
    }

    fn send_many(
        &self,
        messages: Vec<TargetedMessage>,
        _timeout: Duration,
    ) -> BoxFuture<'_, Result<RoundId>> {
        Box::pin(async move {
            if take_one(&self.inner.fail_sends) {
                return Err(TransferError::network("send_many failed"));
            }
            if let Some(message) = messages
                .iter()
                .find(|m| m.payload.len() > self.inner.max_message_length)
            {
                return Err(TransferError::Network(
                    format!("message of {} bytes exceeds maximum", message.payload.len()).into(),
                ));
            }

            let round = self.inner.next_round.fetch_add(1, Ordering::AcqRel);
            let succeeded = !take_one(&self.inner.fail_rounds);
            self.inner.rounds.insert(round, succeeded);

            if !succeeded {
                tracing::debug!(round, count = messages.len(), "Round failed");
                return Ok(round);
            }

            let deliver = self.inner.deliver.load(Ordering::Acquire);
            for message in messages {
                self.inner.messages_sent.fetch_add(1, Ordering::AcqRel);
                if take_one(&self.inner.drop_messages) {
                    self.inner.messages_dropped.fetch_add(1, Ordering::AcqRel);
                    continue;
                }

                let incoming = IncomingMessage::from_targeted(message, round);
                if deliver {
                    self.dispatch(incoming);
                } else {
                    self.inner.outbox.lock().await.push(incoming);
                }
            }
            Ok(round)
        })
    }

    fn round_results(&self, round: RoundId, _timeout: Duration) -> BoxFuture<'_, Result<RoundResult>> {
        Box::pin(async move {
            let (_, succeeded) = self
                .inner
                .rounds
                .remove(&round)
                .ok_or(TransferError::Timeout("unknown round".into()))?;

            Ok(RoundResult {
                succeeded,
                completed_at: Instant::now(),
            })
        })
    }

    fn add_fingerprint(
        &self,
        recipient: RecipientId,
        fingerprint: Fingerprint,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<()> {
        self.inner
            .fingerprints
            .insert((recipient, fingerprint), processor);
        Ok(())
    }

    fn delete_fingerprint(&self, recipient: &RecipientId, fingerprint: &Fingerprint) {
        self.inner.fingerprints.remove(&(*recipient, *fingerprint));
    }

    fn delete_all_fingerprints_for(&self, recipient: &RecipientId) {
        self.inner.fingerprints.retain(|(r, _), _| r != recipient);
    }

    fn is_healthy(&self) -> bool {
        *self.inner.health.borrow()
    }

    fn health_watch(&self) -> watch::Receiver<bool> {
        self.inner.health.subscribe()
    }
}
