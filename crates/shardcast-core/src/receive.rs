//! Inbound part processing
//!
//! One [`PartProcessor`] is registered with the network for every unused
//! fingerprint of an incoming transfer. A matching message is decrypted with
//! the processor's cypher, unframed and stored. Messages that fail any step
//! are dropped; the network never sees an error.

use crate::BoxFuture;
use crate::callbacks::CallbackManager;
use crate::network::{IncomingMessage, MessageProcessor};
use crate::store::ReceivedTransfer;
use shardcast_crypto::Cypher;
use shardcast_files::PartMessage;
use std::sync::{Arc, Weak};

/// Handler for messages on one fingerprint of an incoming transfer
pub struct PartProcessor {
    cypher: Cypher,
    transfer: Weak<ReceivedTransfer>,
    callbacks: Arc<CallbackManager<ReceivedTransfer>>,
}

impl PartProcessor {
    /// Processor for `cypher` of `transfer`
    #[must_use]
    pub fn new(
        cypher: Cypher,
        transfer: &Arc<ReceivedTransfer>,
        callbacks: Arc<CallbackManager<ReceivedTransfer>>,
    ) -> Self {
        Self {
            cypher,
            transfer: Arc::downgrade(transfer),
            callbacks,
        }
    }

    async fn handle(&self, message: IncomingMessage) {
        let Some(transfer) = self.transfer.upgrade() else {
            tracing::debug!(
                "Dropping message on {} for removed transfer",
                message.fingerprint
            );
            return;
        };
        let tid = hex::encode(&transfer.tid()[..8]);

        let plaintext = match self.cypher.decrypt(&message.payload, &message.mac) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::warn!(
                    "Dropping undecryptable message for transfer {} on cypher {}: {}",
                    tid,
                    self.cypher.index(),
                    e
                );
                if let Err(e) = transfer.mark_cypher_used(self.cypher.index()).await {
                    tracing::error!("Failed to record used cypher for transfer {}: {}", tid, e);
                }
                return;
            }
        };

        let part = match PartMessage::decode(&plaintext) {
            Ok(part) => part,
            Err(e) => {
                tracing::warn!("Dropping malformed part message for transfer {}: {}", tid, e);
                if let Err(e) = transfer.mark_cypher_used(self.cypher.index()).await {
                    tracing::error!("Failed to record used cypher for transfer {}: {}", tid, e);
                }
                return;
            }
        };

        match transfer
            .add_part(self.cypher.index(), part.part_num, part.part.to_vec())
            .await
        {
            Ok(true) => {
                if transfer.is_complete().await {
                    tracing::info!("Transfer {} fully received", tid);
                }
                self.callbacks.call(&transfer).await;
            }
            Ok(false) => tracing::debug!(
                "Duplicate part {} for transfer {} ignored",
                part.part_num,
                tid
            ),
            Err(e) => tracing::warn!(
                "Dropping part {} for transfer {}: {}",
                part.part_num,
                tid,
                e
            ),
        }
    }
}

impl MessageProcessor for PartProcessor {
    fn process(&self, message: IncomingMessage) -> BoxFuture<'_, ()> {
        Box::pin(self.handle(message))
    }
}

impl std::fmt::Debug for PartProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartProcessor")
            .field("cypher", &self.cypher.index())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::TransferInfo;
    use crate::progress::ReceivedProgress;
    use crate::storage::MemoryKvStore;
    use crate::store::ReceivedTransferStore;
    use shardcast_crypto::{TransferKey, TransferMac};
    use std::sync::Mutex;
    use std::time::Duration;

    const KEY: [u8; 32] = [0x61; 32];
    const MAX_PAYLOAD: usize = 12;

    struct Setup {
        _store: ReceivedTransferStore,
        transfer: Arc<ReceivedTransfer>,
        callbacks: Arc<CallbackManager<ReceivedTransfer>>,
        reports: Arc<Mutex<Vec<ReceivedProgress>>>,
    }

    async fn setup() -> Setup {
        let store = ReceivedTransferStore::load(Arc::new(MemoryKvStore::new())).await.unwrap();
        let info = TransferInfo {
            recipient: [5u8; 32],
            file_id: [6u8; 32],
            file_name: "a.bin".to_string(),
            file_type: "bin".to_string(),
            key: TransferKey::from_bytes(KEY),
            mac: TransferMac([0u8; 32]),
            num_parts: 2,
            size: 15,
            retry: 0.5,
            preview: Vec::new(),
        };
        let transfer = store.add_transfer([7u8; 32], info).await.unwrap();

        let callbacks = Arc::new(CallbackManager::new());
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        callbacks
            .register(
                &transfer,
                Arc::new(move |p: &ReceivedProgress| sink.lock().unwrap().push(p.clone())),
                Duration::ZERO,
            )
            .await;

        Setup {
            _store: store,
            transfer,
            callbacks,
            reports,
        }
    }

    fn cypher(index: u16) -> Cypher {
        Cypher::new(&TransferKey::from_bytes(KEY), index)
    }

    fn message(cypher: &Cypher, part_num: u16, data: &[u8]) -> IncomingMessage {
        let plaintext = PartMessage::encode(part_num, data, MAX_PAYLOAD).unwrap();
        let encrypted = cypher.encrypt(&plaintext).unwrap();
        IncomingMessage {
            recipient: [5u8; 32],
            fingerprint: encrypted.fingerprint,
            payload: encrypted.ciphertext,
            mac: encrypted.mac,
            round: 1,
        }
    }

    #[tokio::test]
    async fn test_parts_stored_and_reported() {
        let s = setup().await;
        let first = PartProcessor::new(cypher(0), &s.transfer, Arc::clone(&s.callbacks));
        let second = PartProcessor::new(cypher(2), &s.transfer, Arc::clone(&s.callbacks));

        first.process(message(&cypher(0), 1, &[b'y'; 10])).await;
        second.process(message(&cypher(2), 0, &[b'x'; 10])).await;

        assert!(s.transfer.is_complete().await);
        let file = s.transfer.file().await.unwrap();
        assert_eq!(&file[..10], &[b'x'; 10]);
        assert_eq!(&file[10..], &[b'y'; 5]);

        let reports = s.reports.lock().unwrap();
        let received: Vec<u16> = reports.iter().map(|p| p.received).collect();
        assert_eq!(received, vec![0, 1, 2]);
        assert!(reports.last().unwrap().completed);
    }

    #[tokio::test]
    async fn test_cypher_outside_pool_rejected() {
        let s = setup().await;
        let processor = PartProcessor::new(cypher(3), &s.transfer, Arc::clone(&s.callbacks));

        processor.process(message(&cypher(3), 0, &[b'x'; 10])).await;

        assert_eq!(s.transfer.num_received().await, 0);
        assert!(!s.transfer.is_complete().await);
        assert_eq!(s.reports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_ignored() {
        let s = setup().await;
        let processor = PartProcessor::new(cypher(1), &s.transfer, Arc::clone(&s.callbacks));
        let msg = message(&cypher(1), 0, &[1u8; 10]);

        processor.process(msg.clone()).await;
        processor.process(msg).await;

        assert_eq!(s.transfer.num_received().await, 1);
        assert_eq!(s.reports.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_bad_mac_dropped() {
        let s = setup().await;
        let processor = PartProcessor::new(cypher(2), &s.transfer, Arc::clone(&s.callbacks));
        let mut msg = message(&cypher(2), 0, &[1u8; 10]);
        msg.mac[0] ^= 0xff;

        processor.process(msg).await;

        assert_eq!(s.transfer.num_received().await, 0);
        let unused: Vec<u16> = s.transfer.unused_cyphers().await.iter().map(Cypher::index).collect();
        assert!(!unused.contains(&2));
        assert_eq!(s.reports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_part_dropped() {
        let s = setup().await;
        let processor = PartProcessor::new(cypher(0), &s.transfer, Arc::clone(&s.callbacks));

        processor.process(message(&cypher(0), 9, &[1u8; 10])).await;
        assert_eq!(s.transfer.num_received().await, 0);
    }

    #[tokio::test]
    async fn test_removed_transfer_ignored() {
        let s = setup().await;
        let processor = PartProcessor::new(cypher(0), &s.transfer, Arc::clone(&s.callbacks));
        let tid = s.transfer.tid();
        drop(s.transfer);
        s._store.remove(&tid).await.unwrap();

        processor.process(message(&cypher(0), 0, &[1u8; 10])).await;
        assert_eq!(s.reports.lock().unwrap().len(), 1);
    }
}
