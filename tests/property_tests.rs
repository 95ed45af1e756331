//! Property-based tests for shardcast
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Partitioning Properties
// ============================================================================

mod partition_properties {
    use super::*;
    use shardcast_files::Partitioner;

    proptest! {
        /// Joining the parts of a file yields the file
        #[test]
        fn partition_join_roundtrip(
            file in prop::collection::vec(any::<u8>(), 0..4096),
            part_size in 1usize..512,
        ) {
            let partitioner = Partitioner::new(part_size).unwrap();
            let parts = partitioner.partition(&file);

            prop_assert_eq!(parts.len(), partitioner.part_count(file.len()));
            prop_assert!(parts.iter().all(|p| p.len() == part_size));
            prop_assert_eq!(partitioner.join(&parts, file.len()), file);
        }
    }
}

// ============================================================================
// Cypher Pool Properties
// ============================================================================

mod cypher_properties {
    use super::*;
    use shardcast_core::{CypherManager, TransferError, calc_num_fingerprints};
    use shardcast_crypto::TransferKey;
    use std::collections::HashSet;

    proptest! {
        /// The pool covers every part plus the retry allowance, truncated
        #[test]
        fn fingerprint_count(num_parts in 1u16..2000, retry in 0.0f32..3.0) {
            let count = calc_num_fingerprints(num_parts, retry);
            let exact = f64::from(num_parts) * (1.0 + f64::from(retry));

            prop_assert!(count >= usize::from(num_parts));
            prop_assert!((count as f64) <= exact + 1e-3);
            prop_assert!((count as f64) > exact - 1.0 - 1e-3);
        }

        /// Every pop yields a fresh fingerprint until the pool runs dry
        #[test]
        fn cypher_uniqueness(key in any::<[u8; 32]>(), size in 1u16..200) {
            let mut manager = CypherManager::new(TransferKey::from_bytes(key), size);
            let mut seen = HashSet::new();

            for _ in 0..size {
                let cypher = manager.pop_cypher().unwrap();
                prop_assert!(seen.insert(cypher.fingerprint()));
            }
            prop_assert!(matches!(
                manager.pop_cypher(),
                Err(TransferError::FingerprintsExhausted)
            ));
            prop_assert!(manager.unused_cyphers().is_empty());
        }
    }
}

// ============================================================================
// Part State Machine Properties
// ============================================================================

mod state_properties {
    use super::*;
    use shardcast_core::{PartStatus, PartStatusVector};

    fn status() -> impl Strategy<Value = PartStatus> {
        prop_oneof![
            Just(PartStatus::Unsent),
            Just(PartStatus::Sent),
            Just(PartStatus::Received),
        ]
    }

    proptest! {
        /// Random transitions follow the table and `Received` is absorbing
        #[test]
        fn transitions_follow_table(
            num_parts in 1u16..32,
            ops in prop::collection::vec((any::<u16>(), status()), 0..200),
        ) {
            let mut vector = PartStatusVector::new(num_parts);
            let mut model = vec![PartStatus::Unsent; usize::from(num_parts)];

            for (part, to) in ops {
                let part = part % num_parts;
                let from = model[usize::from(part)];
                let changed = vector.transition(part, to).unwrap();

                prop_assert_eq!(changed, from.can_transition(to));
                if changed {
                    model[usize::from(part)] = to;
                }
                if from == PartStatus::Received {
                    prop_assert!(!changed);
                }
                prop_assert_eq!(vector.status(part), Some(model[usize::from(part)]));
            }

            let received = model.iter().filter(|s| **s == PartStatus::Received).count();
            let sent = model.iter().filter(|s| **s == PartStatus::Sent).count();
            prop_assert_eq!(usize::from(vector.num_received()), received);
            prop_assert_eq!(usize::from(vector.num_sent()), sent);
            prop_assert_eq!(vector.is_complete(), received == usize::from(num_parts));
        }

        /// Out-of-range parts are rejected
        #[test]
        fn out_of_range_rejected(num_parts in 1u16..64, extra in 0u16..64, to in status()) {
            let mut vector = PartStatusVector::new(num_parts);
            prop_assert!(vector.transition(num_parts + extra, to).is_err());
        }
    }
}

// ============================================================================
// Transfer Store Properties
// ============================================================================

mod store_properties {
    use super::*;
    use shardcast_core::{MemoryKvStore, ReceivedTransferStore, SentTransferStore, TransferInfo};
    use shardcast_crypto::{TransferKey, TransferMac};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn info(num_parts: u16) -> TransferInfo {
        TransferInfo {
            recipient: [1u8; 32],
            file_id: [2u8; 32],
            file_name: "prop.bin".to_string(),
            file_type: "bin".to_string(),
            key: TransferKey::from_bytes([3u8; 32]),
            mac: TransferMac([0u8; 32]),
            num_parts,
            size: u32::from(num_parts) * 4,
            retry: 1.0,
            preview: Vec::new(),
        }
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        /// Repeated deliveries never double count
        #[test]
        fn idempotent_receive(
            num_parts in 1u16..24,
            deliveries in prop::collection::vec(any::<u16>(), 0..80),
        ) {
            let (received, distinct, complete) = runtime().block_on(async {
                let store = ReceivedTransferStore::load(Arc::new(MemoryKvStore::new()))
                    .await
                    .unwrap();
                let transfer = store.add_transfer([9u8; 32], info(num_parts)).await.unwrap();

                let mut distinct = HashSet::new();
                for (cypher, part) in deliveries.iter().enumerate() {
                    let part = part % num_parts;
                    let cypher = (cypher % (usize::from(num_parts) * 2)) as u16;
                    let added = transfer.add_part(cypher, part, vec![part as u8; 4]).await.unwrap();
                    assert_eq!(added, distinct.insert(part));
                }
                (transfer.num_received().await, distinct.len(), transfer.is_complete().await)
            });

            prop_assert_eq!(usize::from(received), distinct);
            prop_assert_eq!(complete, distinct == usize::from(num_parts));
        }

        /// Completion is reported by exactly one confirmation
        #[test]
        fn completion_reported_once(
            num_parts in 1u16..24,
            acks in prop::collection::vec(prop::collection::vec(any::<u16>(), 1..6), 1..40),
        ) {
            let (completions, all_acked, status_complete) = runtime().block_on(async {
                let store = SentTransferStore::load(Arc::new(MemoryKvStore::new()))
                    .await
                    .unwrap();
                let parts = vec![vec![0u8; 4]; usize::from(num_parts)];
                let transfer = store
                    .add_transfer([8u8; 32], info(num_parts), parts)
                    .await
                    .unwrap();

                let mut acked = HashSet::new();
                let mut completions = 0;
                for batch in acks {
                    let batch: Vec<u16> = batch.into_iter().map(|p| p % num_parts).collect();
                    acked.extend(batch.iter().copied());
                    if transfer.mark_received(&batch).await.unwrap() {
                        completions += 1;
                        assert_eq!(acked.len(), usize::from(num_parts));
                    }
                }
                let status = transfer.status().await;
                (
                    completions,
                    acked.len() == usize::from(num_parts),
                    status == shardcast_core::TransferStatus::Completed,
                )
            });

            prop_assert_eq!(completions, usize::from(all_acked));
            prop_assert_eq!(status_complete, all_acked);
        }
    }
}
