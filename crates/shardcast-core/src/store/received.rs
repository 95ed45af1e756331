//! Incoming transfers

use super::{decode_tid, transfer_key};
use crate::BoxFuture;
use crate::callbacks::ProgressReporter;
use crate::cypher::CypherManager;
use crate::error::{Result, TransferError};
use crate::info::TransferInfo;
use crate::progress::{ReceivedPartTracker, ReceivedProgress};
use crate::status::PartBitmap;
use crate::storage::{KvStore, load_json, save_json};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shardcast_crypto::{Cypher, RecipientId, TransferId};
use shardcast_files::Partitioner;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const PREFIX: &str = "received";
const LIST_KEY: &str = "received/transfers";

#[derive(Serialize, Deserialize)]
struct ReceivedStateRecord {
    received: PartBitmap,
    cyphers_used: PartBitmap,
}

struct ReceivedState {
    received: PartBitmap,
    cyphers: CypherManager,
    parts: Vec<Option<Vec<u8>>>,
    callback_fps: HashMap<u64, String>,
}

impl ReceivedState {
    fn record(&self) -> ReceivedStateRecord {
        ReceivedStateRecord {
            received: self.received.clone(),
            cyphers_used: self.cyphers.used().clone(),
        }
    }

    fn progress(&self) -> ReceivedProgress {
        ReceivedProgress {
            completed: self.received.is_complete(),
            received: self.received.count(),
            total: self.received.num_parts(),
            parts: ReceivedPartTracker::new(self.received.clone()),
            error: None,
        }
    }
}

/// One incoming transfer
pub struct ReceivedTransfer {
    tid: TransferId,
    info: TransferInfo,
    state: Mutex<ReceivedState>,
    kv: Arc<dyn KvStore>,
}

impl ReceivedTransfer {
    /// Transfer ID
    #[must_use]
    pub fn tid(&self) -> TransferId {
        self.tid
    }

    /// Announcement this transfer was created from
    #[must_use]
    pub fn info(&self) -> &TransferInfo {
        &self.info
    }

    /// Identity whose fingerprints receive the parts
    #[must_use]
    pub fn recipient(&self) -> RecipientId {
        self.info.recipient
    }

    /// Number of parts
    #[must_use]
    pub fn num_parts(&self) -> u16 {
        self.info.num_parts
    }

    /// Parts received so far
    pub async fn num_received(&self) -> u16 {
        self.state.lock().await.received.count()
    }

    /// Every part received
    pub async fn is_complete(&self) -> bool {
        self.state.lock().await.received.is_complete()
    }

    /// Current progress
    pub async fn progress(&self) -> ReceivedProgress {
        self.state.lock().await.progress()
    }

    /// Cyphers whose fingerprints have not matched a message yet
    pub async fn unused_cyphers(&self) -> Vec<Cypher> {
        self.state.lock().await.cyphers.unused_cyphers()
    }

    /// Record that the cypher at `index` matched a message that could not be
    /// used
    ///
    /// # Errors
    ///
    /// Returns an error if `index` is outside the pool or persisting fails.
    pub async fn mark_cypher_used(&self, index: u16) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.cyphers.mark_used(index)? {
            self.save_state(&state).await?;
        }
        Ok(())
    }

    /// Store one decrypted part that arrived on the cypher at `cypher_index`.
    ///
    /// Returns false if the part had already been received, which is not an
    /// error because the network does not deduplicate.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::PartOutOfRange` if `part_num` is beyond the
    /// part count. The cypher is recorded as used either way.
    pub async fn add_part(&self, cypher_index: u16, part_num: u16, data: Vec<u8>) -> Result<bool> {
        let mut state = self.state.lock().await;
        let cypher_changed = state.cyphers.mark_used(cypher_index)?;

        if part_num >= self.info.num_parts {
            if cypher_changed {
                self.save_state(&state).await?;
            }
            return Err(TransferError::PartOutOfRange {
                part_num,
                num_parts: self.info.num_parts,
            });
        }

        if state.received.is_set(part_num) {
            if cypher_changed {
                self.save_state(&state).await?;
            }
            return Ok(false);
        }

        // Part data is written before the bitmap that references it
        self.kv
            .set(&self.part_key(part_num), data.clone())
            .await?;
        state.parts[usize::from(part_num)] = Some(data);
        state.received.set(part_num)?;
        self.save_state(&state).await?;

        tracing::trace!(
            "Transfer {} received part {} ({}/{})",
            hex::encode(&self.tid[..8]),
            part_num,
            state.received.count(),
            self.info.num_parts
        );
        Ok(true)
    }

    /// Reassemble the file.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::Incomplete` while parts are missing.
    pub async fn file(&self) -> Result<Vec<u8>> {
        let state = self.state.lock().await;
        let total = self.info.num_parts;
        if !state.received.is_complete() {
            return Err(TransferError::Incomplete {
                missing: total - state.received.count(),
                total,
            });
        }

        let parts = state
            .parts
            .iter()
            .map(|p| p.as_deref().ok_or(TransferError::invalid_state("received part missing")))
            .collect::<Result<Vec<&[u8]>>>()?;
        let part_size = parts.first().map_or(1, |p| p.len().max(1));
        Ok(Partitioner::new(part_size)?.join(&parts, self.info.size as usize))
    }

    fn part_key(&self, part_num: u16) -> String {
        transfer_key(PREFIX, &self.tid, &format!("part/{part_num}"))
    }

    async fn save_state(&self, state: &ReceivedState) -> Result<()> {
        save_json(
            self.kv.as_ref(),
            &transfer_key(PREFIX, &self.tid, "state"),
            &state.record(),
        )
        .await
    }

    async fn create(tid: TransferId, info: TransferInfo, kv: Arc<dyn KvStore>) -> Result<Self> {
        let num_fingerprints = u16::try_from(info.num_fingerprints())
            .map_err(|_| TransferError::invalid_config("too many fingerprints for transfer"))?;

        let state = ReceivedState {
            received: PartBitmap::new(info.num_parts),
            cyphers: CypherManager::new(info.key.clone(), num_fingerprints),
            parts: vec![None; usize::from(info.num_parts)],
            callback_fps: HashMap::new(),
        };
        let transfer = Self {
            tid,
            info,
            state: Mutex::new(state),
            kv,
        };

        save_json(
            transfer.kv.as_ref(),
            &transfer_key(PREFIX, &tid, "info"),
            &transfer.info,
        )
        .await?;
        transfer.save_state(&*transfer.state.lock().await).await?;
        Ok(transfer)
    }

    async fn load(tid: TransferId, kv: Arc<dyn KvStore>) -> Result<Option<Self>> {
        let Some(info) =
            load_json::<TransferInfo>(kv.as_ref(), &transfer_key(PREFIX, &tid, "info")).await?
        else {
            return Ok(None);
        };
        let saved: ReceivedStateRecord =
            load_json(kv.as_ref(), &transfer_key(PREFIX, &tid, "state"))
                .await?
                .ok_or(TransferError::invalid_state("received transfer state missing"))?;
        if saved.received.num_parts() != info.num_parts {
            return Err(TransferError::invalid_state(
                "persisted part count does not match transfer",
            ));
        }

        let transfer = Self {
            tid,
            state: Mutex::new(ReceivedState {
                received: saved.received.clone(),
                cyphers: CypherManager::restore(info.key.clone(), saved.cyphers_used),
                parts: vec![None; usize::from(info.num_parts)],
                callback_fps: HashMap::new(),
            }),
            info,
            kv,
        };

        {
            let mut state = transfer.state.lock().await;
            for part_num in 0..transfer.info.num_parts {
                if !saved.received.is_set(part_num) {
                    continue;
                }
                let data = transfer
                    .kv
                    .get(&transfer.part_key(part_num))
                    .await?
                    .ok_or(TransferError::invalid_state("received part data missing"))?;
                state.parts[usize::from(part_num)] = Some(data);
            }
        }
        Ok(Some(transfer))
    }

    async fn delete_storage(&self) -> Result<()> {
        let received = self.state.lock().await.received.clone();
        for part_num in 0..self.info.num_parts {
            if received.is_set(part_num) {
                self.kv.delete(&self.part_key(part_num)).await?;
            }
        }
        self.kv.delete(&transfer_key(PREFIX, &self.tid, "info")).await?;
        self.kv.delete(&transfer_key(PREFIX, &self.tid, "state")).await
    }
}

impl ProgressReporter for ReceivedTransfer {
    type Progress = ReceivedProgress;

    fn tid(&self) -> TransferId {
        self.tid
    }

    fn report(&self, callback_id: u64) -> BoxFuture<'_, Option<ReceivedProgress>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let progress = state.progress();
            let fp = progress.fingerprint();
            if state.callback_fps.get(&callback_id) == Some(&fp) {
                return None;
            }
            state.callback_fps.insert(callback_id, fp);
            Some(progress)
        })
    }
}

impl std::fmt::Debug for ReceivedTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedTransfer")
            .field("tid", &hex::encode(&self.tid[..8]))
            .field("file_name", &self.info.file_name)
            .field("num_parts", &self.info.num_parts)
            .finish_non_exhaustive()
    }
}

/// Every incoming transfer
pub struct ReceivedTransferStore {
    transfers: DashMap<TransferId, Arc<ReceivedTransfer>>,
    kv: Arc<dyn KvStore>,
    list_lock: Mutex<()>,
}

impl ReceivedTransferStore {
    /// Load every persisted incoming transfer
    ///
    /// # Errors
    ///
    /// Returns an error if a listed transfer cannot be read.
    pub async fn load(kv: Arc<dyn KvStore>) -> Result<Self> {
        let transfers = DashMap::new();
        let listed: Vec<String> = load_json(kv.as_ref(), LIST_KEY).await?.unwrap_or_default();

        for encoded in listed {
            let tid = decode_tid(&encoded)?;
            match ReceivedTransfer::load(tid, Arc::clone(&kv)).await? {
                Some(transfer) => {
                    transfers.insert(tid, Arc::new(transfer));
                }
                None => tracing::warn!("Listed received transfer {} has no record", &encoded[..16]),
            }
        }

        tracing::debug!("Loaded {} received transfers", transfers.len());
        Ok(Self {
            transfers,
            kv,
            list_lock: Mutex::new(()),
        })
    }

    /// Create and persist a new transfer
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is taken or persistence fails.
    pub async fn add_transfer(&self, tid: TransferId, info: TransferInfo) -> Result<Arc<ReceivedTransfer>> {
        if self.transfers.contains_key(&tid) {
            return Err(TransferError::invalid_state("transfer ID already in use"));
        }

        let transfer = Arc::new(ReceivedTransfer::create(tid, info, Arc::clone(&self.kv)).await?);
        self.transfers.insert(tid, Arc::clone(&transfer));
        self.save_list().await?;
        Ok(transfer)
    }

    /// Look up a transfer
    ///
    /// # Errors
    ///
    /// Returns `TransferError::TransferNotFound` for an unknown ID.
    pub fn get(&self, tid: &TransferId) -> Result<Arc<ReceivedTransfer>> {
        self.transfers
            .get(tid)
            .map(|t| Arc::clone(t.value()))
            .ok_or(TransferError::TransferNotFound(*tid))
    }

    /// Remove a transfer and its persisted state
    ///
    /// # Errors
    ///
    /// Returns `TransferError::TransferNotFound` for an unknown ID.
    pub async fn remove(&self, tid: &TransferId) -> Result<Arc<ReceivedTransfer>> {
        let (_, transfer) = self
            .transfers
            .remove(tid)
            .ok_or(TransferError::TransferNotFound(*tid))?;
        self.save_list().await?;
        transfer.delete_storage().await?;
        Ok(transfer)
    }

    /// Every transfer
    #[must_use]
    pub fn all(&self) -> Vec<Arc<ReceivedTransfer>> {
        self.transfers.iter().map(|t| Arc::clone(t.value())).collect()
    }

    /// Whether any transfer other than `except` receives on `recipient`
    #[must_use]
    pub fn recipient_in_use(&self, recipient: &RecipientId, except: &TransferId) -> bool {
        self.transfers
            .iter()
            .any(|t| t.key() != except && t.value().recipient() == *recipient)
    }

    /// Number of transfers
    #[must_use]
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    async fn save_list(&self) -> Result<()> {
        let _guard = self.list_lock.lock().await;
        let mut listed: Vec<String> = self.transfers.iter().map(|t| hex::encode(t.key())).collect();
        listed.sort();
        save_json(self.kv.as_ref(), LIST_KEY, &listed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKvStore;
    use shardcast_crypto::{TransferKey, TransferMac};

    const TID: TransferId = [4u8; 32];

    fn info() -> TransferInfo {
        TransferInfo {
            recipient: [9u8; 32],
            file_id: [1u8; 32],
            file_name: "photo.jpg".to_string(),
            file_type: "jpg".to_string(),
            key: TransferKey::from_bytes([0x44; 32]),
            mac: TransferMac([0u8; 32]),
            num_parts: 3,
            size: 25,
            retry: 1.0,
            preview: Vec::new(),
        }
    }

    async fn store_with_transfer() -> (Arc<MemoryKvStore>, ReceivedTransferStore, Arc<ReceivedTransfer>) {
        let kv = Arc::new(MemoryKvStore::new());
        let store = ReceivedTransferStore::load(kv.clone()).await.unwrap();
        let transfer = store.add_transfer(TID, info()).await.unwrap();
        (kv, store, transfer)
    }

    #[tokio::test]
    async fn test_add_part_idempotent() {
        let (_, _, transfer) = store_with_transfer().await;

        assert!(transfer.add_part(0, 1, vec![1u8; 10]).await.unwrap());
        assert!(!transfer.add_part(1, 1, vec![1u8; 10]).await.unwrap());
        assert_eq!(transfer.num_received().await, 1);
        assert_eq!(transfer.unused_cyphers().await.len(), 4);
    }

    #[tokio::test]
    async fn test_add_part_out_of_range() {
        let (_, _, transfer) = store_with_transfer().await;

        assert!(matches!(
            transfer.add_part(2, 3, vec![0u8; 10]).await,
            Err(TransferError::PartOutOfRange {
                part_num: 3,
                num_parts: 3
            })
        ));
        assert_eq!(transfer.num_received().await, 0);
        assert_eq!(transfer.unused_cyphers().await.len(), 5);
    }

    #[tokio::test]
    async fn test_file_requires_all_parts() {
        let (_, _, transfer) = store_with_transfer().await;
        transfer.add_part(0, 0, vec![b'a'; 10]).await.unwrap();

        let err = transfer.file().await.unwrap_err();
        assert_eq!(err.to_string(), "cannot get incomplete file: missing 2 of 3 parts");

        transfer.add_part(1, 2, vec![b'c'; 10]).await.unwrap();
        transfer.add_part(2, 1, vec![b'b'; 10]).await.unwrap();
        assert!(transfer.is_complete().await);

        let file = transfer.file().await.unwrap();
        assert_eq!(file.len(), 25);
        assert_eq!(&file[..10], &[b'a'; 10]);
        assert_eq!(&file[20..], &[b'c'; 5]);
    }

    #[tokio::test]
    async fn test_reload_restores_parts() {
        let (kv, _, transfer) = store_with_transfer().await;
        transfer.add_part(0, 2, vec![5u8; 10]).await.unwrap();
        transfer.mark_cypher_used(3).await.unwrap();

        let store = ReceivedTransferStore::load(kv).await.unwrap();
        let restored = store.get(&TID).unwrap();
        assert_eq!(restored.num_received().await, 1);
        let unused: Vec<u16> = restored.unused_cyphers().await.iter().map(Cypher::index).collect();
        assert_eq!(unused, vec![1, 2, 4, 5]);
        assert_eq!(restored.info(), transfer.info());
    }

    #[tokio::test]
    async fn test_remove_deletes_parts() {
        let (kv, store, transfer) = store_with_transfer().await;
        transfer.add_part(0, 0, vec![5u8; 10]).await.unwrap();
        assert_eq!(kv.len(), 4);

        store.remove(&TID).await.unwrap();
        assert_eq!(kv.keys(), vec!["received/transfers".to_string()]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_recipient_in_use() {
        let (_, store, _) = store_with_transfer().await;
        assert!(!store.recipient_in_use(&[9u8; 32], &TID));

        store.add_transfer([5u8; 32], info()).await.unwrap();
        assert!(store.recipient_in_use(&[9u8; 32], &TID));
        assert!(!store.recipient_in_use(&[8u8; 32], &TID));
    }

    #[tokio::test]
    async fn test_progress_dedup() {
        let (_, _, transfer) = store_with_transfer().await;
        let first = transfer.report(7).await.unwrap();
        assert_eq!(first.received, 0);
        assert!(transfer.report(7).await.is_none());

        transfer.add_part(0, 0, vec![0u8; 10]).await.unwrap();
        let second = transfer.report(7).await.unwrap();
        assert_eq!(second.received, 1);
        assert!(!second.completed);
    }
}
