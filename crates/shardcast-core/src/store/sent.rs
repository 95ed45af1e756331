//! Outgoing transfers

use super::{decode_tid, transfer_key};
use crate::BoxFuture;
use crate::callbacks::ProgressReporter;
use crate::cypher::CypherManager;
use crate::error::{Result, TransferError};
use crate::info::TransferInfo;
use crate::progress::{SentPartTracker, SentProgress};
use crate::status::{PartBitmap, PartStatus, PartStatusVector, TransferStatus};
use crate::storage::{KvStore, load_json, save_json};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shardcast_crypto::{EncryptedPart, RecipientId, TransferId};
use shardcast_files::PartMessage;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const PREFIX: &str = "sent";
const LIST_KEY: &str = "sent/transfers";

/// Immutable part of an outgoing transfer
#[derive(Serialize, Deserialize)]
struct SentRecord {
    info: TransferInfo,
    #[serde(with = "super::base64_parts")]
    parts: Vec<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct SentStateRecord {
    status: TransferStatus,
    part_status: PartStatusVector,
    cyphers_used: PartBitmap,
}

struct SentState {
    status: TransferStatus,
    parts: PartStatusVector,
    cyphers: CypherManager,
    callback_fps: HashMap<u64, String>,
}

impl SentState {
    fn record(&self) -> SentStateRecord {
        SentStateRecord {
            status: self.status,
            part_status: self.parts.clone(),
            cyphers_used: self.cyphers.used().clone(),
        }
    }

    fn progress(&self) -> SentProgress {
        SentProgress {
            completed: self.status == TransferStatus::Completed,
            sent: self.parts.num_sent(),
            received: self.parts.num_received(),
            total: self.parts.num_parts(),
            parts: SentPartTracker::new(self.parts.clone()),
            error: (self.status == TransferStatus::Failed).then_some(TransferError::OutOfRetries),
        }
    }

    fn compare_and_swap_callback_fp(&mut self, callback_id: u64, fp: String) -> bool {
        if self.callback_fps.get(&callback_id) == Some(&fp) {
            return false;
        }
        self.callback_fps.insert(callback_id, fp);
        true
    }
}

/// One outgoing transfer
pub struct SentTransfer {
    tid: TransferId,
    record: SentRecord,
    state: Mutex<SentState>,
    kv: Arc<dyn KvStore>,
}

impl SentTransfer {
    /// Transfer ID
    #[must_use]
    pub fn tid(&self) -> TransferId {
        self.tid
    }

    /// Identity the parts are sent to
    #[must_use]
    pub fn recipient(&self) -> RecipientId {
        self.record.info.recipient
    }

    /// File name
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.record.info.file_name
    }

    /// Number of parts
    #[must_use]
    pub fn num_parts(&self) -> u16 {
        self.record.info.num_parts
    }

    /// File size in bytes
    #[must_use]
    pub fn file_size(&self) -> u32 {
        self.record.info.size
    }

    /// Announcement the recipient needs to receive this transfer
    #[must_use]
    pub fn info(&self) -> &TransferInfo {
        &self.record.info
    }

    /// Padded data of one part
    #[must_use]
    pub fn part(&self, part_num: u16) -> Option<&[u8]> {
        self.record.parts.get(usize::from(part_num)).map(Vec::as_slice)
    }

    /// Current status
    pub async fn status(&self) -> TransferStatus {
        self.state.lock().await.status
    }

    /// Current status of one part
    pub async fn part_status(&self, part_num: u16) -> Option<PartStatus> {
        self.state.lock().await.parts.status(part_num)
    }

    /// Part numbers currently in `status`
    pub async fn parts_with(&self, status: PartStatus) -> Vec<u16> {
        self.state.lock().await.parts.parts_with(status)
    }

    /// Cyphers left in the pool
    pub async fn num_unused_cyphers(&self) -> u16 {
        self.state.lock().await.cyphers.num_unused()
    }

    /// Current progress
    pub async fn progress(&self) -> SentProgress {
        self.state.lock().await.progress()
    }

    /// Frame and encrypt one part with a fresh cypher.
    ///
    /// The consumed cypher is persisted before the ciphertext is returned.
    /// Returns `None` when the part no longer needs sending, because it is
    /// not `Unsent` or the transfer is no longer running.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::FingerprintsExhausted` when the cypher pool is
    /// empty; the transfer is marked `Failed` first.
    pub async fn encrypted_part(
        &self,
        part_num: u16,
        max_payload: usize,
    ) -> Result<Option<EncryptedPart>> {
        let data = self.part(part_num).ok_or(TransferError::PartOutOfRange {
            part_num,
            num_parts: self.num_parts(),
        })?;
        let message = PartMessage::encode(part_num, data, max_payload)?;

        let mut state = self.state.lock().await;
        if state.status != TransferStatus::Running
            || state.parts.status(part_num) != Some(PartStatus::Unsent)
        {
            return Ok(None);
        }

        let cypher = match state.cyphers.pop_cypher() {
            Ok(cypher) => cypher,
            Err(err) => {
                state.status = TransferStatus::Failed;
                self.save_state(&state).await?;
                tracing::warn!(
                    "Transfer {} failed: cypher pool exhausted at part {}",
                    hex::encode(&self.tid[..8]),
                    part_num
                );
                return Err(err);
            }
        };
        self.save_state(&state).await?;
        drop(state);

        Ok(Some(cypher.encrypt(&message)?))
    }

    /// Move parts `Unsent → Sent`; returns how many changed
    ///
    /// # Errors
    ///
    /// Returns `TransferError::PartOutOfRange` for an unknown part, leaving
    /// the vector unchanged.
    pub async fn mark_sent(&self, part_nums: &[u16]) -> Result<usize> {
        let changed = self.transition_all(part_nums, PartStatus::Sent).await?;
        Ok(changed.len())
    }

    /// Move parts to `Received`.
    ///
    /// Returns true if this call completed the transfer. Completion is
    /// decided under the same lock that updates the vector, so it is
    /// reported exactly once.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::PartOutOfRange` for an unknown part, leaving
    /// the vector unchanged.
    pub async fn mark_received(&self, part_nums: &[u16]) -> Result<bool> {
        let mut state = self.state.lock().await;
        Self::check_range(&state, part_nums)?;

        for &part_num in part_nums {
            state.parts.transition(part_num, PartStatus::Received)?;
        }

        let completed =
            state.status == TransferStatus::Running && state.parts.is_complete();
        if completed {
            state.status = TransferStatus::Completed;
            tracing::info!(
                "Transfer {} completed ({} parts)",
                hex::encode(&self.tid[..8]),
                self.num_parts()
            );
        }
        self.save_state(&state).await?;
        Ok(completed)
    }

    /// Move parts `Sent → Unsent`; returns the parts that changed and so
    /// need to be queued again
    ///
    /// # Errors
    ///
    /// Returns `TransferError::PartOutOfRange` for an unknown part, leaving
    /// the vector unchanged.
    pub async fn mark_for_resend(&self, part_nums: &[u16]) -> Result<Vec<u16>> {
        self.transition_all(part_nums, PartStatus::Unsent).await
    }

    async fn transition_all(&self, part_nums: &[u16], to: PartStatus) -> Result<Vec<u16>> {
        let mut state = self.state.lock().await;
        Self::check_range(&state, part_nums)?;

        let mut changed = Vec::new();
        for &part_num in part_nums {
            if state.parts.transition(part_num, to)? {
                changed.push(part_num);
            }
        }
        if !changed.is_empty() {
            self.save_state(&state).await?;
        }
        Ok(changed)
    }

    fn check_range(state: &SentState, part_nums: &[u16]) -> Result<()> {
        let num_parts = state.parts.num_parts();
        match part_nums.iter().find(|p| **p >= num_parts) {
            Some(&part_num) => Err(TransferError::PartOutOfRange {
                part_num,
                num_parts,
            }),
            None => Ok(()),
        }
    }

    async fn save_state(&self, state: &SentState) -> Result<()> {
        save_json(
            self.kv.as_ref(),
            &transfer_key(PREFIX, &self.tid, "state"),
            &state.record(),
        )
        .await
    }

    async fn create(
        tid: TransferId,
        info: TransferInfo,
        parts: Vec<Vec<u8>>,
        kv: Arc<dyn KvStore>,
    ) -> Result<Self> {
        let num_fingerprints = u16::try_from(info.num_fingerprints())
            .map_err(|_| TransferError::invalid_config("too many fingerprints for transfer"))?;
        if parts.len() != usize::from(info.num_parts) {
            return Err(TransferError::invalid_state("part count does not match info"));
        }

        let state = SentState {
            status: TransferStatus::Running,
            parts: PartStatusVector::new(info.num_parts),
            cyphers: CypherManager::new(info.key.clone(), num_fingerprints),
            callback_fps: HashMap::new(),
        };
        let transfer = Self {
            tid,
            record: SentRecord { info, parts },
            state: Mutex::new(state),
            kv,
        };

        save_json(
            transfer.kv.as_ref(),
            &transfer_key(PREFIX, &tid, "info"),
            &transfer.record,
        )
        .await?;
        transfer.save_state(&*transfer.state.lock().await).await?;
        Ok(transfer)
    }

    async fn load(tid: TransferId, kv: Arc<dyn KvStore>) -> Result<Option<Self>> {
        let Some(record) =
            load_json::<SentRecord>(kv.as_ref(), &transfer_key(PREFIX, &tid, "info")).await?
        else {
            return Ok(None);
        };
        let saved: SentStateRecord =
            load_json(kv.as_ref(), &transfer_key(PREFIX, &tid, "state"))
                .await?
                .ok_or(TransferError::invalid_state("sent transfer state missing"))?;

        if saved.part_status.num_parts() != record.info.num_parts
            || record.parts.len() != usize::from(record.info.num_parts)
        {
            return Err(TransferError::invalid_state(
                "persisted part count does not match transfer",
            ));
        }

        let state = SentState {
            status: saved.status,
            parts: saved.part_status,
            cyphers: CypherManager::restore(record.info.key.clone(), saved.cyphers_used),
            callback_fps: HashMap::new(),
        };
        Ok(Some(Self {
            tid,
            record,
            state: Mutex::new(state),
            kv,
        }))
    }

    async fn delete_storage(&self) -> Result<()> {
        self.kv.delete(&transfer_key(PREFIX, &self.tid, "info")).await?;
        self.kv.delete(&transfer_key(PREFIX, &self.tid, "state")).await
    }
}

impl ProgressReporter for SentTransfer {
    type Progress = SentProgress;

    fn tid(&self) -> TransferId {
        self.tid
    }

    fn report(&self, callback_id: u64) -> BoxFuture<'_, Option<SentProgress>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let progress = state.progress();
            state
                .compare_and_swap_callback_fp(callback_id, progress.fingerprint())
                .then_some(progress)
        })
    }
}

impl std::fmt::Debug for SentTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SentTransfer")
            .field("tid", &hex::encode(&self.tid[..8]))
            .field("file_name", &self.record.info.file_name)
            .field("num_parts", &self.record.info.num_parts)
            .finish_non_exhaustive()
    }
}

/// Every outgoing transfer
pub struct SentTransferStore {
    transfers: DashMap<TransferId, Arc<SentTransfer>>,
    kv: Arc<dyn KvStore>,
    list_lock: Mutex<()>,
}

impl SentTransferStore {
    /// Load every persisted outgoing transfer
    ///
    /// # Errors
    ///
    /// Returns an error if a listed transfer cannot be read.
    pub async fn load(kv: Arc<dyn KvStore>) -> Result<Self> {
        let transfers = DashMap::new();
        let listed: Vec<String> = load_json(kv.as_ref(), LIST_KEY).await?.unwrap_or_default();

        for encoded in listed {
            let tid = decode_tid(&encoded)?;
            match SentTransfer::load(tid, Arc::clone(&kv)).await? {
                Some(transfer) => {
                    transfers.insert(tid, Arc::new(transfer));
                }
                None => tracing::warn!("Listed sent transfer {} has no record", &encoded[..16]),
            }
        }

        tracing::debug!("Loaded {} sent transfers", transfers.len());
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
    pub async fn add_transfer(
        &self,
        tid: TransferId,
        info: TransferInfo,
        parts: Vec<Vec<u8>>,
    ) -> Result<Arc<SentTransfer>> {
        if self.transfers.contains_key(&tid) {
            return Err(TransferError::invalid_state("transfer ID already in use"));
        }

        let transfer = Arc::new(SentTransfer::create(tid, info, parts, Arc::clone(&self.kv)).await?);
        self.transfers.insert(tid, Arc::clone(&transfer));
        self.save_list().await?;
        Ok(transfer)
    }

    /// Look up a transfer
    ///
    /// # Errors
    ///
    /// Returns `TransferError::TransferNotFound` for an unknown ID.
    pub fn get(&self, tid: &TransferId) -> Result<Arc<SentTransfer>> {
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
    pub async fn remove(&self, tid: &TransferId) -> Result<Arc<SentTransfer>> {
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
    pub fn all(&self) -> Vec<Arc<SentTransfer>> {
        self.transfers.iter().map(|t| Arc::clone(t.value())).collect()
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
    use shardcast_crypto::{Cypher, TransferKey, TransferMac};
    use shardcast_files::Partitioner;

    fn info(num_parts: u16, retry: f32) -> TransferInfo {
        TransferInfo {
            recipient: [9u8; 32],
            file_id: [1u8; 32],
            file_name: "file.bin".to_string(),
            file_type: "bin".to_string(),
            key: TransferKey::from_bytes([0x33; 32]),
            mac: TransferMac([0u8; 32]),
            num_parts,
            size: u32::from(num_parts) * 100,
            retry,
            preview: Vec::new(),
        }
    }

    async fn store_with_transfer(retry: f32) -> (Arc<MemoryKvStore>, SentTransferStore, Arc<SentTransfer>) {
        let kv = Arc::new(MemoryKvStore::new());
        let store = SentTransferStore::load(kv.clone()).await.unwrap();
        let parts = Partitioner::new(100).unwrap().partition(&[7u8; 1000]);
        let transfer = store
            .add_transfer([2u8; 32], info(10, retry), parts)
            .await
            .unwrap();
        (kv, store, transfer)
    }

    #[tokio::test]
    async fn test_new_transfer_layout() {
        let (kv, store, transfer) = store_with_transfer(0.5).await;

        assert_eq!(transfer.num_parts(), 10);
        assert_eq!(transfer.num_unused_cyphers().await, 15);
        assert_eq!(transfer.status().await, TransferStatus::Running);
        assert_eq!(transfer.parts_with(PartStatus::Unsent).await.len(), 10);
        assert_eq!(store.len(), 1);

        let keys = kv.keys();
        assert!(keys.contains(&"sent/transfers".to_string()));
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn test_encrypted_part_decrypts() {
        let (_, _, transfer) = store_with_transfer(0.5).await;

        let encrypted = transfer.encrypted_part(3, 102).await.unwrap().unwrap();
        assert_eq!(encrypted.ciphertext.len(), 102);

        let cypher = Cypher::new(&TransferKey::from_bytes([0x33; 32]), 0);
        assert_eq!(encrypted.fingerprint, cypher.fingerprint());
        let plaintext = cypher.decrypt(&encrypted.ciphertext, &encrypted.mac).unwrap();
        let message = PartMessage::decode(&plaintext).unwrap();
        assert_eq!(message.part_num, 3);
        assert_eq!(message.part, &[7u8; 100][..]);
        assert_eq!(transfer.num_unused_cyphers().await, 14);
    }

    #[tokio::test]
    async fn test_encrypted_part_skips_non_unsent() {
        let (_, _, transfer) = store_with_transfer(0.5).await;
        transfer.mark_received(&[4]).await.unwrap();
        transfer.mark_sent(&[5]).await.unwrap();

        assert!(transfer.encrypted_part(4, 102).await.unwrap().is_none());
        assert!(transfer.encrypted_part(5, 102).await.unwrap().is_none());
        assert_eq!(transfer.num_unused_cyphers().await, 15);
    }

    #[tokio::test]
    async fn test_exhaustion_fails_transfer() {
        let (_, _, transfer) = store_with_transfer(0.0).await;
        for part in 0..10 {
            transfer.encrypted_part(part, 102).await.unwrap().unwrap();
        }
        transfer.mark_sent(&[0]).await.unwrap();
        transfer.mark_for_resend(&[0]).await.unwrap();

        assert!(matches!(
            transfer.encrypted_part(0, 102).await,
            Err(TransferError::FingerprintsExhausted)
        ));
        assert_eq!(transfer.status().await, TransferStatus::Failed);

        let progress = transfer.progress().await;
        assert!(matches!(progress.error, Some(TransferError::OutOfRetries)));
        assert!(!progress.completed);
    }

    #[tokio::test]
    async fn test_completion_reported_once() {
        let (_, _, transfer) = store_with_transfer(0.5).await;
        let all: Vec<u16> = (0..10).collect();
        transfer.mark_sent(&all).await.unwrap();

        assert!(!transfer.mark_received(&all[..9]).await.unwrap());
        assert!(transfer.mark_received(&[9]).await.unwrap());
        assert!(!transfer.mark_received(&[9]).await.unwrap());
        assert_eq!(transfer.status().await, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn test_resend_only_moves_sent_parts() {
        let (_, _, transfer) = store_with_transfer(0.5).await;
        transfer.mark_sent(&[0, 1, 2]).await.unwrap();
        transfer.mark_received(&[1]).await.unwrap();

        let moved = transfer.mark_for_resend(&[0, 1, 2, 3]).await.unwrap();
        assert_eq!(moved, vec![0, 2]);
        assert_eq!(transfer.part_status(1).await, Some(PartStatus::Received));
        assert_eq!(transfer.part_status(3).await, Some(PartStatus::Unsent));
    }

    #[tokio::test]
    async fn test_out_of_range_rejected_atomically() {
        let (_, _, transfer) = store_with_transfer(0.5).await;
        assert!(transfer.mark_sent(&[0, 10]).await.is_err());
        assert_eq!(transfer.part_status(0).await, Some(PartStatus::Unsent));
    }

    #[tokio::test]
    async fn test_reload_restores_state() {
        let (kv, _, transfer) = store_with_transfer(0.5).await;
        transfer.encrypted_part(0, 102).await.unwrap();
        transfer.encrypted_part(1, 102).await.unwrap();
        transfer.mark_sent(&[0, 1]).await.unwrap();
        transfer.mark_received(&[1]).await.unwrap();

        let reloaded = SentTransferStore::load(kv).await.unwrap();
        let restored = reloaded.get(&[2u8; 32]).unwrap();
        assert_eq!(restored.part_status(0).await, Some(PartStatus::Sent));
        assert_eq!(restored.part_status(1).await, Some(PartStatus::Received));
        assert_eq!(restored.num_unused_cyphers().await, 13);
        assert_eq!(restored.part(9), transfer.part(9));
        assert_eq!(restored.info(), transfer.info());
    }

    #[tokio::test]
    async fn test_remove_deletes_storage() {
        let (kv, store, _) = store_with_transfer(0.5).await;
        store.remove(&[2u8; 32]).await.unwrap();

        assert!(store.get(&[2u8; 32]).is_err());
        assert!(matches!(
            store.remove(&[2u8; 32]).await,
            Err(TransferError::TransferNotFound(_))
        ));
        assert_eq!(kv.keys(), vec!["sent/transfers".to_string()]);
    }

    #[tokio::test]
    async fn test_callback_fingerprint_dedup() {
        let (_, _, transfer) = store_with_transfer(0.5).await;
        assert!(transfer.report(0).await.is_some());
        assert!(transfer.report(0).await.is_none());
        assert!(transfer.report(1).await.is_some());

        transfer.mark_sent(&[0]).await.unwrap();
        let progress = transfer.report(0).await.unwrap();
        assert_eq!(progress.sent, 1);
    }
}
