//! File transfer manager
//!
//! The public face of the engine. It owns both transfer stores, the
//! callback registries and, while running, the sending pipeline.

use crate::callbacks::CallbackManager;
use crate::config::Config;
use crate::error::{Result, TransferError};
use crate::info::TransferInfo;
use crate::network::Network;
use crate::progress::{ReceivedProgressCallback, SentProgressCallback};
use crate::receive::PartProcessor;
use crate::send::{SendContext, SendPipeline, SentBatch};
use crate::status::{PartStatus, TransferStatus};
use crate::storage::KvStore;
use crate::store::{
    Part, ReceivedTransfer, ReceivedTransferStore, SentTransfer, SentTransferStore,
};
use crate::{FILE_MAX_SIZE, FILE_NAME_MAX_LEN, FILE_TYPE_MAX_LEN, PREVIEW_MAX_SIZE};
use dashmap::DashSet;
use shardcast_crypto::{
    RecipientId, TransferId, TransferKey, create_transfer_mac, file_id, new_transfer_id,
    verify_transfer_mac,
};
use shardcast_files::{PartMessage, Partitioner};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

/// Sending pipeline of a started manager
struct ActivePipeline {
    ctx: Arc<SendContext>,
    tasks: SendPipeline,
}

struct ManagerInner {
    config: Config,
    network: Arc<dyn Network>,
    sent: SentTransferStore,
    received: ReceivedTransferStore,
    sent_callbacks: Arc<CallbackManager<SentTransfer>>,
    received_callbacks: Arc<CallbackManager<ReceivedTransfer>>,
    // Received transfers whose fingerprints are registered with the network
    armed: DashSet<TransferId>,
    running: AtomicBool,
    // Also held while adding a sent transfer, so start() never queues a
    // part that send() queues too
    pipeline: Mutex<Option<ActivePipeline>>,
}

/// Sends and receives files over a [`Network`]
#[derive(Clone)]
pub struct FileTransferManager {
    inner: Arc<ManagerInner>,
}

impl FileTransferManager {
    /// Load persisted transfers from `kv`.
    ///
    /// The manager is idle until [`start`](Self::start) is called. Incoming
    /// transfers can be registered and outgoing ones created before then.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or persisted state
    /// cannot be read.
    pub async fn new(
        config: Config,
        network: Arc<dyn Network>,
        kv: Arc<dyn KvStore>,
    ) -> Result<Self> {
        config.validate()?;

        let sent = SentTransferStore::load(Arc::clone(&kv)).await?;
        let received = ReceivedTransferStore::load(kv).await?;
        tracing::info!(
            "Loaded {} sent and {} received transfers",
            sent.len(),
            received.len()
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                network,
                sent,
                received,
                sent_callbacks: Arc::new(CallbackManager::new()),
                received_callbacks: Arc::new(CallbackManager::new()),
                armed: DashSet::new(),
                running: AtomicBool::new(false),
                pipeline: Mutex::new(None),
            }),
        })
    }

    /// Start the sending pipeline and resume persisted transfers.
    ///
    /// Unsent parts are queued, parts left `Sent` are scheduled for a resend
    /// check after a full `resend_wait`, and fingerprints of incomplete
    /// incoming transfers loaded from storage are registered. Transfers this
    /// manager already registered are left alone.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::InvalidState` if the manager is already
    /// running.
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TransferError::invalid_state(
                "File transfer manager already running",
            ));
        }

        let config = &self.inner.config.transfer;
        let (part_tx, part_rx) = mpsc::channel(config.batch_queue_len);
        let (sent_tx, sent_rx) = mpsc::channel(config.sent_queue_len);
        let ctx = Arc::new(SendContext {
            config: config.clone(),
            network: Arc::clone(&self.inner.network),
            callbacks: Arc::clone(&self.inner.sent_callbacks),
            part_tx,
            sent_tx,
        });

        let mut pipeline = self.inner.pipeline.lock().await;
        let tasks = SendPipeline::spawn(Arc::clone(&ctx), part_rx, sent_rx);

        let (mut queued, mut awaiting) = (0usize, 0usize);
        for transfer in self.inner.sent.all() {
            if transfer.status().await != TransferStatus::Running {
                continue;
            }

            let unsent = transfer.parts_with(PartStatus::Unsent).await;
            queued += unsent.len();
            ctx.requeue(unsent.into_iter().map(|n| Part::new(&transfer, n)).collect());

            let sent = transfer.parts_with(PartStatus::Sent).await;
            if !sent.is_empty() {
                awaiting += sent.len();
                let batch = SentBatch {
                    parts: sent.into_iter().map(|n| Part::new(&transfer, n)).collect(),
                    sent_at: Instant::now(),
                    loaded: true,
                };
                if ctx.sent_tx.send(batch).await.is_err() {
                    tracing::warn!("Resend monitor exited during startup");
                }
            }
        }

        let mut armed = 0usize;
        for transfer in self.inner.received.all() {
            if transfer.is_complete().await {
                continue;
            }
            match self.arm_fingerprints(&transfer).await {
                Ok(n) => armed += n,
                Err(e) => tracing::warn!(
                    "Failed to register fingerprints for transfer {}: {}",
                    hex::encode(&transfer.tid()[..8]),
                    e
                ),
            }
        }

        *pipeline = Some(ActivePipeline { ctx, tasks });
        tracing::info!(
            "File transfer manager started ({} parts queued, {} awaiting confirmation, {} fingerprints registered)",
            queued,
            awaiting,
            armed
        );
        Ok(())
    }

    /// Stop the sending pipeline.
    ///
    /// The batch builder and workers stop first and outstanding round
    /// results are applied before the resend monitor stops. Transfer state
    /// stays persisted and resumes on the next start.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::InvalidState` if the manager is not running.
    pub async fn stop(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TransferError::invalid_state(
                "File transfer manager not running",
            ));
        }

        let active = self.inner.pipeline.lock().await.take();
        if let Some(active) = active {
            active.tasks.shutdown().await;
        }

        tracing::info!("File transfer manager stopped");
        Ok(())
    }

    /// Whether the sending pipeline is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start sending `data` to `recipient`.
    ///
    /// The file is split into parts sized for one network message each and
    /// persisted before this returns. If the manager is running the parts
    /// are queued immediately. `callback`, if given, is registered as by
    /// [`register_sent_progress_callback`](Self::register_sent_progress_callback).
    ///
    /// # Errors
    ///
    /// Validation errors when a field exceeds its limit, the file is empty,
    /// `retry` is negative or not finite, or the network is unhealthy.
    /// `TransferError::InvalidConfig` if the network message length cannot
    /// carry a part or the file needs more parts or cyphers than a transfer
    /// can address.
    #[allow(clippy::too_many_arguments)]
    pub async fn send(
        &self,
        recipient: RecipientId,
        file_name: &str,
        file_type: &str,
        data: Vec<u8>,
        retry: f32,
        preview: Vec<u8>,
        callback: Option<SentProgressCallback>,
        period: Duration,
    ) -> Result<TransferId> {
        if file_name.len() > FILE_NAME_MAX_LEN {
            return Err(TransferError::FileNameTooLong {
                len: file_name.len(),
                max: FILE_NAME_MAX_LEN,
            });
        }
        if file_type.len() > FILE_TYPE_MAX_LEN {
            return Err(TransferError::FileTypeTooLong {
                len: file_type.len(),
                max: FILE_TYPE_MAX_LEN,
            });
        }
        if data.len() > FILE_MAX_SIZE {
            return Err(TransferError::FileTooLarge {
                size: data.len(),
                max: FILE_MAX_SIZE,
            });
        }
        if data.is_empty() {
            return Err(TransferError::EmptyFile);
        }
        if preview.len() > PREVIEW_MAX_SIZE {
            return Err(TransferError::PreviewTooLarge {
                size: preview.len(),
                max: PREVIEW_MAX_SIZE,
            });
        }
        if !retry.is_finite() || retry < 0.0 {
            return Err(TransferError::InvalidConfig(
                format!("retry must be a non-negative number, got {retry}").into(),
            ));
        }
        if !self.inner.network.is_healthy() {
            return Err(TransferError::NetworkUnhealthy(file_name.to_string()));
        }

        let max_payload = self.inner.network.max_message_length();
        let part_size = PartMessage::part_size(max_payload).map_err(|e| {
            TransferError::InvalidConfig(
                format!("network message length {max_payload} cannot carry a part: {e}").into(),
            )
        })?;
        let partitioner = Partitioner::new(part_size)?;
        let num_parts = u16::try_from(partitioner.part_count(data.len())).map_err(|_| {
            TransferError::invalid_config("file needs more parts than a transfer can address")
        })?;
        if u16::try_from(crate::calc_num_fingerprints(num_parts, retry)).is_err() {
            return Err(TransferError::invalid_config(
                "retry needs more cyphers than a transfer can address",
            ));
        }

        let key = TransferKey::generate()?;
        let tid = new_transfer_id()?;
        let info = TransferInfo {
            recipient,
            file_id: file_id(&data),
            file_name: file_name.to_string(),
            file_type: file_type.to_string(),
            mac: create_transfer_mac(&data, &key),
            key,
            num_parts,
            size: data.len() as u32,
            retry,
            preview,
        };
        let parts = partitioner.partition(&data);

        let transfer = {
            let pipeline = self.inner.pipeline.lock().await;
            let transfer = self.inner.sent.add_transfer(tid, info, parts).await?;
            if let Some(active) = pipeline.as_ref() {
                active
                    .ctx
                    .requeue((0..num_parts).map(|n| Part::new(&transfer, n)).collect());
            }
            transfer
        };

        tracing::info!(
            "Sending {:?} ({} bytes, {} parts) to {} as transfer {}",
            file_name,
            data.len(),
            num_parts,
            hex::encode(&recipient[..8]),
            hex::encode(&tid[..8])
        );

        if let Some(callback) = callback {
            self.inner
                .sent_callbacks
                .register(&transfer, callback, period)
                .await;
        }
        Ok(tid)
    }

    /// Transfer details of an outgoing transfer, to be delivered to the
    /// recipient out of band
    ///
    /// # Errors
    ///
    /// Returns `TransferError::TransferNotFound` for an unknown transfer.
    pub async fn transfer_info(&self, tid: &TransferId) -> Result<TransferInfo> {
        Ok(self.inner.sent.get(tid)?.info().clone())
    }

    /// Outgoing transfer `tid`
    ///
    /// # Errors
    ///
    /// Returns `TransferError::TransferNotFound` for an unknown transfer.
    pub fn sent_transfer(&self, tid: &TransferId) -> Result<Arc<SentTransfer>> {
        self.inner.sent.get(tid)
    }

    /// Incoming transfer `tid`
    ///
    /// # Errors
    ///
    /// Returns `TransferError::TransferNotFound` for an unknown transfer.
    pub fn received_transfer(&self, tid: &TransferId) -> Result<Arc<ReceivedTransfer>> {
        self.inner.received.get(tid)
    }

    /// Status of outgoing transfer `tid`
    ///
    /// # Errors
    ///
    /// Returns `TransferError::TransferNotFound` for an unknown transfer.
    pub async fn sent_status(&self, tid: &TransferId) -> Result<TransferStatus> {
        Ok(self.inner.sent.get(tid)?.status().await)
    }

    /// Report progress of outgoing transfer `tid` to `callback`, at most
    /// once per `period`. The current progress is reported immediately.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::TransferNotFound` for an unknown transfer.
    pub async fn register_sent_progress_callback(
        &self,
        tid: &TransferId,
        callback: SentProgressCallback,
        period: Duration,
    ) -> Result<()> {
        let transfer = self.inner.sent.get(tid)?;
        self.inner
            .sent_callbacks
            .register(&transfer, callback, period)
            .await;
        Ok(())
    }

    /// Record that the recipient holds `part_nums` of outgoing transfer
    /// `tid`.
    ///
    /// Confirmed parts are never resent. Confirming the last part completes
    /// the transfer.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::TransferNotFound` for an unknown transfer or
    /// `TransferError::PartOutOfRange` for an unknown part, in which case no
    /// part is marked.
    pub async fn confirm_received(&self, tid: &TransferId, part_nums: &[u16]) -> Result<()> {
        let transfer = self.inner.sent.get(tid)?;
        if transfer.mark_received(part_nums).await? {
            tracing::info!("Transfer {} confirmed complete", hex::encode(&tid[..8]));
        }
        self.inner.sent_callbacks.call(&transfer).await;
        Ok(())
    }

    /// Delete a completed or failed outgoing transfer and its persisted
    /// state. Parts still queued are dropped by the pipeline.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::TransferNotFound` for an unknown transfer and
    /// `TransferError::TransferNotTerminal` while it is still running.
    pub async fn close_send(&self, tid: &TransferId) -> Result<()> {
        let transfer = self.inner.sent.get(tid)?;
        let status = transfer.status().await;
        if !status.is_terminal() {
            return Err(TransferError::TransferNotTerminal(*tid));
        }
        drop(transfer);

        self.inner.sent_callbacks.delete(tid);
        self.inner.sent.remove(tid).await?;
        tracing::info!("Closed {} transfer {}", status, hex::encode(&tid[..8]));
        Ok(())
    }

    /// Start receiving the transfer described by `transfer_info`.
    ///
    /// Every fingerprint of the transfer is registered with the network.
    /// `callback`, if given, is registered as by
    /// [`register_received_progress_callback`](Self::register_received_progress_callback).
    ///
    /// # Errors
    ///
    /// Returns an error if the blob does not decode, describes no parts, or
    /// fingerprint registration fails.
    pub async fn handle_incoming_transfer(
        &self,
        transfer_info: &[u8],
        callback: Option<ReceivedProgressCallback>,
        period: Duration,
    ) -> Result<(TransferId, TransferInfo)> {
        let info = TransferInfo::unmarshal(transfer_info)?;
        if info.num_parts == 0 {
            return Err(TransferError::EmptyFile);
        }
        if u16::try_from(info.num_fingerprints()).is_err() {
            return Err(TransferError::invalid_config(
                "incoming transfer needs more cyphers than a transfer can address",
            ));
        }

        let tid = new_transfer_id()?;
        let transfer = self.inner.received.add_transfer(tid, info.clone()).await?;
        let armed = match self.arm_fingerprints(&transfer).await {
            Ok(armed) => armed,
            Err(e) => {
                drop(transfer);
                if let Err(remove) = self.inner.received.remove(&tid).await {
                    tracing::error!(
                        "Failed to discard unregistered transfer {}: {}",
                        hex::encode(&tid[..8]),
                        remove
                    );
                }
                return Err(e);
            }
        };
        tracing::info!(
            "Receiving {:?} ({} bytes, {} parts) as transfer {}, {} fingerprints registered",
            info.file_name,
            info.size,
            info.num_parts,
            hex::encode(&tid[..8]),
            armed
        );

        if let Some(callback) = callback {
            self.inner
                .received_callbacks
                .register(&transfer, callback, period)
                .await;
        }
        Ok((tid, info))
    }

    /// Report progress of incoming transfer `tid` to `callback`, at most
    /// once per `period`. The current progress is reported immediately.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::TransferNotFound` for an unknown transfer.
    pub async fn register_received_progress_callback(
        &self,
        tid: &TransferId,
        callback: ReceivedProgressCallback,
        period: Duration,
    ) -> Result<()> {
        let transfer = self.inner.received.get(tid)?;
        self.inner
            .received_callbacks
            .register(&transfer, callback, period)
            .await;
        Ok(())
    }

    /// Take the file of a fully received transfer.
    ///
    /// The file is checked against the transfer MAC, then the transfer, its
    /// callbacks, its remaining fingerprints and its persisted state are
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::TransferNotFound` for an unknown transfer,
    /// `TransferError::Incomplete` while parts are missing and
    /// `TransferError::MacMismatch` if the file fails verification, in which
    /// case the transfer is kept.
    pub async fn receive(&self, tid: &TransferId) -> Result<Vec<u8>> {
        let transfer = self.inner.received.get(tid)?;
        let file = transfer.file().await?;

        let info = transfer.info();
        if !verify_transfer_mac(&file, &info.key, &info.mac) {
            tracing::warn!(
                "Transfer {} failed integrity verification",
                hex::encode(&tid[..8])
            );
            return Err(TransferError::MacMismatch);
        }

        let recipient = transfer.recipient();
        if self.inner.received.recipient_in_use(&recipient, tid) {
            for cypher in transfer.unused_cyphers().await {
                self.inner
                    .network
                    .delete_fingerprint(&recipient, &cypher.fingerprint());
            }
        } else {
            self.inner.network.delete_all_fingerprints_for(&recipient);
        }
        drop(transfer);

        self.inner.received_callbacks.delete(tid);
        self.inner.armed.remove(tid);
        self.inner.received.remove(tid).await?;
        tracing::info!(
            "Received transfer {} ({} bytes)",
            hex::encode(&tid[..8]),
            file.len()
        );
        Ok(file)
    }

    /// Register a processor for every unused fingerprint of `transfer`.
    ///
    /// Returns 0 if the transfer is already registered. On failure the
    /// fingerprints registered so far are removed again.
    async fn arm_fingerprints(&self, transfer: &Arc<ReceivedTransfer>) -> Result<usize> {
        let tid = transfer.tid();
        if !self.inner.armed.insert(tid) {
            return Ok(0);
        }

        let recipient = transfer.recipient();
        let cyphers = transfer.unused_cyphers().await;
        let mut registered = Vec::with_capacity(cyphers.len());

        for cypher in cyphers {
            let fingerprint = cypher.fingerprint();
            let processor = PartProcessor::new(
                cypher,
                transfer,
                Arc::clone(&self.inner.received_callbacks),
            );
            if let Err(e) = self
                .inner
                .network
                .add_fingerprint(recipient, fingerprint, Arc::new(processor))
            {
                for fingerprint in &registered {
                    self.inner.network.delete_fingerprint(&recipient, fingerprint);
                }
                self.inner.armed.remove(&tid);
                return Err(e);
            }
            registered.push(fingerprint);
        }
        Ok(registered.len())
    }
}

impl std::fmt::Debug for FileTransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTransferManager")
            .field("running", &self.is_running())
            .field("sent", &self.inner.sent.len())
            .field("received", &self.inner.received.len())
            .finish_non_exhaustive()
    }
}
