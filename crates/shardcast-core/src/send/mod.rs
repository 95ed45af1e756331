//! Sending pipeline
//!
//! Three kinds of background task cooperate through bounded queues:
//!
//! ```text
//!   [part queue] ──▶ batch builder ──▶ [batch queue] ──▶ workers ×N
//!        ▲                                                   │
//!        │                                        round ok   │  round failed
//!        │          resend monitor ◀── [sent queue] ◀────────┤────────┐
//!        │               │                                   │        │
//!        └───────────────┴───────────── requeue ─────────────┴────────┘
//! ```
//!
//! Shutdown happens in two phases. The builder and workers stop first;
//! workers wait for their outstanding round results so every successful
//! round lands on the sent queue. The resend monitor stops after that.

mod batch;
mod resend;
mod worker;

use crate::callbacks::CallbackManager;
use crate::config::TransferConfig;
use crate::network::Network;
use crate::store::{Part, SentTransfer};
use shardcast_crypto::TransferId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Parts of one successful round awaiting confirmation
#[derive(Debug)]
pub struct SentBatch {
    /// Parts sent in the round
    pub parts: Vec<Part>,
    /// When the round resolved
    pub sent_at: Instant,
    /// Reconstructed from persisted state, so `sent_at` is unreliable
    pub loaded: bool,
}

/// Handles shared by every pipeline task
pub(crate) struct SendContext {
    pub(crate) config: TransferConfig,
    pub(crate) network: Arc<dyn Network>,
    pub(crate) callbacks: Arc<CallbackManager<SentTransfer>>,
    pub(crate) part_tx: mpsc::Sender<Part>,
    pub(crate) sent_tx: mpsc::Sender<SentBatch>,
}

impl SendContext {
    /// Put parts back on the part queue without blocking the caller
    pub(crate) fn requeue(&self, parts: Vec<Part>) {
        if parts.is_empty() {
            return;
        }

        let part_tx = self.part_tx.clone();
        tokio::spawn(async move {
            for part in parts {
                if part_tx.send(part).await.is_err() {
                    tracing::debug!("Part queue closed, dropping requeued parts");
                    return;
                }
            }
        });
    }
}

/// Group part handles by transfer, skipping transfers that were closed
pub(crate) fn group_by_transfer(parts: &[Part]) -> Vec<(Arc<SentTransfer>, Vec<u16>)> {
    let mut groups: HashMap<TransferId, (Arc<SentTransfer>, Vec<u16>)> = HashMap::new();
    for part in parts {
        match part.transfer() {
            Some(transfer) => groups
                .entry(part.tid())
                .or_insert_with(|| (transfer, Vec::new()))
                .1
                .push(part.part_num()),
            None => tracing::debug!(
                "Dropping part {} of closed transfer {}",
                part.part_num(),
                hex::encode(&part.tid()[..8])
            ),
        }
    }
    groups.into_values().collect()
}

/// Running pipeline tasks
pub(crate) struct SendPipeline {
    send_shutdown: watch::Sender<bool>,
    resend_shutdown: watch::Sender<bool>,
    builder: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    resend: JoinHandle<()>,
}

impl SendPipeline {
    /// Spawn the batch builder, `worker_threads` workers and the resend
    /// monitor
    pub(crate) fn spawn(
        ctx: Arc<SendContext>,
        part_rx: mpsc::Receiver<Part>,
        sent_rx: mpsc::Receiver<SentBatch>,
    ) -> Self {
        let (send_shutdown, send_stop) = watch::channel(false);
        let (resend_shutdown, resend_stop) = watch::channel(false);
        let (batch_tx, batch_rx) = mpsc::channel(ctx.config.send_queue_len);

        let builder = tokio::spawn(batch::run_batch_builder(
            Arc::clone(&ctx),
            part_rx,
            batch_tx,
            send_stop.clone(),
        ));

        let batch_rx = Arc::new(Mutex::new(batch_rx));
        let workers = (0..ctx.config.worker_threads)
            .map(|id| {
                tokio::spawn(worker::run_worker(
                    id,
                    Arc::clone(&ctx),
                    Arc::clone(&batch_rx),
                    send_stop.clone(),
                ))
            })
            .collect();

        let resend = tokio::spawn(resend::run_resend_monitor(ctx, sent_rx, resend_stop));

        Self {
            send_shutdown,
            resend_shutdown,
            builder,
            workers,
            resend,
        }
    }

    /// Stop every task in order
    pub(crate) async fn shutdown(self) {
        let _ = self.send_shutdown.send(true);
        if let Err(e) = self.builder.await {
            tracing::error!("Batch builder panicked: {}", e);
        }
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!("Sending worker panicked: {}", e);
            }
        }

        let _ = self.resend_shutdown.send(true);
        if let Err(e) = self.resend.await {
            tracing::error!("Resend monitor panicked: {}", e);
        }
    }
}
