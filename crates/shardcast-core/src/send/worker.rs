//! Sending workers
//!
//! Each worker takes one batch at a time, encrypts every member with a fresh
//! cypher and hands the result to the network as a single round. Workers
//! only consume batches while the network is healthy. Round results are
//! awaited on separate tasks so a slow round does not stall the worker.

use super::{SendContext, SentBatch, group_by_transfer};
use crate::network::{RoundId, TargetedMessage};
use crate::store::Part;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;

pub(crate) async fn run_worker(
    id: usize,
    ctx: Arc<SendContext>,
    batch_rx: Arc<Mutex<mpsc::Receiver<Vec<Part>>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut health = ctx.network.health_watch();
    let mut rounds = JoinSet::new();

    loop {
        let healthy = *health.borrow_and_update();
        if !healthy {
            tracing::debug!(worker = id, "Network unhealthy, pausing");
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                changed = health.changed() => if changed.is_err() {
                    break;
                },
            }
            continue;
        }

        let batch = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            changed = health.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            batch = async { batch_rx.lock().await.recv().await } => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        send_batch(&ctx, batch, &mut rounds).await;

        while let Some(result) = rounds.try_join_next() {
            if let Err(e) = result {
                tracing::error!(worker = id, "Round result task panicked: {}", e);
            }
        }
    }

    // Let outstanding rounds land before reporting stopped
    while let Some(result) = rounds.join_next().await {
        if let Err(e) = result {
            tracing::error!(worker = id, "Round result task panicked: {}", e);
        }
    }
    tracing::debug!(worker = id, "Sending worker stopped");
}

/// Encrypt and send one batch, then track its round
async fn send_batch(ctx: &Arc<SendContext>, batch: Vec<Part>, rounds: &mut JoinSet<()>) {
    let max_payload = ctx.network.max_message_length();
    let mut messages = Vec::with_capacity(batch.len());
    let mut parts = Vec::with_capacity(batch.len());

    for part in batch {
        let Some(transfer) = part.transfer() else {
            tracing::debug!(
                "Dropping part {} of closed transfer {}",
                part.part_num(),
                hex::encode(&part.tid()[..8])
            );
            continue;
        };

        match part.encrypted_part(max_payload).await {
            Ok(Some(encrypted)) => {
                messages.push(TargetedMessage {
                    recipient: transfer.recipient(),
                    fingerprint: encrypted.fingerprint,
                    payload: encrypted.ciphertext,
                    mac: encrypted.mac,
                });
                parts.push(part);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(
                    "Failed to encrypt part {} of transfer {}: {}",
                    part.part_num(),
                    hex::encode(&part.tid()[..8]),
                    e
                );
                ctx.callbacks.call(&transfer).await;
            }
        }
    }

    if messages.is_empty() {
        return;
    }

    match ctx.network.send_many(messages, ctx.config.send_timeout).await {
        Ok(round) => {
            let ctx = Arc::clone(ctx);
            rounds.spawn(async move { handle_round(&ctx, round, parts).await });
        }
        Err(e) => {
            tracing::warn!("Failed to send batch of {} parts: {}", parts.len(), e);
            ctx.requeue(parts);
        }
    }
}

/// Apply the outcome of a round to its parts
async fn handle_round(ctx: &SendContext, round: RoundId, parts: Vec<Part>) {
    let result = ctx
        .network
        .round_results(round, ctx.config.round_results_timeout)
        .await;

    let sent_at = match result {
        Ok(result) if result.succeeded => result.completed_at,
        Ok(_) => {
            tracing::debug!(round, "Round failed, requeueing {} parts", parts.len());
            ctx.requeue(parts);
            return;
        }
        Err(e) => {
            tracing::debug!(round, "Round outcome unknown ({}), requeueing {} parts", e, parts.len());
            ctx.requeue(parts);
            return;
        }
    };

    for (transfer, part_nums) in group_by_transfer(&parts) {
        if let Err(e) = transfer.mark_sent(&part_nums).await {
            tracing::error!(
                "Failed to mark parts sent for transfer {}: {}",
                hex::encode(&transfer.tid()[..8]),
                e
            );
        }
        ctx.callbacks.call(&transfer).await;
    }

    let batch = SentBatch {
        parts,
        sent_at,
        loaded: false,
    };
    if ctx.sent_tx.send(batch).await.is_err() {
        tracing::debug!(round, "Sent queue closed");
    }
}
