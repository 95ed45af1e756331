//! Resend monitor
//!
//! Every successful round is checked once `resend_wait` after it resolved.
//! Parts that are still `Sent` by then were not acknowledged by the
//! recipient, so they move back to `Unsent` and rejoin the part queue.
//! Batches reconstructed at startup carry no usable send time and wait the
//! full period.

use super::{SendContext, SentBatch, group_by_transfer};
use crate::store::Part;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

pub(crate) async fn run_resend_monitor(
    ctx: Arc<SendContext>,
    mut sent_rx: mpsc::Receiver<SentBatch>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut checks = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            batch = sent_rx.recv() => match batch {
                Some(batch) => {
                    let wait = resend_delay(&batch, ctx.config.resend_wait);
                    let ctx = Arc::clone(&ctx);
                    let stop = shutdown.clone();
                    checks.spawn(async move { check_batch(&ctx, batch, wait, stop).await });
                }
                None => break,
            },
            Some(result) = checks.join_next(), if !checks.is_empty() => {
                if let Err(e) = result {
                    tracing::error!("Resend check panicked: {}", e);
                }
            }
        }
    }

    while let Some(result) = checks.join_next().await {
        if let Err(e) = result {
            tracing::error!("Resend check panicked: {}", e);
        }
    }
    tracing::debug!("Resend monitor stopped");
}

fn resend_delay(batch: &SentBatch, resend_wait: Duration) -> Duration {
    if batch.loaded {
        resend_wait
    } else {
        resend_wait.saturating_sub(batch.sent_at.elapsed())
    }
}

/// Wait out the batch's period, then requeue whatever is still `Sent`.
///
/// A check cancelled by shutdown does nothing. Its parts stay `Sent` in
/// persisted state and are checked again after the next start.
async fn check_batch(
    ctx: &SendContext,
    batch: SentBatch,
    wait: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let cancelled = tokio::select! {
        biased;
        _ = shutdown.changed() => true,
        () = tokio::time::sleep(wait) => false,
    };
    if cancelled {
        return;
    }

    let mut requeue = Vec::new();
    for (transfer, part_nums) in group_by_transfer(&batch.parts) {
        match transfer.mark_for_resend(&part_nums).await {
            Ok(moved) => {
                if !moved.is_empty() {
                    tracing::debug!(
                        "Resending {} parts of transfer {}",
                        moved.len(),
                        hex::encode(&transfer.tid()[..8])
                    );
                }
                requeue.extend(moved.into_iter().map(|n| Part::new(&transfer, n)));
            }
            Err(e) => tracing::error!(
                "Failed to mark parts for resend in transfer {}: {}",
                hex::encode(&transfer.tid()[..8]),
                e
            ),
        }
    }

    for part in requeue {
        if ctx.part_tx.send(part).await.is_err() {
            tracing::debug!("Part queue closed, dropping resend");
            return;
        }
    }
}
