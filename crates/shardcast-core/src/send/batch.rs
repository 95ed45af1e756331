//! Batch builder
//!
//! Groups queued parts into batches of a random size between
//! `min_parts_per_batch` and `max_parts_per_batch`, so round sizes do not
//! reveal file boundaries. A partial batch is flushed once the part queue
//! has been idle for `batch_poll_interval`. Consecutive batches are spaced
//! by [`TransferConfig::batch_delay`](crate::TransferConfig::batch_delay)
//! to respect `max_throughput`.

use super::SendContext;
use crate::store::Part;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

pub(crate) async fn run_batch_builder(
    ctx: Arc<SendContext>,
    mut part_rx: mpsc::Receiver<Part>,
    batch_tx: mpsc::Sender<Vec<Part>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let delay = ctx.config.batch_delay(ctx.network.max_message_length());
    let (min, max) = (
        ctx.config.min_parts_per_batch,
        ctx.config.max_parts_per_batch,
    );
    let mut last_send: Option<Instant> = None;

    tracing::debug!(?delay, min, max, "Batch builder started");

    loop {
        let target = rand::thread_rng().gen_range(min..=max);
        let mut batch = Vec::with_capacity(target);

        while batch.len() < target {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    tracing::debug!("Batch builder stopping");
                    return;
                }
                part = part_rx.recv() => match part {
                    Some(part) => batch.push(part),
                    None => return,
                },
                () = tokio::time::sleep(ctx.config.batch_poll_interval), if !batch.is_empty() => break,
            }
        }

        if let Some(last) = last_send {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                () = tokio::time::sleep_until(last + delay) => {}
            }
        }

        tracing::trace!("Emitting batch of {} parts", batch.len());
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            sent = batch_tx.send(batch) => if sent.is_err() {
                return;
            },
        }
        last_send = Some(Instant::now());
    }
}
