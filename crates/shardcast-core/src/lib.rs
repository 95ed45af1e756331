//! # shardcast Core
//!
//! Transfer engine that moves files over a mix network whose transport unit
//! is a small, fixed-size, unordered, best-effort message.
//!
//! This crate provides:
//! - Sent and received transfer stores with explicit part state machines
//! - Single-use cypher pools (one fingerprint per physical send)
//! - Throughput-limited batching and a concurrent sending worker pool
//! - A resend monitor that retries parts lost after a successful round
//! - Fingerprint-bound receive processors and exactly-once reassembly
//! - Throttled, deduplicated progress callbacks
//! - Persistence of all transfer state through a [`KvStore`]
//!
//! ## Pipeline
//!
//! ```text
//!  send() ──▶ Partitioner ──▶ SentTransfer ──▶ [part queue]
//!                                                   │
//!                                          batch builder (throttled)
//!                                                   │
//!                                             [batch queue]
//!                                                   │
//!                                  worker pool ──▶ Network::send_many
//!                                                   │
//!                        round failed ◀──── round_results ────▶ round ok
//!                        (requeue)                              mark Sent
//!                                                                  │
//!                                                           [sent queue]
//!                                                                  │
//!                                         resend monitor: still Sent after
//!                                         resend_wait? ──▶ Unsent, requeue
//!
//!  Network ──fingerprint──▶ PartProcessor ──▶ ReceivedTransfer ──▶ receive()
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use shardcast_core::{Config, FileTransferManager, MemoryKvStore, MemoryNetwork};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> shardcast_core::Result<()> {
//! let network = Arc::new(MemoryNetwork::new(1024));
//! let manager = FileTransferManager::new(
//!     Config::default(),
//!     network,
//!     Arc::new(MemoryKvStore::new()),
//! )
//! .await?;
//! manager.start().await?;
//!
//! let tid = manager
//!     .send([7u8; 32], "notes.txt", "txt", b"hello".to_vec(), 0.5, Vec::new(), None, Duration::ZERO)
//!     .await?;
//! let info = manager.transfer_info(&tid).await?;
//! # let _ = info;
//! manager.stop().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod callbacks;
pub mod config;
pub mod cypher;
pub mod error;
pub mod info;
pub mod manager;
pub mod network;
pub mod progress;
pub mod receive;
pub mod send;
pub mod status;
pub mod storage;
pub mod store;

use std::future::Future;
use std::pin::Pin;

pub use config::{Config, LoggingConfig, StorageConfig, TransferConfig};
pub use cypher::CypherManager;
pub use error::{Result, TransferError};
pub use info::TransferInfo;
pub use manager::FileTransferManager;
pub use network::memory::MemoryNetwork;
pub use network::{
    IncomingMessage, MessageProcessor, Network, RoundId, RoundResult, TargetedMessage,
};
pub use progress::{
    ReceivedPartTracker, ReceivedProgress, ReceivedProgressCallback, SentPartTracker,
    SentProgress, SentProgressCallback,
};
pub use status::{PartBitmap, PartStatus, PartStatusVector, TransferStatus};
pub use storage::{FsKvStore, KvStore, MemoryKvStore};
pub use store::{Part, ReceivedTransfer, ReceivedTransferStore, SentTransfer, SentTransferStore};

/// Boxed future returned by the object-safe collaborator traits
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Maximum file name length in bytes
pub const FILE_NAME_MAX_LEN: usize = 48;

/// Maximum file type length in bytes
pub const FILE_TYPE_MAX_LEN: usize = 8;

/// Maximum file size in bytes
pub const FILE_MAX_SIZE: usize = 250_000;

/// Maximum preview size in bytes
pub const PREVIEW_MAX_SIZE: usize = 4_000;

/// Number of cyphers allotted to a transfer of `num_parts` parts that may
/// spend up to `retry` extra sends per part on average.
///
/// The product is computed in `f32` and truncated.
#[must_use]
pub fn calc_num_fingerprints(num_parts: u16, retry: f32) -> usize {
    (f32::from(num_parts) * (1.0 + retry)) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_num_fingerprints() {
        assert_eq!(calc_num_fingerprints(12, 0.5), 18);
        assert_eq!(calc_num_fingerprints(119, 0.45), 172);
        assert_eq!(calc_num_fingerprints(10, 0.5), 15);
        assert_eq!(calc_num_fingerprints(16, 0.0), 16);
        assert_eq!(calc_num_fingerprints(1, 2.0), 3);
    }
}
