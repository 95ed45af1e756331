//! # shardcast Files
//!
//! File handling for shardcast transfers.
//!
//! This crate provides:
//! - Partitioning a file into equal-size parts (last part zero-padded)
//! - Reassembling parts into the original file
//! - Framing of a single part into a fixed-size part message
//!
//! ## Part message layout
//!
//! ```text
//! ┌──────────────┬────────────────────────────────────────┐
//! │ part number  │ part data (zero padded)                │
//! │ u16 BE (2 B) │ max_payload - 2 bytes                  │
//! └──────────────┴────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod message;
pub mod partition;

pub use error::FilesError;
pub use message::PartMessage;
pub use partition::Partitioner;

/// Size of the part message header (part number).
pub const PART_HEADER_LEN: usize = 2;
