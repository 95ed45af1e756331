//! Transfer stores
//!
//! The sent and received stores own every transfer of their direction.
//! Each transfer keeps its mutable state behind its own lock; the store maps
//! are concurrent and the persisted transfer list is rewritten under a
//! separate store-level lock. No operation holds two transfer locks at once.

mod part;
mod received;
mod sent;

pub use part::Part;
pub use received::{ReceivedTransfer, ReceivedTransferStore};
pub use sent::{SentTransfer, SentTransferStore};

use crate::error::{Result, TransferError};
use shardcast_crypto::TransferId;

fn transfer_key(prefix: &str, tid: &TransferId, suffix: &str) -> String {
    format!("{prefix}/{}/{suffix}", hex::encode(tid))
}

fn decode_tid(encoded: &str) -> Result<TransferId> {
    let bytes = hex::decode(encoded)
        .map_err(|e| TransferError::Serialization(format!("invalid transfer ID: {e}").into()))?;
    bytes
        .try_into()
        .map_err(|_| TransferError::Serialization("transfer ID must be 32 bytes".into()))
}

/// Serde helpers storing part buffers as base64 strings
mod base64_parts {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(parts: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded: Vec<String> = parts.iter().map(|p| STANDARD.encode(p)).collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .into_iter()
            .map(|p| STANDARD.decode(p).map_err(serde::de::Error::custom))
            .collect()
    }
}
