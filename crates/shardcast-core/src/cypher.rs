//! Per-transfer cypher pool
//!
//! A transfer owns `num_fingerprints` cyphers, indices `0..num_fingerprints`.
//! Each index may be used for exactly one physical message. The pool records
//! used indices in a bitmap that is persisted with the transfer, so a cypher
//! consumed before a restart is never issued again.

use crate::error::{Result, TransferError};
use crate::status::PartBitmap;
use shardcast_crypto::{Cypher, TransferKey};

/// Pool of single-use cyphers derived from one transfer key
#[derive(Clone)]
pub struct CypherManager {
    key: TransferKey,
    used: PartBitmap,
}

impl CypherManager {
    /// Fresh pool with every cypher unused
    #[must_use]
    pub fn new(key: TransferKey, num_fingerprints: u16) -> Self {
        Self {
            key,
            used: PartBitmap::new(num_fingerprints),
        }
    }

    /// Rebuild a pool from its persisted used-bitmap
    #[must_use]
    pub fn restore(key: TransferKey, used: PartBitmap) -> Self {
        Self { key, used }
    }

    /// Transfer key the cyphers derive from
    #[must_use]
    pub fn key(&self) -> &TransferKey {
        &self.key
    }

    /// Size of the pool
    #[must_use]
    pub fn num_fingerprints(&self) -> u16 {
        self.used.num_parts()
    }

    /// Cyphers still available
    #[must_use]
    pub fn num_unused(&self) -> u16 {
        self.used.num_parts() - self.used.count()
    }

    /// Bitmap of consumed indices, for persistence
    #[must_use]
    pub fn used(&self) -> &PartBitmap {
        &self.used
    }

    /// Take the lowest unused cypher.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::FingerprintsExhausted` when every cypher has
    /// been used. The pool is never refilled.
    pub fn pop_cypher(&mut self) -> Result<Cypher> {
        let index = (0..self.used.num_parts())
            .find(|i| !self.used.is_set(*i))
            .ok_or(TransferError::FingerprintsExhausted)?;

        self.used.set(index)?;
        Ok(Cypher::new(&self.key, index))
    }

    /// Record that the cypher at `index` was consumed by an inbound message.
    ///
    /// Returns false if it was already marked.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::InvalidState` if `index` is outside the pool.
    pub fn mark_used(&mut self, index: u16) -> Result<bool> {
        self.used
            .set(index)
            .map_err(|_| TransferError::invalid_state("cypher index outside of pool"))
    }

    /// Every cypher not yet used, in index order
    #[must_use]
    pub fn unused_cyphers(&self) -> Vec<Cypher> {
        self.used
            .missing()
            .into_iter()
            .map(|index| Cypher::new(&self.key, index))
            .collect()
    }
}

impl std::fmt::Debug for CypherManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CypherManager")
            .field("num_fingerprints", &self.num_fingerprints())
            .field("unused", &self.num_unused())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn manager(n: u16) -> CypherManager {
        CypherManager::new(TransferKey::from_bytes([0x42; 32]), n)
    }

    #[test]
    fn test_pop_until_exhausted() {
        let mut cyphers = manager(15);
        let mut fingerprints = HashSet::new();
        for expected in 0..15 {
            let cypher = cyphers.pop_cypher().unwrap();
            assert_eq!(cypher.index(), expected);
            assert!(fingerprints.insert(cypher.fingerprint()));
        }

        assert!(matches!(
            cyphers.pop_cypher(),
            Err(TransferError::FingerprintsExhausted)
        ));
        assert_eq!(cyphers.num_unused(), 0);
    }

    #[test]
    fn test_unused_cyphers_skip_consumed() {
        let mut cyphers = manager(5);
        cyphers.pop_cypher().unwrap();
        assert!(cyphers.mark_used(3).unwrap());
        assert!(!cyphers.mark_used(3).unwrap());

        let unused: Vec<_> = cyphers.unused_cyphers().iter().map(Cypher::index).collect();
        assert_eq!(unused, vec![1, 2, 4]);
    }

    #[test]
    fn test_pop_skips_marked() {
        let mut cyphers = manager(3);
        cyphers.mark_used(0).unwrap();
        cyphers.mark_used(1).unwrap();
        assert_eq!(cyphers.pop_cypher().unwrap().index(), 2);
    }

    #[test]
    fn test_mark_used_out_of_pool() {
        let mut cyphers = manager(3);
        assert!(matches!(
            cyphers.mark_used(3),
            Err(TransferError::InvalidState(_))
        ));
    }

    #[test]
    fn test_restore_preserves_cursor() {
        let mut cyphers = manager(4);
        cyphers.pop_cypher().unwrap();
        cyphers.pop_cypher().unwrap();

        let json = serde_json::to_vec(cyphers.used()).unwrap();
        let used: PartBitmap = serde_json::from_slice(&json).unwrap();
        let mut restored = CypherManager::restore(cyphers.key().clone(), used);

        assert_eq!(restored.num_unused(), 2);
        assert_eq!(restored.pop_cypher().unwrap().index(), 2);
    }
}
