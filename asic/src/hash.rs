// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;

use aal::{AsicResult, HashValues, HashOps, MatchKey, StageId};

// Keeps the proxy digest independent of the placement hash.
const DIGEST_SALT: u64 = 0x5bd1_e995_0000_0001;

/// A deterministic hash engine.  Each stage gets its own hash function by
/// mixing the stage id into the seed, as the hardware does with per-stage
/// hash-matrix configuration.
#[derive(Debug, Clone, Copy)]
pub struct SeededHash {
    seed: u64,
    // Also produce a second 64-bit value, for stages that need more bits
    wide: bool,
}

impl SeededHash {
    pub fn new(seed: u64) -> Self {
        SeededHash { seed, wide: false }
    }

    pub fn wide(seed: u64) -> Self {
        SeededHash { seed, wide: true }
    }

    fn hash_with(&self, salt: u64, key: &MatchKey, stage: StageId) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.seed.hash(&mut hasher);
        salt.hash(&mut hasher);
        stage.0.hash(&mut hasher);
        key.as_bytes().hash(&mut hasher);
        hasher.finish()
    }
}

impl HashOps for SeededHash {
    fn compute_hash(
        &self,
        key: &MatchKey,
        stage: StageId,
    ) -> AsicResult<HashValues> {
        let primary = self.hash_with(0, key, stage);
        let secondary = self.wide.then(|| self.hash_with(1, key, stage));
        Ok(HashValues { primary, secondary })
    }

    fn compute_proxy_digest(
        &self,
        key: &MatchKey,
        stage: StageId,
    ) -> AsicResult<u64> {
        Ok(self.hash_with(DIGEST_SALT, key, stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() -> anyhow::Result<()> {
        let h = SeededHash::new(7);
        let k = MatchKey::from(42u64);
        assert_eq!(
            h.compute_hash(&k, StageId(0))?,
            h.compute_hash(&k, StageId(0))?
        );
        assert_ne!(
            h.compute_hash(&k, StageId(0))?,
            h.compute_hash(&k, StageId(1))?
        );
        assert!(h.compute_hash(&k, StageId(0))?.secondary.is_none());
        assert!(SeededHash::wide(7)
            .compute_hash(&k, StageId(0))?
            .secondary
            .is_some());
        Ok(())
    }
}
