// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

/// Tracks which entry handle indices of a table instance are free.  Free
/// indices are kept as coalesced runs, and the lowest free index is always the
/// next one handed out, so a replayed sequence of operations assigns the same
/// handles every time.
use std::collections::BTreeMap;

use crate::types::ExmError;
use crate::types::ExmResult;

use slog::debug;

#[derive(Clone)]
pub struct FreeMap {
    log: slog::Logger,
    // Name reported when the map is exhausted
    name: String,
    // First index handed out
    base: u32,
    // Number of indices managed
    size: u32,
    // Free runs, keyed by their first index.  The value is one past the last
    // index in the run.  Adjacent runs are always merged.
    runs: BTreeMap<u32, u32>,
}

impl FreeMap {
    pub fn new(
        log: &slog::Logger,
        name: impl ToString,
        base: u32,
        size: u32,
    ) -> Self {
        let name = name.to_string();
        let log = log.new(slog::o!("unit" => format!("freemap_{name}")));
        debug!(log, "created new freemap"; "base" => base, "size" => size);
        let mut map = FreeMap {
            log,
            name,
            base,
            size,
            runs: BTreeMap::new(),
        };
        map.reset();
        map
    }

    /// Return every index to the pool.
    pub fn reset(&mut self) {
        self.runs.clear();
        if self.size > 0 {
            self.runs.insert(self.base, self.base + self.size);
        }
    }

    /// Number of indices not handed out.
    pub fn available(&self) -> u32 {
        self.runs.iter().map(|(low, high)| high - low).sum()
    }

    fn in_range(&self, idx: u32) -> bool {
        idx >= self.base && idx - self.base < self.size
    }

    // The run containing idx, if idx is free.
    fn run_of(&self, idx: u32) -> Option<(u32, u32)> {
        self.runs
            .range(..=idx)
            .next_back()
            .filter(|(_, high)| idx < **high)
            .map(|(&low, &high)| (low, high))
    }

    // Carve idx out of the free run holding it.
    fn take(&mut self, low: u32, high: u32, idx: u32) {
        self.runs.remove(&low);
        if low < idx {
            self.runs.insert(low, idx);
        }
        if idx + 1 < high {
            self.runs.insert(idx + 1, high);
        }
    }

    pub fn alloc(&mut self) -> ExmResult<u32> {
        let Some((&low, &high)) = self.runs.first_key_value() else {
            debug!(self.log, "exhausted");
            return Err(ExmError::TableFull(self.name.clone()));
        };
        self.take(low, high, low);
        slog::trace!(self.log, "allocated {low}");
        Ok(low)
    }

    /// Remove a specific index from the free pool, as when an entry is
    /// restored with the handle it had before a restart.
    pub fn claim(&mut self, idx: u32) -> ExmResult<()> {
        if !self.in_range(idx) {
            return Err(ExmError::Invalid(format!(
                "{}: index {idx} outside [{}, {})",
                self.name,
                self.base,
                self.base + self.size
            )));
        }
        let (low, high) = self.run_of(idx).ok_or_else(|| {
            ExmError::Invalid(format!("{}: index {idx} in use", self.name))
        })?;
        self.take(low, high, idx);
        debug!(self.log, "claimed {idx}");
        Ok(())
    }

    /// Give an index back.  Freeing an index that is already free, or that
    /// the map never managed, is ignored.
    pub fn free(&mut self, idx: u32) {
        if !self.in_range(idx) || self.run_of(idx).is_some() {
            slog::warn!(self.log, "ignoring free of {idx}");
            return;
        }
        let mut low = idx;
        let mut high = idx + 1;
        if let Some(after) = self.runs.remove(&high) {
            high = after;
        }
        if let Some((&prev, &end)) = self.runs.range(..idx).next_back() {
            if end == idx {
                self.runs.remove(&prev);
                low = prev;
            }
        }
        self.runs.insert(low, high);
        slog::trace!(self.log, "freed {idx}");
    }
}

#[cfg(test)]
fn new_freemap(size: u32) -> FreeMap {
    FreeMap::new(&common::logging::test_logger(), "test", 0, size)
}

#[test]
fn test_basic() -> anyhow::Result<()> {
    let mut map = new_freemap(128);

    assert_eq!(map.alloc()?, 0);
    assert_eq!(map.alloc()?, 1);
    assert_eq!(map.available(), 126);
    assert_eq!(map.runs.first_key_value(), Some((&2, &128)));
    Ok(())
}

// Handle index 0 is kept back for the default entry
#[test]
fn test_base() -> anyhow::Result<()> {
    let log = common::logging::test_logger();
    let mut map = FreeMap::new(&log, "handles", 1, 2);
    assert_eq!(map.alloc()?, 1);
    assert_eq!(map.alloc()?, 2);
    assert!(matches!(map.alloc(), Err(ExmError::TableFull(_))));
    map.free(0);
    assert_eq!(map.available(), 0);
    Ok(())
}

#[test]
fn test_lowest_first() -> anyhow::Result<()> {
    let mut map = new_freemap(16);
    for _ in 0..8 {
        map.alloc()?;
    }
    map.free(5);
    map.free(2);
    assert_eq!(map.alloc()?, 2);
    assert_eq!(map.alloc()?, 5);
    assert_eq!(map.alloc()?, 8);
    Ok(())
}

#[test]
fn test_coalesce() -> anyhow::Result<()> {
    let mut map = new_freemap(128);
    let mut s = Vec::new();
    for _ in 0..128 {
        s.push(map.alloc().expect("exhausted pool prematurely"));
    }
    map.alloc().unwrap_err();

    // Out of order, so both neighbors have to be merged at some point
    for idx in [3, 1, 2, 0] {
        map.free(idx);
    }
    assert_eq!(map.runs.len(), 1);
    assert_eq!(map.runs.first_key_value(), Some((&0, &4)));

    // Double free changes nothing
    map.free(2);
    assert_eq!(map.available(), 4);

    while let Some(idx) = s.pop() {
        map.free(idx);
    }
    assert_eq!(map.runs.len(), 1);
    assert_eq!(map.available(), 128);
    Ok(())
}

#[test]
fn test_claim() -> anyhow::Result<()> {
    let mut map = new_freemap(8);
    map.claim(0)?;
    map.claim(3)?;
    map.claim(7)?;
    assert!(map.claim(3).is_err());
    assert!(map.claim(8).is_err());

    let mut got = Vec::new();
    while let Ok(idx) = map.alloc() {
        got.push(idx);
    }
    assert_eq!(got, vec![1, 2, 4, 5, 6]);
    Ok(())
}
