// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::cmp::Ordering;

use aal::HashValues;
use aal::SlotIdx;
use aal::StageId;

use crate::config::StageConfig;
use crate::graph::OccupancyGraph;
use crate::graph::WordId;
use crate::search::expand_candidates;

/// The fixed shape of one stage's share of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageGeometry {
    pub stage: StageId,
    pub entries: u32,
    pub ways: u8,
    pub entries_per_word: u8,
    pub words_per_way: u32,
    pub max_moves: u8,
    /// Logical index of the stage's slot 0.
    pub base: u32,
}

impl StageGeometry {
    pub fn new(cfg: &StageConfig, base: u32) -> Self {
        let words = cfg.entries / cfg.entries_per_word as u32;
        StageGeometry {
            stage: StageId(cfg.stage),
            entries: cfg.entries,
            ways: cfg.ways,
            entries_per_word: cfg.entries_per_word,
            words_per_way: words / cfg.ways.max(1) as u32,
            max_moves: cfg.max_moves,
            base,
        }
    }

    pub fn words(&self) -> u32 {
        self.words_per_way * self.ways as u32
    }

    pub fn graph(&self) -> OccupancyGraph {
        OccupancyGraph::new(self.words(), self.entries_per_word)
    }

    pub fn candidates(&self, hv: &HashValues) -> Vec<WordId> {
        expand_candidates(hv, self.ways, self.words_per_way)
    }

    /// The only slot a hash-action key may use.
    pub fn hash_action_slot(&self, hv: &HashValues) -> SlotIdx {
        SlotIdx((hv.primary % self.entries as u64) as u32)
    }

    pub fn contains(&self, slot: SlotIdx) -> bool {
        slot.0 < self.entries
    }
}

/// Order the stages to try for a new entry.  Stages below `threshold` full
/// come first, in table order.  The rest follow from least to most occupied,
/// with ties going to the earlier stage.  `used` gives each stage's
/// occupancy, parallel to `stages`.
pub fn stage_order(
    stages: &[StageGeometry],
    used: &[u32],
    threshold: f64,
) -> Vec<usize> {
    let fill = |i: usize| used[i] as f64 / stages[i].entries as f64;
    let (mut under, mut over): (Vec<usize>, Vec<usize>) =
        (0..stages.len()).partition(|&i| fill(i) < threshold);
    over.sort_by(|&a, &b| {
        // Cross-multiply to compare fill ratios exactly.
        let lhs = used[a] as u64 * stages[b].entries as u64;
        let rhs = used[b] as u64 * stages[a].entries as u64;
        match lhs.cmp(&rhs) {
            Ordering::Equal => a.cmp(&b),
            o => o,
        }
    });
    under.append(&mut over);
    under
}
