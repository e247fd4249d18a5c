// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::collections::VecDeque;

use aal::SlotIdx;
use aal::StageId;

/// The match memory and address-lock register of a single stage.
#[derive(Debug, Default)]
struct StageMemory {
    // Only slots with the valid bit set are present
    words: BTreeMap<SlotIdx, Vec<u8>>,
    addr_lock: VecDeque<SlotIdx>,
}

/// The per-pipe view of the device.  Stages are materialized on first touch.
#[derive(Debug)]
pub struct PipeMemory {
    stages: BTreeMap<StageId, StageMemory>,
    pub default: Option<Vec<u8>>,
    lock_depth: usize,
}

impl PipeMemory {
    pub fn new(lock_depth: usize) -> Self {
        PipeMemory {
            stages: BTreeMap::new(),
            default: None,
            lock_depth,
        }
    }

    fn stage(&mut self, stage: StageId) -> &mut StageMemory {
        self.stages.entry(stage).or_default()
    }

    pub fn program(&mut self, stage: StageId, slot: SlotIdx, word: Vec<u8>) {
        self.stage(stage).words.insert(slot, word);
    }

    pub fn invalidate(&mut self, stage: StageId, slot: SlotIdx) {
        self.stage(stage).words.remove(&slot);
    }

    pub fn read(&self, stage: StageId, slot: SlotIdx) -> Option<Vec<u8>> {
        self.stages
            .get(&stage)
            .and_then(|s| s.words.get(&slot))
            .cloned()
    }

    pub fn valid_slots(&self, stage: StageId) -> Vec<SlotIdx> {
        self.stages
            .get(&stage)
            .map(|s| s.words.keys().copied().collect())
            .unwrap_or_default()
    }

    // The caller has already checked the register has room.
    pub fn addr_push(&mut self, stage: StageId, slot: SlotIdx) {
        let depth = self.lock_depth;
        let reg = &mut self.stage(stage).addr_lock;
        if reg.len() < depth {
            reg.push_back(slot);
        }
    }

    // Retires the oldest held address.
    pub fn addr_pop(&mut self, stage: StageId) -> Option<SlotIdx> {
        self.stage(stage).addr_lock.pop_front()
    }

    pub fn addr_lock_held(&self, stage: StageId) -> usize {
        self.stages
            .get(&stage)
            .map(|s| s.addr_lock.len())
            .unwrap_or(0)
    }
}
