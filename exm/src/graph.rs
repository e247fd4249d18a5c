// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The per-stage occupancy graph.
//!
//! Each node is one packing word: `entries_per_word` consecutive slots that
//! live in the same memory word.  A node records which of its sub-positions
//! are occupied and, for every resident, the other words that resident could
//! legally move to.  Those alternates are the graph's edges.  Nodes are
//! addressed by plain index, so the graph is an arena that is sized once and
//! never shrinks.

use aal::SlotIdx;

use crate::types::ExmError;
use crate::types::ExmResult;

/// Index of a packing word within a stage.
pub type WordId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
struct WordNode {
    occupied: u64,
    // Indexed by sub-position.  Empty for free sub-positions.
    alternates: Vec<Vec<WordId>>,
}

impl WordNode {
    fn new(entries_per_word: u8) -> Self {
        WordNode {
            occupied: 0,
            alternates: vec![Vec::new(); entries_per_word as usize],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupancyGraph {
    entries_per_word: u8,
    nodes: Vec<WordNode>,
    used: u32,
}

impl OccupancyGraph {
    pub fn new(words: u32, entries_per_word: u8) -> Self {
        OccupancyGraph {
            entries_per_word,
            nodes: (0..words).map(|_| WordNode::new(entries_per_word)).collect(),
            used: 0,
        }
    }

    pub fn words(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn entries_per_word(&self) -> u8 {
        self.entries_per_word
    }

    pub fn capacity(&self) -> u32 {
        self.words() * self.entries_per_word as u32
    }

    /// Number of occupied slots.
    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn word_of(&self, slot: SlotIdx) -> WordId {
        slot.0 / self.entries_per_word as u32
    }

    pub fn slot_of(&self, word: WordId, sub: u8) -> SlotIdx {
        SlotIdx(word * self.entries_per_word as u32 + sub as u32)
    }

    fn locate(&self, slot: SlotIdx) -> ExmResult<(usize, u8)> {
        let word = self.word_of(slot) as usize;
        if word >= self.nodes.len() {
            return Err(ExmError::Invalid(format!(
                "slot {slot} beyond {} words",
                self.nodes.len()
            )));
        }
        Ok((word, (slot.0 % self.entries_per_word as u32) as u8))
    }

    pub fn is_occupied(&self, slot: SlotIdx) -> bool {
        match self.locate(slot) {
            Ok((word, sub)) => self.nodes[word].occupied & (1 << sub) != 0,
            Err(_) => false,
        }
    }

    /// The lowest free sub-position in a word, if any.
    pub fn free_sub(&self, word: WordId) -> Option<u8> {
        let node = self.nodes.get(word as usize)?;
        (0..self.entries_per_word).find(|&sub| node.occupied & (1 << sub) == 0)
    }

    /// The occupied sub-positions of a word and their residents' alternate
    /// words, in sub-position order.
    pub fn residents(
        &self,
        word: WordId,
    ) -> impl Iterator<Item = (u8, &[WordId])> + '_ {
        let node = self.nodes.get(word as usize);
        (0..self.entries_per_word).filter_map(move |sub| {
            let node = node?;
            if node.occupied & (1 << sub) != 0 {
                Some((sub, node.alternates[sub as usize].as_slice()))
            } else {
                None
            }
        })
    }

    /// Set or clear the resident of a slot, returning the alternates of the
    /// previous resident.  Overwriting an occupied slot is allowed: while a
    /// move list is being committed a slot may briefly be claimed by its new
    /// resident before its old one is accounted elsewhere.
    pub fn put(
        &mut self,
        slot: SlotIdx,
        alternates: Option<Vec<WordId>>,
    ) -> ExmResult<Option<Vec<WordId>>> {
        let (word, sub) = self.locate(slot)?;
        let node = &mut self.nodes[word];
        let bit = 1u64 << sub;
        let old = if node.occupied & bit != 0 {
            Some(std::mem::take(&mut node.alternates[sub as usize]))
        } else {
            None
        };
        match alternates {
            Some(alts) => {
                node.occupied |= bit;
                node.alternates[sub as usize] = alts;
                if old.is_none() {
                    self.used += 1;
                }
            }
            None => {
                node.occupied &= !bit;
                if old.is_some() {
                    self.used -= 1;
                }
            }
        }
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occupancy() -> anyhow::Result<()> {
        let mut g = OccupancyGraph::new(4, 2);
        assert_eq!(g.capacity(), 8);
        assert_eq!(g.word_of(SlotIdx(5)), 2);
        assert_eq!(g.slot_of(2, 1), SlotIdx(5));

        assert_eq!(g.put(SlotIdx(4), Some(vec![0, 3]))?, None);
        assert_eq!(g.free_sub(2), Some(1));
        assert!(g.is_occupied(SlotIdx(4)));
        assert_eq!(g.put(SlotIdx(5), Some(vec![1]))?, None);
        assert_eq!(g.free_sub(2), None);
        assert_eq!(g.used(), 2);

        let residents: Vec<_> =
            g.residents(2).map(|(s, a)| (s, a.to_vec())).collect();
        assert_eq!(residents, vec![(0, vec![0, 3]), (1, vec![1])]);

        assert_eq!(g.put(SlotIdx(4), None)?, Some(vec![0, 3]));
        assert_eq!(g.used(), 1);
        assert_eq!(g.free_sub(2), Some(0));
        assert!(g.put(SlotIdx(8), None).is_err());
        Ok(())
    }

    #[test]
    fn test_overwrite() -> anyhow::Result<()> {
        let mut g = OccupancyGraph::new(2, 1);
        g.put(SlotIdx(0), Some(vec![1]))?;
        assert_eq!(g.put(SlotIdx(0), Some(vec![]))?, Some(vec![1]));
        assert_eq!(g.used(), 1);
        Ok(())
    }
}
