// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Candidate expansion and the eviction-chain search.
//!
//! A key may live in one word per way.  If none of those words has a free
//! sub-position, a breadth-first search walks outward through the residents'
//! alternate words until it finds one that does.  The chain of displacements
//! leading back to the key's own candidate word is returned deepest first,
//! which is the order in which the moves can be made without ever leaving a
//! key unmatched.

use std::collections::VecDeque;

use aal::ActionSpec;
use aal::EntryHandle;
use aal::HashValues;
use aal::MatchKey;
use aal::PipeSel;
use aal::SlotIdx;
use aal::StageId;
use serde::Deserialize;
use serde::Serialize;

use crate::graph::OccupancyGraph;
use crate::graph::WordId;

/// Expand a stage hash into one candidate word per way.  Ways are laid out
/// way-major, so way `w`'s words start at `w * words_per_way`.
pub fn expand_candidates(
    hv: &HashValues,
    ways: u8,
    words_per_way: u32,
) -> Vec<WordId> {
    let bits = if words_per_way <= 1 {
        0
    } else {
        32 - (words_per_way - 1).leading_zeros()
    };
    (0..ways as u32)
        .map(|way| {
            let idx = (hv.bits(way * bits, bits) % words_per_way as u64) as u32;
            way * words_per_way + idx
        })
        .collect()
}

/// The data needed to program a brand new entry.  Only add nodes carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntry {
    pub key: MatchKey,
    pub action: ActionSpec,
    pub ttl: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MoveOp {
    Add { dst: SlotIdx },
    Move { src: SlotIdx, dst: SlotIdx },
    Delete { src: SlotIdx },
}

/// One step of a move list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveNode {
    pub pipe: PipeSel,
    pub stage: StageId,
    pub handle: EntryHandle,
    pub op: MoveOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<NewEntry>,
}

impl MoveNode {
    pub fn src(&self) -> Option<SlotIdx> {
        match self.op {
            MoveOp::Add { .. } => None,
            MoveOp::Move { src, .. } | MoveOp::Delete { src } => Some(src),
        }
    }

    pub fn dst(&self) -> Option<SlotIdx> {
        match self.op {
            MoveOp::Add { dst } | MoveOp::Move { dst, .. } => Some(dst),
            MoveOp::Delete { .. } => None,
        }
    }
}

/// An ordered list of placement operations.  Hardware consumes it front to
/// back; the shadow state commits it back to front.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveList {
    nodes: Vec<MoveNode>,
}

impl MoveList {
    pub fn new() -> Self {
        MoveList::default()
    }

    pub fn push(&mut self, node: MoveNode) {
        self.nodes.push(node);
    }

    pub fn nodes(&self) -> &[MoveNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of existing entries displaced by the list.
    pub fn displacements(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.op, MoveOp::Move { .. }))
            .count()
    }
}

impl From<Vec<MoveNode>> for MoveList {
    fn from(nodes: Vec<MoveNode>) -> Self {
        MoveList { nodes }
    }
}

/// One displacement found by the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hop {
    pub src: SlotIdx,
    pub dst: SlotIdx,
}

/// The result of a successful search: the displacements to make, deepest
/// first, and the slot that is free for the new resident once they are done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionChain {
    pub hops: Vec<Hop>,
    pub landing: SlotIdx,
}

struct Visit {
    word: WordId,
    // The visit this word was reached from, and the sub-position in that
    // word whose resident would move here.
    parent: Option<(usize, u8)>,
    depth: u8,
}

/// Find a home for a key whose candidate words are `candidates`.
///
/// A free sub-position in any candidate word is used directly.  Otherwise the
/// search is breadth-first, so the shortest chain wins, and is bounded by
/// `max_moves` displacements.  `exclude` names a word that must not be used
/// at all, which is how an entry moving out of its own word is kept from
/// landing back in it.  The search is deterministic for a given graph.
pub fn find_placement(
    graph: &OccupancyGraph,
    candidates: &[WordId],
    max_moves: u8,
    exclude: Option<WordId>,
) -> Option<EvictionChain> {
    let usable = |w: WordId| w < graph.words() && Some(w) != exclude;

    for &word in candidates.iter().filter(|w| usable(**w)) {
        if let Some(sub) = graph.free_sub(word) {
            return Some(EvictionChain {
                hops: Vec::new(),
                landing: graph.slot_of(word, sub),
            });
        }
    }
    if max_moves == 0 {
        return None;
    }

    let mut visited = vec![false; graph.words() as usize];
    if let Some(x) = exclude {
        if let Some(v) = visited.get_mut(x as usize) {
            *v = true;
        }
    }
    let mut visits: Vec<Visit> = Vec::new();
    let mut queue = VecDeque::new();
    for &word in candidates {
        if !usable(word) || visited[word as usize] {
            continue;
        }
        visited[word as usize] = true;
        queue.push_back(visits.len());
        visits.push(Visit {
            word,
            parent: None,
            depth: 0,
        });
    }

    while let Some(at) = queue.pop_front() {
        let (word, depth) = (visits[at].word, visits[at].depth);
        if depth >= max_moves {
            continue;
        }
        for (sub, alternates) in graph.residents(word) {
            for &alt in alternates {
                if alt >= graph.words() || visited[alt as usize] {
                    continue;
                }
                visited[alt as usize] = true;
                visits.push(Visit {
                    word: alt,
                    parent: Some((at, sub)),
                    depth: depth + 1,
                });
                if let Some(free) = graph.free_sub(alt) {
                    return Some(unwind_chain(graph, &visits, free));
                }
                queue.push_back(visits.len() - 1);
            }
        }
    }
    None
}

// Walk parent pointers from the last visit, which has a free sub-position,
// back to the root.  Each step moves the parent's resident into the slot
// just vacated below it.
fn unwind_chain(
    graph: &OccupancyGraph,
    visits: &[Visit],
    free: u8,
) -> EvictionChain {
    let mut at = visits.len() - 1;
    let mut dst = graph.slot_of(visits[at].word, free);
    let mut hops = Vec::new();
    while let Some((parent, sub)) = visits[at].parent {
        let src = graph.slot_of(visits[parent].word, sub);
        hops.push(Hop { src, dst });
        dst = src;
        at = parent;
    }
    EvictionChain {
        hops,
        landing: dst,
    }
}
