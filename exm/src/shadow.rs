// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The software view of a table instance.
//!
//! Every change made while a savepoint is open is paired with an undo record
//! holding the value it replaced.  Rolling back to a savepoint replays those
//! records newest first, which leaves the maps exactly as they were when the
//! savepoint was taken.  Savepoints nest: an explicit transaction holds the
//! outermost one and each mutating call holds its own inside it.
//!
//! The state also mirrors what the instance has written to each slot on the
//! device.  Device writes are journaled the same way, so a rollback knows
//! exactly which writes reached the device and what each one replaced.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use aal::ActionSpec;
use aal::Addressing;
use aal::EntryHandle;
use aal::EntryWord;
use aal::IndirectPtrs;
use aal::MatchKey;
use aal::PipeSel;
use aal::ResourceClass;
use aal::ResourceLoc;
use aal::ResourcePtr;
use aal::SlotIdx;
use aal::StageId;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::Logger;

use crate::freemap::FreeMap;
use crate::graph::OccupancyGraph;
use crate::graph::WordId;
use crate::search::MoveList;
use crate::search::MoveOp;
use crate::types::ExmError;
use crate::types::ExmResult;

/// Where an entry physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysLocation {
    pub pipe: PipeSel,
    pub stage: StageId,
    pub slot: SlotIdx,
    /// Table-wide index used to address idle-time and statistics state:
    /// the stage's first index plus the slot.
    pub logical_index: u32,
}

/// The attached resources an action holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachments {
    /// Pointer block carried in the match word.
    pub ptrs: IndirectPtrs,
    /// The caller's index for each live indirect resource.
    pub indices: BTreeMap<ResourceClass, u32>,
    /// Live directly-addressed resources.
    pub direct: BTreeSet<ResourceClass>,
}

/// Everything known about an installed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub handle: EntryHandle,
    pub pipe: PipeSel,
    pub key: MatchKey,
    pub action: ActionSpec,
    pub ttl: Option<u32>,
    pub stage: StageId,
    pub slot: SlotIdx,
    pub attached: Attachments,
    /// Present for proxy-hash tables.
    pub digest: Option<u64>,
    /// The words this entry's key hashes to in its stage.
    pub candidates: Vec<WordId>,
}

impl EntryRecord {
    pub fn word(&self) -> EntryWord<'_> {
        EntryWord {
            key: &self.key,
            digest: self.digest,
            action: &self.action,
            ptrs: &self.attached.ptrs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultEntry {
    pub handle: EntryHandle,
    pub action: ActionSpec,
    pub attached: Attachments,
}

/// A side effect on an attached-resource manager, recorded so it can be
/// reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceUndo {
    Attached {
        class: ResourceClass,
        addressing: Addressing,
        loc: ResourceLoc,
        ptr: ResourcePtr,
    },
    Detached {
        class: ResourceClass,
        addressing: Addressing,
        loc: ResourceLoc,
        addr: u32,
    },
    Relocated {
        class: ResourceClass,
        loc: ResourceLoc,
        from: u32,
        to: u32,
    },
}

/// A write to the device, recorded with what it replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceUndo {
    /// A slot was programmed or cleared.
    Slot {
        stage: StageId,
        slot: SlotIdx,
        old: Option<Vec<u8>>,
    },
    /// An entry's copy was carried from `src` to `dst`, and the copy at
    /// `src` has been cleared.
    Move {
        stage: StageId,
        src: SlotIdx,
        src_old: Option<Vec<u8>>,
        dst: SlotIdx,
        dst_old: Option<Vec<u8>>,
    },
}

/// One side effect a rollback has to reverse outside the maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reversal {
    Resource(ResourceUndo),
    Device(DeviceUndo),
}

#[derive(Debug, Clone)]
enum Undo {
    Entry {
        handle: EntryHandle,
        old: Option<EntryRecord>,
    },
    Slot {
        stage: StageId,
        slot: SlotIdx,
        old: Option<EntryHandle>,
    },
    Location {
        handle: EntryHandle,
        old: Option<PhysLocation>,
    },
    Digest {
        stage: StageId,
        digest: u64,
        old: Option<EntryHandle>,
    },
    Graph {
        stage: StageId,
        slot: SlotIdx,
        old: Option<Vec<WordId>>,
    },
    Default {
        old: Option<DefaultEntry>,
    },
    Resource(ResourceUndo),
    Device(DeviceUndo),
}

struct Savepoint {
    mark: usize,
    handles: FreeMap,
}

/// What a rollback could not undo by itself: resource-manager side effects
/// and device writes, newest first, and whether the default register needs
/// rewriting.  A call that failed before touching anything outside the maps
/// leaves nothing here.
#[derive(Debug, Default)]
pub struct Compensation {
    pub steps: Vec<Reversal>,
    pub default: bool,
}

impl Compensation {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && !self.default
    }
}

/// The maps making up an instance's software state.  Cloning it gives a
/// snapshot that can be compared against later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowMaps {
    pub entries: BTreeMap<EntryHandle, EntryRecord>,
    pub slots: BTreeMap<(StageId, SlotIdx), EntryHandle>,
    pub locations: BTreeMap<EntryHandle, PhysLocation>,
    pub digests: BTreeMap<(StageId, u64), EntryHandle>,
    pub default: Option<DefaultEntry>,
    pub graphs: BTreeMap<StageId, OccupancyGraph>,
}

pub struct ShadowState {
    log: Logger,
    pipe: PipeSel,
    maps: ShadowMaps,
    // First logical index of each stage
    bases: BTreeMap<StageId, u32>,
    handles: FreeMap,
    // Last word written to each slot by this instance
    device: BTreeMap<(StageId, SlotIdx), Vec<u8>>,
    undo: Vec<Undo>,
    savepoints: Vec<Savepoint>,
}

/// Handle index reserved for the default entry.
pub const DEFAULT_HANDLE_INDEX: u32 = 0;

impl ShadowState {
    /// Create the state for one instance.  `stages` lists each stage's
    /// graph and first logical index.
    pub fn new(
        log: &Logger,
        pipe: PipeSel,
        stages: Vec<(StageId, OccupancyGraph, u32)>,
    ) -> Self {
        let log = log.new(slog::o!("unit" => format!("shadow_{pipe}")));
        let capacity = stages.iter().map(|(_, g, _)| g.capacity()).sum();
        let handles = FreeMap::new(&log, format!("handles_{pipe}"), 1, capacity);
        let mut graphs = BTreeMap::new();
        let mut bases = BTreeMap::new();
        for (stage, graph, base) in stages {
            graphs.insert(stage, graph);
            bases.insert(stage, base);
        }
        ShadowState {
            log,
            pipe,
            maps: ShadowMaps {
                entries: BTreeMap::new(),
                slots: BTreeMap::new(),
                locations: BTreeMap::new(),
                digests: BTreeMap::new(),
                default: None,
                graphs,
            },
            bases,
            handles,
            device: BTreeMap::new(),
            undo: Vec::new(),
            savepoints: Vec::new(),
        }
    }

    pub fn pipe(&self) -> PipeSel {
        self.pipe
    }

    pub fn maps(&self) -> &ShadowMaps {
        &self.maps
    }

    pub fn entry(&self, handle: EntryHandle) -> Option<&EntryRecord> {
        self.maps.entries.get(&handle)
    }

    pub fn entries(&self) -> impl Iterator<Item = &EntryRecord> {
        self.maps.entries.values()
    }

    pub fn len(&self) -> usize {
        self.maps.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.entries.is_empty() && self.maps.default.is_none()
    }

    pub fn location(&self, handle: EntryHandle) -> Option<PhysLocation> {
        self.maps.locations.get(&handle).copied()
    }

    pub fn slot_owner(&self, stage: StageId, slot: SlotIdx) -> Option<EntryHandle> {
        self.maps.slots.get(&(stage, slot)).copied()
    }

    pub fn digest_owner(&self, stage: StageId, digest: u64) -> Option<EntryHandle> {
        self.maps.digests.get(&(stage, digest)).copied()
    }

    pub fn graph(&self, stage: StageId) -> ExmResult<&OccupancyGraph> {
        self.maps
            .graphs
            .get(&stage)
            .ok_or(ExmError::NoSuchStage(stage))
    }

    pub fn default_entry(&self) -> Option<&DefaultEntry> {
        self.maps.default.as_ref()
    }

    pub fn default_handle(&self) -> EntryHandle {
        EntryHandle::new(self.pipe, DEFAULT_HANDLE_INDEX)
    }

    /// Number of open savepoints.
    pub fn depth(&self) -> usize {
        self.savepoints.len()
    }

    pub fn savepoint(&mut self) {
        self.savepoints.push(Savepoint {
            mark: self.undo.len(),
            handles: self.handles.clone(),
        });
    }

    /// Keep everything done since the innermost savepoint.  Once the last
    /// savepoint is gone the undo log is discarded.
    pub fn release(&mut self) -> ExmResult<()> {
        self.savepoints
            .pop()
            .ok_or_else(|| ExmError::Internal("no savepoint to release".into()))?;
        if self.savepoints.is_empty() {
            self.undo.clear();
        }
        Ok(())
    }

    /// Undo everything done since the innermost savepoint.
    pub fn rollback(&mut self) -> ExmResult<Compensation> {
        let sp = self
            .savepoints
            .pop()
            .ok_or_else(|| ExmError::Internal("no savepoint to roll back".into()))?;
        let records = self.undo.split_off(sp.mark);
        debug!(self.log, "rolling back"; "records" => records.len());

        let mut comp = Compensation::default();
        for undo in records.into_iter().rev() {
            self.apply_undo(undo, &mut comp)?;
        }
        self.handles = sp.handles;
        Ok(comp)
    }

    fn apply_undo(&mut self, undo: Undo, comp: &mut Compensation) -> ExmResult<()> {
        let maps = &mut self.maps;
        match undo {
            Undo::Entry { handle, old } => {
                restore(&mut maps.entries, handle, old);
            }
            Undo::Slot { stage, slot, old } => {
                restore(&mut maps.slots, (stage, slot), old);
            }
            Undo::Location { handle, old } => {
                restore(&mut maps.locations, handle, old);
            }
            Undo::Digest { stage, digest, old } => {
                restore(&mut maps.digests, (stage, digest), old);
            }
            Undo::Graph { stage, slot, old } => {
                maps.graphs
                    .get_mut(&stage)
                    .ok_or(ExmError::NoSuchStage(stage))?
                    .put(slot, old)?;
            }
            Undo::Default { old } => {
                comp.default = true;
                maps.default = old;
            }
            Undo::Resource(r) => comp.steps.push(Reversal::Resource(r)),
            Undo::Device(d) => {
                match &d {
                    DeviceUndo::Slot { stage, slot, old } => {
                        restore(&mut self.device, (*stage, *slot), old.clone());
                    }
                    DeviceUndo::Move {
                        stage,
                        src,
                        src_old,
                        dst,
                        dst_old,
                    } => {
                        restore(&mut self.device, (*stage, *dst), dst_old.clone());
                        restore(&mut self.device, (*stage, *src), src_old.clone());
                    }
                }
                comp.steps.push(Reversal::Device(d));
            }
        }
        Ok(())
    }

    fn record(&mut self, undo: Undo) {
        if !self.savepoints.is_empty() {
            self.undo.push(undo);
        }
    }

    /// Note an attached-resource side effect so a rollback can reverse it.
    pub fn record_resource(&mut self, undo: ResourceUndo) {
        self.record(Undo::Resource(undo));
    }

    /// The word this instance last wrote to a slot, if the slot is valid.
    pub fn device_word(&self, stage: StageId, slot: SlotIdx) -> Option<&Vec<u8>> {
        self.device.get(&(stage, slot))
    }

    /// Note that a slot on the device was programmed with `word`, or cleared
    /// if there is none.
    pub fn note_device(&mut self, stage: StageId, slot: SlotIdx, word: Option<Vec<u8>>) {
        let old = match word {
            Some(w) => self.device.insert((stage, slot), w),
            None => self.device.remove(&(stage, slot)),
        };
        self.record(Undo::Device(DeviceUndo::Slot { stage, slot, old }));
    }

    /// Note that the copy at `src` was cleared after its entry had been
    /// written to `dst`.  The two writes are journaled as one move, which a
    /// rollback reverses as a move back.
    pub fn note_moved(&mut self, stage: StageId, src: SlotIdx, dst: SlotIdx) {
        let src_old = self.device.remove(&(stage, src));
        for u in self.undo.iter_mut().rev() {
            if let Undo::Device(DeviceUndo::Slot { stage: s, slot, old }) = u {
                if *s == stage && *slot == dst {
                    let dst_old = old.take();
                    *u = Undo::Device(DeviceUndo::Move {
                        stage,
                        src,
                        src_old,
                        dst,
                        dst_old,
                    });
                    return;
                }
            }
        }
        self.record(Undo::Device(DeviceUndo::Slot {
            stage,
            slot: src,
            old: src_old,
        }));
    }

    fn put_entry(&mut self, handle: EntryHandle, rec: Option<EntryRecord>) {
        let old = match rec {
            Some(r) => self.maps.entries.insert(handle, r),
            None => self.maps.entries.remove(&handle),
        };
        self.record(Undo::Entry { handle, old });
    }

    fn put_slot(&mut self, stage: StageId, slot: SlotIdx, h: Option<EntryHandle>) {
        let old = match h {
            Some(h) => self.maps.slots.insert((stage, slot), h),
            None => self.maps.slots.remove(&(stage, slot)),
        };
        self.record(Undo::Slot { stage, slot, old });
    }

    fn put_location(&mut self, handle: EntryHandle, loc: Option<PhysLocation>) {
        let old = match loc {
            Some(l) => self.maps.locations.insert(handle, l),
            None => self.maps.locations.remove(&handle),
        };
        self.record(Undo::Location { handle, old });
    }

    fn put_digest(&mut self, stage: StageId, digest: u64, h: Option<EntryHandle>) {
        let old = match h {
            Some(h) => self.maps.digests.insert((stage, digest), h),
            None => self.maps.digests.remove(&(stage, digest)),
        };
        self.record(Undo::Digest { stage, digest, old });
    }

    fn put_graph(
        &mut self,
        stage: StageId,
        slot: SlotIdx,
        alts: Option<Vec<WordId>>,
    ) -> ExmResult<()> {
        let old = self
            .maps
            .graphs
            .get_mut(&stage)
            .ok_or(ExmError::NoSuchStage(stage))?
            .put(slot, alts)?;
        self.record(Undo::Graph { stage, slot, old });
        Ok(())
    }

    fn physical(&self, stage: StageId, slot: SlotIdx) -> ExmResult<PhysLocation> {
        let base = self
            .bases
            .get(&stage)
            .ok_or(ExmError::NoSuchStage(stage))?;
        Ok(PhysLocation {
            pipe: self.pipe,
            stage,
            slot,
            logical_index: base + slot.0,
        })
    }

    pub fn alloc_handle(&mut self) -> ExmResult<EntryHandle> {
        let idx = self.handles.alloc()?;
        Ok(EntryHandle::new(self.pipe, idx))
    }

    /// Take a specific handle out of the free pool.
    pub fn claim_handle(&mut self, handle: EntryHandle) -> ExmResult<()> {
        if handle.pipe() != self.pipe {
            return Err(ExmError::Invalid(format!(
                "handle {handle} does not belong to {}",
                self.pipe
            )));
        }
        self.handles.claim(handle.index())
    }

    // Record an entry as resident at its stage and slot.
    fn occupy(&mut self, rec: EntryRecord) -> ExmResult<()> {
        let (handle, stage, slot) = (rec.handle, rec.stage, rec.slot);
        let loc = self.physical(stage, slot)?;
        self.put_graph(stage, slot, Some(rec.candidates.clone()))?;
        self.put_slot(stage, slot, Some(handle));
        self.put_location(handle, Some(loc));
        self.put_entry(handle, Some(rec));
        Ok(())
    }

    // Clear a slot if, and only if, it still belongs to `handle`.
    fn vacate(&mut self, stage: StageId, slot: SlotIdx, handle: EntryHandle) -> ExmResult<()> {
        if self.slot_owner(stage, slot) == Some(handle) {
            self.put_slot(stage, slot, None);
            self.put_graph(stage, slot, None)?;
        }
        Ok(())
    }

    /// Install an entry at the position recorded in it, outside of any move
    /// list.  Used when restoring state.
    pub fn insert(&mut self, rec: EntryRecord) -> ExmResult<()> {
        if let Some(owner) = self.slot_owner(rec.stage, rec.slot) {
            return Err(ExmError::Invalid(format!(
                "{} slot {} already holds {owner}",
                rec.stage, rec.slot
            )));
        }
        if self.maps.entries.contains_key(&rec.handle) {
            return Err(ExmError::Invalid(format!("{} already present", rec.handle)));
        }
        if let Some(d) = rec.digest {
            self.put_digest(rec.stage, d, Some(rec.handle));
        }
        self.occupy(rec)
    }

    /// Apply a move list to the maps.  The list is walked back to front: the
    /// new entry claims its landing slot first, and each displaced entry then
    /// takes over the slot vacated below it.  Each node names its own handle,
    /// so the order of application does not change the result.
    pub fn commit(
        &mut self,
        list: &MoveList,
        mut new_entry: Option<EntryRecord>,
    ) -> ExmResult<()> {
        for node in list.nodes().iter().rev() {
            let (stage, handle) = (node.stage, node.handle);
            match node.op {
                MoveOp::Add { dst } => {
                    let mut rec = new_entry
                        .take()
                        .filter(|r| r.handle == handle)
                        .ok_or_else(|| {
                            ExmError::Internal(format!(
                                "no record for new entry {handle}"
                            ))
                        })?;
                    rec.stage = stage;
                    rec.slot = dst;
                    if let Some(d) = rec.digest {
                        self.put_digest(stage, d, Some(handle));
                    }
                    self.occupy(rec)?;
                }
                MoveOp::Move { src, dst } => {
                    let mut rec = self
                        .entry(handle)
                        .cloned()
                        .ok_or(ExmError::NoSuchHandle(handle))?;
                    if rec.stage != stage || rec.slot != src {
                        return Err(ExmError::Internal(format!(
                            "{handle} is at {} slot {}, not {stage} slot {src}",
                            rec.stage, rec.slot
                        )));
                    }
                    self.vacate(stage, src, handle)?;
                    rec.slot = dst;
                    self.occupy(rec)?;
                }
                MoveOp::Delete { src } => {
                    let rec = self
                        .entry(handle)
                        .cloned()
                        .ok_or(ExmError::NoSuchHandle(handle))?;
                    if rec.stage != stage || rec.slot != src {
                        return Err(ExmError::Internal(format!(
                            "{handle} is at {} slot {}, not {stage} slot {src}",
                            rec.stage, rec.slot
                        )));
                    }
                    self.vacate(stage, src, handle)?;
                    if let Some(d) = rec.digest {
                        if self.digest_owner(stage, d) == Some(handle) {
                            self.put_digest(stage, d, None);
                        }
                    }
                    self.put_location(handle, None);
                    self.put_entry(handle, None);
                    self.handles.free(handle.index());
                }
            }
        }
        Ok(())
    }

    /// Replace an entry's action and attachments without moving it.
    pub fn update_action(
        &mut self,
        handle: EntryHandle,
        action: ActionSpec,
        attached: Attachments,
    ) -> ExmResult<()> {
        let mut rec = self
            .entry(handle)
            .cloned()
            .ok_or(ExmError::NoSuchHandle(handle))?;
        rec.action = action;
        rec.attached = attached;
        self.put_entry(handle, Some(rec));
        Ok(())
    }

    pub fn set_default(&mut self, entry: Option<DefaultEntry>) {
        let old = std::mem::replace(&mut self.maps.default, entry);
        self.record(Undo::Default { old });
    }
}

fn restore<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, old: Option<V>) {
    match old {
        Some(v) => {
            map.insert(key, v);
        }
        None => {
            map.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::MoveNode;
    use pretty_assertions::assert_eq;

    const STAGE: StageId = StageId(0);

    fn shadow() -> ShadowState {
        let log = common::logging::test_logger();
        ShadowState::new(
            &log,
            PipeSel::All,
            vec![(STAGE, OccupancyGraph::new(4, 1), 0)],
        )
    }

    fn record(handle: EntryHandle, key: u64, slot: u32) -> EntryRecord {
        EntryRecord {
            handle,
            pipe: PipeSel::All,
            key: MatchKey::from(key),
            action: ActionSpec::new(1, vec![key as u8]),
            ttl: None,
            stage: STAGE,
            slot: SlotIdx(slot),
            attached: Attachments::default(),
            digest: None,
            candidates: vec![0, 1],
        }
    }

    fn node(handle: EntryHandle, op: MoveOp) -> MoveNode {
        MoveNode {
            pipe: PipeSel::All,
            stage: STAGE,
            handle,
            op,
            entry: None,
        }
    }

    #[test]
    fn test_commit_chain() -> anyhow::Result<()> {
        let mut s = shadow();
        let a = s.alloc_handle()?;
        s.insert(record(a, 1, 0))?;

        // b lands in slot 0 once a has moved to slot 1
        let b = s.alloc_handle()?;
        let list = MoveList::from(vec![
            node(a, MoveOp::Move { src: SlotIdx(0), dst: SlotIdx(1) }),
            node(b, MoveOp::Add { dst: SlotIdx(0) }),
        ]);
        s.commit(&list, Some(record(b, 2, 0)))?;

        assert_eq!(s.slot_owner(STAGE, SlotIdx(0)), Some(b));
        assert_eq!(s.slot_owner(STAGE, SlotIdx(1)), Some(a));
        assert_eq!(s.location(a).unwrap().slot, SlotIdx(1));
        assert_eq!(s.graph(STAGE)?.used(), 2);
        Ok(())
    }

    #[test]
    fn test_rollback_exact() -> anyhow::Result<()> {
        let mut s = shadow();
        let a = s.alloc_handle()?;
        s.insert(record(a, 1, 0))?;
        let before = s.maps().clone();

        s.savepoint();
        let b = s.alloc_handle()?;
        let list = MoveList::from(vec![
            node(a, MoveOp::Move { src: SlotIdx(0), dst: SlotIdx(1) }),
            node(b, MoveOp::Add { dst: SlotIdx(0) }),
        ]);
        s.commit(&list, Some(record(b, 2, 0)))?;
        s.record_resource(ResourceUndo::Relocated {
            class: ResourceClass::Counter,
            loc: ResourceLoc {
                pipe: PipeSel::All,
                stage: STAGE,
            },
            from: 0,
            to: 1,
        });
        let comp = s.rollback()?;

        assert_eq!(s.maps(), &before);
        // Nothing reached the device, so only the resource step is left
        assert_eq!(comp.steps.len(), 1);
        assert!(matches!(comp.steps[0], Reversal::Resource(_)));
        // The handle allocator is back where it was too
        assert_eq!(s.alloc_handle()?, b);
        Ok(())
    }

    #[test]
    fn test_device_journal() -> anyhow::Result<()> {
        let mut s = shadow();
        s.note_device(STAGE, SlotIdx(0), Some(vec![1]));
        s.note_device(STAGE, SlotIdx(2), Some(vec![2]));

        s.savepoint();
        // A move of the word at 0 to 1, then a half-finished one of the
        // word at 2 to 3
        s.note_device(STAGE, SlotIdx(1), Some(vec![1]));
        s.note_moved(STAGE, SlotIdx(0), SlotIdx(1));
        s.note_device(STAGE, SlotIdx(3), Some(vec![2]));
        assert_eq!(s.device_word(STAGE, SlotIdx(0)), None);
        let comp = s.rollback()?;

        assert_eq!(
            comp.steps,
            vec![
                Reversal::Device(DeviceUndo::Slot {
                    stage: STAGE,
                    slot: SlotIdx(3),
                    old: None,
                }),
                Reversal::Device(DeviceUndo::Move {
                    stage: STAGE,
                    src: SlotIdx(0),
                    src_old: Some(vec![1]),
                    dst: SlotIdx(1),
                    dst_old: None,
                }),
            ]
        );
        assert_eq!(s.device_word(STAGE, SlotIdx(0)), Some(&vec![1]));
        assert_eq!(s.device_word(STAGE, SlotIdx(1)), None);
        assert_eq!(s.device_word(STAGE, SlotIdx(2)), Some(&vec![2]));
        assert_eq!(s.device_word(STAGE, SlotIdx(3)), None);
        Ok(())
    }

    #[test]
    fn test_nested() -> anyhow::Result<()> {
        let mut s = shadow();
        s.savepoint();
        let a = s.alloc_handle()?;
        s.savepoint();
        s.insert(record(a, 1, 2))?;
        s.release()?;

        s.savepoint();
        let b = s.alloc_handle()?;
        s.insert(record(b, 2, 3))?;
        s.rollback()?;
        assert!(s.entry(a).is_some());
        assert!(s.entry(b).is_none());

        s.rollback()?;
        assert!(s.is_empty());
        assert_eq!(s.graph(STAGE)?.used(), 0);
        assert!(s.rollback().is_err());
        Ok(())
    }

    #[test]
    fn test_delete() -> anyhow::Result<()> {
        let mut s = shadow();
        let a = s.alloc_handle()?;
        s.insert(record(a, 1, 3))?;
        let list =
            MoveList::from(vec![node(a, MoveOp::Delete { src: SlotIdx(3) })]);
        s.commit(&list, None)?;
        assert!(s.entry(a).is_none());
        assert!(s.location(a).is_none());
        assert_eq!(s.slot_owner(STAGE, SlotIdx(3)), None);

        // A stale list is refused
        assert!(s.commit(&list, None).is_err());
        Ok(())
    }
}
