// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The public face of an exact-match table.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::TryLockError;

use aal::ActionSpec;
use aal::AsicOps;
use aal::EntryCodec;
use aal::EntryHandle;
use aal::EntryWord;
use aal::HashOps;
use aal::Instruction;
use aal::MatchKey;
use aal::PipeId;
use aal::PipeSel;
use aal::ResourceLoc;
use aal::ResourceOps;
use aal::SlotIdx;
use aal::StageId;
use common::table::TableKind;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::Logger;

use crate::config::TableConfig;
use crate::graph::WordId;
use crate::replay::Replay;
use crate::resources::Coordinator;
use crate::restore::ReconcileReport;
use crate::restore::RestoreImage;
use crate::restore::RestoreRecord;
use crate::restore::RESTORE_VERSION;
use crate::search::find_placement;
use crate::search::EvictionChain;
use crate::search::MoveList;
use crate::search::MoveNode;
use crate::search::MoveOp;
use crate::search::NewEntry;
use crate::session::Session;
use crate::shadow::DefaultEntry;
use crate::shadow::EntryRecord;
use crate::shadow::PhysLocation;
use crate::shadow::ShadowState;
use crate::shadow::DEFAULT_HANDLE_INDEX;
use crate::types::ExmError;
use crate::types::ExmResult;

mod rollback;
pub mod stage;

pub use stage::StageGeometry;

/// Basic statistics about table usage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TableUsage {
    /// Maximum number of entries in the table
    pub size: u32,
    /// Current number of entries in the table
    pub occupancy: u32,
    /// Total number of entries inserted over time
    pub inserts: u64,
    /// Total number of entries deleted over time
    pub deletes: u64,
    /// Number of entries modified over time
    pub updates: u64,
    /// Number of resident entries displaced to make room
    pub moves: u64,
    /// Number of stage placements refused because of a hash or digest
    /// collision
    pub collisions: u64,
    /// Number of inserts refused because the key was already present
    pub duplicates: u64,
    /// Number of modifies failed due to a missing entry
    pub update_misses: u64,
    /// Number of deletes failed due to a missing entry
    pub delete_misses: u64,
    /// Number of inserts that failed due to space exhaustion
    pub exhaustion: u64,
    /// Number of calls that failed and were rolled back
    pub rollbacks: u64,
}

/// One stage's fill level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StageOccupancy {
    pub stage: StageId,
    pub used: u32,
    pub capacity: u32,
}

/// One copy of the table's state.  Symmetric tables have a single instance
/// covering every pipe; asymmetric tables have one per pipe.
pub(crate) struct Instance {
    pipe: PipeSel,
    shadow: ShadowState,
    usage: TableUsage,
    next_lock: u32,
    txn_open: bool,
}

// Where a new entry is going and what it needs to get there.
struct Home {
    stage: usize,
    chain: EvictionChain,
    candidates: Vec<WordId>,
    digest: Option<u64>,
}

pub struct ExmTable {
    log: Logger,
    config: TableConfig,
    stages: Vec<StageGeometry>,
    hash: Arc<dyn HashOps>,
    codec: Arc<dyn EntryCodec>,
    resources: Arc<dyn ResourceOps>,
    instances: BTreeMap<PipeSel, Mutex<Instance>>,
}

impl ExmTable {
    pub fn new(
        log: &Logger,
        config: TableConfig,
        hash: Arc<dyn HashOps>,
        codec: Arc<dyn EntryCodec>,
        resources: Arc<dyn ResourceOps>,
    ) -> ExmResult<Self> {
        config.validate()?;
        let log = log.new(slog::o!("unit" => "exm", "table" => config.name.clone()));

        let mut stages = Vec::new();
        let mut base = 0;
        for s in &config.stages {
            stages.push(StageGeometry::new(s, base));
            base += s.entries;
        }

        let pipes: Vec<PipeSel> = if config.symmetric {
            vec![PipeSel::All]
        } else {
            (0..config.pipes).map(|p| PipeSel::Pipe(PipeId(p))).collect()
        };
        let mut instances = BTreeMap::new();
        for pipe in pipes {
            let shadow = ShadowState::new(
                &log,
                pipe,
                stages.iter().map(|g| (g.stage, g.graph(), g.base)).collect(),
            );
            let usage = TableUsage {
                size: config.total_entries(),
                ..Default::default()
            };
            instances.insert(
                pipe,
                Mutex::new(Instance {
                    pipe,
                    shadow,
                    usage,
                    next_lock: 1,
                    txn_open: false,
                }),
            );
        }

        info!(log, "created table";
            "kind" => %config.kind,
            "stages" => stages.len(),
            "entries" => config.total_entries(),
            "instances" => instances.len());
        Ok(ExmTable {
            log,
            config,
            stages,
            hash,
            codec,
            resources,
            instances,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn stages(&self) -> &[StageGeometry] {
        &self.stages
    }

    /// The pipe selectors of the table's instances.
    pub fn instances(&self) -> Vec<PipeSel> {
        self.instances.keys().copied().collect()
    }

    fn instance(&self, pipe: PipeSel) -> ExmResult<&Mutex<Instance>> {
        self.instances.get(&pipe).ok_or_else(|| {
            ExmError::Invalid(format!(
                "table {} has no instance for pipe {pipe}",
                self.config.name
            ))
        })
    }

    fn instance_for(&self, handle: EntryHandle) -> ExmResult<&Mutex<Instance>> {
        self.instances
            .get(&handle.pipe())
            .ok_or(ExmError::NoSuchHandle(handle))
    }

    // Only one mutating call may be in progress per instance.  A second one
    // is refused rather than queued.
    fn writer<'m>(
        &self,
        cell: &'m Mutex<Instance>,
    ) -> ExmResult<MutexGuard<'m, Instance>> {
        cell.try_lock().map_err(|e| match e {
            TryLockError::WouldBlock => ExmError::Busy(format!(
                "table {} has a call in progress",
                self.config.name
            )),
            TryLockError::Poisoned(_) => {
                ExmError::Internal("table state poisoned".into())
            }
        })
    }

    fn reader<'m>(
        &self,
        cell: &'m Mutex<Instance>,
    ) -> ExmResult<MutexGuard<'m, Instance>> {
        cell.lock()
            .map_err(|_| ExmError::Internal("table state poisoned".into()))
    }

    fn geometry(&self, stage: StageId) -> ExmResult<&StageGeometry> {
        self.stages
            .iter()
            .find(|g| g.stage == stage)
            .ok_or(ExmError::NoSuchStage(stage))
    }

    fn coordinator(&self) -> Coordinator<'_> {
        Coordinator::new(&self.log, self.resources.as_ref(), &self.config.resources)
    }

    fn table_full(&self) -> ExmError {
        ExmError::TableFull(self.config.name.clone())
    }

    // Run a mutating call against an instance.  Whatever the call changes in
    // the shadow state is undone if it fails, and whatever it wrote to the
    // device is put back.
    fn mutate<H, T, F>(
        &self,
        sess: &Session<'_, H>,
        cell: &Mutex<Instance>,
        op: &str,
        f: F,
    ) -> ExmResult<T>
    where
        H: AsicOps,
        F: FnOnce(&mut Instance) -> ExmResult<T>,
    {
        let mut guard = self.writer(cell)?;
        let inst = &mut *guard;
        inst.shadow.savepoint();
        match f(inst) {
            Ok(v) => {
                inst.shadow.release()?;
                Ok(v)
            }
            Err(e) => {
                inst.usage.rollbacks += 1;
                Err(self.unwind(sess, inst, op, e))
            }
        }
    }

    fn replay<H: AsicOps>(
        &self,
        sess: &Session<'_, H>,
        inst: &mut Instance,
        list: &MoveList,
    ) -> ExmResult<()> {
        let coord = self.coordinator();
        let Instance {
            shadow, next_lock, ..
        } = inst;
        Replay::new(&self.log, sess, self.codec.as_ref(), &coord, next_lock)
            .run(list, shadow)
    }

    fn program_in_place<H: AsicOps>(
        &self,
        sess: &Session<'_, H>,
        inst: &mut Instance,
        handle: EntryHandle,
    ) -> ExmResult<()> {
        let rec = inst
            .shadow
            .entry(handle)
            .ok_or(ExmError::NoSuchHandle(handle))?;
        let (stage, slot) = (rec.stage, rec.slot);
        let word = self.codec.pack(&rec.word())?;
        sess.issue(Instruction::Program {
            pipe: inst.pipe,
            stage,
            slot,
            word: word.clone(),
        })?;
        inst.shadow.note_device(stage, slot, Some(word));
        Ok(())
    }

    /// Look for an installed entry with the same key in any of the words the
    /// key could occupy.
    fn find_key(&self, inst: &Instance, key: &MatchKey) -> ExmResult<Option<EntryHandle>> {
        for geo in &self.stages {
            let hv = self.hash.compute_hash(key, geo.stage)?;
            let graph = inst.shadow.graph(geo.stage)?;
            let slots: Vec<SlotIdx> = match self.config.kind {
                TableKind::HashAction => vec![geo.hash_action_slot(&hv)],
                _ => geo
                    .candidates(&hv)
                    .into_iter()
                    .flat_map(|w| {
                        (0..geo.entries_per_word).map(move |sub| graph.slot_of(w, sub))
                    })
                    .collect(),
            };
            for slot in slots {
                let found = inst
                    .shadow
                    .slot_owner(geo.stage, slot)
                    .and_then(|h| inst.shadow.entry(h))
                    .filter(|rec| rec.key == *key);
                if let Some(rec) = found {
                    return Ok(Some(rec.handle));
                }
            }
        }
        Ok(None)
    }

    // Pick the stage and slot for a new key.  Stages are tried in the order
    // given by the fill heuristic; a stage is passed over if the search finds
    // no room or, for proxy-hash tables, if another key there has the same
    // digest.
    fn find_home(&self, inst: &mut Instance, key: &MatchKey) -> ExmResult<Home> {
        let used = self
            .stages
            .iter()
            .map(|g| inst.shadow.graph(g.stage).map(|graph| graph.used()))
            .collect::<ExmResult<Vec<u32>>>()?;

        for idx in stage::stage_order(&self.stages, &used, self.config.fill_threshold) {
            let geo = &self.stages[idx];
            let hv = self.hash.compute_hash(key, geo.stage)?;
            let graph = inst.shadow.graph(geo.stage)?;

            if !self.config.kind.evicts() {
                let slot = geo.hash_action_slot(&hv);
                if graph.is_occupied(slot) {
                    inst.usage.collisions += 1;
                    return Err(ExmError::HashCollision {
                        stage: geo.stage,
                        slot,
                    });
                }
                return Ok(Home {
                    stage: idx,
                    chain: EvictionChain {
                        hops: Vec::new(),
                        landing: slot,
                    },
                    candidates: vec![graph.word_of(slot)],
                    digest: None,
                });
            }

            let candidates = geo.candidates(&hv);
            let Some(chain) = find_placement(graph, &candidates, geo.max_moves, None)
            else {
                debug!(self.log, "no room"; "stage" => %geo.stage, "key" => %key);
                continue;
            };

            let digest = if self.config.kind == TableKind::ProxyHash {
                let d = self.hash.compute_proxy_digest(key, geo.stage)?;
                if let Some(owner) = inst.shadow.digest_owner(geo.stage, d) {
                    inst.usage.collisions += 1;
                    debug!(self.log, "digest collision";
                        "stage" => %geo.stage,
                        "key" => %key,
                        "owner" => %owner);
                    continue;
                }
                Some(d)
            } else {
                None
            };

            return Ok(Home {
                stage: idx,
                chain,
                candidates,
                digest,
            });
        }
        inst.usage.exhaustion += 1;
        Err(self.table_full())
    }

    // Turn a search result into a move list for `mover`, whose own step is
    // `last`.
    fn build_list(
        &self,
        inst: &Instance,
        stage: StageId,
        chain: &EvictionChain,
        mover: EntryHandle,
        last: MoveOp,
    ) -> ExmResult<MoveList> {
        let mut list = MoveList::new();
        for hop in &chain.hops {
            let handle = inst.shadow.slot_owner(stage, hop.src).ok_or_else(|| {
                ExmError::Internal(format!(
                    "{stage} slot {} is occupied with no entry",
                    hop.src
                ))
            })?;
            list.push(MoveNode {
                pipe: inst.pipe,
                stage,
                handle,
                op: MoveOp::Move {
                    src: hop.src,
                    dst: hop.dst,
                },
                entry: None,
            });
        }
        list.push(MoveNode {
            pipe: inst.pipe,
            stage,
            handle: mover,
            op: last,
            entry: None,
        });
        Ok(list)
    }

    /// Install a new entry.  The key's candidate positions are searched,
    /// stage by stage, for a free slot or a chain of displacements ending in
    /// one; the entry's indirect resources are attached; and the move list is
    /// committed to the shadow state and then to hardware.  Direct resources
    /// are claimed during the replay, once the landing slot has been vacated
    /// and before the entry's word is written.
    pub fn place<H: AsicOps>(
        &self,
        sess: &Session<'_, H>,
        pipe: PipeSel,
        key: MatchKey,
        action: ActionSpec,
        ttl: Option<u32>,
    ) -> ExmResult<EntryHandle> {
        if key.is_empty() {
            return Err(ExmError::Invalid("empty match key".into()));
        }
        let cell = self.instance(pipe)?;
        self.mutate(sess, cell, "place", |inst| {
            if self.config.duplicate_check {
                if let Some(h) = self.find_key(inst, &key)? {
                    inst.usage.duplicates += 1;
                    return Err(ExmError::DuplicateKey(h));
                }
            }
            let handle = inst.shadow.alloc_handle().map_err(|e| match e {
                ExmError::TableFull(_) => self.table_full(),
                e => e,
            })?;
            let home = self.find_home(inst, &key)?;
            let geo = &self.stages[home.stage];
            let list = self.build_list(
                inst,
                geo.stage,
                &home.chain,
                handle,
                MoveOp::Add {
                    dst: home.chain.landing,
                },
            )?;

            let loc = ResourceLoc {
                pipe: inst.pipe,
                stage: geo.stage,
            };
            let attached = self.coordinator().attach(&mut inst.shadow, loc, None, &action)?;
            let rec = EntryRecord {
                handle,
                pipe: inst.pipe,
                key,
                action,
                ttl,
                stage: geo.stage,
                slot: home.chain.landing,
                attached,
                digest: home.digest,
                candidates: home.candidates,
            };
            inst.shadow.commit(&list, Some(rec))?;
            self.replay(sess, inst, &list)?;

            inst.usage.inserts += 1;
            inst.usage.moves += list.displacements() as u64;
            debug!(self.log, "placed";
                "handle" => %handle,
                "stage" => %geo.stage,
                "slot" => %home.chain.landing,
                "moves" => list.displacements());
            Ok(handle)
        })
    }

    /// Change an entry's action.  If the new action needs the same amount of
    /// immediate data the word is rewritten where it is.  Otherwise the entry
    /// is moved to another of its candidate positions with the new action,
    /// so no lookup ever sees a half-written word.
    pub fn move_modify<H: AsicOps>(
        &self,
        sess: &Session<'_, H>,
        handle: EntryHandle,
        action: ActionSpec,
    ) -> ExmResult<()> {
        if handle.index() == DEFAULT_HANDLE_INDEX {
            return self.set_default(sess, handle.pipe(), action).map(|_| ());
        }
        let cell = self.instance_for(handle)?;
        self.mutate(sess, cell, "modify", |inst| {
            let Some(rec) = inst.shadow.entry(handle).cloned() else {
                inst.usage.update_misses += 1;
                return Err(ExmError::NoSuchHandle(handle));
            };
            let geo = self.geometry(rec.stage)?;
            let loc = ResourceLoc {
                pipe: inst.pipe,
                stage: rec.stage,
            };
            let coord = self.coordinator();
            let (attached, stale) = coord.modify(
                &mut inst.shadow,
                loc,
                Some(rec.slot),
                &rec.attached,
                &action,
            )?;
            let in_place = self.config.kind == TableKind::HashAction
                || self.codec.immediate_bits(&rec.action)?
                    == self.codec.immediate_bits(&action)?;
            inst.shadow.update_action(handle, action, attached)?;

            if in_place {
                self.program_in_place(sess, inst, handle)?;
            } else {
                let graph = inst.shadow.graph(rec.stage)?;
                let own = graph.word_of(rec.slot);
                let Some(chain) =
                    find_placement(graph, &rec.candidates, geo.max_moves, Some(own))
                else {
                    inst.usage.exhaustion += 1;
                    return Err(self.table_full());
                };
                let list = self.build_list(
                    inst,
                    rec.stage,
                    &chain,
                    handle,
                    MoveOp::Move {
                        src: rec.slot,
                        dst: chain.landing,
                    },
                )?;
                inst.shadow.commit(&list, None)?;
                self.replay(sess, inst, &list)?;
                inst.usage.moves += list.displacements() as u64;
            }

            // Direct resources being given up never moved with the entry,
            // so they are still at its old slot.
            coord.release(&mut inst.shadow, loc, Some(rec.slot), &stale)?;
            inst.usage.updates += 1;
            debug!(self.log, "modified"; "handle" => %handle, "in_place" => in_place);
            Ok(())
        })
    }

    /// Remove an entry and release its resources.
    pub fn delete<H: AsicOps>(
        &self,
        sess: &Session<'_, H>,
        handle: EntryHandle,
    ) -> ExmResult<()> {
        if handle.index() == DEFAULT_HANDLE_INDEX {
            return self.clear_default(sess, handle.pipe());
        }
        let cell = self.instance_for(handle)?;
        self.mutate(sess, cell, "delete", |inst| {
            let Some(rec) = inst.shadow.entry(handle).cloned() else {
                inst.usage.delete_misses += 1;
                return Err(ExmError::NoSuchHandle(handle));
            };
            let loc = ResourceLoc {
                pipe: inst.pipe,
                stage: rec.stage,
            };
            let coord = self.coordinator();
            let held = coord.held(&rec.attached)?;
            coord.release(&mut inst.shadow, loc, Some(rec.slot), &held)?;

            let list = MoveList::from(vec![MoveNode {
                pipe: inst.pipe,
                stage: rec.stage,
                handle,
                op: MoveOp::Delete { src: rec.slot },
                entry: None,
            }]);
            inst.shadow.commit(&list, None)?;
            self.replay(sess, inst, &list)?;
            inst.usage.deletes += 1;
            debug!(self.log, "deleted"; "handle" => %handle);
            Ok(())
        })
    }

    pub fn get_location(&self, handle: EntryHandle) -> ExmResult<PhysLocation> {
        let inst = self.reader(self.instance_for(handle)?)?;
        inst.shadow
            .location(handle)
            .ok_or(ExmError::NoSuchHandle(handle))
    }

    pub fn get_entry(&self, handle: EntryHandle) -> ExmResult<EntryRecord> {
        let inst = self.reader(self.instance_for(handle)?)?;
        inst.shadow
            .entry(handle)
            .cloned()
            .ok_or(ExmError::NoSuchHandle(handle))
    }

    /// All entries of an instance, in handle order.
    pub fn entries(&self, pipe: PipeSel) -> ExmResult<Vec<EntryRecord>> {
        let inst = self.reader(self.instance(pipe)?)?;
        Ok(inst.shadow.entries().cloned().collect())
    }

    pub fn occupancy(&self, pipe: PipeSel) -> ExmResult<Vec<StageOccupancy>> {
        let inst = self.reader(self.instance(pipe)?)?;
        self.stages
            .iter()
            .map(|g| {
                let graph = inst.shadow.graph(g.stage)?;
                Ok(StageOccupancy {
                    stage: g.stage,
                    used: graph.used(),
                    capacity: graph.capacity(),
                })
            })
            .collect()
    }

    pub fn usage(&self, pipe: PipeSel) -> ExmResult<TableUsage> {
        let inst = self.reader(self.instance(pipe)?)?;
        Ok(TableUsage {
            occupancy: inst.shadow.len() as u32,
            ..inst.usage
        })
    }

    // Build the record for an entry arriving in a move list, checking that
    // the slot it names is one its key may occupy.
    fn incoming_record(
        &self,
        inst: &mut Instance,
        node: &MoveNode,
        dst: SlotIdx,
    ) -> ExmResult<EntryRecord> {
        let Some(new) = node.entry.clone() else {
            return Err(ExmError::Invalid(format!(
                "add of {} carries no entry",
                node.handle
            )));
        };
        let NewEntry { key, action, ttl } = new;
        if key.is_empty() {
            return Err(ExmError::Invalid("empty match key".into()));
        }
        let geo = self.geometry(node.stage)?;
        let (candidates, digest) = self.key_placement(inst, geo, &key, dst)?;
        inst.shadow.claim_handle(node.handle)?;
        let attached = self.coordinator().attach(
            &mut inst.shadow,
            ResourceLoc {
                pipe: inst.pipe,
                stage: geo.stage,
            },
            None,
            &action,
        )?;
        Ok(EntryRecord {
            handle: node.handle,
            pipe: inst.pipe,
            key,
            action,
            ttl,
            stage: geo.stage,
            slot: dst,
            attached,
            digest,
            candidates,
        })
    }

    // The candidate words and digest of a key being put at a specific slot,
    // refusing slots the key could never have been placed in.
    fn key_placement(
        &self,
        inst: &Instance,
        geo: &StageGeometry,
        key: &MatchKey,
        slot: SlotIdx,
    ) -> ExmResult<(Vec<WordId>, Option<u64>)> {
        if !geo.contains(slot) {
            return Err(ExmError::Invalid(format!(
                "{} has no slot {slot}",
                geo.stage
            )));
        }
        let hv = self.hash.compute_hash(key, geo.stage)?;
        let graph = inst.shadow.graph(geo.stage)?;
        let candidates = match self.config.kind {
            TableKind::HashAction => {
                if geo.hash_action_slot(&hv) != slot {
                    return Err(ExmError::Invalid(format!(
                        "key {key} does not hash to {} slot {slot}",
                        geo.stage
                    )));
                }
                vec![graph.word_of(slot)]
            }
            _ => {
                let candidates = geo.candidates(&hv);
                if !candidates.contains(&graph.word_of(slot)) {
                    return Err(ExmError::Invalid(format!(
                        "{} slot {slot} is not a candidate for key {key}",
                        geo.stage
                    )));
                }
                candidates
            }
        };
        let digest = match self.config.kind {
            TableKind::ProxyHash => {
                let d = self.hash.compute_proxy_digest(key, geo.stage)?;
                if let Some(owner) = inst.shadow.digest_owner(geo.stage, d) {
                    return Err(ExmError::Invalid(format!(
                        "key {key} digest collides with {owner}"
                    )));
                }
                Some(d)
            }
            _ => None,
        };
        Ok((candidates, digest))
    }

    /// Apply a move list built elsewhere, such as by a peer keeping a replica
    /// of this table.  Nodes are checked and applied to the shadow state in
    /// list order, each against the state the previous ones left behind,
    /// and then replayed to hardware as a whole.  Every node must target the
    /// same instance.  Returns the number of nodes applied.
    pub fn process_move_list<H: AsicOps>(
        &self,
        sess: &Session<'_, H>,
        list: &MoveList,
    ) -> ExmResult<usize> {
        let Some(first) = list.nodes().first() else {
            return Ok(0);
        };
        let pipe = first.pipe;
        if list.nodes().iter().any(|n| n.pipe != pipe) {
            return Err(ExmError::Invalid("move list spans instances".into()));
        }
        let cell = self.instance(pipe)?;
        self.mutate(sess, cell, "process_move_list", |inst| {
            let coord = self.coordinator();
            for node in list.nodes() {
                let geo = self.geometry(node.stage)?;
                if let Some(src) = node.src() {
                    let rec = inst
                        .shadow
                        .entry(node.handle)
                        .ok_or(ExmError::NoSuchHandle(node.handle))?;
                    if (rec.stage, rec.slot) != (node.stage, src) {
                        return Err(ExmError::Invalid(format!(
                            "{} is at {} slot {}, not {} slot {src}",
                            node.handle, rec.stage, rec.slot, node.stage
                        )));
                    }
                }
                if let Some(dst) = node.dst() {
                    if !geo.contains(dst) {
                        return Err(ExmError::Invalid(format!(
                            "{} has no slot {dst}",
                            geo.stage
                        )));
                    }
                    if let Some(owner) = inst.shadow.slot_owner(node.stage, dst) {
                        return Err(ExmError::Invalid(format!(
                            "{} slot {dst} still holds {owner}",
                            node.stage
                        )));
                    }
                }
                let single = MoveList::from(vec![node.clone()]);
                match node.op {
                    MoveOp::Add { dst } => {
                        let rec = self.incoming_record(inst, node, dst)?;
                        inst.shadow.commit(&single, Some(rec))?;
                        inst.usage.inserts += 1;
                    }
                    MoveOp::Move { dst, .. } => {
                        let rec = inst
                            .shadow
                            .entry(node.handle)
                            .ok_or(ExmError::NoSuchHandle(node.handle))?;
                        let graph = inst.shadow.graph(node.stage)?;
                        if !rec.candidates.contains(&graph.word_of(dst)) {
                            return Err(ExmError::Invalid(format!(
                                "{} slot {dst} is not a candidate for {}",
                                node.stage, node.handle
                            )));
                        }
                        inst.shadow.commit(&single, None)?;
                        inst.usage.moves += 1;
                    }
                    MoveOp::Delete { .. } => {
                        let rec = inst
                            .shadow
                            .entry(node.handle)
                            .cloned()
                            .ok_or(ExmError::NoSuchHandle(node.handle))?;
                        let held = coord.held(&rec.attached)?;
                        coord.release(
                            &mut inst.shadow,
                            ResourceLoc {
                                pipe: inst.pipe,
                                stage: rec.stage,
                            },
                            Some(rec.slot),
                            &held,
                        )?;
                        inst.shadow.commit(&single, None)?;
                        inst.usage.deletes += 1;
                    }
                }
            }
            self.replay(sess, inst, list)?;
            Ok(list.len())
        })
    }

    /// Clear a slot in hardware that the shadow state does not account for,
    /// such as one left behind by an interrupted update.
    pub fn invalidate_slot<H: AsicOps>(
        &self,
        sess: &Session<'_, H>,
        pipe: PipeSel,
        stage: StageId,
        slot: SlotIdx,
    ) -> ExmResult<()> {
        let geo = self.geometry(stage)?;
        if !geo.contains(slot) {
            return Err(ExmError::Invalid(format!("{stage} has no slot {slot}")));
        }
        let cell = self.instance(pipe)?;
        self.mutate(sess, cell, "invalidate_slot", |inst| {
            if let Some(owner) = inst.shadow.slot_owner(stage, slot) {
                return Err(ExmError::Invalid(format!(
                    "{stage} slot {slot} holds {owner}"
                )));
            }
            sess.issue(Instruction::Invalidate {
                pipe: inst.pipe,
                stage,
                slot,
            })?;
            inst.shadow.note_device(stage, slot, None);
            Ok(())
        })
    }

    fn default_word(&self, d: &DefaultEntry) -> ExmResult<Vec<u8>> {
        let key = MatchKey::new(Vec::new());
        let word = EntryWord {
            key: &key,
            digest: None,
            action: &d.action,
            ptrs: &d.attached.ptrs,
        };
        Ok(self.codec.pack(&word)?)
    }

    /// Install or replace the action applied on a miss.  The default entry
    /// always has handle index 0.
    pub fn set_default<H: AsicOps>(
        &self,
        sess: &Session<'_, H>,
        pipe: PipeSel,
        action: ActionSpec,
    ) -> ExmResult<EntryHandle> {
        let cell = self.instance(pipe)?;
        self.mutate(sess, cell, "set_default", |inst| {
            let handle = inst.shadow.default_handle();
            // Indirect companions of the default entry live with the first
            // stage's.
            let loc = ResourceLoc {
                pipe: inst.pipe,
                stage: self.stages[0].stage,
            };
            let coord = self.coordinator();
            let (attached, stale) = match inst.shadow.default_entry().cloned() {
                Some(d) => {
                    coord.modify(&mut inst.shadow, loc, None, &d.attached, &action)?
                }
                None => (coord.attach(&mut inst.shadow, loc, None, &action)?, Vec::new()),
            };
            let entry = DefaultEntry {
                handle,
                action,
                attached,
            };
            let word = self.default_word(&entry)?;
            inst.shadow.set_default(Some(entry));
            sess.issue(Instruction::SetDefault {
                pipe: inst.pipe,
                word,
            })?;
            coord.release(&mut inst.shadow, loc, None, &stale)?;
            debug!(self.log, "default set"; "pipe" => %inst.pipe);
            Ok(handle)
        })
    }

    pub fn clear_default<H: AsicOps>(
        &self,
        sess: &Session<'_, H>,
        pipe: PipeSel,
    ) -> ExmResult<()> {
        let cell = self.instance(pipe)?;
        self.mutate(sess, cell, "clear_default", |inst| {
            let Some(d) = inst.shadow.default_entry().cloned() else {
                inst.usage.delete_misses += 1;
                return Err(ExmError::NoSuchHandle(inst.shadow.default_handle()));
            };
            let loc = ResourceLoc {
                pipe: inst.pipe,
                stage: self.stages[0].stage,
            };
            let coord = self.coordinator();
            let held = coord.held(&d.attached)?;
            inst.shadow.set_default(None);
            sess.issue(Instruction::ClearDefault { pipe: inst.pipe })?;
            coord.release(&mut inst.shadow, loc, None, &held)?;
            Ok(())
        })
    }

    /// Open a transaction on an instance.  Changes made until the matching
    /// commit or abort can be undone as a unit.
    pub fn txn_begin(&self, pipe: PipeSel) -> ExmResult<()> {
        let mut inst = self.writer(self.instance(pipe)?)?;
        if inst.txn_open {
            return Err(ExmError::Invalid("transaction already open".into()));
        }
        inst.shadow.savepoint();
        inst.txn_open = true;
        debug!(self.log, "transaction opened"; "pipe" => %pipe);
        Ok(())
    }

    pub fn txn_commit(&self, pipe: PipeSel) -> ExmResult<()> {
        let mut inst = self.writer(self.instance(pipe)?)?;
        if !inst.txn_open {
            return Err(ExmError::Invalid("no transaction open".into()));
        }
        inst.shadow.release()?;
        inst.txn_open = false;
        debug!(self.log, "transaction committed"; "pipe" => %pipe);
        Ok(())
    }

    /// Undo everything since `txn_begin`, in software and in hardware.
    pub fn txn_abort<H: AsicOps>(
        &self,
        sess: &Session<'_, H>,
        pipe: PipeSel,
    ) -> ExmResult<()> {
        let mut guard = self.writer(self.instance(pipe)?)?;
        let inst = &mut *guard;
        if !inst.txn_open {
            return Err(ExmError::Invalid("no transaction open".into()));
        }
        inst.txn_open = false;
        let comp = inst.shadow.rollback()?;
        debug!(self.log, "transaction aborted"; "pipe" => %pipe);
        self.compensate(sess, inst, comp)
    }

    /// Capture every instance's entries in restorable form.
    pub fn snapshot(&self) -> ExmResult<RestoreImage> {
        let mut records = Vec::new();
        for cell in self.instances.values() {
            let inst = self.reader(cell)?;
            records.extend(inst.shadow.default_entry().map(RestoreRecord::from));
            records.extend(inst.shadow.entries().map(RestoreRecord::from));
        }
        Ok(RestoreImage::new(&self.config.name, records))
    }

    /// Rebuild the shadow state from an image.  The table must be empty.
    /// Hardware is not touched; follow with [`ExmTable::reconcile`] to bring
    /// it in line.  Attached resources are taken to have been restored by
    /// their own managers.
    pub fn restore(&self, image: &RestoreImage) -> ExmResult<usize> {
        if image.version != RESTORE_VERSION {
            return Err(ExmError::Invalid(format!(
                "image version {} is not {RESTORE_VERSION}",
                image.version
            )));
        }
        if image.table != self.config.name {
            return Err(ExmError::Invalid(format!(
                "image is for table {}, not {}",
                image.table, self.config.name
            )));
        }

        let mut guards = BTreeMap::new();
        for (pipe, cell) in &self.instances {
            let inst = self.writer(cell)?;
            if !inst.shadow.is_empty() {
                return Err(ExmError::Invalid(format!(
                    "instance {pipe} is not empty"
                )));
            }
            guards.insert(*pipe, inst);
        }
        for inst in guards.values_mut() {
            inst.shadow.savepoint();
        }

        let result = self.restore_records(&mut guards, image);
        for inst in guards.values_mut() {
            let done = match result {
                Ok(_) => inst.shadow.release(),
                Err(_) => inst.shadow.rollback().map(|_| ()),
            };
            done?;
        }
        if let Ok(n) = result {
            info!(self.log, "restored"; "records" => n);
        }
        result
    }

    fn restore_records(
        &self,
        guards: &mut BTreeMap<PipeSel, MutexGuard<'_, Instance>>,
        image: &RestoreImage,
    ) -> ExmResult<usize> {
        for record in &image.records {
            let handle = record.handle();
            let inst = guards
                .get_mut(&handle.pipe())
                .ok_or(ExmError::NoSuchHandle(handle))?;
            let pipe = inst.pipe;
            match record {
                RestoreRecord::DefaultEntry {
                    action, attached, ..
                } => {
                    if handle != inst.shadow.default_handle() {
                        return Err(ExmError::Invalid(format!(
                            "{handle} is not a default-entry handle"
                        )));
                    }
                    inst.shadow.set_default(Some(DefaultEntry {
                        handle,
                        action: action.clone(),
                        attached: attached.clone(),
                    }));
                }
                RestoreRecord::MatchEntry {
                    stage,
                    slot,
                    key,
                    action,
                    ttl,
                    attached,
                    ..
                } => {
                    let geo = self.geometry(*stage)?;
                    let (candidates, digest) =
                        self.key_placement(inst, geo, key, *slot)?;
                    let rec = EntryRecord {
                        handle,
                        pipe,
                        key: key.clone(),
                        action: action.clone(),
                        ttl: *ttl,
                        stage: *stage,
                        slot: *slot,
                        attached: attached.clone(),
                        digest,
                        candidates,
                    };
                    // A warm restart leaves the entry's word where it was
                    let word = self.codec.pack(&rec.word())?;
                    inst.shadow.claim_handle(handle)?;
                    inst.shadow.insert(rec)?;
                    inst.shadow.note_device(*stage, *slot, Some(word));
                }
            }
        }
        Ok(image.records.len())
    }

    /// Compare hardware against the shadow state and fix every difference:
    /// entries missing or wrong in hardware are reprogrammed, and valid
    /// slots with no entry behind them are cleared.  Any queued batch is
    /// flushed first so the reads see it.
    pub fn reconcile<H: AsicOps>(
        &self,
        sess: &Session<'_, H>,
    ) -> ExmResult<ReconcileReport> {
        sess.checkpoint()?;
        let mut report = ReconcileReport::default();
        for (sel, cell) in &self.instances {
            let mut inst = self.writer(cell)?;
            let pipes: Vec<PipeId> = match sel {
                PipeSel::All => (0..sess.hdl().pipe_count()).map(PipeId).collect(),
                PipeSel::Pipe(p) => vec![*p],
            };
            for geo in &self.stages {
                for slot in (0..geo.entries).map(SlotIdx) {
                    let expected = match inst.shadow.slot_owner(geo.stage, slot) {
                        Some(h) => {
                            let rec = inst
                                .shadow
                                .entry(h)
                                .ok_or(ExmError::NoSuchHandle(h))?;
                            Some(self.codec.pack(&rec.word())?)
                        }
                        None => None,
                    };
                    for &p in &pipes {
                        report.checked += 1;
                        let actual = sess.hdl().read_slot(p, geo.stage, slot)?;
                        let pipe = PipeSel::Pipe(p);
                        match (&expected, actual) {
                            (Some(e), Some(a)) if *e == a => {}
                            (Some(e), _) => {
                                sess.issue(Instruction::Program {
                                    pipe,
                                    stage: geo.stage,
                                    slot,
                                    word: e.clone(),
                                })?;
                                report.reprogrammed += 1;
                            }
                            (None, Some(_)) => {
                                sess.issue(Instruction::Invalidate {
                                    pipe,
                                    stage: geo.stage,
                                    slot,
                                })?;
                                report.cleared += 1;
                            }
                            (None, None) => {}
                        }
                    }
                    inst.shadow.note_device(geo.stage, slot, expected);
                }
            }

            let expected = match inst.shadow.default_entry() {
                Some(d) => Some(self.default_word(d)?),
                None => None,
            };
            for &p in &pipes {
                let actual = sess.hdl().read_default(p)?;
                let pipe = PipeSel::Pipe(p);
                match (&expected, actual) {
                    (Some(e), Some(a)) if *e == a => {}
                    (Some(e), _) => {
                        sess.issue(Instruction::SetDefault {
                            pipe,
                            word: e.clone(),
                        })?;
                        report.defaults += 1;
                    }
                    (None, Some(_)) => {
                        sess.issue(Instruction::ClearDefault { pipe })?;
                        report.defaults += 1;
                    }
                    (None, None) => {}
                }
            }
        }
        info!(self.log, "reconciled";
            "checked" => report.checked,
            "reprogrammed" => report.reprogrammed,
            "cleared" => report.cleared,
            "defaults" => report.defaults);
        Ok(report)
    }

    /// A copy of an instance's shadow maps, for comparison in tests and
    /// debugging.
    pub fn shadow_maps(&self, pipe: PipeSel) -> ExmResult<crate::shadow::ShadowMaps> {
        let inst = self.reader(self.instance(pipe)?)?;
        Ok(inst.shadow.maps().clone())
    }
}
