// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Drives the device through a committed move list.
//!
//! A displaced entry is moved by first holding both its old and new address
//! in the stage's address-lock register, writing the new copy, and only then
//! retiring the new address, clearing the old copy, and retiring the old
//! address.  Lookups therefore see exactly one copy of the key throughout.
//! When the table has directly-addressed companions, a run of moves in one
//! stage is bracketed by a companion-table lock so those managers know
//! entries are in motion.  A new entry claims its direct companions only
//! when the moves ahead of it have carried the previous occupant's state out
//! of its landing slot, and before its own word is written.
//!
//! Each hop pushes and pops both of its addresses, even though a chain's
//! next hop writes the slot the previous one just cleared.
//!
//! Every write that reaches the device is journaled in the shadow state.
//! [`Replay::rewind`] walks that journal backwards after a failure, carrying
//! displaced entries back with the same address-lock sequence.

use aal::AsicOps;
use aal::EntryCodec;
use aal::Instruction;
use aal::PipeSel;
use aal::ResourceLoc;
use aal::SlotIdx;
use aal::StageId;
use slog::error;
use slog::trace;
use slog::Logger;

use crate::resources::Coordinator;
use crate::search::MoveList;
use crate::search::MoveNode;
use crate::search::MoveOp;
use crate::session::Session;
use crate::shadow::DeviceUndo;
use crate::shadow::ResourceUndo;
use crate::shadow::Reversal;
use crate::shadow::ShadowState;
use crate::types::ExmError;
use crate::types::ExmResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Idle,
    /// The companion-table lock is held for a stage.
    Locked,
    /// Both addresses of a move are held and the new copy is being written.
    Moving,
    /// The new copy is live and the old one is being retired.
    Settling,
}

// Device-side state that must be released whatever happens.
#[derive(Default)]
struct Held {
    lock: Option<(PipeSel, StageId, u32)>,
    pushed: Vec<(PipeSel, StageId)>,
}

pub struct Replay<'a, 's, H: AsicOps> {
    log: &'a Logger,
    sess: &'a Session<'s, H>,
    codec: &'a dyn EntryCodec,
    coord: &'a Coordinator<'a>,
    next_lock: &'a mut u32,
    state: ReplayState,
}

impl<'a, 's, H: AsicOps> Replay<'a, 's, H> {
    pub fn new(
        log: &'a Logger,
        sess: &'a Session<'s, H>,
        codec: &'a dyn EntryCodec,
        coord: &'a Coordinator<'a>,
        next_lock: &'a mut u32,
    ) -> Self {
        Replay {
            log,
            sess,
            codec,
            coord,
            next_lock,
            state: ReplayState::Idle,
        }
    }

    pub fn state(&self) -> ReplayState {
        self.state
    }

    fn enter(&mut self, state: ReplayState) {
        trace!(self.log, "replay {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Issue the instructions for a move list whose changes are already in
    /// the shadow state.  On failure the address-lock register is drained
    /// and any companion lock released before the error is returned; putting
    /// the slots themselves back is left to the caller, once it has rolled
    /// the shadow state back.
    pub fn run(
        &mut self,
        list: &MoveList,
        shadow: &mut ShadowState,
    ) -> ExmResult<()> {
        let mut held = Held::default();
        let result = self.run_held(list, shadow, &mut held);
        let result = match result {
            Ok(()) => self.finish_chain(&mut held),
            Err(e) => Err(e),
        };
        if let Err(initial) = result {
            error!(self.log, "replay failed"; "error" => %initial);
            let cleanup = self.release(&mut held);
            self.enter(ReplayState::Idle);
            return match cleanup {
                Ok(()) => Err(initial),
                Err(unwind) => Err(ExmError::Unwind {
                    initial: Box::new(initial),
                    unwind: Box::new(unwind),
                }),
            };
        }
        Ok(())
    }

    fn run_held(
        &mut self,
        list: &MoveList,
        shadow: &mut ShadowState,
        held: &mut Held,
    ) -> ExmResult<()> {
        for node in list.nodes() {
            // A chain ends when the next node is in another stage or pipe.
            if let Some((pipe, stage, _)) = held.lock {
                if (pipe, stage) != (node.pipe, node.stage) {
                    self.finish_chain(held)?;
                }
            }
            match node.op {
                MoveOp::Move { src, dst } => {
                    self.displace(node, src, dst, shadow, held)?
                }
                MoveOp::Add { dst } => {
                    self.land(node, dst, shadow)?;
                    self.program(node, dst, shadow)?
                }
                MoveOp::Delete { src } => {
                    self.sess.issue(Instruction::Invalidate {
                        pipe: node.pipe,
                        stage: node.stage,
                        slot: src,
                    })?;
                    shadow.note_device(node.stage, src, None);
                }
            }
        }
        Ok(())
    }

    // Claim a new entry's direct companions at the slot it is landing in.
    fn land(
        &self,
        node: &MoveNode,
        dst: SlotIdx,
        shadow: &mut ShadowState,
    ) -> ExmResult<()> {
        let mut rec = shadow
            .entry(node.handle)
            .cloned()
            .ok_or(ExmError::NoSuchHandle(node.handle))?;
        let loc = ResourceLoc {
            pipe: node.pipe,
            stage: node.stage,
        };
        let direct = self.coord.attach_direct_at(shadow, loc, dst, &rec.action)?;
        if direct.is_empty() {
            return Ok(());
        }
        rec.attached.direct.extend(direct);
        shadow.update_action(node.handle, rec.action, rec.attached)
    }

    fn program(
        &self,
        node: &MoveNode,
        slot: SlotIdx,
        shadow: &mut ShadowState,
    ) -> ExmResult<()> {
        let rec = shadow
            .entry(node.handle)
            .ok_or(ExmError::NoSuchHandle(node.handle))?;
        let word = self.codec.pack(&rec.word())?;
        self.sess.issue(Instruction::Program {
            pipe: node.pipe,
            stage: node.stage,
            slot,
            word: word.clone(),
        })?;
        shadow.note_device(node.stage, slot, Some(word));
        Ok(())
    }

    fn push(
        &self,
        held: &mut Held,
        pipe: PipeSel,
        stage: StageId,
        slot: SlotIdx,
    ) -> ExmResult<()> {
        self.sess.issue(Instruction::AddrPush { pipe, stage, slot })?;
        held.pushed.push((pipe, stage));
        Ok(())
    }

    fn pop(&self, held: &mut Held, pipe: PipeSel, stage: StageId) -> ExmResult<()> {
        self.sess.issue(Instruction::AddrPop { pipe, stage })?;
        if let Some(idx) = held.pushed.iter().position(|p| *p == (pipe, stage)) {
            held.pushed.remove(idx);
        }
        Ok(())
    }

    fn displace(
        &mut self,
        node: &MoveNode,
        src: SlotIdx,
        dst: SlotIdx,
        shadow: &mut ShadowState,
        held: &mut Held,
    ) -> ExmResult<()> {
        let (pipe, stage) = (node.pipe, node.stage);
        self.lock(held, pipe, stage)?;

        self.enter(ReplayState::Moving);
        self.push(held, pipe, stage, dst)?;
        self.push(held, pipe, stage, src)?;
        self.program(node, dst, shadow)?;
        let direct = shadow
            .entry(node.handle)
            .map(|r| r.attached.direct.clone())
            .unwrap_or_default();
        self.coord
            .relocate(shadow, ResourceLoc { pipe, stage }, &direct, src, dst)?;

        self.enter(ReplayState::Settling);
        self.pop(held, pipe, stage)?;
        self.sess
            .issue(Instruction::Invalidate { pipe, stage, slot: src })?;
        shadow.note_moved(stage, src, dst);
        self.pop(held, pipe, stage)?;

        self.enter(if held.lock.is_some() {
            ReplayState::Locked
        } else {
            ReplayState::Idle
        });
        Ok(())
    }

    // Take the companion-table lock for a stage, if the table has direct
    // companions and it is not already held.
    fn lock(
        &mut self,
        held: &mut Held,
        pipe: PipeSel,
        stage: StageId,
    ) -> ExmResult<()> {
        if !self.coord.has_direct() {
            return Ok(());
        }
        if let Some((p, s, _)) = held.lock {
            if (p, s) == (pipe, stage) {
                return Ok(());
            }
            self.finish_chain(held)?;
        }
        let lock_id = *self.next_lock;
        *self.next_lock = self.next_lock.wrapping_add(1);
        self.sess.issue(Instruction::LockTables {
            pipe,
            stage,
            lock_id,
        })?;
        held.lock = Some((pipe, stage, lock_id));
        self.enter(ReplayState::Locked);
        Ok(())
    }

    fn finish_chain(&mut self, held: &mut Held) -> ExmResult<()> {
        if let Some((pipe, stage, lock_id)) = held.lock {
            self.sess.issue(Instruction::UnlockTables {
                pipe,
                stage,
                lock_id,
            })?;
            held.lock = None;
        }
        self.enter(ReplayState::Idle);
        Ok(())
    }

    // Best-effort cleanup of device-side locks after a failure.
    fn release(&mut self, held: &mut Held) -> ExmResult<()> {
        let mut first = None;
        while let Some((pipe, stage)) = held.pushed.pop() {
            if let Err(e) = self.sess.issue(Instruction::AddrPop { pipe, stage }) {
                first.get_or_insert(e);
            }
        }
        if let Err(e) = self.finish_chain(held) {
            first.get_or_insert(e);
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reverse a rolled-back call's side effects, newest first.  Every step
    /// is attempted; the first failure is returned once the address-lock
    /// register and any companion lock have been released.
    pub fn rewind(&mut self, pipe: PipeSel, steps: &[Reversal]) -> ExmResult<()> {
        let mut held = Held::default();
        let mut first = None;
        for step in steps {
            let result = match step {
                Reversal::Resource(r) => self.reverse_resource(r, &mut held),
                Reversal::Device(d) => self.reverse(pipe, d, &mut held),
            };
            if let Err(e) = result {
                error!(self.log, "rewind step failed"; "step" => ?step, "error" => %e);
                first.get_or_insert(e);
            }
        }
        if let Err(e) = self.release(&mut held) {
            first.get_or_insert(e);
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // Relocations are carried back under the companion-table lock, as they
    // were made.
    fn reverse_resource(&mut self, undo: &ResourceUndo, held: &mut Held) -> ExmResult<()> {
        if let ResourceUndo::Relocated { loc, .. } = undo {
            self.lock(held, loc.pipe, loc.stage)?;
        }
        self.coord.compensate(std::slice::from_ref(undo))
    }

    fn restore(
        &self,
        pipe: PipeSel,
        stage: StageId,
        slot: SlotIdx,
        word: &Option<Vec<u8>>,
    ) -> ExmResult<()> {
        self.sess.issue(match word {
            Some(word) => Instruction::Program {
                pipe,
                stage,
                slot,
                word: word.clone(),
            },
            None => Instruction::Invalidate { pipe, stage, slot },
        })
    }

    fn reverse(
        &mut self,
        pipe: PipeSel,
        undo: &DeviceUndo,
        held: &mut Held,
    ) -> ExmResult<()> {
        match undo {
            DeviceUndo::Slot { stage, slot, old } => {
                self.restore(pipe, *stage, *slot, old)
            }
            DeviceUndo::Move {
                stage,
                src,
                src_old,
                dst,
                dst_old,
            } => {
                // The entry goes back from dst to src
                let stage = *stage;
                self.lock(held, pipe, stage)?;
                self.enter(ReplayState::Moving);
                self.push(held, pipe, stage, *src)?;
                self.push(held, pipe, stage, *dst)?;
                self.restore(pipe, stage, *src, src_old)?;
                self.enter(ReplayState::Settling);
                self.pop(held, pipe, stage)?;
                self.restore(pipe, stage, *dst, dst_old)?;
                self.pop(held, pipe, stage)?;
                self.enter(if held.lock.is_some() {
                    ReplayState::Locked
                } else {
                    ReplayState::Idle
                });
                Ok(())
            }
        }
    }
}
