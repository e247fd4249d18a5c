// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! A software model of the match memories of an ASIC, with the ability to fail
//! any instruction either randomly or on a schedule.

use rand::random;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;

use aal::{
    AsicError, AsicOps, AsicResult, InstrKind, Instruction, PipeId, PipeSel,
    SlotIdx, StageId,
};

pub mod memory;
use memory::PipeMemory;

/// Default depth of each stage's address-lock register.
pub const ADDR_LOCK_DEPTH: usize = 4;

/// Chaos that happens according to a probability.
#[derive(Default, Debug, Serialize, Deserialize, Copy, Clone)]
pub struct Chaos {
    /// A probability between 0.0 and 1.0
    pub value: f64,
}

impl Chaos {
    /// Create a new chaos value.
    pub fn new(value: f64) -> Self {
        let mut c = Self::default();
        c.set(value);
        c
    }
    /// Set the chaos value. Panics if value is outside the range [0.0, 1.0].
    pub fn set(&mut self, value: f64) {
        if !(0.0..=1.0).contains(&value) {
            panic!("probability out of range");
        }
        self.value = value;
    }

    /// Get the underlying chaos value.
    pub fn get(&self) -> f64 {
        self.value
    }

    /// Return a chaos error according to the underlying probability value.
    pub fn unfurled(&self, log: &Logger, message: &str) -> AsicResult<()> {
        if self.value > 0.0 && self.value >= random() {
            slog::error!(log, "chaos error: {}", message);
            return Err(AsicError::Synthetic(message.into()));
        }
        Ok(())
    }
}

/// The chaos ASIC config contains chaos values for each instruction kind.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AsicConfig {
    pub pipes: u8,
    pub addr_lock_depth: usize,
    pub lock_tables: Chaos,
    pub unlock_tables: Chaos,
    pub addr_push: Chaos,
    pub addr_pop: Chaos,
    pub program: Chaos,
    pub invalidate: Chaos,
    pub set_default: Chaos,
    pub clear_default: Chaos,
}

impl Default for AsicConfig {
    fn default() -> Self {
        AsicConfig::uniform(1, 0.0)
    }
}

impl AsicConfig {
    /// The uniform chaos config applies a uniform underlying probability to
    /// each instruction kind.
    pub fn uniform(pipes: u8, v: f64) -> Self {
        Self {
            pipes,
            addr_lock_depth: ADDR_LOCK_DEPTH,
            lock_tables: Chaos::new(v),
            unlock_tables: Chaos::new(v),
            addr_push: Chaos::new(v),
            addr_pop: Chaos::new(v),
            program: Chaos::new(v),
            invalidate: Chaos::new(v),
            set_default: Chaos::new(v),
            clear_default: Chaos::new(v),
        }
    }

    fn chaos(&self, kind: InstrKind) -> &Chaos {
        match kind {
            InstrKind::LockTables => &self.lock_tables,
            InstrKind::UnlockTables => &self.unlock_tables,
            InstrKind::AddrPush => &self.addr_push,
            InstrKind::AddrPop => &self.addr_pop,
            InstrKind::Program => &self.program,
            InstrKind::Invalidate => &self.invalidate,
            InstrKind::SetDefault => &self.set_default,
            InstrKind::ClearDefault => &self.clear_default,
        }
    }
}

/// Everything mutable about the device, protected by a single Mutex in
/// `Handle`.
#[derive(Debug, Default)]
struct DeviceState {
    pipes: Vec<PipeMemory>,
    // Every instruction that took effect, in order
    trace: Vec<Instruction>,
    // Number of times each instruction kind has been attempted
    attempts: BTreeMap<InstrKind, usize>,
    // Attempt numbers at which an instruction kind is scheduled to fail
    faults: Vec<(InstrKind, usize)>,
    // Companion-table locks held, keyed by (pipe, stage)
    locks: BTreeMap<(u8, StageId), u32>,
}

impl DeviceState {
    fn scheduled_fault(&mut self, kind: InstrKind) -> bool {
        let attempt = self.attempts.entry(kind).or_insert(0);
        *attempt += 1;
        let attempt = *attempt;
        match self
            .faults
            .iter()
            .position(|(k, n)| *k == kind && *n == attempt)
        {
            Some(idx) => {
                self.faults.remove(idx);
                true
            }
            None => false,
        }
    }
}

/// A handle for a chaos asic.
pub struct Handle {
    config: AsicConfig,
    log: Logger,
    state: Mutex<DeviceState>,
}

impl Handle {
    /// Create a new chaos ASIC with the provided logger and config.
    pub fn new(log: &Logger, config: &AsicConfig) -> AsicResult<Self> {
        if config.pipes == 0 {
            return Err(AsicError::InvalidArg("device needs a pipe".into()));
        }
        let state = DeviceState {
            pipes: (0..config.pipes)
                .map(|_| PipeMemory::new(config.addr_lock_depth))
                .collect(),
            ..Default::default()
        };
        Ok(Handle {
            config: config.clone(),
            log: log.new(slog::o!("unit" => "chaos_asic")),
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> AsicResult<MutexGuard<'_, DeviceState>> {
        self.state
            .lock()
            .map_err(|_| AsicError::Internal("device state poisoned".into()))
    }

    /// Fail the `skip + 1`th upcoming attempt of the given instruction kind.
    pub fn fail_next(&self, kind: InstrKind, skip: usize) -> AsicResult<()> {
        let mut state = self.state()?;
        let done = state.attempts.get(&kind).copied().unwrap_or(0);
        state.faults.push((kind, done + skip + 1));
        Ok(())
    }

    /// Drop any scheduled faults that have not yet fired.
    pub fn clear_faults(&self) -> AsicResult<()> {
        self.state()?.faults.clear();
        Ok(())
    }

    /// The instructions that have taken effect so far.
    pub fn trace(&self) -> AsicResult<Vec<Instruction>> {
        Ok(self.state()?.trace.clone())
    }

    pub fn clear_trace(&self) -> AsicResult<()> {
        self.state()?.trace.clear();
        Ok(())
    }

    /// Companion-table lock held on a pipe's stage, if any.
    pub fn lock_held(
        &self,
        pipe: PipeId,
        stage: StageId,
    ) -> AsicResult<Option<u32>> {
        Ok(self.state()?.locks.get(&(pipe.0, stage)).copied())
    }

    /// Number of addresses currently held in a stage's address-lock register.
    pub fn addr_lock_depth(
        &self,
        pipe: PipeId,
        stage: StageId,
    ) -> AsicResult<usize> {
        let state = self.state()?;
        let mem = state
            .pipes
            .get(pipe.0 as usize)
            .ok_or_else(|| AsicError::InvalidArg(format!("no {pipe}")))?;
        Ok(mem.addr_lock_held(stage))
    }

    /// Every valid slot in a pipe's stage, in slot order.
    pub fn valid_slots(
        &self,
        pipe: PipeId,
        stage: StageId,
    ) -> AsicResult<Vec<SlotIdx>> {
        let state = self.state()?;
        let mem = state
            .pipes
            .get(pipe.0 as usize)
            .ok_or_else(|| AsicError::InvalidArg(format!("no {pipe}")))?;
        Ok(mem.valid_slots(stage))
    }

    /// Write a word behind the table manager's back, as stale state left over
    /// from before a restart would appear.
    pub fn poke(
        &self,
        pipe: PipeId,
        stage: StageId,
        slot: SlotIdx,
        word: Option<Vec<u8>>,
    ) -> AsicResult<()> {
        let mut state = self.state()?;
        let mem = state
            .pipes
            .get_mut(pipe.0 as usize)
            .ok_or_else(|| AsicError::InvalidArg(format!("no {pipe}")))?;
        match word {
            Some(w) => mem.program(stage, slot, w),
            None => mem.invalidate(stage, slot),
        }
        Ok(())
    }

    fn pipe_indices(&self, sel: PipeSel) -> AsicResult<Vec<usize>> {
        let pipes: Vec<usize> = (0..self.config.pipes)
            .filter(|p| sel.covers(PipeId(*p)))
            .map(usize::from)
            .collect();
        if pipes.is_empty() {
            return Err(AsicError::InvalidArg(format!("no such pipe: {sel}")));
        }
        Ok(pipes)
    }
}

impl AsicOps for Handle {
    fn execute(&self, instr: &Instruction) -> AsicResult<()> {
        let kind = instr.kind();
        let mut state = self.state()?;
        if state.scheduled_fault(kind) {
            slog::error!(self.log, "scheduled chaos error: {instr}");
            return Err(AsicError::Synthetic(format!("scheduled {kind} fault")));
        }
        self.config.chaos(kind).unfurled(&self.log, &kind.to_string())?;

        // Validate against every targeted pipe before touching any of them,
        // so a broadcast either lands everywhere or nowhere.
        match instr {
            Instruction::LockTables { pipe, stage, .. } => {
                for p in self.pipe_indices(*pipe)? {
                    if state.locks.contains_key(&(p as u8, *stage)) {
                        return Err(AsicError::Exists);
                    }
                }
            }
            Instruction::UnlockTables {
                pipe,
                stage,
                lock_id,
            } => {
                for p in self.pipe_indices(*pipe)? {
                    if state.locks.get(&(p as u8, *stage)) != Some(lock_id) {
                        return Err(AsicError::Missing(format!(
                            "lock {lock_id} on pipe{p}/{stage}"
                        )));
                    }
                }
            }
            Instruction::AddrPush { pipe, stage, .. } => {
                for p in self.pipe_indices(*pipe)? {
                    if state.pipes[p].addr_lock_held(*stage)
                        >= self.config.addr_lock_depth
                    {
                        return Err(AsicError::InvalidArg(format!(
                            "address-lock register full on pipe{p}/{stage}"
                        )));
                    }
                }
            }
            Instruction::AddrPop { pipe, stage } => {
                for p in self.pipe_indices(*pipe)? {
                    if state.pipes[p].addr_lock_held(*stage) == 0 {
                        return Err(AsicError::InvalidArg(format!(
                            "address-lock register empty on pipe{p}/{stage}"
                        )));
                    }
                }
            }
            _ => {
                self.pipe_indices(instr.pipe())?;
            }
        }

        match instr {
            Instruction::LockTables {
                pipe,
                stage,
                lock_id,
            } => {
                for p in self.pipe_indices(*pipe)? {
                    state.locks.insert((p as u8, *stage), *lock_id);
                }
            }
            Instruction::UnlockTables { pipe, stage, .. } => {
                for p in self.pipe_indices(*pipe)? {
                    state.locks.remove(&(p as u8, *stage));
                }
            }
            Instruction::AddrPush { pipe, stage, slot } => {
                for p in self.pipe_indices(*pipe)? {
                    state.pipes[p].addr_push(*stage, *slot);
                }
            }
            Instruction::AddrPop { pipe, stage } => {
                for p in self.pipe_indices(*pipe)? {
                    state.pipes[p].addr_pop(*stage);
                }
            }
            Instruction::Program {
                pipe,
                stage,
                slot,
                word,
            } => {
                for p in self.pipe_indices(*pipe)? {
                    state.pipes[p].program(*stage, *slot, word.clone());
                }
            }
            Instruction::Invalidate { pipe, stage, slot } => {
                for p in self.pipe_indices(*pipe)? {
                    state.pipes[p].invalidate(*stage, *slot);
                }
            }
            Instruction::SetDefault { pipe, word } => {
                for p in self.pipe_indices(*pipe)? {
                    state.pipes[p].default = Some(word.clone());
                }
            }
            Instruction::ClearDefault { pipe } => {
                for p in self.pipe_indices(*pipe)? {
                    state.pipes[p].default = None;
                }
            }
        }
        slog::trace!(self.log, "executed {instr}");
        state.trace.push(instr.clone());
        Ok(())
    }

    fn read_slot(
        &self,
        pipe: PipeId,
        stage: StageId,
        slot: SlotIdx,
    ) -> AsicResult<Option<Vec<u8>>> {
        let state = self.state()?;
        let mem = state
            .pipes
            .get(pipe.0 as usize)
            .ok_or_else(|| AsicError::InvalidArg(format!("no {pipe}")))?;
        Ok(mem.read(stage, slot))
    }

    fn read_default(&self, pipe: PipeId) -> AsicResult<Option<Vec<u8>>> {
        let state = self.state()?;
        let mem = state
            .pipes
            .get(pipe.0 as usize)
            .ok_or_else(|| AsicError::InvalidArg(format!("no {pipe}")))?;
        Ok(mem.default.clone())
    }

    fn pipe_count(&self) -> u8 {
        self.config.pipes
    }
}
