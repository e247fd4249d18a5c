// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use strum::EnumIter;

use crate::PipeSel;
use crate::SlotIdx;
use crate::StageId;

/// A single element of a hardware instruction list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Tell the managers of the stage's directly-addressed companion tables
    /// that entries are about to move.
    LockTables {
        pipe: PipeSel,
        stage: StageId,
        lock_id: u32,
    },
    UnlockTables {
        pipe: PipeSel,
        stage: StageId,
        lock_id: u32,
    },
    /// Push an address into the stage's address-lock register, keeping
    /// lookups at that address stable while it is rewritten.
    AddrPush {
        pipe: PipeSel,
        stage: StageId,
        slot: SlotIdx,
    },
    /// Retire the oldest address held in the address-lock register.
    AddrPop { pipe: PipeSel, stage: StageId },
    /// Write a packed match word and set its valid bit.
    Program {
        pipe: PipeSel,
        stage: StageId,
        slot: SlotIdx,
        word: Vec<u8>,
    },
    /// Clear a slot's valid bit.
    Invalidate {
        pipe: PipeSel,
        stage: StageId,
        slot: SlotIdx,
    },
    /// Install the action applied on a table miss.
    SetDefault { pipe: PipeSel, word: Vec<u8> },
    ClearDefault { pipe: PipeSel },
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum InstrKind {
    LockTables,
    UnlockTables,
    AddrPush,
    AddrPop,
    Program,
    Invalidate,
    SetDefault,
    ClearDefault,
}

impl Instruction {
    pub fn kind(&self) -> InstrKind {
        match self {
            Instruction::LockTables { .. } => InstrKind::LockTables,
            Instruction::UnlockTables { .. } => InstrKind::UnlockTables,
            Instruction::AddrPush { .. } => InstrKind::AddrPush,
            Instruction::AddrPop { .. } => InstrKind::AddrPop,
            Instruction::Program { .. } => InstrKind::Program,
            Instruction::Invalidate { .. } => InstrKind::Invalidate,
            Instruction::SetDefault { .. } => InstrKind::SetDefault,
            Instruction::ClearDefault { .. } => InstrKind::ClearDefault,
        }
    }

    /// The pipes an instruction applies to.
    pub fn pipe(&self) -> PipeSel {
        match self {
            Instruction::LockTables { pipe, .. }
            | Instruction::UnlockTables { pipe, .. }
            | Instruction::AddrPush { pipe, .. }
            | Instruction::AddrPop { pipe, .. }
            | Instruction::Program { pipe, .. }
            | Instruction::Invalidate { pipe, .. }
            | Instruction::SetDefault { pipe, .. }
            | Instruction::ClearDefault { pipe } => *pipe,
        }
    }

    /// The stage an instruction addresses, if it addresses one.
    pub fn stage(&self) -> Option<StageId> {
        match self {
            Instruction::LockTables { stage, .. }
            | Instruction::UnlockTables { stage, .. }
            | Instruction::AddrPush { stage, .. }
            | Instruction::AddrPop { stage, .. }
            | Instruction::Program { stage, .. }
            | Instruction::Invalidate { stage, .. } => Some(*stage),
            Instruction::SetDefault { .. } | Instruction::ClearDefault { .. } => {
                None
            }
        }
    }
}

impl fmt::Display for InstrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                InstrKind::LockTables => "lock",
                InstrKind::UnlockTables => "unlock",
                InstrKind::AddrPush => "push",
                InstrKind::AddrPop => "pop",
                InstrKind::Program => "program",
                InstrKind::Invalidate => "invalidate",
                InstrKind::SetDefault => "set_default",
                InstrKind::ClearDefault => "clear_default",
            }
        )
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::LockTables {
                pipe,
                stage,
                lock_id,
            }
            | Instruction::UnlockTables {
                pipe,
                stage,
                lock_id,
            } => write!(f, "{} {pipe}/{stage} id={lock_id}", self.kind()),
            Instruction::AddrPush { pipe, stage, slot }
            | Instruction::Invalidate { pipe, stage, slot } => {
                write!(f, "{} {pipe}/{stage} slot={slot}", self.kind())
            }
            Instruction::AddrPop { pipe, stage } => {
                write!(f, "{} {pipe}/{stage}", self.kind())
            }
            Instruction::Program {
                pipe,
                stage,
                slot,
                word,
            } => write!(
                f,
                "{} {pipe}/{stage} slot={slot} len={}",
                self.kind(),
                word.len()
            ),
            Instruction::SetDefault { pipe, word } => {
                write!(f, "{} {pipe} len={}", self.kind(), word.len())
            }
            Instruction::ClearDefault { pipe } => {
                write!(f, "{} {pipe}", self.kind())
            }
        }
    }
}
