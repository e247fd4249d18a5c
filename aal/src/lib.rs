// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

mod match_action;
pub use match_action::*;

mod instruction;
pub use instruction::*;

/// A specialized Result type for ASIC operations
pub type AsicResult<T> = Result<T, AsicError>;

/// Error type conveying additional information about ASIC errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AsicError {
    /// An argument passed to the ASIC layer is invalid or inappropriate.  This
    /// indicates misbehavior from the caller.
    #[error("Invalid argument: {}", .0)]
    InvalidArg(String),
    /// This operation is unsupported by the ASIC model being used
    #[error("Operation unsupported by the ASIC")]
    OperationUnsupported,
    /// The ASIC layer detected some internal inconsistency
    #[error("Internal error: {}",.0)]
    Internal(String),
    /// An attached resource could not be allocated
    #[error("Resource exhausted: {}", .0)]
    Exhausted(String),
    /// An error derived from a purposely triggered synthetic fault for testing
    /// purposes.
    #[error("Synthetic ASIC error: {}", .0)]
    Synthetic(String),
    /// A general indication that a caller is trying to create something that
    /// already exists.
    #[error("Already exists")]
    Exists,
    /// A general indication that a caller is trying to modify something that
    /// is not present.
    #[error("Missing: {}", .0)]
    Missing(String),
}

/// Identifies one of the ASIC's packet-processing pipes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct PipeId(pub u8);

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe{}", self.0)
    }
}

/// Selects the pipes an operation applies to.  Symmetric tables keep a single
/// instance whose writes are broadcast to every pipe.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum PipeSel {
    All,
    Pipe(PipeId),
}

impl PipeSel {
    /// Does this selector cover the given pipe?
    pub fn covers(&self, pipe: PipeId) -> bool {
        match self {
            PipeSel::All => true,
            PipeSel::Pipe(p) => *p == pipe,
        }
    }
}

impl fmt::Display for PipeSel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeSel::All => write!(f, "all"),
            PipeSel::Pipe(p) => write!(f, "{p}"),
        }
    }
}

/// A match-action stage within a pipe.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct StageId(pub u8);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage{}", self.0)
    }
}

/// A stage-relative physical entry position.  Slots are numbered way-major:
/// all of way 0's words, then way 1's, with `entries_per_word` consecutive
/// slots sharing one memory word.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct SlotIdx(pub u32);

impl fmt::Display for SlotIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const HANDLE_PIPE_SHIFT: u32 = 28;
const HANDLE_INDEX_MASK: u32 = (1 << HANDLE_PIPE_SHIFT) - 1;
const HANDLE_ALL_PIPES: u32 = 0xf;

/// Opaque identifier for an installed entry.  The owning pipe is encoded in
/// the top four bits so a handle can be routed to its table instance without
/// a lookup.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct EntryHandle(u32);

impl EntryHandle {
    pub fn new(pipe: PipeSel, index: u32) -> Self {
        let pipe_bits = match pipe {
            PipeSel::All => HANDLE_ALL_PIPES,
            PipeSel::Pipe(p) => p.0 as u32,
        };
        EntryHandle((pipe_bits << HANDLE_PIPE_SHIFT) | (index & HANDLE_INDEX_MASK))
    }

    pub fn from_raw(raw: u32) -> Self {
        EntryHandle(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn pipe(&self) -> PipeSel {
        match self.0 >> HANDLE_PIPE_SHIFT {
            HANDLE_ALL_PIPES => PipeSel::All,
            p => PipeSel::Pipe(PipeId(p as u8)),
        }
    }

    pub fn index(&self) -> u32 {
        self.0 & HANDLE_INDEX_MASK
    }
}

impl fmt::Display for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl std::str::FromStr for EntryHandle {
    type Err = AsicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = match s.strip_prefix("0x") {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => s.parse::<u32>(),
        }
        .map_err(|e| AsicError::InvalidArg(format!("bad handle {s}: {e}")))?;
        Ok(EntryHandle(raw))
    }
}

/// The one or two hash values computed for a key in a given stage.  A second
/// value is present when the stage needs more hash bits than fit in 64.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashValues {
    pub primary: u64,
    pub secondary: Option<u64>,
}

impl HashValues {
    pub fn single(primary: u64) -> Self {
        HashValues {
            primary,
            secondary: None,
        }
    }

    /// Extract `width` bits starting at `offset`, treating the two values as
    /// a single 128-bit stream with the primary value in the low half.
    pub fn bits(&self, offset: u32, width: u32) -> u64 {
        let stream = (self.primary as u128)
            | ((self.secondary.unwrap_or(0) as u128) << 64);
        if width == 0 || offset >= 128 {
            return 0;
        }
        let mask = if width >= 64 {
            u64::MAX as u128
        } else {
            (1u128 << width) - 1
        };
        ((stream >> offset) & mask) as u64
    }
}

/// The hash engine configured for a table.  The manager never hashes keys
/// itself; it only expands the values returned here into candidate slots.
pub trait HashOps: Send + Sync {
    /// Compute the placement hash for `key` in `stage`.
    fn compute_hash(
        &self,
        key: &MatchKey,
        stage: StageId,
    ) -> AsicResult<HashValues>;

    /// Compute the digest stored in place of the key by proxy-hash tables.
    fn compute_proxy_digest(
        &self,
        key: &MatchKey,
        stage: StageId,
    ) -> AsicResult<u64>;
}

/// The fields written into a single match word.
#[derive(Debug, Clone, Copy)]
pub struct EntryWord<'a> {
    pub key: &'a MatchKey,
    /// Present for proxy-hash tables, which store this in place of the key.
    pub digest: Option<u64>,
    pub action: &'a ActionSpec,
    pub ptrs: &'a IndirectPtrs,
}

/// A match word decoded back from its hardware representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedWord {
    pub key: Option<MatchKey>,
    pub digest: Option<u64>,
    pub action_id: u32,
    pub data: Vec<u8>,
    pub ptrs: IndirectPtrs,
}

/// Converts entries to and from the packed layout written into a memory
/// word.
pub trait EntryCodec: Send + Sync {
    fn pack(&self, entry: &EntryWord<'_>) -> AsicResult<Vec<u8>>;

    fn unpack(&self, word: &[u8]) -> AsicResult<DecodedWord>;

    /// Number of immediate-data bits the action occupies in the match word.
    /// A modify that changes this can not be written in place.
    fn immediate_bits(&self, action: &ActionSpec) -> AsicResult<u32>;
}

/// Where an attached resource lives: the companion tables are allocated per
/// stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceLoc {
    pub pipe: PipeSel,
    pub stage: StageId,
}

/// How a companion resource is found from its match entry.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Addressing {
    /// Co-located with the entry: the address is the entry's slot, scaled by
    /// the companion memory's packing.
    Direct,
    /// Reached through a pointer carried in the match word.
    Indirect,
}

/// The interface to the managers of action-data, counter, meter, stateful and
/// idle-timeout tables.
pub trait ResourceOps: Send + Sync {
    /// Claim the resource at `addr`.  For indirect resources `addr` is the
    /// caller-supplied index; for direct resources it is derived from the
    /// entry's slot.  Returns the pointer to carry in the match word.
    fn attach_at(
        &self,
        class: ResourceClass,
        addressing: Addressing,
        loc: ResourceLoc,
        addr: u32,
    ) -> AsicResult<ResourcePtr>;

    /// Release a previously attached resource.
    fn detach(
        &self,
        class: ResourceClass,
        addressing: Addressing,
        loc: ResourceLoc,
        ptr: ResourcePtr,
    ) -> AsicResult<()>;

    /// Carry the state of a direct resource along with its entry.  Indirect
    /// resources never move; the pointer moves with the match word.
    fn relocate(
        &self,
        class: ResourceClass,
        loc: ResourceLoc,
        old_addr: u32,
        new_addr: u32,
    ) -> AsicResult<()>;
}

/// The operations the table manager needs from the device itself.  All
/// mutation goes through instruction lists; reads are used only by
/// warm-restart reconciliation and verification.
pub trait AsicOps {
    /// Execute a single instruction synchronously.
    fn execute(&self, instr: &Instruction) -> AsicResult<()>;

    /// Read back the word programmed at a slot.  `None` means the slot's
    /// valid bit is clear.
    fn read_slot(
        &self,
        pipe: PipeId,
        stage: StageId,
        slot: SlotIdx,
    ) -> AsicResult<Option<Vec<u8>>>;

    /// Read back a pipe's default-entry register.
    fn read_default(&self, pipe: PipeId) -> AsicResult<Option<Vec<u8>>>;

    /// Number of pipes on the device.
    fn pipe_count(&self) -> u8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_encoding() {
        let h = EntryHandle::new(PipeSel::Pipe(PipeId(3)), 1234);
        assert_eq!(h.pipe(), PipeSel::Pipe(PipeId(3)));
        assert_eq!(h.index(), 1234);

        let h = EntryHandle::new(PipeSel::All, 7);
        assert_eq!(h.pipe(), PipeSel::All);
        assert_eq!(h.index(), 7);

        let parsed: EntryHandle = h.to_string().parse().unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn test_hash_bits() {
        let hv = HashValues::single(0b1110_0100);
        assert_eq!(hv.bits(0, 2), 0b00);
        assert_eq!(hv.bits(2, 2), 0b01);
        assert_eq!(hv.bits(4, 4), 0b1110);

        let hv = HashValues {
            primary: u64::MAX,
            secondary: Some(0b11),
        };
        // Straddles the two values
        assert_eq!(hv.bits(62, 4), 0b1111);
        assert_eq!(hv.bits(64, 4), 0b0011);
    }
}
