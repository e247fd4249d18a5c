// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! General types used throughout the table manager.

use std::convert;
use std::fmt;

use aal::AsicError;
use aal::EntryHandle;
use aal::SlotIdx;
use aal::StageId;

pub type ExmResult<T> = Result<T, ExmError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExmError {
    #[error("ASIC error: {0}")]
    Hardware(AsicError),
    #[error("Invalid argument: {0}")]
    Invalid(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Resource is missing: {0}")]
    Missing(String),
    #[error("No such entry: {0}")]
    NoSuchHandle(EntryHandle),
    #[error("No such stage: {0}")]
    NoSuchStage(StageId),
    #[error("Table {0} is full")]
    TableFull(String),
    #[error("Hash collision at {stage} slot {slot}")]
    HashCollision { stage: StageId, slot: SlotIdx },
    #[error("Key already present as entry {0}")]
    DuplicateKey(EntryHandle),
    #[error("Attached resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("Table is busy: {0}")]
    Busy(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Unwind: initial: {initial}, unwind: {unwind}")]
    Unwind {
        initial: Box<ExmError>,
        unwind: Box<ExmError>,
    },
}

/// The coarse classification callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArg,
    NotFound,
    NoSpace,
    DuplicateKey,
    ResourceExhausted,
    HardwareFault,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ErrorKind::InvalidArg => "INVALID_ARG",
                ErrorKind::NotFound => "NOT_FOUND",
                ErrorKind::NoSpace => "NO_SPACE",
                ErrorKind::DuplicateKey => "DUPLICATE_KEY",
                ErrorKind::ResourceExhausted => "RESOURCE_EXHAUSTED",
                ErrorKind::HardwareFault => "HARDWARE_FAULT",
                ErrorKind::Internal => "INTERNAL",
            }
        )
    }
}

impl ExmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExmError::Hardware(AsicError::Exhausted(_)) => {
                ErrorKind::ResourceExhausted
            }
            ExmError::Hardware(AsicError::InvalidArg(_)) => {
                ErrorKind::InvalidArg
            }
            ExmError::Hardware(_) => ErrorKind::HardwareFault,
            ExmError::Invalid(_) | ExmError::Config(_) => ErrorKind::InvalidArg,
            ExmError::Missing(_)
            | ExmError::NoSuchHandle(_)
            | ExmError::NoSuchStage(_) => ErrorKind::NotFound,
            ExmError::TableFull(_) | ExmError::HashCollision { .. } => {
                ErrorKind::NoSpace
            }
            ExmError::DuplicateKey(_) => ErrorKind::DuplicateKey,
            ExmError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            ExmError::Busy(_)
            | ExmError::Internal(_)
            | ExmError::Unwind { .. } => ErrorKind::Internal,
        }
    }
}

impl convert::From<AsicError> for ExmError {
    fn from(err: AsicError) -> Self {
        ExmError::Hardware(err)
    }
}

impl convert::From<String> for ExmError {
    fn from(err: String) -> Self {
        ExmError::Internal(err)
    }
}

impl convert::From<&str> for ExmError {
    fn from(err: &str) -> Self {
        ExmError::Internal(err.to_string())
    }
}
