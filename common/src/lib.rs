// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Code shared by the exact-match table manager and its tools.

pub mod logging;
pub mod table;

/// Number of pipes on the largest supported ASIC.
pub const MAX_PIPES: u8 = 4;

/// Longest eviction chain the address-lock instruction sequence can carry.
/// Each displaced entry consumes one push/pop pair, and the hardware caps the
/// depth of a single instruction list.
pub const MAX_MOVE_BUDGET: u8 = 8;
