// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Software implementations of the collaborators the exact-match table
//! manager drives: a chaos-capable model of the device's match memories, a
//! seeded hash engine, a raw entry codec, and a resource manager for the
//! companion tables.

pub mod chaos;
pub mod codec;
pub mod hash;
pub mod resources;

pub use chaos::AsicConfig;
pub use chaos::Handle;
