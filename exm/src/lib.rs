// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Entry placement and hardware synchronization for exact-match tables.
//!
//! A request to add, modify or delete an entry flows through four pieces:
//!
//! - the eviction-chain search ([`search`]) consults the per-stage occupancy
//!   graph ([`graph`]) and produces an ordered move list,
//! - the attached-resource coordinator ([`resources`]) claims the counters,
//!   meters and action data the entry needs,
//! - the shadow state ([`shadow`]) commits the move list to the software view
//!   of the table, logging undo records as it goes,
//! - the replay protocol ([`replay`]) walks the move list again and drives the
//!   device through a [`session::Session`], moving displaced entries without
//!   ever letting two copies, or no copy, of a key match.
//!
//! Any failure along the way rolls the shadow state back to exactly what it
//! was before the call, then undoes the call's device writes newest first,
//! moving displaced entries back the way they came.

pub mod config;
pub mod freemap;
pub mod graph;
pub mod replay;
pub mod resources;
pub mod restore;
pub mod search;
pub mod session;
pub mod shadow;
pub mod table;
pub mod types;

pub use config::TableConfig;
pub use session::Session;
pub use table::ExmTable;
pub use types::{ErrorKind, ExmError, ExmResult};
