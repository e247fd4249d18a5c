// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2026 Oxide Computer Company

use std::fmt;

use serde::{Deserialize, Serialize};

/// The flavors of exact-match table the manager knows how to place entries
/// into.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    /// Full key stored in the match word, multi-way cuckoo placement.
    #[default]
    Exact,
    /// A digest of the key is stored in place of the key itself.  Two keys
    /// with the same digest may not share a stage.
    ProxyHash,
    /// One hash, one slot.  There is no match decision in hardware, so a
    /// collision can not be evicted around.
    HashAction,
}

impl TableKind {
    /// Does placement in this kind of table go through the eviction search?
    pub fn evicts(&self) -> bool {
        !matches!(self, TableKind::HashAction)
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                TableKind::Exact => "exact",
                TableKind::ProxyHash => "proxy_hash",
                TableKind::HashAction => "hash_action",
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        kind: TableKind,
    }

    #[test]
    fn test_kind_names() {
        for kind in [TableKind::Exact, TableKind::ProxyHash, TableKind::HashAction]
        {
            let w: Wrapper =
                serde_json::from_str(&format!("{{\"kind\": \"{kind}\"}}"))
                    .unwrap();
            assert_eq!(w.kind, kind);
        }
        assert!(serde_json::from_str::<Wrapper>(r#"{"kind": "ternary"}"#).is_err());
        assert!(!TableKind::HashAction.evicts());
        assert!(TableKind::ProxyHash.evicts());
    }
}
