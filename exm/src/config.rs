// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Static table geometry, loaded from TOML.

use std::collections::BTreeSet;
use std::path::Path;

use aal::Addressing;
use aal::ResourceClass;
use common::table::TableKind;
use common::MAX_MOVE_BUDGET;
use common::MAX_PIPES;
use serde::Deserialize;
use serde::Serialize;

use crate::types::ExmError;
use crate::types::ExmResult;

/// Fill level above which a stage is only used if every stage is above it.
pub const DEFAULT_FILL_THRESHOLD: f64 = 0.70;

/// Eviction depth used when a stage does not set its own.
pub const DEFAULT_MAX_MOVES: u8 = 4;

/// Widest packing word supported by the occupancy bitmap.
pub const MAX_ENTRIES_PER_WORD: u8 = 64;

/// Widest packing of a directly-addressed companion memory.
pub const MAX_RESOURCE_ENTRIES_PER_WORD: u8 = 8;

fn default_pipes() -> u8 {
    1
}

fn default_symmetric() -> bool {
    true
}

fn default_fill_threshold() -> f64 {
    DEFAULT_FILL_THRESHOLD
}

fn default_ways() -> u8 {
    2
}

fn default_entries_per_word() -> u8 {
    1
}

fn default_max_moves() -> u8 {
    DEFAULT_MAX_MOVES
}

/// One stage's share of the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub stage: u8,
    /// Total entry positions across all ways.
    pub entries: u32,
    #[serde(default = "default_ways")]
    pub ways: u8,
    #[serde(default = "default_entries_per_word")]
    pub entries_per_word: u8,
    /// Longest eviction chain the search may build in this stage.
    #[serde(default = "default_max_moves")]
    pub max_moves: u8,
}

impl StageConfig {
    pub fn new(stage: u8, entries: u32, ways: u8, entries_per_word: u8) -> Self {
        StageConfig {
            stage,
            entries,
            ways,
            entries_per_word,
            max_moves: DEFAULT_MAX_MOVES,
        }
    }

    pub fn with_max_moves(mut self, max_moves: u8) -> Self {
        self.max_moves = max_moves;
        self
    }
}

/// A companion table attached to the match table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceConfig {
    pub class: ResourceClass,
    pub addressing: Addressing,
    /// Packing of the companion memory; only meaningful for direct
    /// addressing.
    #[serde(default = "default_entries_per_word")]
    pub entries_per_word: u8,
}

impl ResourceConfig {
    pub fn direct(class: ResourceClass) -> Self {
        ResourceConfig {
            class,
            addressing: Addressing::Direct,
            entries_per_word: 1,
        }
    }

    pub fn indirect(class: ResourceClass) -> Self {
        ResourceConfig {
            class,
            addressing: Addressing::Indirect,
            entries_per_word: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub name: String,
    #[serde(default)]
    pub kind: TableKind,
    /// Number of pipes the table is instantiated in.
    #[serde(default = "default_pipes")]
    pub pipes: u8,
    /// A symmetric table keeps one instance and broadcasts to every pipe.
    #[serde(default = "default_symmetric")]
    pub symmetric: bool,
    /// Reject adds whose key is already installed.
    #[serde(default)]
    pub duplicate_check: bool,
    #[serde(default = "default_fill_threshold")]
    pub fill_threshold: f64,
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

impl TableConfig {
    /// A symmetric, single-pipe exact-match table with no companions.
    pub fn exact(name: impl ToString, stages: Vec<StageConfig>) -> Self {
        TableConfig {
            name: name.to_string(),
            kind: TableKind::Exact,
            pipes: 1,
            symmetric: true,
            duplicate_check: false,
            fill_threshold: DEFAULT_FILL_THRESHOLD,
            stages,
            resources: Vec::new(),
        }
    }

    pub fn from_toml(contents: &str) -> ExmResult<Self> {
        let config: TableConfig = toml::from_str(contents)
            .map_err(|e| ExmError::Config(format!("parsing: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ExmResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ExmError::Config(format!("reading {}: {e}", path.display()))
        })?;
        TableConfig::from_toml(&contents)
    }

    /// Number of entry positions across all stages.
    pub fn total_entries(&self) -> u32 {
        self.stages.iter().map(|s| s.entries).sum()
    }

    pub fn has_direct_resources(&self) -> bool {
        self.resources
            .iter()
            .any(|r| r.addressing == Addressing::Direct)
    }

    pub fn resource(&self, class: ResourceClass) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.class == class)
    }

    pub fn validate(&self) -> ExmResult<()> {
        let bad = |msg: String| Err(ExmError::Config(msg));

        if self.name.is_empty() {
            return bad("table needs a name".into());
        }
        if self.pipes == 0 || self.pipes > MAX_PIPES {
            return bad(format!(
                "{}: pipe count {} outside 1..={MAX_PIPES}",
                self.name, self.pipes
            ));
        }
        if !(self.fill_threshold > 0.0 && self.fill_threshold <= 1.0) {
            return bad(format!(
                "{}: fill threshold {} outside (0, 1]",
                self.name, self.fill_threshold
            ));
        }
        if self.stages.is_empty() {
            return bad(format!("{}: no stages", self.name));
        }

        let mut seen = BTreeSet::new();
        for s in &self.stages {
            if !seen.insert(s.stage) {
                return bad(format!("{}: stage {} listed twice", self.name, s.stage));
            }
            if s.entries == 0 {
                return bad(format!("{}: stage {} is empty", self.name, s.stage));
            }
            if s.entries_per_word == 0 || s.entries_per_word > MAX_ENTRIES_PER_WORD
            {
                return bad(format!(
                    "{}: stage {} packs {} entries per word",
                    self.name, s.stage, s.entries_per_word
                ));
            }
            if s.max_moves > MAX_MOVE_BUDGET {
                return bad(format!(
                    "{}: stage {} max_moves {} exceeds {MAX_MOVE_BUDGET}",
                    self.name, s.stage, s.max_moves
                ));
            }
            match self.kind {
                TableKind::HashAction => {
                    if s.ways != 1 || s.entries_per_word != 1 {
                        return bad(format!(
                            "{}: hash-action stage {} must be one way of \
                             one entry per word",
                            self.name, s.stage
                        ));
                    }
                }
                _ => {
                    if s.ways == 0 {
                        return bad(format!(
                            "{}: stage {} has no ways",
                            self.name, s.stage
                        ));
                    }
                    let per_way = s.ways as u32 * s.entries_per_word as u32;
                    if s.entries % per_way != 0 {
                        return bad(format!(
                            "{}: stage {}: {} entries do not divide into {} \
                             ways of {}-entry words",
                            self.name,
                            s.stage,
                            s.entries,
                            s.ways,
                            s.entries_per_word
                        ));
                    }
                }
            }
        }

        let mut classes = BTreeSet::new();
        for r in &self.resources {
            if !classes.insert(r.class) {
                return bad(format!("{}: {} attached twice", self.name, r.class));
            }
            if r.class == ResourceClass::IdleTime
                && r.addressing != Addressing::Direct
            {
                return bad(format!(
                    "{}: idle-time state must be directly addressed",
                    self.name
                ));
            }
            if r.entries_per_word == 0
                || r.entries_per_word > MAX_RESOURCE_ENTRIES_PER_WORD
            {
                return bad(format!(
                    "{}: {} packs {} entries per word",
                    self.name, r.class, r.entries_per_word
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name = "fwd"
kind = "proxy_hash"
pipes = 2
symmetric = false

[[stages]]
stage = 2
entries = 1024
ways = 4
entries_per_word = 4

[[stages]]
stage = 3
entries = 512
max_moves = 2

[[resources]]
class = "counter"
addressing = "direct"
entries_per_word = 4

[[resources]]
class = "action_data"
addressing = "indirect"
"#;

    #[test]
    fn test_parse() -> anyhow::Result<()> {
        let config = TableConfig::from_toml(SAMPLE)?;
        assert_eq!(config.kind, TableKind::ProxyHash);
        assert_eq!(config.pipes, 2);
        assert!(!config.symmetric);
        assert_eq!(config.fill_threshold, DEFAULT_FILL_THRESHOLD);
        assert_eq!(config.stages[1].ways, 2);
        assert_eq!(config.stages[1].max_moves, 2);
        assert_eq!(config.stages[0].max_moves, DEFAULT_MAX_MOVES);
        assert_eq!(config.total_entries(), 1536);
        assert!(config.has_direct_resources());
        Ok(())
    }

    #[test]
    fn test_rejects() {
        let mut config =
            TableConfig::exact("t", vec![StageConfig::new(0, 10, 4, 1)]);
        assert!(config.validate().is_err());

        config.stages = vec![StageConfig::new(0, 8, 2, 1).with_max_moves(9)];
        assert!(config.validate().is_err());

        config.stages = vec![
            StageConfig::new(0, 8, 2, 1),
            StageConfig::new(0, 8, 2, 1),
        ];
        assert!(config.validate().is_err());

        config.stages = vec![StageConfig::new(0, 8, 2, 1)];
        assert!(config.validate().is_ok());

        config.kind = TableKind::HashAction;
        assert!(config.validate().is_err());

        config.kind = TableKind::Exact;
        config.resources = vec![ResourceConfig::indirect(ResourceClass::IdleTime)];
        assert!(config.validate().is_err());

        assert!(TableConfig::from_toml("name = \"x\"\nbogus = 1").is_err());
    }
}
