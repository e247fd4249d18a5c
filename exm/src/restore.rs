// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The persisted form of a table's software state, used to rebuild it after
//! a restart.

use aal::ActionSpec;
use aal::EntryHandle;
use aal::MatchKey;
use aal::SlotIdx;
use aal::StageId;
use serde::Deserialize;
use serde::Serialize;

use crate::shadow::Attachments;
use crate::shadow::DefaultEntry;
use crate::shadow::EntryRecord;
use crate::types::ExmError;
use crate::types::ExmResult;

/// Bumped whenever the record layout changes incompatibly.
pub const RESTORE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestoreRecord {
    DefaultEntry {
        handle: EntryHandle,
        action: ActionSpec,
        #[serde(default)]
        attached: Attachments,
    },
    MatchEntry {
        handle: EntryHandle,
        stage: StageId,
        slot: SlotIdx,
        key: MatchKey,
        action: ActionSpec,
        #[serde(default)]
        ttl: Option<u32>,
        #[serde(default)]
        attached: Attachments,
    },
}

impl RestoreRecord {
    pub fn handle(&self) -> EntryHandle {
        match self {
            RestoreRecord::DefaultEntry { handle, .. }
            | RestoreRecord::MatchEntry { handle, .. } => *handle,
        }
    }
}

impl From<&EntryRecord> for RestoreRecord {
    fn from(rec: &EntryRecord) -> Self {
        RestoreRecord::MatchEntry {
            handle: rec.handle,
            stage: rec.stage,
            slot: rec.slot,
            key: rec.key.clone(),
            action: rec.action.clone(),
            ttl: rec.ttl,
            attached: rec.attached.clone(),
        }
    }
}

impl From<&DefaultEntry> for RestoreRecord {
    fn from(d: &DefaultEntry) -> Self {
        RestoreRecord::DefaultEntry {
            handle: d.handle,
            action: d.action.clone(),
            attached: d.attached.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreImage {
    pub version: u32,
    pub table: String,
    pub records: Vec<RestoreRecord>,
}

impl RestoreImage {
    pub fn new(table: impl ToString, records: Vec<RestoreRecord>) -> Self {
        RestoreImage {
            version: RESTORE_VERSION,
            table: table.to_string(),
            records,
        }
    }

    pub fn to_json(&self) -> ExmResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ExmError::Internal(format!("encoding image: {e}")))
    }

    pub fn from_json(s: &str) -> ExmResult<Self> {
        let image: RestoreImage = serde_json::from_str(s)
            .map_err(|e| ExmError::Invalid(format!("decoding image: {e}")))?;
        if image.version != RESTORE_VERSION {
            return Err(ExmError::Invalid(format!(
                "image version {} is not {RESTORE_VERSION}",
                image.version
            )));
        }
        Ok(image)
    }
}

/// What a reconciliation pass found and fixed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Slot reads compared against the shadow state.
    pub checked: usize,
    /// Slots rewritten because hardware was missing or disagreed with an
    /// installed entry.
    pub reprogrammed: usize,
    /// Valid slots with no entry behind them, now cleared.
    pub cleared: usize,
    /// Default-entry registers rewritten or cleared.
    pub defaults: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use aal::PipeSel;
    use aal::ResourceClass;
    use aal::ResourcePtr;

    #[test]
    fn test_json() -> anyhow::Result<()> {
        let mut attached = Attachments::default();
        attached.ptrs.counter = Some(ResourcePtr(3));
        attached.indices.insert(ResourceClass::Counter, 1);
        let image = RestoreImage::new(
            "fwd",
            vec![
                RestoreRecord::DefaultEntry {
                    handle: EntryHandle::new(PipeSel::All, 0),
                    action: ActionSpec::new(9, vec![]),
                    attached: Attachments::default(),
                },
                RestoreRecord::MatchEntry {
                    handle: EntryHandle::new(PipeSel::All, 1),
                    stage: StageId(2),
                    slot: SlotIdx(17),
                    key: MatchKey::from(0xabcdu64),
                    action: ActionSpec::new(1, vec![1, 2]),
                    ttl: Some(30),
                    attached,
                },
            ],
        );
        let json = image.to_json()?;
        assert!(json.contains("\"kind\": \"match_entry\""));
        assert_eq!(RestoreImage::from_json(&json)?, image);
        Ok(())
    }

    #[test]
    fn test_version() {
        let json = r#"{"version": 99, "table": "t", "records": []}"#;
        assert!(matches!(
            RestoreImage::from_json(json),
            Err(ExmError::Invalid(_))
        ));
    }
}
