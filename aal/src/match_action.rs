// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

/// Northbound callers describe match keys and actions with their own typed
/// structures, and the key/data encoders reduce them to the packed binary
/// specs defined here before they reach the table manager.  The manager treats
/// keys as opaque byte strings: it compares them for duplicate detection and
/// hands them to the hash and codec collaborators, but never interprets them.
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use strum::EnumIter;

use crate::AsicError;
use crate::AsicResult;

/// A packed exact-match key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MatchKey(pub Vec<u8>);

impl MatchKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        MatchKey(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a key from a string of hex digits, with an optional "0x" prefix.
    pub fn from_hex(s: &str) -> AsicResult<Self> {
        parse_hex(s).map(MatchKey)
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl From<u64> for MatchKey {
    fn from(v: u64) -> Self {
        MatchKey(v.to_be_bytes().to_vec())
    }
}

/// Parse a string of hex digits, with an optional "0x" prefix, into bytes.
pub fn parse_hex(s: &str) -> AsicResult<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() % 2 != 0 {
        return Err(AsicError::InvalidArg(format!(
            "odd number of hex digits: {s}"
        )));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| {
                AsicError::InvalidArg(format!("bad hex string {s}: {e}"))
            })
        })
        .collect()
}

/// The kinds of companion resource that can travel with a match entry.
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
pub enum ResourceClass {
    ActionData,
    Counter,
    Meter,
    Stateful,
    IdleTime,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ResourceClass::ActionData => "action_data",
                ResourceClass::Counter => "counter",
                ResourceClass::Meter => "meter",
                ResourceClass::Stateful => "stateful",
                ResourceClass::IdleTime => "idle_time",
            }
        )
    }
}

/// What the caller wants done with one class of resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceTag {
    /// The resource must be live.  For indirect resources `index` names the
    /// element to point at; it is ignored for direct resources.
    Attached { index: u32 },
    /// The resource must be absent.
    Detached,
    /// Leave whatever is there alone.
    NoChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub class: ResourceClass,
    pub tag: ResourceTag,
}

/// An action and its parameters, already packed by the action encoder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionSpec {
    pub action_id: u32,
    /// Immediate action data carried in the match word.
    pub data: Vec<u8>,
    pub resources: Vec<ResourceSpec>,
}

impl ActionSpec {
    pub fn new(action_id: u32, data: impl Into<Vec<u8>>) -> Self {
        ActionSpec {
            action_id,
            data: data.into(),
            resources: Vec::new(),
        }
    }

    /// Add a resource directive, replacing any earlier one for the same class.
    pub fn with_resource(mut self, class: ResourceClass, tag: ResourceTag) -> Self {
        self.resources.retain(|r| r.class != class);
        self.resources.push(ResourceSpec { class, tag });
        self
    }

    /// The directive for a class, `NoChange` if the caller gave none.
    pub fn resource_tag(&self, class: ResourceClass) -> ResourceTag {
        self.resources
            .iter()
            .find(|r| r.class == class)
            .map(|r| r.tag)
            .unwrap_or(ResourceTag::NoChange)
    }
}

/// A hardware pointer to an attached resource, as carried in a match word or
/// derived from a slot.
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
pub struct ResourcePtr(pub u32);

/// The indirect-resource pointer block of an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndirectPtrs {
    pub action_data: Option<ResourcePtr>,
    pub counter: Option<ResourcePtr>,
    pub meter: Option<ResourcePtr>,
    pub stateful: Option<ResourcePtr>,
}

impl IndirectPtrs {
    pub fn get(&self, class: ResourceClass) -> Option<ResourcePtr> {
        match class {
            ResourceClass::ActionData => self.action_data,
            ResourceClass::Counter => self.counter,
            ResourceClass::Meter => self.meter,
            ResourceClass::Stateful => self.stateful,
            ResourceClass::IdleTime => None,
        }
    }

    /// Record a pointer.  Idle-time state is always addressed directly, so
    /// there is no slot for it here.
    pub fn set(
        &mut self,
        class: ResourceClass,
        ptr: Option<ResourcePtr>,
    ) -> AsicResult<()> {
        match class {
            ResourceClass::ActionData => self.action_data = ptr,
            ResourceClass::Counter => self.counter = ptr,
            ResourceClass::Meter => self.meter = ptr,
            ResourceClass::Stateful => self.stateful = ptr,
            ResourceClass::IdleTime => {
                return Err(AsicError::InvalidArg(
                    "idle-time state has no indirect pointer".into(),
                ))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hex() {
        let k = MatchKey::from_hex("0x0a0b").unwrap();
        assert_eq!(k.as_bytes(), &[0x0a, 0x0b]);
        assert_eq!(k.to_string(), "0x0a0b");
        assert!(MatchKey::from_hex("abc").is_err());
        assert!(MatchKey::from_hex("zz").is_err());
    }

    #[test]
    fn test_resource_tags() {
        let a = ActionSpec::new(1, vec![])
            .with_resource(
                ResourceClass::Counter,
                ResourceTag::Attached { index: 4 },
            )
            .with_resource(ResourceClass::Counter, ResourceTag::Detached);
        assert_eq!(a.resources.len(), 1);
        assert_eq!(a.resource_tag(ResourceClass::Counter), ResourceTag::Detached);
        assert_eq!(a.resource_tag(ResourceClass::Meter), ResourceTag::NoChange);
    }

    #[test]
    fn test_ptr_block() {
        let mut p = IndirectPtrs::default();
        p.set(ResourceClass::Meter, Some(ResourcePtr(9))).unwrap();
        assert_eq!(p.get(ResourceClass::Meter), Some(ResourcePtr(9)));
        assert!(p.set(ResourceClass::IdleTime, None).is_err());
    }
}
