// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Coordinates the companion tables attached to a match table.
//!
//! Indirect resources are reached through pointers carried in the match
//! word, so they stay put when their entry moves.  Direct resources are
//! addressed by the entry's own slot, so their state has to travel with the
//! entry.  Every side effect is recorded in the shadow state's undo log,
//! which is how a failed call releases whatever it had claimed.

use std::collections::BTreeSet;

use aal::ActionSpec;
use aal::Addressing;
use aal::AsicError;
use aal::ResourceClass;
use aal::ResourceLoc;
use aal::ResourceOps;
use aal::ResourcePtr;
use aal::ResourceTag;
use aal::SlotIdx;
use slog::debug;
use slog::Logger;

use crate::config::ResourceConfig;
use crate::shadow::Attachments;
use crate::shadow::ResourceUndo;
use crate::shadow::ShadowState;
use crate::types::ExmError;
use crate::types::ExmResult;

/// Address of a direct resource: the memory word holding the slot's state in
/// the upper bits, and the sub-word position in the low three.
pub fn direct_addr(cfg: &ResourceConfig, slot: SlotIdx) -> u32 {
    let epw = cfg.entries_per_word.max(1) as u32;
    ((slot.0 / epw) << 3) | (slot.0 % epw)
}

/// A resource an entry no longer wants.  It is only released once the
/// hardware no longer points at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stale {
    Indirect {
        class: ResourceClass,
        index: u32,
        ptr: ResourcePtr,
    },
    Direct {
        class: ResourceClass,
    },
}

pub struct Coordinator<'a> {
    log: &'a Logger,
    ops: &'a dyn ResourceOps,
    config: &'a [ResourceConfig],
}

fn attach_error(class: ResourceClass, e: AsicError) -> ExmError {
    match e {
        AsicError::Exhausted(msg) => {
            ExmError::ResourceExhausted(format!("{class}: {msg}"))
        }
        e => ExmError::Hardware(e),
    }
}

impl<'a> Coordinator<'a> {
    pub fn new(
        log: &'a Logger,
        ops: &'a dyn ResourceOps,
        config: &'a [ResourceConfig],
    ) -> Self {
        Coordinator { log, ops, config }
    }

    /// Are any of the table's companions addressed through the slot?
    pub fn has_direct(&self) -> bool {
        self.config.iter().any(|c| c.addressing == Addressing::Direct)
    }

    fn config(&self, class: ResourceClass) -> ExmResult<&ResourceConfig> {
        self.config.iter().find(|c| c.class == class).ok_or_else(|| {
            ExmError::Invalid(format!("no {class} is attached to this table"))
        })
    }

    // Reject directives for classes the table has no companion for.
    fn check_action(&self, action: &ActionSpec) -> ExmResult<()> {
        for spec in &action.resources {
            if matches!(spec.tag, ResourceTag::Attached { .. }) {
                self.config(spec.class)?;
            }
        }
        Ok(())
    }

    fn attach_indirect(
        &self,
        shadow: &mut ShadowState,
        loc: ResourceLoc,
        class: ResourceClass,
        index: u32,
        att: &mut Attachments,
    ) -> ExmResult<()> {
        let ptr = self
            .ops
            .attach_at(class, Addressing::Indirect, loc, index)
            .map_err(|e| attach_error(class, e))?;
        shadow.record_resource(ResourceUndo::Attached {
            class,
            addressing: Addressing::Indirect,
            loc,
            ptr,
        });
        att.ptrs.set(class, Some(ptr))?;
        att.indices.insert(class, index);
        Ok(())
    }

    fn attach_direct(
        &self,
        shadow: &mut ShadowState,
        loc: ResourceLoc,
        cfg: &ResourceConfig,
        slot: SlotIdx,
        att: &mut Attachments,
    ) -> ExmResult<()> {
        let addr = direct_addr(cfg, slot);
        let ptr = self
            .ops
            .attach_at(cfg.class, Addressing::Direct, loc, addr)
            .map_err(|e| attach_error(cfg.class, e))?;
        shadow.record_resource(ResourceUndo::Attached {
            class: cfg.class,
            addressing: Addressing::Direct,
            loc,
            ptr,
        });
        att.direct.insert(cfg.class);
        Ok(())
    }

    /// Claim everything a new entry's action asks for.  Direct resources are
    /// claimed unless explicitly declined, and only when `slot` is given:
    /// the default entry has none, and a new entry landing where another is
    /// being displaced from claims them with [`Coordinator::attach_direct_at`]
    /// once that move is done and before its own word is written.
    pub fn attach(
        &self,
        shadow: &mut ShadowState,
        loc: ResourceLoc,
        slot: Option<SlotIdx>,
        action: &ActionSpec,
    ) -> ExmResult<Attachments> {
        self.check_action(action)?;
        let mut att = Attachments::default();
        for cfg in self.config {
            match (cfg.addressing, action.resource_tag(cfg.class)) {
                (Addressing::Indirect, ResourceTag::Attached { index }) => {
                    self.attach_indirect(shadow, loc, cfg.class, index, &mut att)?
                }
                (Addressing::Indirect, _) => {}
                (Addressing::Direct, ResourceTag::Detached) => {}
                (Addressing::Direct, _) => {
                    if let Some(slot) = slot {
                        self.attach_direct(shadow, loc, cfg, slot, &mut att)?
                    }
                }
            }
        }
        Ok(att)
    }

    /// Claim the direct resources of an entry that has landed at `slot`.
    pub fn attach_direct_at(
        &self,
        shadow: &mut ShadowState,
        loc: ResourceLoc,
        slot: SlotIdx,
        action: &ActionSpec,
    ) -> ExmResult<BTreeSet<ResourceClass>> {
        let mut att = Attachments::default();
        for cfg in self.config {
            if cfg.addressing == Addressing::Direct
                && action.resource_tag(cfg.class) != ResourceTag::Detached
            {
                self.attach_direct(shadow, loc, cfg, slot, &mut att)?;
            }
        }
        Ok(att.direct)
    }

    /// Work out the attachments for a modified action.  New resources are
    /// claimed now; the ones being given up are returned for release once
    /// the hardware has stopped using them.
    pub fn modify(
        &self,
        shadow: &mut ShadowState,
        loc: ResourceLoc,
        slot: Option<SlotIdx>,
        current: &Attachments,
        action: &ActionSpec,
    ) -> ExmResult<(Attachments, Vec<Stale>)> {
        self.check_action(action)?;
        let mut att = current.clone();
        let mut stale = Vec::new();
        for cfg in self.config {
            let class = cfg.class;
            let tag = action.resource_tag(class);
            match cfg.addressing {
                Addressing::Indirect => {
                    let old = match (current.indices.get(&class), current.ptrs.get(class)) {
                        (Some(index), Some(ptr)) => Some(Stale::Indirect {
                            class,
                            index: *index,
                            ptr,
                        }),
                        _ => None,
                    };
                    match tag {
                        ResourceTag::Attached { index }
                            if current.indices.get(&class) == Some(&index) => {}
                        ResourceTag::Attached { index } => {
                            self.attach_indirect(shadow, loc, class, index, &mut att)?;
                            stale.extend(old);
                        }
                        ResourceTag::Detached => {
                            att.ptrs.set(class, None)?;
                            att.indices.remove(&class);
                            stale.extend(old);
                        }
                        ResourceTag::NoChange => {}
                    }
                }
                Addressing::Direct => {
                    let live = current.direct.contains(&class);
                    match (tag, slot) {
                        (ResourceTag::Attached { .. }, Some(slot)) if !live => {
                            self.attach_direct(shadow, loc, cfg, slot, &mut att)?
                        }
                        (ResourceTag::Detached, _) if live => {
                            att.direct.remove(&class);
                            stale.push(Stale::Direct { class });
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok((att, stale))
    }

    /// Give up resources.  `slot` locates direct ones.
    pub fn release(
        &self,
        shadow: &mut ShadowState,
        loc: ResourceLoc,
        slot: Option<SlotIdx>,
        stale: &[Stale],
    ) -> ExmResult<()> {
        for s in stale {
            match *s {
                Stale::Indirect { class, index, ptr } => {
                    self.ops.detach(class, Addressing::Indirect, loc, ptr)?;
                    shadow.record_resource(ResourceUndo::Detached {
                        class,
                        addressing: Addressing::Indirect,
                        loc,
                        addr: index,
                    });
                }
                Stale::Direct { class } => {
                    let Some(slot) = slot else { continue };
                    let addr = direct_addr(self.config(class)?, slot);
                    self.ops.detach(
                        class,
                        Addressing::Direct,
                        loc,
                        ResourcePtr(addr),
                    )?;
                    shadow.record_resource(ResourceUndo::Detached {
                        class,
                        addressing: Addressing::Direct,
                        loc,
                        addr,
                    });
                }
            }
        }
        Ok(())
    }

    /// Everything an entry holds, as a release list.
    pub fn held(&self, att: &Attachments) -> ExmResult<Vec<Stale>> {
        let mut held = Vec::new();
        for (class, index) in &att.indices {
            let ptr = att.ptrs.get(*class).ok_or_else(|| {
                ExmError::Internal(format!("{class} index without a pointer"))
            })?;
            held.push(Stale::Indirect {
                class: *class,
                index: *index,
                ptr,
            });
        }
        held.extend(att.direct.iter().map(|class| Stale::Direct { class: *class }));
        Ok(held)
    }

    /// Carry an entry's direct resources from one slot to another.
    pub fn relocate(
        &self,
        shadow: &mut ShadowState,
        loc: ResourceLoc,
        direct: &BTreeSet<ResourceClass>,
        src: SlotIdx,
        dst: SlotIdx,
    ) -> ExmResult<()> {
        for class in direct {
            let cfg = self.config(*class)?;
            let (from, to) = (direct_addr(cfg, src), direct_addr(cfg, dst));
            self.ops.relocate(*class, loc, from, to)?;
            shadow.record_resource(ResourceUndo::Relocated {
                class: *class,
                loc,
                from,
                to,
            });
        }
        Ok(())
    }

    /// Reverse recorded side effects, newest first.  Every step is attempted;
    /// the first failure is reported.
    pub fn compensate(&self, undo: &[ResourceUndo]) -> ExmResult<()> {
        let mut first = None;
        for u in undo {
            let result = match *u {
                ResourceUndo::Attached {
                    class,
                    addressing,
                    loc,
                    ptr,
                } => self.ops.detach(class, addressing, loc, ptr),
                ResourceUndo::Detached {
                    class,
                    addressing,
                    loc,
                    addr,
                } => self.ops.attach_at(class, addressing, loc, addr).map(|_| ()),
                ResourceUndo::Relocated {
                    class,
                    loc,
                    from,
                    to,
                } => self.ops.relocate(class, loc, to, from),
            };
            if let Err(e) = result {
                debug!(self.log, "resource compensation failed";
                    "undo" => ?u, "error" => %e);
                first.get_or_insert(ExmError::from(e));
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow::Reversal;
    use aal::PipeSel;
    use aal::StageId;
    use std::sync::Mutex;

    // A resource manager that records what it is asked to do.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        exhausted: Option<ResourceClass>,
    }

    impl ResourceOps for Recorder {
        fn attach_at(
            &self,
            class: ResourceClass,
            _addressing: Addressing,
            _loc: ResourceLoc,
            addr: u32,
        ) -> aal::AsicResult<ResourcePtr> {
            if self.exhausted == Some(class) {
                return Err(AsicError::Exhausted("none left".into()));
            }
            self.calls.lock().unwrap().push(format!("attach {class} {addr}"));
            Ok(ResourcePtr(addr + 100))
        }

        fn detach(
            &self,
            class: ResourceClass,
            _addressing: Addressing,
            _loc: ResourceLoc,
            ptr: ResourcePtr,
        ) -> aal::AsicResult<()> {
            self.calls.lock().unwrap().push(format!("detach {class} {}", ptr.0));
            Ok(())
        }

        fn relocate(
            &self,
            class: ResourceClass,
            _loc: ResourceLoc,
            old_addr: u32,
            new_addr: u32,
        ) -> aal::AsicResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("relocate {class} {old_addr} {new_addr}"));
            Ok(())
        }
    }

    fn loc() -> ResourceLoc {
        ResourceLoc {
            pipe: PipeSel::All,
            stage: StageId(0),
        }
    }

    fn shadow() -> ShadowState {
        let log = common::logging::test_logger();
        ShadowState::new(&log, PipeSel::All, Vec::new())
    }

    fn config() -> Vec<ResourceConfig> {
        vec![
            ResourceConfig::indirect(ResourceClass::ActionData),
            ResourceConfig {
                class: ResourceClass::Counter,
                addressing: Addressing::Direct,
                entries_per_word: 4,
            },
        ]
    }

    #[test]
    fn test_direct_addr() {
        let cfg = &config()[1];
        assert_eq!(direct_addr(cfg, SlotIdx(0)), 0);
        assert_eq!(direct_addr(cfg, SlotIdx(5)), (1 << 3) | 1);
    }

    #[test]
    fn test_attach_and_compensate() -> anyhow::Result<()> {
        let log = common::logging::test_logger();
        let ops = Recorder::default();
        let config = config();
        let coord = Coordinator::new(&log, &ops, &config);
        let mut shadow = shadow();
        shadow.savepoint();

        let action = ActionSpec::new(1, vec![]).with_resource(
            ResourceClass::ActionData,
            ResourceTag::Attached { index: 7 },
        );
        let att = coord.attach(&mut shadow, loc(), Some(SlotIdx(2)), &action)?;
        assert_eq!(att.ptrs.action_data, Some(ResourcePtr(107)));
        assert!(att.direct.contains(&ResourceClass::Counter));

        let comp = shadow.rollback()?;
        let undo: Vec<ResourceUndo> = comp
            .steps
            .iter()
            .filter_map(|step| match step {
                Reversal::Resource(r) => Some(*r),
                Reversal::Device(_) => None,
            })
            .collect();
        coord.compensate(&undo)?;
        assert_eq!(
            *ops.calls.lock().unwrap(),
            vec![
                "attach action_data 7",
                "attach counter 2",
                "detach counter 102",
                "detach action_data 107",
            ]
        );
        Ok(())
    }

    #[test]
    fn test_exhausted() {
        let log = common::logging::test_logger();
        let ops = Recorder {
            exhausted: Some(ResourceClass::Counter),
            ..Default::default()
        };
        let config = config();
        let coord = Coordinator::new(&log, &ops, &config);
        let mut shadow = shadow();
        let action = ActionSpec::new(1, vec![]);
        let err = coord
            .attach(&mut shadow, loc(), Some(SlotIdx(0)), &action)
            .unwrap_err();
        assert!(matches!(err, ExmError::ResourceExhausted(_)));
    }

    #[test]
    fn test_modify() -> anyhow::Result<()> {
        let log = common::logging::test_logger();
        let ops = Recorder::default();
        let config = config();
        let coord = Coordinator::new(&log, &ops, &config);
        let mut shadow = shadow();

        let action = ActionSpec::new(1, vec![]).with_resource(
            ResourceClass::ActionData,
            ResourceTag::Attached { index: 1 },
        );
        let att = coord.attach(&mut shadow, loc(), Some(SlotIdx(0)), &action)?;

        let action = ActionSpec::new(1, vec![])
            .with_resource(
                ResourceClass::ActionData,
                ResourceTag::Attached { index: 2 },
            )
            .with_resource(ResourceClass::Counter, ResourceTag::Detached);
        let (new, stale) =
            coord.modify(&mut shadow, loc(), Some(SlotIdx(0)), &att, &action)?;
        assert_eq!(new.indices.get(&ResourceClass::ActionData), Some(&2));
        assert!(new.direct.is_empty());
        assert_eq!(
            stale,
            vec![
                Stale::Indirect {
                    class: ResourceClass::ActionData,
                    index: 1,
                    ptr: ResourcePtr(101)
                },
                Stale::Direct {
                    class: ResourceClass::Counter
                },
            ]
        );

        // Asking for a class the table lacks is an error
        let action = ActionSpec::new(1, vec![])
            .with_resource(ResourceClass::Meter, ResourceTag::Attached { index: 0 });
        assert!(matches!(
            coord.modify(&mut shadow, loc(), None, &new, &action),
            Err(ExmError::Invalid(_))
        ));
        Ok(())
    }
}
