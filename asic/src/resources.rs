// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;

use slog::Logger;

use aal::{
    Addressing, AsicError, AsicResult, PipeSel, ResourceClass, ResourceLoc,
    ResourceOps, ResourcePtr, StageId,
};

// Indirect pointers carry the element index above a per-flow-enable bit
const PFE_BIT: u32 = 0x1;

type Addr = (ResourceClass, PipeSel, StageId, u32);

#[derive(Debug, Default)]
struct Pools {
    // Live elements and their reference counts.  Indirect elements may be
    // shared by several entries; direct ones never are.
    refs: BTreeMap<Addr, u32>,
    // Per-element state that must travel with a direct resource, such as a
    // packet count.
    state: BTreeMap<Addr, u64>,
    // Classes whose next N attaches should fail
    failures: BTreeMap<ResourceClass, Vec<usize>>,
    attempts: BTreeMap<ResourceClass, usize>,
}

/// An in-memory manager for the companion tables attached to a match table.
pub struct FauxResources {
    log: Logger,
    capacity: BTreeMap<ResourceClass, u32>,
    pools: Mutex<Pools>,
}

/// Encode an indirect element index as the pointer carried in a match word.
pub fn indirect_ptr(index: u32) -> ResourcePtr {
    ResourcePtr((index << 1) | PFE_BIT)
}

fn ptr_index(ptr: ResourcePtr) -> u32 {
    ptr.0 >> 1
}

impl FauxResources {
    /// Create a manager with the same capacity for every class.
    pub fn new(log: &Logger, capacity: u32) -> Self {
        FauxResources {
            log: log.new(slog::o!("unit" => "faux_resources")),
            capacity: BTreeMap::new(),
            pools: Mutex::new(Pools::default()),
        }
        .with_default_capacity(capacity)
    }

    fn with_default_capacity(mut self, capacity: u32) -> Self {
        use strum::IntoEnumIterator;
        for class in ResourceClass::iter() {
            self.capacity.insert(class, capacity);
        }
        self
    }

    pub fn set_capacity(&mut self, class: ResourceClass, capacity: u32) {
        self.capacity.insert(class, capacity);
    }

    fn pools(&self) -> AsicResult<MutexGuard<'_, Pools>> {
        self.pools
            .lock()
            .map_err(|_| AsicError::Internal("resource pools poisoned".into()))
    }

    /// Fail the `skip + 1`th upcoming attach of a class.
    pub fn fail_next_attach(
        &self,
        class: ResourceClass,
        skip: usize,
    ) -> AsicResult<()> {
        let mut pools = self.pools()?;
        let done = pools.attempts.get(&class).copied().unwrap_or(0);
        pools
            .failures
            .entry(class)
            .or_default()
            .push(done + skip + 1);
        Ok(())
    }

    /// Number of live elements of a class, across all stages.
    pub fn live(&self, class: ResourceClass) -> AsicResult<usize> {
        Ok(self
            .pools()?
            .refs
            .keys()
            .filter(|(c, ..)| *c == class)
            .count())
    }

    /// Is the element at `addr` live?
    pub fn attached(
        &self,
        class: ResourceClass,
        loc: ResourceLoc,
        addr: u32,
    ) -> AsicResult<bool> {
        Ok(self
            .pools()?
            .refs
            .contains_key(&(class, loc.pipe, loc.stage, addr)))
    }

    /// Bump the state of a direct element, as traffic hitting a counter would.
    pub fn bump(
        &self,
        class: ResourceClass,
        loc: ResourceLoc,
        addr: u32,
    ) -> AsicResult<()> {
        let mut pools = self.pools()?;
        let key = (class, loc.pipe, loc.stage, addr);
        if !pools.refs.contains_key(&key) {
            return Err(AsicError::Missing(format!("{class} at {addr}")));
        }
        *pools.state.entry(key).or_insert(0) += 1;
        Ok(())
    }

    pub fn state(
        &self,
        class: ResourceClass,
        loc: ResourceLoc,
        addr: u32,
    ) -> AsicResult<u64> {
        Ok(self
            .pools()?
            .state
            .get(&(class, loc.pipe, loc.stage, addr))
            .copied()
            .unwrap_or(0))
    }
}

impl ResourceOps for FauxResources {
    fn attach_at(
        &self,
        class: ResourceClass,
        addressing: Addressing,
        loc: ResourceLoc,
        addr: u32,
    ) -> AsicResult<ResourcePtr> {
        let mut pools = self.pools()?;
        let attempt = {
            let a = pools.attempts.entry(class).or_insert(0);
            *a += 1;
            *a
        };
        if let Some(sched) = pools.failures.get_mut(&class) {
            if let Some(idx) = sched.iter().position(|n| *n == attempt) {
                sched.remove(idx);
                slog::debug!(self.log, "scheduled {class} attach failure");
                return Err(AsicError::Exhausted(format!(
                    "scheduled {class} failure"
                )));
            }
        }

        let capacity = self.capacity.get(&class).copied().unwrap_or(0);
        if addr >= capacity {
            return Err(AsicError::Exhausted(format!(
                "{class} address {addr} beyond capacity {capacity}"
            )));
        }

        let key = (class, loc.pipe, loc.stage, addr);
        let refs = pools.refs.entry(key).or_insert(0);
        if *refs > 0 && addressing == Addressing::Direct {
            return Err(AsicError::Exists);
        }
        *refs += 1;
        if *refs == 1 {
            pools.state.insert(key, 0);
        }
        slog::trace!(self.log, "attached {class} at {addr}";
            "stage" => %loc.stage);
        Ok(match addressing {
            Addressing::Direct => ResourcePtr(addr),
            Addressing::Indirect => indirect_ptr(addr),
        })
    }

    fn detach(
        &self,
        class: ResourceClass,
        addressing: Addressing,
        loc: ResourceLoc,
        ptr: ResourcePtr,
    ) -> AsicResult<()> {
        let addr = match addressing {
            Addressing::Direct => ptr.0,
            Addressing::Indirect => ptr_index(ptr),
        };
        let mut pools = self.pools()?;
        let key = (class, loc.pipe, loc.stage, addr);
        match pools.refs.get_mut(&key) {
            None => Err(AsicError::Missing(format!("{class} at {addr}"))),
            Some(refs) => {
                *refs -= 1;
                if *refs == 0 {
                    pools.refs.remove(&key);
                    pools.state.remove(&key);
                }
                slog::trace!(self.log, "detached {class} at {addr}";
                    "stage" => %loc.stage);
                Ok(())
            }
        }
    }

    fn relocate(
        &self,
        class: ResourceClass,
        loc: ResourceLoc,
        old_addr: u32,
        new_addr: u32,
    ) -> AsicResult<()> {
        let mut pools = self.pools()?;
        let old = (class, loc.pipe, loc.stage, old_addr);
        let new = (class, loc.pipe, loc.stage, new_addr);
        if pools.refs.contains_key(&new) {
            return Err(AsicError::Exists);
        }
        let refs = pools
            .refs
            .remove(&old)
            .ok_or_else(|| AsicError::Missing(format!("{class} at {old_addr}")))?;
        let state = pools.state.remove(&old).unwrap_or(0);
        pools.refs.insert(new, refs);
        pools.state.insert(new, state);
        slog::trace!(self.log, "relocated {class} {old_addr} -> {new_addr}";
            "stage" => %loc.stage);
        Ok(())
    }
}
