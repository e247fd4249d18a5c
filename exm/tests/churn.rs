// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Long runs of random inserts, modifies and deletes against a chaos device,
//! checking after each step that hardware and the shadow state agree.

use std::collections::BTreeSet;
use std::sync::Arc;

use aal::ActionSpec;
use aal::AsicOps;
use aal::EntryCodec;
use aal::EntryHandle;
use aal::InstrKind;
use aal::MatchKey;
use aal::PipeId;
use aal::PipeSel;
use asic::codec::RawCodec;
use asic::hash::SeededHash;
use asic::resources::FauxResources;
use asic::AsicConfig;
use asic::Handle;
use exm::config::StageConfig;
use exm::ErrorKind;
use exm::ExmTable;
use exm::Session;
use exm::TableConfig;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use slog::Logger;

struct Rig {
    log: Logger,
    hdl: Handle,
    table: ExmTable,
}

fn rig(seed: u64) -> Rig {
    let log = common::logging::test_logger();
    let hdl = Handle::new(&log, &AsicConfig::default()).unwrap();
    let config = TableConfig::exact(
        "churn",
        vec![StageConfig::new(0, 64, 4, 2), StageConfig::new(1, 64, 4, 2)],
    );
    let table = ExmTable::new(
        &log,
        config,
        Arc::new(SeededHash::new(seed)),
        Arc::new(RawCodec),
        Arc::new(FauxResources::new(&log, 1 << 16)),
    )
    .unwrap();
    Rig { log, hdl, table }
}

fn action(rng: &mut StdRng) -> ActionSpec {
    // Varying the data length forces some modifies to move their entry.
    let len = rng.gen_range(1..4);
    ActionSpec::new(rng.gen_range(1..16), vec![0x5a; len])
}

// Everything the table claims is true of itself and of the device.
fn check(rig: &Rig) -> anyhow::Result<()> {
    let entries = rig.table.entries(PipeSel::All)?;
    let mut slots = BTreeSet::new();
    for e in &entries {
        let geo = rig
            .table
            .stages()
            .iter()
            .find(|g| g.stage == e.stage)
            .unwrap();
        let word = e.slot.0 / geo.entries_per_word as u32;
        assert!(
            e.candidates.contains(&word),
            "{} is in word {word}, not one of {:?}",
            e.handle,
            e.candidates
        );
        assert!(slots.insert((e.stage, e.slot)), "{} shares a slot", e.handle);
        assert_eq!(rig.table.get_location(e.handle)?.slot, e.slot);
    }

    let mut valid = BTreeSet::new();
    for geo in rig.table.stages() {
        assert_eq!(rig.hdl.addr_lock_depth(PipeId(0), geo.stage)?, 0);
        for slot in rig.hdl.valid_slots(PipeId(0), geo.stage)? {
            valid.insert((geo.stage, slot));
        }
    }
    assert_eq!(valid, slots);
    for e in &entries {
        assert_eq!(
            rig.hdl.read_slot(PipeId(0), e.stage, e.slot)?,
            Some(RawCodec.pack(&e.word())?)
        );
    }

    let used: u32 = rig
        .table
        .occupancy(PipeSel::All)?
        .iter()
        .map(|o| o.used)
        .sum();
    assert_eq!(used as usize, entries.len());
    Ok(())
}

struct Churn {
    rng: StdRng,
    live: Vec<EntryHandle>,
    next_key: u64,
}

impl Churn {
    fn new(seed: u64) -> Self {
        Churn {
            rng: StdRng::seed_from_u64(seed),
            live: Vec::new(),
            next_key: 1,
        }
    }

    // Make one random change, returning its error kind if it failed.
    fn step(
        &mut self,
        rig: &Rig,
        sess: &Session<'_, Handle>,
    ) -> Option<ErrorKind> {
        let roll = self.rng.gen_range(0..100);
        let result = if roll < 55 || self.live.is_empty() {
            let key = MatchKey::from(self.next_key);
            self.next_key += 1;
            let act = action(&mut self.rng);
            rig.table
                .place(sess, PipeSel::All, key, act, None)
                .map(|h| self.live.push(h))
        } else if roll < 80 {
            let idx = self.rng.gen_range(0..self.live.len());
            let h = self.live[idx];
            rig.table.delete(sess, h).map(|_| {
                self.live.swap_remove(idx);
            })
        } else {
            let idx = self.rng.gen_range(0..self.live.len());
            let act = action(&mut self.rng);
            rig.table.move_modify(sess, self.live[idx], act)
        };
        result.err().map(|e| e.kind())
    }
}

#[test]
fn test_fill_to_capacity() -> anyhow::Result<()> {
    let rig = rig(11);
    let sess = Session::new(&rig.hdl, &rig.log);
    let capacity = rig.table.config().total_entries();

    let mut placed = 0;
    for k in 0..capacity as u64 {
        match rig.table.place(
            &sess,
            PipeSel::All,
            MatchKey::from(k + 1),
            ActionSpec::new(1, vec![1]),
            None,
        ) {
            Ok(_) => placed += 1,
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::NoSpace);
                break;
            }
        }
    }
    // Four ways of two-entry words with room to displace residents fill
    // well past three quarters before the first refusal.
    assert!(
        placed * 4 >= capacity * 3,
        "only {placed} of {capacity} placed"
    );
    check(&rig)?;

    let usage = rig.table.usage(PipeSel::All)?;
    assert_eq!(usage.occupancy, placed);
    assert!(usage.moves > 0);
    Ok(())
}

#[test]
fn test_churn() -> anyhow::Result<()> {
    let rig = rig(3);
    let sess = Session::new(&rig.hdl, &rig.log);
    let mut churn = Churn::new(7);
    for i in 0..3000 {
        if let Some(kind) = churn.step(&rig, &sess) {
            assert_eq!(kind, ErrorKind::NoSpace);
        }
        if i % 100 == 0 {
            check(&rig)?;
        }
    }
    check(&rig)?;
    assert_eq!(rig.table.entries(PipeSel::All)?.len(), churn.live.len());
    Ok(())
}

#[test]
fn test_deterministic() -> anyhow::Result<()> {
    let first = rig(5);
    let second = rig(5);
    for r in [&first, &second] {
        let sess = Session::new(&r.hdl, &r.log);
        let mut churn = Churn::new(9);
        for _ in 0..500 {
            churn.step(r, &sess);
        }
    }
    assert_eq!(
        first.table.shadow_maps(PipeSel::All)?,
        second.table.shadow_maps(PipeSel::All)?
    );
    assert_eq!(first.hdl.trace()?, second.hdl.trace()?);
    Ok(())
}

#[test]
fn test_faults() -> anyhow::Result<()> {
    let rig = rig(13);
    let sess = Session::new(&rig.hdl, &rig.log);
    let mut churn = Churn::new(17);
    let kinds = [
        InstrKind::Program,
        InstrKind::Invalidate,
        InstrKind::AddrPush,
        InstrKind::AddrPop,
    ];

    // Fill up first so plenty of inserts have to displace something.
    for _ in 0..100 {
        churn.step(&rig, &sess);
    }
    let mut faults = 0;
    for _ in 0..500 {
        let kind = kinds[churn.rng.gen_range(0..kinds.len())];
        let skip = churn.rng.gen_range(0..4);
        rig.hdl.fail_next(kind, skip)?;
        match churn.step(&rig, &sess) {
            None | Some(ErrorKind::NoSpace) => {}
            Some(ErrorKind::HardwareFault) => faults += 1,
            Some(k) => panic!("unexpected failure: {k}"),
        }
        rig.hdl.clear_faults()?;
        check(&rig)?;
    }
    assert!(faults > 0);
    Ok(())
}
