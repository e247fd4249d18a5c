// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fs;
use std::io::stdout;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;
use structopt::*;
use tabwriter::TabWriter;

use aal::EntryHandle;
use aal::PipeSel;
use asic::codec::RawCodec;
use asic::hash::SeededHash;
use asic::resources::FauxResources;
use asic::AsicConfig;
use asic::Handle;
use common::logging::LogFormat;
use exm::ExmTable;
use exm::Session;
use exm::TableConfig;

mod script;

use script::Verb;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "exmadm",
    about = "drives an exact-match table on the faux ASIC",
    version = "0.0.1"
)]
struct GlobalOpts {
    #[structopt(
        long,
        default_value = "human",
        help = "format of log records: human or json"
    )]
    log_format: LogFormat,

    #[structopt(long, help = "append log records to this file")]
    log_file: Option<String>,

    #[structopt(short, long, help = "table configuration, in TOML")]
    config: PathBuf,

    #[structopt(long, default_value = "0", help = "seed for the hash engine")]
    seed: u64,

    #[structopt(subcommand)]
    cmd: Commands,
}

#[derive(Debug, StructOpt)]
enum Commands {
    /// Run a script of table operations, one per line.
    Run {
        #[structopt(long, help = "stop at the first failing line")]
        strict: bool,
        script: PathBuf,
    },
    /// Display the table's geometry.
    Show,
}

struct Driver<'a> {
    table: &'a ExmTable,
    hdl: &'a Handle,
    sess: Session<'a, Handle>,
    pipe: PipeSel,
}

fn underline<W: Write>(tw: &mut W, cols: &[&str]) -> anyhow::Result<()> {
    let cols: Vec<String> = cols.iter().map(|c| c.underline().to_string()).collect();
    writeln!(tw, "{}", cols.join("\t"))?;
    Ok(())
}

impl Driver<'_> {
    fn location(&self, handle: EntryHandle) -> anyhow::Result<()> {
        let loc = self.table.get_location(handle)?;
        let mut tw = TabWriter::new(stdout());
        underline(&mut tw, &["Handle", "Pipe", "Stage", "Slot", "Index"])?;
        writeln!(
            tw,
            "{handle}\t{}\t{}\t{}\t{}",
            loc.pipe, loc.stage, loc.slot, loc.logical_index
        )?;
        tw.flush()?;
        Ok(())
    }

    fn occupancy(&self) -> anyhow::Result<()> {
        let mut tw = TabWriter::new(stdout());
        underline(&mut tw, &["Stage", "Used", "Capacity", "Fill"])?;
        for o in self.table.occupancy(self.pipe)? {
            let fill = 100.0 * o.used as f64 / o.capacity.max(1) as f64;
            writeln!(tw, "{}\t{}\t{}\t{fill:.1}%", o.stage, o.used, o.capacity)?;
        }
        tw.flush()?;
        Ok(())
    }

    fn entries(&self) -> anyhow::Result<()> {
        let mut tw = TabWriter::new(stdout());
        underline(&mut tw, &["Handle", "Stage", "Slot", "Key", "Action", "Data"])?;
        for e in self.table.entries(self.pipe)? {
            let data: String =
                e.action.data.iter().map(|b| format!("{b:02x}")).collect();
            writeln!(
                tw,
                "{}\t{}\t{}\t{}\t{}\t{data}",
                e.handle, e.stage, e.slot, e.key, e.action.action_id
            )?;
        }
        tw.flush()?;
        Ok(())
    }

    fn usage(&self) -> anyhow::Result<()> {
        let u = self.table.usage(self.pipe)?;
        let mut tw = TabWriter::new(stdout());
        for (name, value) in [
            ("size", u.size as u64),
            ("occupancy", u.occupancy as u64),
            ("inserts", u.inserts),
            ("deletes", u.deletes),
            ("updates", u.updates),
            ("moves", u.moves),
            ("collisions", u.collisions),
            ("duplicates", u.duplicates),
            ("update misses", u.update_misses),
            ("delete misses", u.delete_misses),
            ("exhaustion", u.exhaustion),
            ("rollbacks", u.rollbacks),
        ] {
            writeln!(tw, "{name}:\t{value}")?;
        }
        tw.flush()?;
        Ok(())
    }

    // Print the instructions executed since the last time this was asked.
    fn trace(&self) -> anyhow::Result<()> {
        for instr in self.hdl.trace()? {
            println!("{instr}");
        }
        self.hdl.clear_trace()?;
        Ok(())
    }

    fn exec(&mut self, verb: Verb) -> anyhow::Result<()> {
        match verb {
            Verb::Add { key, action, ttl } => {
                let h = self.table.place(&self.sess, self.pipe, key, action, ttl)?;
                println!("added {h}");
            }
            Verb::Mod { handle, action } => {
                self.table.move_modify(&self.sess, handle, action)?;
                println!("modified {handle}");
            }
            Verb::Del { handle } => {
                self.table.delete(&self.sess, handle)?;
                println!("deleted {handle}");
            }
            Verb::Default { action } => {
                let h = self.table.set_default(&self.sess, self.pipe, action)?;
                println!("default {h}");
            }
            Verb::Loc { handle } => self.location(handle)?,
            Verb::Pipe(pipe) => {
                if !self.table.instances().contains(&pipe) {
                    anyhow::bail!("table has no instance for {pipe}");
                }
                self.pipe = pipe;
            }
            Verb::Occupancy => self.occupancy()?,
            Verb::Entries => self.entries()?,
            Verb::Usage => self.usage()?,
            Verb::Trace => self.trace()?,
            Verb::Reconcile => {
                let r = self.table.reconcile(&self.sess)?;
                println!(
                    "checked {} reprogrammed {} cleared {} defaults {}",
                    r.checked, r.reprogrammed, r.cleared, r.defaults
                );
            }
            Verb::Snapshot => println!("{}", self.table.snapshot()?.to_json()?),
        }
        Ok(())
    }
}

fn show(config: &TableConfig) -> anyhow::Result<()> {
    println!("table: {}", config.name);
    println!("kind: {}", config.kind);
    println!(
        "pipes: {} ({})",
        config.pipes,
        if config.symmetric { "symmetric" } else { "per-pipe" }
    );
    println!("fill threshold: {:.0}%", config.fill_threshold * 100.0);

    let mut tw = TabWriter::new(stdout());
    underline(&mut tw, &["Stage", "Entries", "Ways", "Per word", "Moves"])?;
    for s in &config.stages {
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}",
            s.stage, s.entries, s.ways, s.entries_per_word, s.max_moves
        )?;
    }
    tw.flush()?;

    if !config.resources.is_empty() {
        let mut tw = TabWriter::new(stdout());
        underline(&mut tw, &["Resource", "Addressing"])?;
        for r in &config.resources {
            writeln!(tw, "{}\t{:?}", r.class, r.addressing)?;
        }
        tw.flush()?;
    }
    Ok(())
}

fn run(
    log: &slog::Logger,
    config: TableConfig,
    seed: u64,
    script: PathBuf,
    strict: bool,
) -> anyhow::Result<()> {
    let contents = fs::read_to_string(&script)
        .with_context(|| format!("reading {}", script.display()))?;
    let hdl = Handle::new(log, &AsicConfig::uniform(config.pipes, 0.0))?;
    let table = ExmTable::new(
        log,
        config,
        Arc::new(SeededHash::new(seed)),
        Arc::new(RawCodec),
        Arc::new(FauxResources::new(log, 1 << 20)),
    )?;
    let pipe = table
        .instances()
        .first()
        .copied()
        .ok_or_else(|| anyhow::anyhow!("table has no instances"))?;
    let mut driver = Driver {
        table: &table,
        hdl: &hdl,
        sess: Session::new(&hdl, log),
        pipe,
    };

    let mut failed = 0;
    for (n, line) in contents.lines().enumerate() {
        let verb = script::parse(line)
            .with_context(|| format!("{}:{}", script.display(), n + 1))?;
        let Some(verb) = verb else { continue };
        let name = verb.name();
        if let Err(e) = driver.exec(verb) {
            let kind = e
                .downcast_ref::<exm::ExmError>()
                .map(|e| e.kind().to_string())
                .unwrap_or_else(|| "ERROR".to_string());
            println!("line {}: {name}: {}: {e}", n + 1, kind.red());
            if strict {
                return Err(e.context(format!("line {}", n + 1)));
            }
            failed += 1;
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} line(s) failed");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opts = GlobalOpts::from_args();
    let log = match &opts.log_file {
        Some(_) => common::logging::init("exmadm", &opts.log_file, opts.log_format)?,
        None => slog::Logger::root(slog::Discard, slog::o!()),
    };
    let config = TableConfig::from_file(&opts.config)
        .with_context(|| format!("loading {}", opts.config.display()))?;

    match opts.cmd {
        Commands::Show => show(&config),
        Commands::Run { strict, script } => run(&log, config, opts.seed, script, strict),
    }
}
