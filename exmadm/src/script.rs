// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::str::FromStr;

use aal::parse_hex;
use aal::ActionSpec;
use aal::EntryHandle;
use aal::MatchKey;
use aal::PipeId;
use aal::PipeSel;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;

/// One line of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    Add {
        key: MatchKey,
        action: ActionSpec,
        ttl: Option<u32>,
    },
    Mod {
        handle: EntryHandle,
        action: ActionSpec,
    },
    Del {
        handle: EntryHandle,
    },
    Default {
        action: ActionSpec,
    },
    Loc {
        handle: EntryHandle,
    },
    /// Select the instance later lines act on.
    Pipe(PipeSel),
    Occupancy,
    Entries,
    Usage,
    Trace,
    Reconcile,
    Snapshot,
}

impl Verb {
    pub fn name(&self) -> &'static str {
        match self {
            Verb::Add { .. } => "add",
            Verb::Mod { .. } => "mod",
            Verb::Del { .. } => "del",
            Verb::Default { .. } => "default",
            Verb::Loc { .. } => "loc",
            Verb::Pipe(_) => "pipe",
            Verb::Occupancy => "occupancy",
            Verb::Entries => "entries",
            Verb::Usage => "usage",
            Verb::Trace => "trace",
            Verb::Reconcile => "reconcile",
            Verb::Snapshot => "snapshot",
        }
    }
}

fn action(id: Option<&str>, data: Option<&str>) -> anyhow::Result<ActionSpec> {
    let id = id.ok_or_else(|| anyhow!("missing action id"))?;
    let id = u32::from_str(id).with_context(|| format!("bad action id {id}"))?;
    let data = match data {
        Some(d) => parse_hex(d)?,
        None => Vec::new(),
    };
    Ok(ActionSpec::new(id, data))
}

fn handle(arg: Option<&str>) -> anyhow::Result<EntryHandle> {
    let arg = arg.ok_or_else(|| anyhow!("missing handle"))?;
    Ok(arg.parse()?)
}

fn pipe(arg: Option<&str>) -> anyhow::Result<PipeSel> {
    match arg {
        None => bail!("missing pipe"),
        Some("all") => Ok(PipeSel::All),
        Some(p) => {
            let p = u8::from_str(p).with_context(|| format!("bad pipe {p}"))?;
            Ok(PipeSel::Pipe(PipeId(p)))
        }
    }
}

/// Parse a line.  Blank lines and `#` comments yield nothing.
pub fn parse(line: &str) -> anyhow::Result<Option<Verb>> {
    let line = match line.split_once('#') {
        Some((code, _)) => code,
        None => line,
    };
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let verb = match verb {
        "add" => {
            let key = words.next().ok_or_else(|| anyhow!("missing key"))?;
            let key = MatchKey::from_hex(key)?;
            let action = action(words.next(), words.next())?;
            let ttl = words
                .next()
                .map(|t| u32::from_str(t).with_context(|| format!("bad ttl {t}")))
                .transpose()?;
            Verb::Add { key, action, ttl }
        }
        "mod" => Verb::Mod {
            handle: handle(words.next())?,
            action: action(words.next(), words.next())?,
        },
        "del" => Verb::Del {
            handle: handle(words.next())?,
        },
        "default" => Verb::Default {
            action: action(words.next(), words.next())?,
        },
        "loc" => Verb::Loc {
            handle: handle(words.next())?,
        },
        "pipe" => Verb::Pipe(pipe(words.next())?),
        "occupancy" => Verb::Occupancy,
        "entries" => Verb::Entries,
        "usage" => Verb::Usage,
        "trace" => Verb::Trace,
        "reconcile" => Verb::Reconcile,
        "snapshot" => Verb::Snapshot,
        x => bail!("unknown command: {x}"),
    };
    if let Some(extra) = words.next() {
        bail!("unexpected argument: {extra}");
    }
    Ok(Some(verb))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() -> anyhow::Result<()> {
        assert_eq!(parse("")?, None);
        assert_eq!(parse("   # nothing here")?, None);
        assert_eq!(
            parse("add 0x0102 7 abcd 30")?,
            Some(Verb::Add {
                key: MatchKey::new(vec![1, 2]),
                action: ActionSpec::new(7, vec![0xab, 0xcd]),
                ttl: Some(30),
            })
        );
        assert_eq!(
            parse("del 0xf0000003  # trailing comment")?,
            Some(Verb::Del {
                handle: EntryHandle::new(PipeSel::All, 3),
            })
        );
        assert_eq!(
            parse("mod 5 2")?,
            Some(Verb::Mod {
                handle: EntryHandle::from_raw(5),
                action: ActionSpec::new(2, Vec::new()),
            })
        );
        assert_eq!(parse("pipe 1")?, Some(Verb::Pipe(PipeSel::Pipe(PipeId(1)))));
        assert_eq!(parse("pipe all")?, Some(Verb::Pipe(PipeSel::All)));
        assert_eq!(parse("trace")?, Some(Verb::Trace));
        Ok(())
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("frob").is_err());
        assert!(parse("add").is_err());
        assert!(parse("add 0x01").is_err());
        assert!(parse("add zz 1").is_err());
        assert!(parse("del nope").is_err());
        assert!(parse("occupancy now").is_err());
        assert!(parse("pipe").is_err());
    }
}
