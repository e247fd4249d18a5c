// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Run exmadm scripts against the faux device.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::process::Output;

// Path to `exmadm` executable.
const EXMADM: &str = env!("CARGO_BIN_EXE_exmadm");

const CONFIG: &str = r#"
name = "fwd"

[[stages]]
stage = 0
entries = 16
ways = 2
entries_per_word = 2
"#;

fn write(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir()
        .join(format!("exmadm-{}-{name}", std::process::id()));
    fs::write(&path, contents).expect("writing test input");
    path
}

fn exmadm(test: &str, script: &str, extra: &[&str]) -> Output {
    let config = write(&format!("{test}.toml"), CONFIG);
    let script = write(&format!("{test}.script"), script);
    let output = Command::new(EXMADM)
        .arg("--config")
        .arg(&config)
        .arg("run")
        .args(extra)
        .arg(&script)
        .output()
        .expect("Failed to execute exmadm");
    let _ = fs::remove_file(config);
    let _ = fs::remove_file(script);
    output
}

#[test]
fn test_show() {
    let config = write("show.toml", CONFIG);
    let output = Command::new(EXMADM)
        .arg("--config")
        .arg(&config)
        .arg("show")
        .output()
        .expect("Failed to execute exmadm show");
    let _ = fs::remove_file(config);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("table: fwd"));
    assert!(stdout.contains("symmetric"));
}

#[test]
fn test_run() {
    let script = "\
# two entries and a modify
add 0x0101 1 aa
add 0x0202 2 bb
mod 0xf0000001 3 cc
trace
loc 0xf0000002
del 0xf0000001
entries
";
    let output = exmadm("run", script, &[]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "exmadm failed: {stdout} {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout.contains("added 0xf0000001"));
    assert!(stdout.contains("added 0xf0000002"));
    assert!(stdout.contains("modified 0xf0000001"));
    assert!(stdout.contains("deleted 0xf0000001"));
    assert!(stdout.contains("program"));
    assert!(!stdout.contains("line "));
}

#[test]
fn test_failures() {
    let script = "\
add 0x0101 1 aa
del 0xf0000009
add 0x0202 2 bb
";
    let output = exmadm("failures", script, &[]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!output.status.success());
    assert!(stdout.contains("line 2: del:"));
    assert!(stdout.contains("NOT_FOUND"));
    // Later lines still run.
    assert!(stdout.contains("added 0xf0000002"));

    let output = exmadm("strict", script, &["--strict"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!output.status.success());
    assert!(!stdout.contains("added 0xf0000002"));
}

#[test]
fn test_bad_script() {
    let output = exmadm("bad", "add 0x01 1\nfrobnicate\n", &[]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown command"));
}
