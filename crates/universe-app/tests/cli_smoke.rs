use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use serde_json::Value;
use tempfile::tempdir;

fn universe_app(db: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_universe-app"));
    cmd.arg("--db").arg(db).arg("--seed").arg("11");
    cmd.env_remove("UNIVERSE_CONFIG")
        .env_remove("UNIVERSE_TICK_INTERVAL_MS")
        .env_remove("RUST_LOG");
    cmd
}

fn run_ok(cmd: &mut Command) -> String {
    let output: Output = cmd.output().expect("spawn universe-app");
    assert!(
        output.status.success(),
        "universe-app failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("utf8 stdout")
}

fn ticks_of(lines: &str) -> Vec<u64> {
    lines
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            let snapshot: Value = serde_json::from_str(l).expect("snapshot json");
            snapshot["tick"].as_u64().expect("tick")
        })
        .collect()
}

#[test]
fn knobs_lists_flattened_config() {
    let dir = tempdir().expect("tempdir");
    let stdout = run_ok(
        universe_app(&dir.path().join("knobs.duckdb"))
            .args(["--set", "thresholds.bond=0.7", "knobs"]),
    );
    let knobs: Vec<Value> = serde_json::from_str(&stdout).expect("knob json");
    let bond = knobs
        .iter()
        .find(|k| k["path"] == "thresholds.bond")
        .expect("bond knob");
    assert_eq!(bond["value"].as_f64(), Some(0.7));
    assert_eq!(bond["kind"], "number");
}

#[test]
fn invalid_overrides_are_rejected_before_running() {
    let dir = tempdir().expect("tempdir");
    let output = universe_app(&dir.path().join("bad.duckdb"))
        .args(["--set", "thresholds.attract=0.99", "tick"])
        .output()
        .expect("spawn");
    assert!(!output.status.success());
    assert!(!dir.path().join("bad.duckdb").exists());
}

#[test]
fn manual_ticks_resume_numbering_across_invocations() {
    let dir = tempdir().expect("tempdir");
    let db = dir.path().join("universe.duckdb");

    let seeded: Vec<Value> =
        serde_json::from_str(&run_ok(universe_app(&db).args(["seed", "40"]))).expect("ids");
    assert_eq!(seeded.len(), 40);

    let first = run_ok(universe_app(&db).args(["tick", "--count", "2"]));
    assert_eq!(ticks_of(&first), vec![1, 2]);
    let second = run_ok(universe_app(&db).arg("tick"));
    assert_eq!(ticks_of(&second), vec![3]);

    let recent: Vec<Value> =
        serde_json::from_str(&run_ok(universe_app(&db).args(["snapshots", "--limit", "5"])))
            .expect("snapshots");
    let ticks: Vec<u64> = recent.iter().filter_map(|s| s["tick"].as_u64()).collect();
    assert_eq!(ticks, vec![3, 2, 1]);
}

#[test]
fn run_stops_after_tick_limit() {
    let dir = tempdir().expect("tempdir");
    let stdout = run_ok(universe_app(&dir.path().join("run.duckdb")).args([
        "run",
        "--ticks",
        "3",
        "--interval-ms",
        "1",
        "--particles",
        "25",
    ]));
    assert_eq!(ticks_of(&stdout), vec![3]);
}

#[test]
fn console_quit_stops_the_scheduler() {
    let dir = tempdir().expect("tempdir");
    let mut child = universe_app(&dir.path().join("console.duckdb"))
        .args(["run", "--interval-ms", "60000", "--particles", "10", "--console"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(b"knobs\ntick\nquit\n")
        .expect("write console input");
    let output = child.wait_with_output().expect("wait");
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).expect("utf8");
    assert!(stdout.contains("thresholds.merge = 0.85"));
    let last = stdout.lines().last().expect("final snapshot");
    let snapshot: Value = serde_json::from_str(last).expect("snapshot json");
    assert!(snapshot["tick"].as_u64().is_some_and(|t| t >= 1));
}
