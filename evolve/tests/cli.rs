//! CLI integration tests for the `evolve` binary.
//!
//! Every test writes its log into a temporary directory and runs the binary against it with
//! `--file`, so no database is needed.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn evolve() -> Command {
    let mut cmd = cargo_bin_cmd!("evolve");
    cmd.env_remove("DATABASE_URL").env_remove("RUST_LOG");
    cmd
}

fn sample_log() -> Value {
    json!([
        {
            "position": 1,
            "migration_index": 1,
            "events": [
                {
                    "type": "create",
                    "fqid": "motion_state/1",
                    "fields": {"id": 1, "name": "submitted", "dont_set_identifier": true}
                },
                {
                    "type": "create",
                    "fqid": "meeting/1",
                    "fields": {"id": 1, "name": "plenary"}
                }
            ]
        },
        {
            "position": 2,
            "migration_index": 1,
            "events": [
                {
                    "type": "create",
                    "fqid": "topic/1",
                    "fields": {"id": 1, "title": "budget", "meeting_id": 1}
                }
            ]
        }
    ])
}

fn write_log(dir: &TempDir, log: &Value) -> PathBuf {
    let path = dir.path().join("log.json");
    fs::write(&path, serde_json::to_string_pretty(log).unwrap()).unwrap();
    path
}

fn read_log(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn help_lists_the_subcommands() {
    evolve()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Event log migration tool"))
        .stdout(predicate::str::contains("migrate"))
        .stdout(predicate::str::contains("finalize"))
        .stdout(predicate::str::contains("preview"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn status_reports_pending_migrations() {
    let dir = TempDir::new().unwrap();
    let path = write_log(&dir, &sample_log());

    evolve()
        .arg("--file")
        .arg(&path)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("stored migration index: 1"))
        .stdout(predicate::str::contains("latest migration index: 10"))
        .stdout(predicate::str::contains("pending: 2, 3, 4"))
        .stdout(predicate::str::contains("staging: idle"))
        .stdout(predicate::str::contains("positions: 2"));
}

#[test]
fn preview_prints_the_rewritten_log_and_leaves_the_file() {
    let dir = TempDir::new().unwrap();
    let path = write_log(&dir, &sample_log());
    let before = fs::read_to_string(&path).unwrap();

    let output = evolve()
        .arg("--file")
        .arg(&path)
        .arg("preview")
        .output()
        .unwrap();
    assert!(output.status.success());

    let preview: Value = serde_json::from_slice(&output.stdout).unwrap();
    let positions = preview.as_array().unwrap();
    assert_eq!(positions.len(), 2);
    assert!(positions.iter().all(|p| p["migration_index"] == json!(10)));
    let state = &positions[0]["events"][0]["fields"];
    assert!(state.get("dont_set_identifier").is_none());
    assert_eq!(positions[1]["events"][0]["fields"]["sequential_number"], json!(1));

    assert_eq!(fs::read_to_string(&path).unwrap(), before);
}

#[test]
fn migrate_writes_staging_next_to_the_log() {
    let dir = TempDir::new().unwrap();
    let path = write_log(&dir, &sample_log());
    let before = fs::read_to_string(&path).unwrap();

    evolve()
        .arg("--file")
        .arg(&path)
        .arg("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("staging written to"));

    let staged = read_log(&dir.path().join("log.json.staging.json"));
    assert!(
        staged
            .as_array()
            .unwrap()
            .iter()
            .all(|p| p["migration_index"] == json!(10))
    );
    assert_eq!(fs::read_to_string(&path).unwrap(), before);
}

#[test]
fn finalize_rewrites_the_file_and_a_second_run_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let path = write_log(&dir, &sample_log());

    evolve()
        .arg("--file")
        .arg(&path)
        .arg("finalize")
        .assert()
        .success()
        .stdout(predicate::str::contains("finalized at migration index 10"));

    let live = read_log(&path);
    let positions = live.as_array().unwrap();
    assert_eq!(positions.len(), 2);
    assert_eq!(positions[0]["position"], json!(1));
    assert!(positions.iter().all(|p| p["migration_index"] == json!(10)));

    evolve()
        .arg("--file")
        .arg(&path)
        .arg("finalize")
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing to migrate"));
    assert_eq!(read_log(&path), live);
}

#[test]
fn log_newer_than_the_chain_exits_1() {
    let dir = TempDir::new().unwrap();
    let path = write_log(
        &dir,
        &json!([{
            "position": 1,
            "migration_index": 99,
            "events": [{"type": "create", "fqid": "user/1", "fields": {"id": 1}}]
        }]),
    );

    evolve()
        .arg("--file")
        .arg(&path)
        .arg("migrate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("99"));
}

#[test]
fn malformed_log_exits_2() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log.json");
    fs::write(&path, "{\"position\": 1}").unwrap();

    evolve()
        .arg("--file")
        .arg(&path)
        .arg("status")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("is not a position log"));
}

#[test]
fn missing_file_exits_2() {
    let dir = TempDir::new().unwrap();

    evolve()
        .arg("--file")
        .arg(dir.path().join("absent.json"))
        .arg("status")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cannot read"));
}

#[test]
fn no_log_source_exits_2() {
    evolve()
        .arg("status")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--file or --database-url"));
}
