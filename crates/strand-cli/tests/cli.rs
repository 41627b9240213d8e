//! End-to-end CLI tests: exit codes and output surfaces.

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn strand() -> Command {
    Command::cargo_bin("strand").expect("strand binary")
}

fn seed_log(dir: &Path, n: u64) {
    for i in 0..n {
        strand()
            .args(["--log", dir.to_str().unwrap(), "log", "append"])
            .args(["--event-type", "AgentObserved"])
            .args(["--aggregate", &format!("agent-{}", i % 3)])
            .args([
                "--payload",
                &format!(r#"{{"name":"a{i}","namespace":"u","spec_hash":"h{i}"}}"#),
            ])
            .assert()
            .success();
    }
}

#[test]
fn append_then_verify_succeeds() {
    let dir = TempDir::new().unwrap();
    seed_log(dir.path(), 5);

    strand()
        .args(["--log", dir.path().to_str().unwrap(), "log", "verify"])
        .assert()
        .success()
        .stdout(predicate::str::contains("5 records verified"));
}

#[test]
fn head_reports_tail_seq() {
    let dir = TempDir::new().unwrap();
    seed_log(dir.path(), 3);

    strand()
        .args(["--log", dir.path().to_str().unwrap(), "--json", "log", "head"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"last_seq\":2"));
}

#[test]
fn tampered_log_exits_with_code_2() {
    let dir = TempDir::new().unwrap();
    seed_log(dir.path(), 5);

    // Flip a payload byte in the middle of the segment.
    let segment = dir.path().join("segment-000000.jsonl");
    let contents = fs::read_to_string(&segment).unwrap();
    let tampered = contents.replace("\"a2\"", "\"zz\"");
    assert_ne!(contents, tampered);
    fs::write(&segment, tampered).unwrap();

    strand()
        .args(["--log", dir.path().to_str().unwrap(), "log", "verify"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("seq 2"));

    strand()
        .args(["--log", dir.path().to_str().unwrap(), "verify-pointers"])
        .assert()
        .code(2);
}

#[test]
fn inspect_dumps_state() {
    let dir = TempDir::new().unwrap();
    seed_log(dir.path(), 4);

    strand()
        .args(["--log", dir.path().to_str().unwrap(), "--json", "inspect"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"applied_events\":4"))
        .stdout(predicate::str::contains("\"state_hash\""));

    strand()
        .args([
            "--log",
            dir.path().to_str().unwrap(),
            "--json",
            "inspect",
            "--at-seq",
            "1",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"applied_events\":2"));
}

#[test]
fn audit_report_verifies_clean_log() {
    let dir = TempDir::new().unwrap();
    seed_log(dir.path(), 4);

    strand()
        .args([
            "--log",
            dir.path().to_str().unwrap(),
            "audit-report",
            "--summary",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("VERIFIED"));

    strand()
        .args([
            "--log",
            dir.path().to_str().unwrap(),
            "audit-report",
            "--format",
            "md",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("# Audit report"));
}

#[test]
fn checkpoint_create_verify_round_trip() {
    let dir = TempDir::new().unwrap();
    seed_log(dir.path(), 6);
    let key_path = dir.path().join("keys").join("checkpoint.key");
    let cp_dir = dir.path().join("checkpoints");

    strand()
        .args([
            "checkpoint",
            "keygen",
            "--out",
            key_path.to_str().unwrap(),
        ])
        .assert()
        .success();

    strand()
        .args([
            "--log",
            dir.path().to_str().unwrap(),
            "checkpoint",
            "create",
            "--at-seq",
            "4",
            "--key",
            key_path.to_str().unwrap(),
            "--checkpoints",
            cp_dir.to_str().unwrap(),
        ])
        .assert()
        .success();

    let cp_path = cp_dir.join("checkpoint-0000000004.json");
    assert!(cp_path.exists());

    strand()
        .args([
            "--log",
            dir.path().to_str().unwrap(),
            "checkpoint",
            "verify",
            "--path",
            cp_path.to_str().unwrap(),
            "--pubkey",
            key_path.with_extension("pub").to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("verified"));
}

#[test]
fn tampered_checkpoint_exits_with_code_2() {
    let dir = TempDir::new().unwrap();
    seed_log(dir.path(), 6);
    let key_path = dir.path().join("keys").join("checkpoint.key");
    let cp_dir = dir.path().join("checkpoints");

    strand()
        .args(["checkpoint", "keygen", "--out", key_path.to_str().unwrap()])
        .assert()
        .success();
    strand()
        .args([
            "--log",
            dir.path().to_str().unwrap(),
            "checkpoint",
            "create",
            "--at-seq",
            "3",
            "--key",
            key_path.to_str().unwrap(),
            "--checkpoints",
            cp_dir.to_str().unwrap(),
        ])
        .assert()
        .success();

    // Append one more event, then point the checkpoint at the wrong seq
    // by tampering with its contents.
    let cp_path = cp_dir.join("checkpoint-0000000003.json");
    let contents = fs::read_to_string(&cp_path).unwrap();
    let tampered = contents.replace("\"at_seq\":3", "\"at_seq\":4");
    fs::write(&cp_path, tampered).unwrap();

    strand()
        .args([
            "--log",
            dir.path().to_str().unwrap(),
            "checkpoint",
            "verify",
            "--path",
            cp_path.to_str().unwrap(),
            "--pubkey",
            key_path.with_extension("pub").to_str().unwrap(),
        ])
        .assert()
        .code(2);
}

#[test]
fn missing_log_is_a_runtime_error_not_code_2() {
    strand()
        .args(["log", "verify"])
        .assert()
        .failure()
        .code(predicate::ne(2));
}
