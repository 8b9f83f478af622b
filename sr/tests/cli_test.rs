//! CLI smoke tests for the `sr` binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

struct Env {
    temp: TempDir,
    config: std::path::PathBuf,
}

fn env() -> Env {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let config = temp.path().join("streamrelay.yml");
    let yaml = format!(
        "storage:\n  store-dir: {}\nagent-link:\n  socket-path: {}\n",
        temp.path().join("store").display(),
        temp.path().join("agents.sock").display()
    );
    std::fs::write(&config, yaml).unwrap();
    Env { temp, config }
}

fn sr(env: &Env) -> Command {
    let mut cmd = Command::cargo_bin("sr").unwrap();
    cmd.arg("--config")
        .arg(&env.config)
        .env("XDG_DATA_HOME", env.temp.path().join("data"))
        .env("NO_COLOR", "1");
    cmd
}

#[test]
fn test_help() {
    let env = env();
    sr(&env)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("destination"))
        .stdout(predicate::str::contains("trace"));
}

#[test]
fn test_config_prints_effective_values() {
    let env = env();
    sr(&env)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("idle-timeout-ms: 60000"))
        .stdout(predicate::str::contains("agents.sock"));
}

#[test]
fn test_destination_and_token_lifecycle() {
    let env = env();

    sr(&env)
        .args(["destination", "create", "Kitchen"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created destination"))
        .stdout(predicate::str::contains("Agent token:"));

    let output = sr(&env)
        .args(["destination", "list", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let dests: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(dests.as_array().unwrap().len(), 1);
    assert_eq!(dests[0]["name"], "Kitchen");
    let id = dests[0]["id"].as_str().unwrap().to_string();

    sr(&env)
        .args(["destination", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Kitchen"))
        .stdout(predicate::str::contains("unbound"));

    sr(&env)
        .args(["token", "issue", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Expires:"));

    sr(&env)
        .args(["token", "sweep"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 0 token(s)"));

    sr(&env).args(["destination", "unbind", &id]).assert().success();
}

#[test]
fn test_token_issue_unknown_destination_fails() {
    let env = env();
    sr(&env).args(["token", "issue", "nope"]).assert().failure();
}

#[test]
fn test_trace_commands_on_empty_store() {
    let env = env();
    sr(&env)
        .args(["trace", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No traces"));

    sr(&env)
        .args(["trace", "list", "--anomalies", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));

    sr(&env)
        .args(["trace", "show", "trace_missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Trace not found"));
}
