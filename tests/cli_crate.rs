use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::{fs, process::Command};

fn podvisor() -> Command {
    let mut command = Command::new(env!("CARGO"));
    command
        .arg("run")
        .arg("--quiet")
        .arg("-p")
        .arg("podvisor-cli")
        .arg("--");
    command
}

#[test]
fn cli_no_args() {
    podvisor()
        .assert()
        .failure()
        .stderr(predicate::str::contains("SUBCOMMANDS:"))
        .stdout(predicate::str::is_empty());
}

#[test]
fn cli_help() {
    podvisor()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run-sandbox"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn cli_list_empty() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.json");
    fs::write(
        &config,
        serde_json::json!({
            "root": dir.path().join("root"),
            "run_root": dir.path().join("run"),
            "namespaces_dir": dir.path().join("ns"),
        })
        .to_string(),
    )
    .unwrap();

    podvisor()
        .arg("--config")
        .arg(&config)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"sandboxes\": []"))
        .stdout(predicate::str::contains("\"containers\": []"));
}

#[test]
fn cli_bad_request_file() {
    let dir = tempfile::tempdir().unwrap();
    podvisor()
        .arg("run-sandbox")
        .arg(dir.path().join("missing.json"))
        .assert()
        .failure()
        .stdout(predicate::str::is_empty());
}
