//! CLI tests for `conductor init` and `conductor validate`.
//!
//! Spawns the conductor binary and verifies exit codes for fresh, existing
//! and broken config files.

use std::fs;
use std::process::Command;

use conductor::exit_codes;
use conductor::io::config::{DEFAULT_CONFIG_FILE, load_config};

fn conductor(dir: &std::path::Path, args: &[&str]) -> std::process::ExitStatus {
    Command::new(env!("CARGO_BIN_EXE_conductor"))
        .current_dir(dir)
        .args(args)
        .status()
        .expect("run conductor")
}

#[test]
fn init_writes_a_valid_default_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = conductor(temp.path(), &["init"]);
    assert_eq!(status.code(), Some(exit_codes::OK));

    let cfg = load_config(&temp.path().join(DEFAULT_CONFIG_FILE)).expect("load");
    assert_eq!(cfg.queue.concurrency_limit, 4);

    let status = conductor(temp.path(), &["validate"]);
    assert_eq!(status.code(), Some(exit_codes::OK));
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join(DEFAULT_CONFIG_FILE);
    fs::write(&path, "[queue]\nconcurrency_limit = 9\n").expect("write");

    let status = conductor(temp.path(), &["init"]);
    assert_eq!(status.code(), Some(exit_codes::EXISTS));
    assert!(fs::read_to_string(&path).expect("read").contains("9"));

    let status = conductor(temp.path(), &["init", "--force"]);
    assert_eq!(status.code(), Some(exit_codes::OK));
    assert_eq!(load_config(&path).expect("load").queue.concurrency_limit, 4);
}

#[test]
fn validate_rejects_invalid_and_missing_configs() {
    let temp = tempfile::tempdir().expect("tempdir");
    let status = conductor(temp.path(), &["validate"]);
    assert_eq!(status.code(), Some(exit_codes::INVALID));

    fs::write(
        temp.path().join("custom.toml"),
        "[queue]\nconcurrency_limit = 0\n",
    )
    .expect("write");
    let status = conductor(temp.path(), &["validate", "--config", "custom.toml"]);
    assert_eq!(status.code(), Some(exit_codes::INVALID));
}
