#[path = "common/mod.rs"]
mod common;

use std::{fs, path::Path};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn warden(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("warden"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env("LOCALAPPDATA", home.join("AppData/Local"))
        .env("APPDATA", home.join("AppData/Roaming"))
        .env_remove("WARDEN_CONFIG")
        .env_remove("WARDEN_CONFIG_HOME")
        .env_remove("WARDEN_SOURCE_ROOT")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_lists_every_command() {
    let temp = tempdir().expect("failed to create tempdir");
    let assert = warden(temp.path()).arg("--help").assert().success();
    let output = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    for command in ["install", "uninstall", "status", "logs", "run", "restore"] {
        assert!(output.contains(command), "help is missing {command}");
    }
}

#[test]
fn status_without_install_succeeds() {
    let temp = tempdir().expect("failed to create tempdir");
    warden(temp.path())
        .current_dir(temp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("not installed"));
}

#[test]
fn status_json_is_machine_readable() {
    let temp = tempdir().expect("failed to create tempdir");
    let config_dir = temp.path().join(".config/warden");
    fs::create_dir_all(&config_dir).expect("failed to create config dir");
    fs::write(
        config_dir.join("config.json"),
        r#"{"daemon": {"enabled": false}}"#,
    )
    .expect("failed to write config");

    let assert = warden(temp.path())
        .current_dir(temp.path())
        .args(["status", "--json"])
        .assert()
        .success();
    let status: serde_json::Value =
        serde_json::from_slice(&assert.get_output().stdout).expect("status output is JSON");
    assert_eq!(status["manifest"], serde_json::Value::Null);
    assert_eq!(status["daemon_enabled"], serde_json::json!(false));
    assert_eq!(status["runtime_present"], serde_json::json!(false));
}

#[test]
fn restore_of_missing_backup_exits_with_failure() {
    let temp = tempdir().expect("failed to create tempdir");
    warden(temp.path())
        .args(["restore", "/definitely/not/a/backup"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn install_without_source_explains_remediation() {
    let temp = tempdir().expect("failed to create tempdir");
    warden(temp.path())
        .env("WARDEN_SOURCE_ROOT", temp.path().join("missing-checkout"))
        .args(["install", "--yes", "--no-service"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("WARDEN_SOURCE_ROOT"));
}

#[cfg(unix)]
#[test]
fn install_rejects_old_runtime() {
    let temp = tempdir().expect("failed to create tempdir");
    let source = temp.path().join("checkout");
    common::write_app_source(&source, "1.0.0");
    let (_, interpreter) = common::fake_tools(temp.path(), "3.9.18");

    warden(temp.path())
        .env("WARDEN_SOURCE_ROOT", &source)
        .env("WARDEN_PYTHON", &interpreter)
        .args(["install", "--yes", "--no-service"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("3.10.0 or newer"));
    assert!(!temp.path().join(".local/share/warden/app").exists());
}

#[cfg(unix)]
#[test]
fn install_without_service_then_status_reports_version() {
    let temp = tempdir().expect("failed to create tempdir");
    let source = temp.path().join("checkout");
    common::write_app_source(&source, "0.3.1");
    let (tools, interpreter) = common::fake_tools(temp.path(), "3.12.1");

    warden(temp.path())
        .env("WARDEN_SOURCE_ROOT", &source)
        .env("WARDEN_PYTHON", &interpreter)
        .env("PATH", format!("{}:/usr/bin:/bin", tools.display()))
        .args(["install", "--yes", "--no-service"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Installed version 0.3.1"));

    warden(temp.path())
        .env("WARDEN_SOURCE_ROOT", &source)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Installed version: 0.3.1"))
        .stdout(predicate::str::contains("Server:            enabled"));
}
