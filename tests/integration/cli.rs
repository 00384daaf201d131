//! Integration tests for the conjure binary.
//!
//! Providers are small `sh` scripts so the tests never touch a real LLM CLI.
//! Each test gets its own config file, quota directory and usage log.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn providers_toml(data_dir: &Path, limits: &str) -> String {
    format!(
        r#"
quota_dir = "{quota}"
usage_log_path = "{log}"

[[providers]]
id = "echo"
command_template = ["sh", "-c", 'printf "%s\n" "$1"', "sh", "{{prompt}}"]
auth_check_command = ["true"]
context_window_tokens = 100000
default_model = "echo-1"
aliases = ["e"]
priority = 1

[[providers]]
id = "broken"
command_template = ["sh", "-c", "echo boom >&2; exit 3"]
auth_check_command = ["false"]
context_window_tokens = 100000
priority = 5

[[providers]]
id = "slow"
command_template = ["sh", "-c", "exec sleep 10"]
context_window_tokens = 100000
priority = 9

{limits}
"#,
        quota = data_dir.join("quota").display(),
        log = data_dir.join("usage.jsonl").display(),
        limits = limits,
    )
}

/// Write a config into `dir` and return its path.
fn write_config(dir: &TempDir, limits: &str) -> PathBuf {
    let path = dir.path().join("conjure.toml");
    fs::write(&path, providers_toml(dir.path(), limits)).expect("Failed to write config");
    path
}

/// Get a Command for the conjure binary, isolated from the user's environment.
#[allow(deprecated)]
fn conjure_cmd(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("conjure").expect("Failed to find conjure binary");
    cmd.env_remove("CONJURE_CONFIG")
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(config);
    cmd
}

fn usage_lines(dir: &TempDir) -> Vec<String> {
    fs::read_to_string(dir.path().join("usage.jsonl"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn test_list_services() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    conjure_cmd(&config)
        .arg("--list-services")
        .assert()
        .success()
        .stdout(predicate::str::contains("echo"))
        .stdout(predicate::str::contains("aliases: e"))
        .stdout(predicate::str::contains("slow"));
}

#[test]
fn test_dispatch_success_prints_output_and_logs() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    conjure_cmd(&config)
        .args(["echo", "hello from the test"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("hello from the test"))
        .stderr(predicate::str::contains("OK"));

    let lines = usage_lines(&dir);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("\"success\":true"));
}

#[test]
fn test_dispatch_by_alias() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    conjure_cmd(&config)
        .args(["e", "aliased"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("aliased"));
}

#[test]
fn test_quota_blocks_second_dispatch() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "[limits.echo]\nrequests_per_day = 1\n");

    conjure_cmd(&config).args(["echo", "first"]).assert().code(0);

    conjure_cmd(&config)
        .args(["echo", "second"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("second").not())
        .stderr(predicate::str::contains("BLOCKED: quota"));

    assert_eq!(usage_lines(&dir).len(), 2);
}

#[test]
fn test_unknown_provider_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    conjure_cmd(&config)
        .args(["nonexistent", "hello"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("BLOCKED: unknown provider"));

    let lines = usage_lines(&dir);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("unknown_provider"));
}

#[test]
fn test_nonzero_exit_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    conjure_cmd(&config)
        .args(["broken", "anything"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("boom"))
        .stderr(predicate::str::contains("FAILED: exit 3"));
}

#[test]
fn test_timeout_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    conjure_cmd(&config)
        .args(["slow", "anything", "--timeout-ms", "200"])
        .timeout(std::time::Duration::from_secs(8))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("FAILED: timeout"));
}

#[test]
fn test_failed_auth_check_blocks_dispatch() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    conjure_cmd(&config)
        .args(["broken", "anything", "--check-auth"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("BLOCKED: provider unavailable"))
        .stderr(predicate::str::contains("boom").not());
}

#[test]
fn test_verify() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    conjure_cmd(&config)
        .args(["--verify", "echo"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("echo: available"));

    conjure_cmd(&config)
        .args(["--verify", "broken"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("broken: unavailable"));

    assert!(usage_lines(&dir).is_empty());
}

#[test]
fn test_auto_picks_highest_priority_provider() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    conjure_cmd(&config)
        .args(["auto", "routed"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("routed"));
}

#[test]
fn test_dry_run_has_no_side_effects() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    conjure_cmd(&config)
        .args(["echo", "planned", "--dry-run"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("provider: echo (echo-1)"))
        .stdout(predicate::str::contains("estimate:"))
        .stdout(predicate::str::contains("quota:    ok"));

    assert!(usage_lines(&dir).is_empty());
}

#[test]
fn test_dispatch_json_output() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    let output = conjure_cmd(&config)
        .args(["echo", "structured", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));

    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["providerId"], "echo");
    assert_eq!(result["success"], true);
    assert!(result["stdout"].as_str().unwrap().contains("structured"));
}

#[test]
fn test_report_and_status() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "[limits.echo]\nrequests_per_day = 10\n");

    conjure_cmd(&config).args(["echo", "one"]).assert().code(0);
    conjure_cmd(&config).args(["broken", "two"]).assert().code(1);

    conjure_cmd(&config)
        .arg("--report")
        .assert()
        .success()
        .stdout(predicate::str::contains("**Attempts**: 2 (1 succeeded, 1 failed)"))
        .stdout(predicate::str::contains("exit_failure"));

    conjure_cmd(&config)
        .args(["--report", "--since", "1h"])
        .assert()
        .success()
        .stdout(predicate::str::contains("**Attempts**: 2"));

    conjure_cmd(&config)
        .arg("--status")
        .assert()
        .success()
        .stdout(predicate::str::contains("echo ["))
        .stdout(predicate::str::contains("1/10"));
}

#[test]
fn test_validate_log() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    conjure_cmd(&config).args(["echo", "one"]).assert().code(0);
    conjure_cmd(&config)
        .arg("--validate-log")
        .assert()
        .code(0)
        .stdout(predicate::str::contains(": ok"));

    let log = dir.path().join("usage.jsonl");
    let mut contents = fs::read_to_string(&log).unwrap();
    contents.push_str("{not json\n");
    fs::write(&log, contents).unwrap();

    conjure_cmd(&config)
        .arg("--validate-log")
        .assert()
        .code(1)
        .stdout(predicate::str::contains(":2:"));
}

#[test]
fn test_cleanup() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    conjure_cmd(&config).args(["echo", "one"]).assert().code(0);
    conjure_cmd(&config)
        .arg("--cleanup")
        .assert()
        .success()
        .stdout(predicate::str::contains("echo: removed 0 entries older than 24h"));
}

#[test]
fn test_invalid_config_exits_with_config_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("conjure.toml");
    fs::write(
        &path,
        r#"
[[providers]]
id = "bad"
command_template = ["tool", "{modle}"]
context_window_tokens = 1000
"#,
    )
    .unwrap();

    conjure_cmd(&path)
        .args(["bad", "hello"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("unknown placeholder"));
}

#[test]
fn test_missing_config_file_exits_with_config_error() {
    let dir = TempDir::new().unwrap();

    conjure_cmd(&dir.path().join("absent.toml"))
        .arg("--list-services")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_missing_prompt_is_usage_error() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "");

    conjure_cmd(&config).arg("echo").assert().code(2);
}
