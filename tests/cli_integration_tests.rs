/// Integration tests for the CLI interface
use assert_cmd::Command;
use predicates::prelude::*;
use serial_test::serial;
use std::io::Write;
use std::process::Command as StdCommand;
use tempfile::NamedTempFile;

/// Helper function to create a command for testing
fn monitor_cmd() -> Command {
    Command::cargo_bin("pcsc-card-monitor").expect("Failed to find pcsc-card-monitor binary")
}

#[test]
fn test_help_command() {
    let mut cmd = monitor_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("smart card readers"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("monitor"))
        .stdout(predicate::str::contains("run"));
}

#[test]
fn test_version_command() {
    let mut cmd = monitor_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pcsc-card-monitor"));
}

#[test]
fn test_invalid_command() {
    let mut cmd = monitor_cmd();
    cmd.arg("invalid-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_run_without_args() {
    let mut cmd = monitor_cmd();
    cmd.arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}

#[test]
fn test_invalid_scope() {
    let mut cmd = monitor_cmd();
    cmd.arg("list")
        .arg("--scope")
        .arg("galaxy")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid"));
}

#[test]
fn test_monitor_missing_config() {
    let mut cmd = monitor_cmd();
    cmd.arg("monitor")
        .arg("--config")
        .arg("nonexistent-config.json")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn test_monitor_malformed_config() {
    let mut temp_file = NamedTempFile::new().expect("Failed to create temp file");
    writeln!(temp_file, "{{\"poll_timeout_ms\": \"soon\"}}").expect("Failed to write");

    let mut cmd = monitor_cmd();
    cmd.arg("monitor")
        .arg("--config")
        .arg(temp_file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[cfg(unix)]
mod run_tests {
    use super::*;

    #[test]
    fn test_run_prints_output() {
        let mut cmd = monitor_cmd();
        cmd.arg("run")
            .arg("--")
            .arg("echo")
            .arg("hello")
            .assert()
            .success()
            .stdout("hello\n");
    }

    #[test]
    fn test_run_merges_stderr() {
        let mut cmd = monitor_cmd();
        cmd.args(["run", "sh", "-c", "echo v1.0; echo warn >&2"])
            .assert()
            .success()
            .stdout("v1.0\nwarn\n");
    }

    #[test]
    fn test_run_failing_command() {
        let mut cmd = monitor_cmd();
        cmd.args(["run", "sh", "-c", "echo partial; exit 3"])
            .assert()
            .failure()
            .stdout("partial\n")
            .stderr(predicate::str::contains("Command exited with status 3"));
    }

    #[test]
    fn test_run_missing_program() {
        let mut cmd = monitor_cmd();
        cmd.args(["run", "definitely-not-a-real-program-42"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("Failed to run"))
            .stderr(predicate::str::contains("Command failed"));
    }

    #[test]
    fn test_run_json_with_token() {
        let mut cmd = monitor_cmd();
        cmd.args(["run", "--json", "--token", "job-7", "--", "echo", "v1.0"])
            .assert()
            .success()
            .stdout(predicate::str::contains(r#""correlation_token": "job-7""#))
            .stdout(predicate::str::contains(r#""exit_output": "v1.0\n""#))
            .stdout(predicate::str::contains(r#""succeeded": true"#))
            .stdout(predicate::str::contains(r#""exit_code": 0"#));
    }

    #[test]
    fn test_run_passes_hyphen_arguments() {
        let mut cmd = monitor_cmd();
        cmd.args(["run", "echo", "-n", "raw"])
            .assert()
            .success()
            .stdout("raw");
    }
}

// Helper function for checking if PCSC is available
fn is_pcsc_available() -> bool {
    StdCommand::new("pcscd").arg("--version").output().is_ok()
}

/// Test that requires a running PCSC daemon (conditional)
#[test]
#[serial]
fn test_list_with_real_readers() {
    if !is_pcsc_available() {
        println!("Skipping PCSC integration test - no PCSC daemon available");
        return;
    }

    let mut cmd = monitor_cmd();
    // Without a started daemon the context cannot be established
    cmd.arg("list")
        .arg("--detailed")
        .assert()
        .code(predicate::in_iter([0, 1]));
}

#[test]
#[serial]
#[ignore] // Requires real PCSC hardware and a card to insert
fn test_monitor_once_with_real_reader() {
    let mut cmd = monitor_cmd();
    cmd.arg("monitor")
        .arg("--once")
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stdout(predicate::str::contains("Card Detected on"));
}

#[cfg(test)]
mod performance_tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_help_performance() {
        let start = Instant::now();
        let mut cmd = monitor_cmd();
        cmd.arg("--help").assert().success();
        let duration = start.elapsed();

        // Help should be fast (less than 1 second)
        assert!(
            duration.as_secs() < 1,
            "Help command took too long: {duration:?}"
        );
    }
}
