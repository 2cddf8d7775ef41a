//! Binary smoke tests for the `sipag` CLI.
//!
//! These use `assert_cmd` to run the actual compiled binary, the same way
//! the teacher's `tests/cli_smoke.rs` does, plus a `Fixture` that stands up
//! a fake worktree tool and a fake agent binary so `spawn` exercises the
//! real worktree-creation and process-spawn code paths without a `gh`/
//! `claude` install.
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

#[allow(deprecated)] // cargo_bin works fine for our use case
fn sipag() -> Command {
    Command::cargo_bin("sipag").unwrap()
}

/// Writes an executable shell script at `path`.
fn write_script(path: &Path, body: &str) {
    fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

/// A fixture with a fake worktree tool and a fake agent binary. The
/// worktree tool receives `(create|remove) repo worker_name [base_ref]` and
/// mkdirs `$WORKTREES_ROOT/<repo>/<worker_name>`, exactly the layout
/// `CliWorktreeTool` assumes the real tool produces (§6 "Worktree tool
/// contract").
struct Fixture {
    tmp: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        write_script(
            &tmp.path().join("fake-worktree"),
            r#"case "$1" in
  create) mkdir -p "$WORKTREES_ROOT/$2/$3" ;;
  remove) rm -rf "$2" ;;
esac
"#,
        );
        write_script(
            &tmp.path().join("fake-agent"),
            r#"echo '{"type":"result","is_error":false,"session_id":"s1","total_cost_usd":0.01,"duration_ms":10}'
"#,
        );
        Fixture { tmp }
    }

    fn cmd(&self, args: &[&str]) -> Command {
        let mut cmd = sipag();
        cmd.env("STATE_ROOT", self.tmp.path().join("state"))
            .env("WORKTREES_ROOT", self.tmp.path().join("worktrees"))
            .env("WORKTREE_BIN", self.tmp.path().join("fake-worktree"))
            .env("AGENT_BIN", self.tmp.path().join("fake-agent"))
            .args(args);
        cmd
    }
}

// ── binary builds, version / help ───────────────────────────────────────────

#[test]
fn binary_exists() {
    sipag();
}

#[test]
fn version_subcommand() {
    sipag().arg("version").assert().success().stdout(predicate::str::contains("sipag"));
}

#[test]
fn version_flag() {
    sipag().arg("--version").assert().success().stdout(predicate::str::contains("sipag"));
}

#[test]
fn help_flag() {
    sipag()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("parallel development orchestrator"));
}

#[test]
fn help_lists_subcommands() {
    let output = sipag().arg("--help").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    for cmd in &["spawn", "list", "status", "send", "read", "stop", "merge", "cleanup", "run"] {
        assert!(stdout.contains(cmd), "help text missing '{cmd}' subcommand: {stdout}");
    }
}

#[test]
fn missing_subcommand_is_usage_error() {
    sipag().assert().failure().code(2);
}

// ── spawn / list / status ───────────────────────────────────────────────────

#[test]
fn spawn_creates_worktree_and_lists_worker() {
    let fx = Fixture::new();
    fx.cmd(&["spawn", "feat", "--repo", "o/r", "add a feature"])
        .assert()
        .success()
        .stdout(predicate::str::contains("feat"));

    assert!(fx.tmp.path().join("worktrees/o/r/feat/INSTRUCTIONS.md").exists());

    fx.cmd(&["list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("feat").and(predicate::str::contains("SPAWNING")));
}

#[test]
fn spawn_duplicate_id_fails_with_exit_code_4() {
    let fx = Fixture::new();
    fx.cmd(&["spawn", "feat", "--repo", "o/r", "t"]).assert().success();
    fx.cmd(&["spawn", "feat", "--repo", "o/r", "again"])
        .assert()
        .failure()
        .code(4)
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn status_shows_core_fields() {
    let fx = Fixture::new();
    fx.cmd(&["spawn", "feat", "--repo", "o/r", "add a feature"]).assert().success();
    fx.cmd(&["status", "feat"])
        .assert()
        .success()
        .stdout(predicate::str::contains("id:             feat"))
        .stdout(predicate::str::contains("repo:           o/r"))
        .stdout(predicate::str::contains("state:          SPAWNING"));
}

#[test]
fn status_unknown_worker_fails_with_exit_code_3() {
    let fx = Fixture::new();
    fx.cmd(&["status", "ghost"]).assert().failure().code(3);
}

#[test]
fn list_empty_is_friendly() {
    let fx = Fixture::new();
    fx.cmd(&["list"]).assert().success().stdout(predicate::str::contains("No workers"));
}

// ── stop / merge / cleanup ───────────────────────────────────────────────────

#[test]
fn stop_transitions_to_stopped() {
    let fx = Fixture::new();
    fx.cmd(&["spawn", "feat", "--repo", "o/r", "t"]).assert().success();
    fx.cmd(&["stop", "feat"]).assert().success();
    fx.cmd(&["status", "feat"])
        .assert()
        .success()
        .stdout(predicate::str::contains("state:          STOPPED"));
}

#[test]
fn merge_requires_pr_open_or_reviewing_exit_code_5() {
    let fx = Fixture::new();
    fx.cmd(&["spawn", "feat", "--repo", "o/r", "t"]).assert().success();
    fx.cmd(&["merge", "feat"]).assert().failure().code(5);
}

#[test]
fn cleanup_requires_terminal_state_then_removes() {
    let fx = Fixture::new();
    fx.cmd(&["spawn", "feat", "--repo", "o/r", "t"]).assert().success();

    fx.cmd(&["cleanup", "feat"]).assert().failure();

    fx.cmd(&["stop", "feat"]).assert().success();
    fx.cmd(&["cleanup", "feat"]).assert().success().stdout(predicate::str::contains("Removed 1"));

    fx.cmd(&["status", "feat"]).assert().failure().code(3);
}

// ── send / read ──────────────────────────────────────────────────────────

#[test]
fn send_to_unknown_worker_fails() {
    let fx = Fixture::new();
    fx.cmd(&["send", "ghost", "hello"]).assert().failure();
}

#[test]
fn read_returns_worker_output() {
    let fx = Fixture::new();
    fx.cmd(&["spawn", "feat", "--repo", "o/r", "t"]).assert().success();
    // Give the fake agent a moment to exit and flush its one line.
    std::thread::sleep(std::time::Duration::from_millis(200));
    fx.cmd(&["read", "feat"]).assert().success();
}
