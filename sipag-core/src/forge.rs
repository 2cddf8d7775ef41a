//! Forge Client (§4.5): an abstract interface over PR lookup/status/label/
//! merge/diff operations, plus the devops/simplifier gate policies.
//!
//! `GhForgeClient` is the reference implementation, shelling out to a
//! pre-authenticated `gh` CLI exactly the way the teacher's
//! `GhCliGateway` does: structured `--json` output parsed with
//! `serde_json`, no jq queries, filtering logic kept in pure functions.
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Merge strategy (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Squash,
    Merge,
    Rebase,
}

impl MergeStrategy {
    fn as_flag(self) -> &'static str {
        match self {
            MergeStrategy::Squash => "--squash",
            MergeStrategy::Merge => "--merge",
            MergeStrategy::Rebase => "--rebase",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiStatus {
    Pending,
    Passed,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrStatus {
    pub number: u64,
    pub url: String,
    pub state: PrState,
    pub ci: CiStatus,
    pub labels: Vec<String>,
    pub additions: u64,
    pub deletions: u64,
}

/// The default devops-gate path patterns (§4.5, §6). Configuration may
/// override this list (`devops_patterns`).
pub const DEFAULT_DEVOPS_PATTERNS: &[&str] = &[
    "^ci/workflows/",
    "^deploy-config.",
    "^infra/",
    "Dockerfile$",
    "^compose.",
    "^compose-",
    "^.env",
    "middleware.",
    "e2e-config.",
];

/// Forge Client contract (§4.5).
pub trait ForgeClient: Send + Sync {
    fn get_pr_for_branch(&self, repo: &str, branch: &str) -> Result<Option<u64>>;
    fn get_pr_status(&self, repo: &str, pr: u64) -> Result<PrStatus>;
    fn add_label(&self, repo: &str, pr: u64, label: &str) -> Result<()>;
    fn remove_label(&self, repo: &str, pr: u64, label: &str) -> Result<()>;
    fn merge(&self, repo: &str, pr: u64, strategy: MergeStrategy, delete_branch: bool) -> Result<bool>;
    fn diff_files(&self, repo: &str, pr: u64) -> Result<Vec<String>>;
    fn discover(&self, worktree_path: &std::path::Path) -> Result<(String, String)>;
}

/// Any path matching a devops pattern requires the devops gate (§4.5).
pub fn needs_devops_review(diff_files: &[String], patterns: &[String]) -> bool {
    diff_files.iter().any(|path| patterns.iter().any(|p| path_matches(path, p)))
}

fn path_matches(path: &str, pattern: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('^') {
        if let Some(prefix) = suffix.strip_suffix('$') {
            return path == prefix;
        }
        return path.starts_with(suffix);
    }
    if let Some(suffix) = pattern.strip_suffix('$') {
        return path.ends_with(suffix);
    }
    path.contains(pattern)
}

/// `additions + deletions >= 50` requires the simplifier gate (§4.5).
pub fn needs_simplifier(status: &PrStatus) -> bool {
    status.additions + status.deletions >= 50
}

/// Reference Forge Client implementation shelling out to the `gh` CLI.
pub struct GhForgeClient {
    timeout: Duration,
}

impl GhForgeClient {
    pub fn new(timeout: Duration) -> Self {
        GhForgeClient { timeout }
    }
}

impl Default for GhForgeClient {
    fn default() -> Self {
        // §4.5: all calls have a 30-second timeout.
        GhForgeClient::new(Duration::from_secs(30))
    }
}

/// Run a `gh` command against `repo` and return stdout, enforcing the
/// client's timeout by killing the child if it overruns.
fn run_gh(repo: &str, args: &[&str], timeout: Duration) -> Result<String> {
    let mut full_args: Vec<&str> = vec!["-R", repo];
    full_args.extend_from_slice(args);

    let mut child = Command::new("gh")
        .args(&full_args)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .context("failed to spawn gh command")?;

    let start = std::time::Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            let output = child.wait_with_output()?;
            if status.success() {
                return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("gh {} failed: {}", full_args.join(" "), stderr.trim());
        }
        if start.elapsed() > timeout {
            let _ = child.kill();
            anyhow::bail!("gh {} timed out after {:?}", full_args.join(" "), timeout);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[derive(Deserialize)]
struct GhPrView {
    number: u64,
    url: String,
    state: String,
    #[serde(default)]
    additions: u64,
    #[serde(default)]
    deletions: u64,
    #[serde(default)]
    labels: Vec<GhLabel>,
    #[serde(rename = "statusCheckRollup", default)]
    status_check_rollup: Vec<GhCheck>,
}

#[derive(Deserialize)]
struct GhLabel {
    name: String,
}

#[derive(Deserialize)]
struct GhCheck {
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

fn parse_ci(checks: &[GhCheck]) -> CiStatus {
    if checks.is_empty() {
        return CiStatus::Unknown;
    }
    let mut any_pending = false;
    for c in checks {
        match c.conclusion.as_deref() {
            Some("FAILURE") | Some("CANCELLED") | Some("TIMED_OUT") => return CiStatus::Failed,
            Some("SUCCESS") | Some("NEUTRAL") | Some("SKIPPED") => continue,
            _ => {}
        }
        if matches!(c.status.as_deref(), Some("IN_PROGRESS") | Some("QUEUED") | Some("PENDING")) {
            any_pending = true;
        }
    }
    if any_pending {
        CiStatus::Pending
    } else {
        CiStatus::Passed
    }
}

fn parse_pr_state(state: &str) -> PrState {
    match state {
        "OPEN" => PrState::Open,
        "MERGED" => PrState::Merged,
        _ => PrState::Closed,
    }
}

impl ForgeClient for GhForgeClient {
    fn get_pr_for_branch(&self, repo: &str, branch: &str) -> Result<Option<u64>> {
        let out = run_gh(
            repo,
            &["pr", "list", "--head", branch, "--json", "number", "--limit", "1"],
            self.timeout,
        )?;
        let prs: Vec<serde_json::Value> = serde_json::from_str(&out).unwrap_or_default();
        Ok(prs.first().and_then(|v| v.get("number")).and_then(|n| n.as_u64()))
    }

    fn get_pr_status(&self, repo: &str, pr: u64) -> Result<PrStatus> {
        let pr_str = pr.to_string();
        let out = run_gh(
            repo,
            &[
                "pr",
                "view",
                &pr_str,
                "--json",
                "number,url,state,additions,deletions,labels,statusCheckRollup",
            ],
            self.timeout,
        )?;
        let view: GhPrView = serde_json::from_str(&out).context("parsing gh pr view output")?;
        Ok(PrStatus {
            number: view.number,
            url: view.url,
            state: parse_pr_state(&view.state),
            ci: parse_ci(&view.status_check_rollup),
            labels: view.labels.into_iter().map(|l| l.name).collect(),
            additions: view.additions,
            deletions: view.deletions,
        })
    }

    fn add_label(&self, repo: &str, pr: u64, label: &str) -> Result<()> {
        let pr_str = pr.to_string();
        run_gh(repo, &["pr", "edit", &pr_str, "--add-label", label], self.timeout)?;
        Ok(())
    }

    fn remove_label(&self, repo: &str, pr: u64, label: &str) -> Result<()> {
        let pr_str = pr.to_string();
        run_gh(repo, &["pr", "edit", &pr_str, "--remove-label", label], self.timeout)?;
        Ok(())
    }

    fn merge(&self, repo: &str, pr: u64, strategy: MergeStrategy, delete_branch: bool) -> Result<bool> {
        let pr_str = pr.to_string();
        let mut args = vec!["pr", "merge", &pr_str, strategy.as_flag()];
        if delete_branch {
            args.push("--delete-branch");
        }
        match run_gh(repo, &args, self.timeout) {
            Ok(_) => Ok(true),
            Err(e) => {
                anyhow::bail!("merge of pr #{pr} in {repo} failed: {e}")
            }
        }
    }

    fn diff_files(&self, repo: &str, pr: u64) -> Result<Vec<String>> {
        let pr_str = pr.to_string();
        let out = run_gh(repo, &["pr", "diff", &pr_str, "--name-only"], self.timeout)?;
        Ok(out.lines().map(|l| l.to_string()).collect())
    }

    fn discover(&self, worktree_path: &std::path::Path) -> Result<(String, String)> {
        let out = Command::new("gh")
            .args(["repo", "view", "--json", "owner,name"])
            .current_dir(worktree_path)
            .output()
            .context("failed to run gh repo view")?;
        if !out.status.success() {
            anyhow::bail!("gh repo view failed in {}", worktree_path.display());
        }
        let value: serde_json::Value = serde_json::from_slice(&out.stdout)?;
        let owner = value["owner"]["login"]
            .as_str()
            .context("missing owner.login")?
            .to_string();
        let name = value["name"].as_str().context("missing name")?.to_string();
        Ok((owner, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(additions: u64, deletions: u64) -> PrStatus {
        PrStatus {
            number: 1,
            url: "https://forge.test/o/r/pull/1".to_string(),
            state: PrState::Open,
            ci: CiStatus::Passed,
            labels: vec![],
            additions,
            deletions,
        }
    }

    #[test]
    fn needs_simplifier_at_threshold() {
        assert!(!needs_simplifier(&status(20, 29)));
        assert!(needs_simplifier(&status(20, 30)));
        assert!(needs_simplifier(&status(500, 0)));
    }

    #[test]
    fn needs_devops_review_matches_dockerfile_and_infra() {
        let patterns: Vec<String> = DEFAULT_DEVOPS_PATTERNS.iter().map(|s| s.to_string()).collect();
        assert!(needs_devops_review(&["Dockerfile".to_string()], &patterns));
        assert!(needs_devops_review(&["infra/network.tf".to_string()], &patterns));
        assert!(needs_devops_review(&[".env.production".to_string()], &patterns));
        assert!(!needs_devops_review(&["src/main.rs".to_string()], &patterns));
    }

    #[test]
    fn needs_devops_review_respects_anchors() {
        let patterns: Vec<String> = DEFAULT_DEVOPS_PATTERNS.iter().map(|s| s.to_string()).collect();
        assert!(!needs_devops_review(&["Dockerfile.bak".to_string()], &patterns));
        assert!(!needs_devops_review(&["src/app.env.js".to_string()], &patterns));
        assert!(!needs_devops_review(&["docker-compose.yml".to_string()], &patterns));
        assert!(needs_devops_review(&["backend/Dockerfile".to_string()], &patterns));
    }

    #[test]
    fn needs_devops_review_false_for_unrelated_diff() {
        let patterns: Vec<String> = DEFAULT_DEVOPS_PATTERNS.iter().map(|s| s.to_string()).collect();
        let files = vec!["README.md".to_string(), "src/lib.rs".to_string()];
        assert!(!needs_devops_review(&files, &patterns));
    }

    #[test]
    fn parse_ci_failed_wins_over_pending() {
        let checks = vec![
            GhCheck { conclusion: Some("FAILURE".to_string()), status: Some("COMPLETED".to_string()) },
            GhCheck { conclusion: None, status: Some("IN_PROGRESS".to_string()) },
        ];
        assert_eq!(parse_ci(&checks), CiStatus::Failed);
    }

    #[test]
    fn parse_ci_pending_when_any_in_progress() {
        let checks = vec![GhCheck { conclusion: None, status: Some("IN_PROGRESS".to_string()) }];
        assert_eq!(parse_ci(&checks), CiStatus::Pending);
    }

    #[test]
    fn parse_ci_passed_when_all_success() {
        let checks = vec![
            GhCheck { conclusion: Some("SUCCESS".to_string()), status: Some("COMPLETED".to_string()) },
        ];
        assert_eq!(parse_ci(&checks), CiStatus::Passed);
    }

    #[test]
    fn parse_ci_unknown_for_no_checks() {
        assert_eq!(parse_ci(&[]), CiStatus::Unknown);
    }

    #[test]
    fn parse_pr_state_maps_known_states() {
        assert_eq!(parse_pr_state("OPEN"), PrState::Open);
        assert_eq!(parse_pr_state("MERGED"), PrState::Merged);
        assert_eq!(parse_pr_state("CLOSED"), PrState::Closed);
    }
}
