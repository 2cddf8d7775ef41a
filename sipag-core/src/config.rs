//! Runtime configuration for the orchestrator (§6).
//!
//! Resolution order: **env var > `$STATE_ROOT/config.json` file > hardcoded
//! default**, the same two-tier precedence the teacher's `WorkerConfig`
//! uses, adapted to a JSON config file since the settings here include a
//! list (`devops_patterns`) that doesn't fit a flat `key=value` line.
//!
//! ```text
//! Field               Env Var               Config Key        Default
//! ─────────────────── ───────────────────── ───────────────── ─────────────────────
//! state_root          STATE_ROOT            —                 ~/.orchestrator/workers
//! worktrees_root       WORKTREES_ROOT        —                 ~/.worktrees
//! poll_interval_ms     POLL_INTERVAL_MS      poll_interval_ms  5000
//! auto_merge           AUTO_MERGE            auto_merge        true
//! auto_review          AUTO_REVIEW           auto_review       true
//! agent_bin            AGENT_BIN             agent_bin         "claude"
//! forge_bin            FORGE_BIN             forge_bin         "gh"
//! worker_timeout_ms    WORKER_TIMEOUT_MS     worker_timeout_ms 300000
//! shutdown_timeout_ms  SHUTDOWN_TIMEOUT_MS   shutdown_timeout_ms 30000
//! forge_timeout_ms     FORGE_TIMEOUT_MS      forge_timeout_ms  30000
//! devops_patterns      —  (config file only) devops_patterns  see §4.5
//! state_max_age_days   STATE_MAX_AGE_DAYS    state_max_age_days 7
//! worktree_bin         WORKTREE_BIN          worktree_bin      "sipag-worktree"
//! ```
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::forge::DEFAULT_DEVOPS_PATTERNS;

/// Resolved orchestrator configuration (§6 + §2 ambient expansion).
#[derive(Debug, Clone)]
pub struct Config {
    pub state_root: PathBuf,
    pub worktrees_root: PathBuf,
    pub poll_interval: Duration,
    pub auto_merge: bool,
    pub auto_review: bool,
    pub agent_bin: String,
    pub forge_bin: String,
    pub worker_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub forge_timeout: Duration,
    pub devops_patterns: Vec<String>,
    pub state_max_age_days: u64,
    /// The worktree tool binary (§6 "Worktree tool contract"). Not named
    /// in §6's env var list, since the worktree tool's identity is a local
    /// install detail rather than orchestrator-intrinsic; added here the
    /// same way `agent_bin`/`forge_bin` are, for the same reason.
    pub worktree_bin: String,
}

/// Shape of the optional `$STATE_ROOT/config.json` file. All fields
/// optional; absent fields fall through to the default (and may still be
/// overridden by an env var).
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    poll_interval_ms: Option<u64>,
    auto_merge: Option<bool>,
    auto_review: Option<bool>,
    agent_bin: Option<String>,
    forge_bin: Option<String>,
    worker_timeout_ms: Option<u64>,
    shutdown_timeout_ms: Option<u64>,
    forge_timeout_ms: Option<u64>,
    devops_patterns: Option<Vec<String>>,
    state_max_age_days: Option<u64>,
    worktree_bin: Option<String>,
}

impl Config {
    /// Load config from env vars, `$STATE_ROOT/config.json`, and defaults.
    pub fn load() -> Result<Self> {
        Self::load_with_env(|k| env::var(k).ok())
    }

    /// Defaults rooted at `state_root`, with no env/config-file overlay.
    /// Used by the scheduler's own tests, which need a scheduler `Config`
    /// pointed at a `TempDir` without reading the process environment.
    pub(crate) fn load_with_env_for_test(state_root: PathBuf) -> Self {
        Self::defaults(&state_root)
    }

    fn load_with_env(get_env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let state_root = get_env("STATE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(default_state_root);

        let mut cfg = Self::defaults(&state_root);

        let config_path = state_root.join("config.json");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("reading {}", config_path.display()))?;
            let file: ConfigFile =
                serde_json::from_str(&content).context("parsing config.json")?;
            cfg.apply_file(file);
        }

        cfg.apply_env_overrides(&get_env);
        Ok(cfg)
    }

    fn defaults(state_root: &Path) -> Self {
        Config {
            state_root: state_root.to_path_buf(),
            worktrees_root: default_worktrees_root(),
            poll_interval: Duration::from_millis(5000),
            auto_merge: true,
            auto_review: true,
            agent_bin: "claude".to_string(),
            forge_bin: "gh".to_string(),
            worker_timeout: Duration::from_millis(300_000),
            shutdown_timeout: Duration::from_millis(30_000),
            forge_timeout: Duration::from_millis(30_000),
            devops_patterns: DEFAULT_DEVOPS_PATTERNS.iter().map(|s| s.to_string()).collect(),
            state_max_age_days: 7,
            worktree_bin: "sipag-worktree".to_string(),
        }
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.poll_interval_ms {
            self.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = file.auto_merge {
            self.auto_merge = v;
        }
        if let Some(v) = file.auto_review {
            self.auto_review = v;
        }
        if let Some(v) = file.agent_bin {
            self.agent_bin = v;
        }
        if let Some(v) = file.forge_bin {
            self.forge_bin = v;
        }
        if let Some(v) = file.worker_timeout_ms {
            self.worker_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.shutdown_timeout_ms {
            self.shutdown_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.forge_timeout_ms {
            self.forge_timeout = Duration::from_millis(v);
        }
        if let Some(v) = file.devops_patterns {
            self.devops_patterns = v;
        }
        if let Some(v) = file.state_max_age_days {
            self.state_max_age_days = v;
        }
        if let Some(v) = file.worktree_bin {
            self.worktree_bin = v;
        }
    }

    fn apply_env_overrides(&mut self, get_env: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = get_env("WORKTREES_ROOT") {
            self.worktrees_root = PathBuf::from(v);
        }
        if let Some(v) = get_env("POLL_INTERVAL_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = get_env("AUTO_MERGE") {
            self.auto_merge = v == "true";
        }
        if let Some(v) = get_env("AUTO_REVIEW") {
            self.auto_review = v == "true";
        }
        if let Some(v) = get_env("AGENT_BIN") {
            self.agent_bin = v;
        }
        if let Some(v) = get_env("FORGE_BIN") {
            self.forge_bin = v;
        }
        if let Some(v) = get_env("WORKER_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.worker_timeout = Duration::from_millis(v);
        }
        if let Some(v) = get_env("SHUTDOWN_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.shutdown_timeout = Duration::from_millis(v);
        }
        if let Some(v) = get_env("FORGE_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.forge_timeout = Duration::from_millis(v);
        }
        if let Some(v) = get_env("STATE_MAX_AGE_DAYS").and_then(|v| v.parse::<u64>().ok()) {
            self.state_max_age_days = v;
        }
        if let Some(v) = get_env("WORKTREE_BIN") {
            self.worktree_bin = v;
        }
    }
}

fn default_state_root() -> PathBuf {
    dirs_home().join(".orchestrator").join("workers")
}

fn default_worktrees_root() -> PathBuf {
    dirs_home().join(".worktrees")
}

fn dirs_home() -> PathBuf {
    env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_match_spec_table() {
        let cfg = Config::load_with_env(no_env).unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_millis(5000));
        assert!(cfg.auto_merge);
        assert!(cfg.auto_review);
        assert_eq!(cfg.agent_bin, "claude");
        assert_eq!(cfg.forge_bin, "gh");
        assert_eq!(cfg.state_max_age_days, 7);
        assert_eq!(cfg.devops_patterns.len(), DEFAULT_DEVOPS_PATTERNS.len());
        assert_eq!(cfg.worktree_bin, "sipag-worktree");
    }

    #[test]
    fn worktree_bin_env_override() {
        let cfg = Config::load_with_env(|k| {
            if k == "WORKTREE_BIN" {
                Some("my-worktree-tool".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(cfg.worktree_bin, "my-worktree-tool");
    }

    #[test]
    fn env_state_root_overrides_default() {
        let cfg = Config::load_with_env(|k| match k {
            "STATE_ROOT" => Some("/tmp/custom-state".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.state_root, PathBuf::from("/tmp/custom-state"));
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"poll_interval_ms": 1000, "auto_merge": false, "devops_patterns": ["custom/"]}"#,
        )
        .unwrap();
        let state_root = dir.path().to_path_buf();
        let cfg = Config::load_with_env(move |k| {
            if k == "STATE_ROOT" {
                Some(state_root.display().to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_millis(1000));
        assert!(!cfg.auto_merge);
        assert_eq!(cfg.devops_patterns, vec!["custom/".to_string()]);
    }

    #[test]
    fn env_overrides_config_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"auto_merge": false}"#).unwrap();
        let state_root = dir.path().to_path_buf();
        let cfg = Config::load_with_env(move |k| match k {
            "STATE_ROOT" => Some(state_root.display().to_string()),
            "AUTO_MERGE" => Some("true".to_string()),
            _ => None,
        })
        .unwrap();
        assert!(cfg.auto_merge);
    }

    #[test]
    fn missing_config_file_is_ok() {
        let dir = TempDir::new().unwrap();
        let state_root = dir.path().to_path_buf();
        let cfg = Config::load_with_env(move |k| {
            if k == "STATE_ROOT" {
                Some(state_root.display().to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert!(cfg.auto_merge);
    }

    #[test]
    fn worker_timeout_env_override() {
        let cfg = Config::load_with_env(|k| {
            if k == "WORKER_TIMEOUT_MS" {
                Some("60000".to_string())
            } else {
                None
            }
        })
        .unwrap();
        assert_eq!(cfg.worker_timeout, Duration::from_millis(60000));
    }
}
