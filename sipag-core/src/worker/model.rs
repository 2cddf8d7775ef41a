//! Worker identity/runtime data model (§3).
//!
//! `WorkerState` is the 9-node state machine from §4.4. `WorkerRecord` is the
//! full persisted+in-memory record for one worker; `Registry` is the
//! versioned index keyed by worker id.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a worker (§3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Spawning,
    Initializing,
    Working,
    PrOpen,
    Reviewing,
    Merging,
    Merged,
    Error,
    Stopped,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::Stopped)
    }

    /// Legal next states per the transition graph in §4.4.
    pub fn legal_next(self) -> &'static [WorkerState] {
        use WorkerState::*;
        match self {
            Spawning => &[Initializing, Error, Stopped],
            Initializing => &[Working, Error, Stopped],
            Working => &[PrOpen, Error, Stopped],
            PrOpen => &[Reviewing, Merging, Working, Error, Stopped],
            Reviewing => &[PrOpen, Merging, Error, Stopped],
            Merging => &[Merged, Error, Stopped],
            Merged => &[Stopped],
            Error => &[Working, Stopped],
            Stopped => &[],
        }
    }

    pub fn can_transition_to(self, next: WorkerState) -> bool {
        self.legal_next().contains(&next)
    }

    pub fn as_str(self) -> &'static str {
        use WorkerState::*;
        match self {
            Spawning => "SPAWNING",
            Initializing => "INITIALIZING",
            Working => "WORKING",
            PrOpen => "PR_OPEN",
            Reviewing => "REVIEWING",
            Merging => "MERGING",
            Merged => "MERGED",
            Error => "ERROR",
            Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review lifecycle for the current PR revision (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    None,
    Pending,
    Passed,
    Failed,
}

impl Default for ReviewStatus {
    fn default() -> Self {
        ReviewStatus::None
    }
}

/// Quality-gate agent kinds (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Qa,
    Security,
    Devops,
    Simplifier,
}

impl GateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GateKind::Qa => "qa",
            GateKind::Security => "security",
            GateKind::Devops => "devops",
            GateKind::Simplifier => "simplifier",
        }
    }
}

/// The full persisted+in-memory record for one worker (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub repo: String,
    pub worktree_path: String,
    pub branch: String,
    pub task: String,
    pub created_at: DateTime<Utc>,

    pub state: WorkerState,
    pub pid: Option<u32>,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub error: Option<String>,
    pub review_status: ReviewStatus,
    pub agents_run: BTreeSet<GateKind>,
    pub last_error: Option<String>,

    /// Tracks whether the one-shot "CI failed" nudge has already been sent
    /// for the current failure streak (§9 open question #1).
    #[serde(default)]
    pub ci_failure_notified: bool,

    /// Set by the scheduler on restart recovery (§4.6) when a non-terminal
    /// worker was loaded with no attached process.
    #[serde(default)]
    pub needs_attach: bool,
}

impl WorkerRecord {
    pub fn new(id: impl Into<String>, repo: impl Into<String>, worktree_path: impl Into<String>, branch: impl Into<String>, task: impl Into<String>, now: DateTime<Utc>) -> Self {
        WorkerRecord {
            id: id.into(),
            repo: repo.into(),
            worktree_path: worktree_path.into(),
            branch: branch.into(),
            task: task.into(),
            created_at: now,
            state: WorkerState::Spawning,
            pid: None,
            pr_number: None,
            pr_url: None,
            last_activity: now,
            error: None,
            review_status: ReviewStatus::None,
            agents_run: BTreeSet::new(),
            last_error: None,
            ci_failure_notified: false,
            needs_attach: false,
        }
    }

    /// I1: a worker in {PR_OPEN, REVIEWING, MERGING, MERGED} has a PR number.
    pub fn check_invariants(&self) -> Result<(), String> {
        use WorkerState::*;
        if matches!(self.state, PrOpen | Reviewing | Merging | Merged) && self.pr_number.is_none()
        {
            return Err(format!(
                "worker {} in state {} has no pr_number (I1)",
                self.id, self.state
            ));
        }
        if self.state == Merged {
            if self.review_status != ReviewStatus::Passed {
                return Err(format!("worker {} MERGED without passed review (I2)", self.id));
            }
            if !self.agents_run.contains(&GateKind::Qa) {
                return Err(format!("worker {} MERGED without qa gate (I2)", self.id));
            }
        }
        Ok(())
    }

    /// Set `pr_number`/`pr_url` if not already set (P2: write-once).
    pub fn set_pr_if_absent(&mut self, number: u64, url: String) {
        if self.pr_number.is_none() {
            self.pr_number = Some(number);
            self.pr_url = Some(url);
        }
    }
}

/// Versioned index mapping worker id to its persisted record (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    pub version: u32,
    pub workers: BTreeMap<String, WorkerRecord>,
    pub last_updated: DateTime<Utc>,
}

impl Registry {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(now: DateTime<Utc>) -> Self {
        Registry {
            version: Self::CURRENT_VERSION,
            workers: BTreeMap::new(),
            last_updated: now,
        }
    }

    /// Upgrade an older-version registry in place. Unknown fields on
    /// individual records are preserved by serde (no `deny_unknown_fields`).
    pub fn migrate(mut self) -> Self {
        if self.version < Self::CURRENT_VERSION {
            self.version = Self::CURRENT_VERSION;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn transition_graph_matches_spec() {
        use WorkerState::*;
        assert_eq!(Spawning.legal_next(), &[Initializing, Error, Stopped]);
        assert_eq!(Merged.legal_next(), &[Stopped]);
        assert_eq!(Stopped.legal_next(), &[] as &[WorkerState]);
        assert!(PrOpen.can_transition_to(Working));
        assert!(!Merged.can_transition_to(Working));
    }

    #[test]
    fn terminal_states_are_merged_and_stopped_only() {
        for s in [
            WorkerState::Spawning,
            WorkerState::Initializing,
            WorkerState::Working,
            WorkerState::PrOpen,
            WorkerState::Reviewing,
            WorkerState::Merging,
            WorkerState::Error,
        ] {
            assert!(!s.is_terminal(), "{s} should not be terminal");
        }
        assert!(WorkerState::Merged.is_terminal());
        assert!(WorkerState::Stopped.is_terminal());
    }

    #[test]
    fn new_record_starts_spawning_with_no_pr() {
        let r = WorkerRecord::new("feat", "o/r", "/wt/feat", "feature/feat", "do the thing", now());
        assert_eq!(r.state, WorkerState::Spawning);
        assert!(r.pr_number.is_none());
        assert!(r.check_invariants().is_ok());
    }

    #[test]
    fn invariant_i1_rejects_pr_open_without_pr_number() {
        let mut r = WorkerRecord::new("feat", "o/r", "/wt/feat", "feature/feat", "t", now());
        r.state = WorkerState::PrOpen;
        assert!(r.check_invariants().is_err());
    }

    #[test]
    fn invariant_i2_rejects_merged_without_qa_gate() {
        let mut r = WorkerRecord::new("feat", "o/r", "/wt/feat", "feature/feat", "t", now());
        r.state = WorkerState::Merged;
        r.pr_number = Some(1);
        r.pr_url = Some("https://forge.test/o/r/pull/1".into());
        r.review_status = ReviewStatus::Passed;
        assert!(r.check_invariants().is_err());
        r.agents_run.insert(GateKind::Qa);
        assert!(r.check_invariants().is_ok());
    }

    #[test]
    fn pr_is_write_once() {
        let mut r = WorkerRecord::new("feat", "o/r", "/wt/feat", "feature/feat", "t", now());
        r.set_pr_if_absent(42, "https://forge.test/o/r/pull/42".into());
        r.set_pr_if_absent(99, "https://forge.test/o/r/pull/99".into());
        assert_eq!(r.pr_number, Some(42));
    }

    #[test]
    fn registry_migrates_old_version_forward() {
        let mut reg = Registry::new(now());
        reg.version = 0;
        let migrated = reg.migrate();
        assert_eq!(migrated.version, Registry::CURRENT_VERSION);
    }

    #[test]
    fn record_roundtrips_through_json() {
        let r = WorkerRecord::new("feat", "o/r", "/wt/feat", "feature/feat", "t", now());
        let json = serde_json::to_string(&r).unwrap();
        let back: WorkerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, r.id);
        assert_eq!(back.state, r.state);
    }
}
