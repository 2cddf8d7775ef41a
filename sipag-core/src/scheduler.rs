//! Scheduler (§4.6): the heart. A cooperative tick loop that advances every
//! non-terminal worker, drains its decoded stream events through the state
//! machine, drives the forge-dependent PR_OPEN/REVIEWING/MERGING steps, and
//! runs the quality gates.
//!
//! Generalized the way the teacher's `WorkerOrchestrator<G, S, C>`
//! (`worker/orchestrator.rs`) is generalized over ports: `S: StateStore`,
//! `F: ForgeClient`, `W: WorktreeTool`, `P: ProcessSpawner`. The per-tick
//! logic itself is grounded on `worker/poll.rs::run_worker_loop` (the outer
//! loop) and `worker/cycle.rs::plan_cycle` (the per-worker decision step),
//! generalized from a single container-exit check into the full PR_OPEN
//! gate table, and on `worker/auto_merge.rs::AutoMergeService::merge_clean_prs`
//! for the merge step.
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::Utc;

use crate::config::Config;
use crate::decoder::{text_of, StreamEvent};
use crate::error::OrchestratorError;
use crate::forge::{needs_devops_review, needs_simplifier, CiStatus, ForgeClient, MergeStrategy, PrStatus};
use crate::process::{ProcessConfig, ProcessHandle, ProcessSpawner};
use crate::state_machine::{check_staleness, detect, validate_transition, DetectContext, Effect, Intervention};
use crate::store::StateStore;
use crate::worker::model::{GateKind, ReviewStatus, WorkerRecord, WorkerState};

/// An immutable record emitted by the scheduler (§3). Carries the worker id
/// and a monotonic sequence number, used by the Control API's event stream.
#[derive(Debug, Clone)]
pub enum Event {
    StateChange { id: String, from: WorkerState, to: WorkerState, seq: u64 },
    Output { id: String, message: String, seq: u64 },
    Error { id: String, text: String, seq: u64 },
    PrDetected { id: String, number: u64, url: String, seq: u64 },
    PrMerged { id: String, number: u64, seq: u64 },
    ReviewComplete { id: String, passed: bool, seq: u64 },
    ProcessExit { id: String, code: Option<i32>, seq: u64 },
}

/// Where the scheduler publishes events; the Control API's event bus
/// implements this to fan them out to subscribers (§4.7).
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Discards every event. Used by callers that don't need the event stream
/// (tests, one-shot CLI invocations).
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// The external worktree creation tool (§6): given `(repo, worker_name,
/// base_ref)`, creates a worktree at `<worktrees_root>/<repo>/<worker_name>`
/// on branch `feature/<worker_name>`, and supports removal.
pub trait WorktreeTool: Send + Sync {
    fn create(&self, repo: &str, worker_name: &str, base_ref: &str) -> Result<PathBuf>;
    fn remove(&self, path: &Path) -> Result<()>;
}

/// Reference worktree tool shelling out to a configurable CLI, the same
/// spawn-and-capture shape as `forge::GhForgeClient::run_gh`.
pub struct CliWorktreeTool {
    bin: String,
    worktrees_root: PathBuf,
}

impl CliWorktreeTool {
    pub fn new(bin: impl Into<String>, worktrees_root: PathBuf) -> Self {
        CliWorktreeTool { bin: bin.into(), worktrees_root }
    }
}

impl WorktreeTool for CliWorktreeTool {
    fn create(&self, repo: &str, worker_name: &str, base_ref: &str) -> Result<PathBuf> {
        let path = self.worktrees_root.join(repo).join(worker_name);
        let status = Command::new(&self.bin)
            .args(["create", repo, worker_name, base_ref])
            .status()
            .with_context(|| format!("failed to spawn worktree tool `{}`", self.bin))?;
        if !status.success() {
            bail!("worktree tool exited with {status}");
        }
        Ok(path)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let status = Command::new(&self.bin)
            .args(["remove", &path.display().to_string()])
            .status()
            .with_context(|| format!("failed to spawn worktree tool `{}`", self.bin))?;
        if !status.success() {
            bail!("worktree tool remove exited with {status}");
        }
        Ok(())
    }
}

fn gate_command(kind: GateKind) -> &'static str {
    match kind {
        GateKind::Qa => "/review",
        GateKind::Security => "Run dependency audit at high severity and report vulnerabilities.",
        GateKind::Devops => "/deploy",
        GateKind::Simplifier => "/qcode",
    }
}

/// Completion banner for a dispatched gate (§4.6 gate table). `Qa`'s
/// completion is handled by the review banner rule in the state machine
/// (the `/review` command is the same one PR_OPEN step 5 sends), so it is
/// never dispatched through here.
fn gate_detector(kind: GateKind, text: &str) -> bool {
    let lower = text.to_lowercase();
    match kind {
        GateKind::Qa => false,
        GateKind::Security => {
            lower.contains("found 0 vulnerabilities")
                || lower.contains("no vulnerabilities")
                || (lower.contains("audit") && lower.contains("complete"))
        }
        GateKind::Devops => {
            lower.contains("deployment status")
                || lower.contains("ready with")
                || lower.contains("pre-flight")
                || lower.contains("deployment")
        }
        GateKind::Simplifier => {
            lower.contains("simplif")
                || lower.contains("lines removed")
                || (lower.contains("quality") && lower.contains("check"))
                || (lower.contains("qcode") && lower.contains("complete"))
        }
    }
}

/// Instructs the dispatched-but-not-yet-complete gate per worker, and the
/// "already nudged this staleness episode" guard. Kept out of `WorkerRecord`
/// deliberately: both are scheduler-local runtime state that restart
/// recovery does not attempt to resume (§4.6 "Restart recovery").
struct RuntimeState {
    pending_gate: HashMap<String, GateKind>,
    last_nudge_activity: HashMap<String, chrono::DateTime<Utc>>,
}

impl RuntimeState {
    fn new() -> Self {
        RuntimeState { pending_gate: HashMap::new(), last_nudge_activity: HashMap::new() }
    }
}

/// The scheduler (§4.6). Owns attached process handles; the state store and
/// forge client are the only other I/O surfaces it touches.
pub struct Scheduler<S, F, W, P: ProcessSpawner> {
    store: S,
    forge: F,
    worktrees: W,
    spawner: P,
    config: Config,
    sink: Arc<dyn EventSink>,
    processes: Mutex<HashMap<String, P::Handle>>,
    runtime: Mutex<RuntimeState>,
    seq: AtomicU64,
}

impl<S, F, W, P> Scheduler<S, F, W, P>
where
    S: StateStore,
    F: ForgeClient,
    W: WorktreeTool,
    P: ProcessSpawner,
{
    pub fn new(store: S, forge: F, worktrees: W, spawner: P, config: Config, sink: Arc<dyn EventSink>) -> Self {
        Scheduler {
            store,
            forge,
            worktrees,
            spawner,
            config,
            sink,
            processes: Mutex::new(HashMap::new()),
            runtime: Mutex::new(RuntimeState::new()),
            seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Load every persisted worker; non-terminal ones are revived with no
    /// attached process (§4.6 "Restart recovery"). The caller is responsible
    /// for deciding whether to re-attach or restart each one.
    pub fn recover(&self) -> Result<Vec<WorkerRecord>> {
        let mut records = self.store.load_all()?;
        for record in &mut records {
            if !record.state.is_terminal() && record.pid.is_some() {
                record.pid = None;
                record.needs_attach = true;
                self.store.save(record)?;
            }
        }
        Ok(records)
    }

    /// `spawn(name, task, repo)` (§4.7). Creates the worktree, writes the
    /// per-worker instructions file, and starts the worker process.
    pub fn spawn(&self, id: &str, repo: &str, branch_base_ref: &str, task: &str) -> Result<WorkerRecord> {
        if self.store.load(id)?.is_some() {
            return Err(OrchestratorError::DuplicateId(id.to_string()).into());
        }

        let worktree = self
            .worktrees
            .create(repo, id, branch_base_ref)
            .map_err(|e| OrchestratorError::WorktreeError(e.to_string()))?;

        let branch = format!("feature/{id}");
        write_instructions_file(&worktree, task)
            .map_err(|e| OrchestratorError::WorktreeError(e.to_string()))?;

        let process_config = ProcessConfig {
            bin: self.config.agent_bin.clone(),
            args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--permission-mode".to_string(),
                "bypassPermissions".to_string(),
            ],
            worktree: worktree.clone(),
            env: vec![],
        };
        let errors_log = self.config.state_root.join(id).join("errors.log");
        let handle = self
            .spawner
            .spawn(&process_config, errors_log)
            .map_err(|e| OrchestratorError::SpawnError(e.to_string()))?;

        let mut record = WorkerRecord::new(id, repo, worktree.display().to_string(), branch, task, Utc::now());
        record.pid = Some(handle.pid());
        self.store.save(&record)?;
        self.processes.lock().unwrap().insert(id.to_string(), handle);
        Ok(record)
    }

    pub fn list(&self, include_terminal: bool) -> Result<Vec<WorkerRecord>> {
        let mut all = self.store.load_all()?;
        if !include_terminal {
            all.retain(|w| !w.state.is_terminal());
        }
        Ok(all)
    }

    pub fn status(&self, id: &str) -> Result<WorkerRecord> {
        self.store
            .load(id)?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()).into())
    }

    /// `send(name, message)` (§4.7). Fails with `NotRunning` if no process
    /// is attached (e.g. after a restart, before re-attach).
    pub fn send(&self, id: &str, message: &str) -> Result<()> {
        let mut processes = self.processes.lock().unwrap();
        let handle = processes
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotRunning(id.to_string()))?;
        handle.send(message)
    }

    /// `read(name, lines)` (§4.7). Prefers the attached process's in-memory
    /// ring buffer (no disk I/O) and falls back to the persisted log.
    pub fn read(&self, id: &str, lines: Option<usize>) -> Result<Vec<String>> {
        if let Some(handle) = self.processes.lock().unwrap().get(id) {
            return Ok(handle.read_recent(lines));
        }
        self.store.read_output(id, lines)
    }

    /// `stop(name)` (§4.7). Graceful TERM-then-KILL (§4.2, §5); guarantees
    /// the process is reaped before returning (P4).
    pub fn stop(&self, id: &str) -> Result<()> {
        let mut record = self.status(id)?;
        if let Some(mut handle) = self.processes.lock().unwrap().remove(id) {
            let _ = handle.terminate();
        }
        let from = record.state;
        record.state = WorkerState::Stopped;
        record.pid = None;
        self.store.save(&record)?;
        self.sink.emit(Event::StateChange { id: id.to_string(), from, to: WorkerState::Stopped, seq: self.next_seq() });
        Ok(())
    }

    /// `merge(name)` (§4.7). Valid only from PR_OPEN or REVIEWING; forces
    /// MERGING, where the next tick performs the actual merge call.
    pub fn merge(&self, id: &str) -> Result<bool> {
        let mut record = self.status(id)?;
        if !matches!(record.state, WorkerState::PrOpen | WorkerState::Reviewing) {
            return Err(OrchestratorError::InvalidTransition {
                id: id.to_string(),
                from: record.state,
                to: WorkerState::Merging,
            }
            .into());
        }
        let from = record.state;
        record.state = WorkerState::Merging;
        self.store.save(&record)?;
        self.sink.emit(Event::StateChange { id: id.to_string(), from, to: WorkerState::Merging, seq: self.next_seq() });
        Ok(true)
    }

    /// `cleanup(name?)` (§4.7). Removes terminal worker(s); with no id,
    /// applies the configured max age (§6 `STATE_MAX_AGE_DAYS`).
    pub fn cleanup(&self, id: Option<&str>) -> Result<usize> {
        match id {
            Some(id) => {
                let record = self.status(id)?;
                if !record.state.is_terminal() {
                    bail!("worker '{id}' is not in a terminal state");
                }
                self.store.remove(id)?;
                Ok(1)
            }
            None => self.store.cleanup(chrono::Duration::days(self.config.state_max_age_days as i64)),
        }
    }

    /// One scheduler tick (§4.6): advance every non-terminal worker in
    /// registry order. A single worker's failure never aborts the tick.
    pub fn tick(&self) -> Result<()> {
        let records = self.store.load_all()?;
        for mut record in records {
            if record.state.is_terminal() {
                continue;
            }
            if let Err(e) = self.advance(&mut record) {
                record.last_error = Some(e.to_string());
                let _ = self.store.save(&record);
            }
        }
        Ok(())
    }

    fn advance(&self, record: &mut WorkerRecord) -> Result<()> {
        self.drain_process(record)?;
        if record.state.is_terminal() {
            self.store.save(record)?;
            return Ok(());
        }

        match check_staleness(record.state, record.last_activity, Utc::now()) {
            Intervention::Nudge => self.maybe_nudge(record),
            Intervention::Escalate => {
                let from = record.state;
                record.state = WorkerState::Error;
                record.error = Some(format!("worker idle in {} past the grace period", from));
                self.sink.emit(Event::StateChange { id: record.id.clone(), from, to: record.state, seq: self.next_seq() });
            }
            Intervention::None => {}
        }

        match record.state {
            WorkerState::PrOpen => self.advance_pr_open(record)?,
            WorkerState::Merging => self.advance_merging(record),
            _ => {}
        }

        self.store.save(record)?;
        Ok(())
    }

    fn drain_process(&self, record: &mut WorkerRecord) -> Result<()> {
        let mut processes = self.processes.lock().unwrap();
        let exited = if let Some(handle) = processes.get_mut(&record.id) {
            let events = handle.drain_events();
            for event in events {
                self.apply_event(record, &event);
            }
            record.last_activity = handle.last_activity();
            handle.try_wait()?
        } else {
            None
        };

        if let Some(outcome) = exited {
            processes.remove(&record.id);
            drop(processes);
            self.sink.emit(Event::ProcessExit { id: record.id.clone(), code: outcome.code, seq: self.next_seq() });
            record.pid = None;
            if !record.state.is_terminal() {
                let from = record.state;
                record.state = WorkerState::Error;
                record.error = Some(match outcome.code {
                    Some(code) => format!("Process exited with code {code}"),
                    None => format!("Process terminated by signal {}", outcome.signal.unwrap_or(-1)),
                });
                self.sink.emit(Event::StateChange { id: record.id.clone(), from, to: record.state, seq: self.next_seq() });
            }
        }
        Ok(())
    }

    fn apply_event(&self, record: &mut WorkerRecord, event: &StreamEvent) {
        let ctx = DetectContext {
            state: record.state,
            has_pr: record.pr_number.is_some(),
            review_status: record.review_status,
        };
        let transition = detect(&ctx, event);

        if transition.next_state != record.state {
            if validate_transition(record.state, transition.next_state).is_ok() {
                let from = record.state;
                record.state = transition.next_state;
                self.sink.emit(Event::StateChange { id: record.id.clone(), from, to: record.state, seq: self.next_seq() });
            }
        }

        for effect in transition.effects {
            match effect {
                Effect::SetPr { number, url } => {
                    let was_absent = record.pr_number.is_none();
                    record.set_pr_if_absent(number, url.clone());
                    if was_absent {
                        self.sink.emit(Event::PrDetected { id: record.id.clone(), number, url, seq: self.next_seq() });
                    }
                }
                Effect::SetReviewStatus(status) => {
                    self.on_review_status(record, status);
                }
                Effect::Nudge(msg) => {
                    self.send_best_effort(&record.id, &msg);
                }
                Effect::EscalateToError(msg) => {
                    record.error = Some(msg.clone());
                    record.last_error = Some(msg.clone());
                    self.sink.emit(Event::Error { id: record.id.clone(), text: msg, seq: self.next_seq() });
                }
            }
        }

        if record.review_status == ReviewStatus::Failed {
            if let StreamEvent::Assistant(msg) = event {
                if crate::decoder::has_tool_use(msg) {
                    record.review_status = ReviewStatus::None;
                }
            }
        }

        self.check_gate_completion(record, event);
    }

    fn on_review_status(&self, record: &mut WorkerRecord, status: ReviewStatus) {
        record.review_status = status;
        self.sink.emit(Event::ReviewComplete {
            id: record.id.clone(),
            passed: status == ReviewStatus::Passed,
            seq: self.next_seq(),
        });
        match status {
            ReviewStatus::Passed => {
                record.agents_run.insert(GateKind::Qa);
                if let Some(pr) = record.pr_number {
                    let _ = self.forge.remove_label(&record.repo, pr, "review-pending");
                    let _ = self.forge.add_label(&record.repo, pr, "reviewed");
                }
            }
            ReviewStatus::Failed => {
                self.send_best_effort(&record.id, "The review failed. See the feedback above and address it before reopening for review.");
            }
            _ => {}
        }
    }

    fn check_gate_completion(&self, record: &mut WorkerRecord, event: &StreamEvent) {
        let mut runtime = self.runtime.lock().unwrap();
        if let Some(&kind) = runtime.pending_gate.get(&record.id) {
            if let Some(text) = text_of(event) {
                if gate_detector(kind, &text) {
                    record.agents_run.insert(kind);
                    runtime.pending_gate.remove(&record.id);
                }
            }
        }
    }

    fn maybe_nudge(&self, record: &WorkerRecord) {
        let mut runtime = self.runtime.lock().unwrap();
        if runtime.last_nudge_activity.get(&record.id) == Some(&record.last_activity) {
            return; // already nudged for this staleness episode (S3).
        }
        runtime.last_nudge_activity.insert(record.id.clone(), record.last_activity);
        drop(runtime);
        self.send_best_effort(&record.id, "please continue");
    }

    fn send_best_effort(&self, id: &str, message: &str) {
        if let Some(handle) = self.processes.lock().unwrap().get_mut(id) {
            let _ = handle.send(message);
        }
    }

    /// PR_OPEN steps 1-6 (§4.6).
    fn advance_pr_open(&self, record: &mut WorkerRecord) -> Result<()> {
        let pr_number = match record.pr_number {
            Some(n) => n,
            None => match self.forge.get_pr_for_branch(&record.repo, &record.branch) {
                Ok(Some(n)) => {
                    record.pr_number = Some(n);
                    n
                }
                _ => return Ok(()),
            },
        };

        let status = match self.forge.get_pr_status(&record.repo, pr_number) {
            Ok(s) => s,
            Err(_) => return Ok(()), // transient; retry next tick (§4.5, §7).
        };

        match status.ci {
            CiStatus::Pending | CiStatus::Unknown => {}
            CiStatus::Failed => self.on_ci_failed(record),
            CiStatus::Passed => self.on_ci_passed(record, pr_number, &status)?,
        }
        Ok(())
    }

    fn on_ci_failed(&self, record: &mut WorkerRecord) {
        if !record.ci_failure_notified {
            self.send_best_effort(&record.id, "CI failed. Inspect failing checks and fix.");
            record.ci_failure_notified = true;
        }
        record.review_status = ReviewStatus::None;
        record.agents_run = BTreeSet::new();
        self.runtime.lock().unwrap().pending_gate.remove(&record.id);
    }

    fn on_ci_passed(&self, record: &mut WorkerRecord, pr_number: u64, status: &PrStatus) -> Result<()> {
        record.ci_failure_notified = false;
        if record.review_status == ReviewStatus::None {
            if self.config.auto_review {
                self.send_best_effort(&record.id, &format!("/review {}", record.branch));
                record.review_status = ReviewStatus::Pending;
                let _ = self.forge.add_label(&record.repo, pr_number, "review-pending");
                let from = record.state;
                record.state = WorkerState::Reviewing;
                self.sink.emit(Event::StateChange { id: record.id.clone(), from, to: record.state, seq: self.next_seq() });
            }
        } else if record.review_status == ReviewStatus::Passed {
            self.drive_gates(record, pr_number, status)?;
        }
        Ok(())
    }

    fn drive_gates(&self, record: &mut WorkerRecord, pr_number: u64, status: &PrStatus) -> Result<()> {
        let diff_files = self.forge.diff_files(&record.repo, pr_number).unwrap_or_default();
        let mut required = vec![GateKind::Security];
        if needs_devops_review(&diff_files, &self.config.devops_patterns) {
            required.push(GateKind::Devops);
        }
        if needs_simplifier(status) {
            required.push(GateKind::Simplifier);
        }

        if required.iter().all(|g| record.agents_run.contains(g)) {
            let from = record.state;
            record.state = WorkerState::Merging;
            self.sink.emit(Event::StateChange { id: record.id.clone(), from, to: record.state, seq: self.next_seq() });
            return Ok(());
        }

        let mut runtime = self.runtime.lock().unwrap();
        if runtime.pending_gate.contains_key(&record.id) {
            return Ok(());
        }
        if let Some(next) = required.into_iter().find(|g| !record.agents_run.contains(g)) {
            runtime.pending_gate.insert(record.id.clone(), next);
            drop(runtime);
            self.send_best_effort(&record.id, gate_command(next));
        }
        Ok(())
    }

    fn advance_merging(&self, record: &mut WorkerRecord) {
        let Some(pr_number) = record.pr_number else { return };
        match self.forge.merge(&record.repo, pr_number, MergeStrategy::Squash, true) {
            Ok(true) => {
                let from = record.state;
                record.state = WorkerState::Merged;
                self.sink.emit(Event::StateChange { id: record.id.clone(), from, to: record.state, seq: self.next_seq() });
                self.sink.emit(Event::PrMerged { id: record.id.clone(), number: pr_number, seq: self.next_seq() });
            }
            Ok(false) | Err(_) => {
                let from = record.state;
                record.state = WorkerState::Error;
                record.error = Some(format!("merge of pr #{pr_number} failed"));
                self.sink.emit(Event::StateChange { id: record.id.clone(), from, to: record.state, seq: self.next_seq() });
            }
        }
    }

    /// Scheduler shutdown (§5): TERM-then-KILL every attached process,
    /// bounded by `shutdown_timeout`. Does not touch the registry; workers
    /// remain in their last-saved state for the next `recover()`.
    pub fn shutdown(&self) {
        let mut processes = self.processes.lock().unwrap();
        for (_, mut handle) in processes.drain() {
            let _ = handle.terminate();
        }
    }
}

fn write_instructions_file(worktree: &Path, task: &str) -> Result<()> {
    let content = format!(
        "# Task\n\n{task}\n\n# Before opening a PR\n\nRun this repository's local build, test, and lint checks and ensure they pass.\n"
    );
    std::fs::write(worktree.join("INSTRUCTIONS.md"), content)?;
    Ok(())
}
