//! Worker Process (§4.2): spawn, feed stdin, capture stdout/stderr, signal,
//! reap. Owns the subprocess handle; the scheduler never touches OS handles
//! directly.
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use crate::decoder::{StreamDecoder, StreamEvent};

/// Signal kinds a caller may request (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

/// How the process most recently exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Configuration for spawning a worker subprocess (§6).
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub bin: String,
    pub args: Vec<String>,
    pub worktree: PathBuf,
    pub env: Vec<(String, String)>,
}

const RING_BUFFER_CAPACITY: usize = 1000;

/// Shared, lock-guarded state updated by the reader threads and read by the
/// scheduler.
struct Shared {
    ring: VecDeque<String>,
    last_activity: DateTime<Utc>,
    decoder: StreamDecoder,
    pending_events: Vec<StreamEvent>,
    exited: Option<ExitOutcome>,
}

impl Shared {
    fn push_line(&mut self, line: String) {
        if self.ring.len() == RING_BUFFER_CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back(line);
        self.last_activity = Utc::now();
    }
}

/// A live worker subprocess: three pipes, a decoder on stdout, an
/// append-only error log on stderr, and a ring buffer of recent output.
pub struct WorkerProcess {
    child: Child,
    stdin_closed: Arc<Mutex<bool>>,
    shared: Arc<Mutex<Shared>>,
    stdout_thread: Option<JoinHandle<()>>,
    stderr_thread: Option<JoinHandle<()>>,
    errors_log: PathBuf,
}

impl WorkerProcess {
    /// Spawn the agent CLI in the worktree directory (§4.2, §6).
    ///
    /// Fails with a `SpawnError`-shaped message when the binary is missing,
    /// the working directory is absent, or the OS refuses the spawn.
    pub fn start(config: &ProcessConfig, errors_log: PathBuf) -> Result<Self> {
        if !config.worktree.is_dir() {
            bail!("worktree directory {} does not exist", config.worktree.display());
        }

        let mut cmd = Command::new(&config.bin);
        cmd.args(&config.args)
            .current_dir(&config.worktree)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in &config.env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn worker subprocess `{}`", config.bin))?;

        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;

        let shared = Arc::new(Mutex::new(Shared {
            ring: VecDeque::with_capacity(RING_BUFFER_CAPACITY),
            last_activity: Utc::now(),
            decoder: StreamDecoder::new(),
            pending_events: Vec::new(),
            exited: None,
        }));

        if let Some(parent) = errors_log.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let stdout_shared = Arc::clone(&shared);
        let stdout_thread = thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines().map_while(Result::ok) {
                let mut guard = stdout_shared.lock().unwrap();
                let events = guard.decoder.feed(format!("{line}\n").as_bytes());
                guard.pending_events.extend(events);
                guard.push_line(line);
            }
        });

        let stderr_shared = Arc::clone(&shared);
        let errors_log_path = errors_log.clone();
        let stderr_thread = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&errors_log_path)
                .ok();
            for line in reader.lines().map_while(Result::ok) {
                if let Some(f) = file.as_mut() {
                    let ts = Utc::now().to_rfc3339();
                    let _ = writeln!(f, "[{ts}] {line}");
                }
                let mut guard = stderr_shared.lock().unwrap();
                guard.push_line(line);
            }
        });

        Ok(WorkerProcess {
            child,
            stdin_closed: Arc::new(Mutex::new(false)),
            shared,
            stdout_thread: Some(stdout_thread),
            stderr_thread: Some(stderr_thread),
            errors_log,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Append `text` then a newline to stdin. Fails if the process has
    /// exited (§4.2).
    pub fn send(&mut self, text: &str) -> Result<()> {
        if *self.stdin_closed.lock().unwrap() {
            bail!("stdin is closed: process has exited");
        }
        let stdin = self.child.stdin.as_mut().context("stdin not piped")?;
        writeln!(stdin, "{text}").context("failed to write to stdin")?;
        stdin.flush().context("failed to flush stdin")?;
        Ok(())
    }

    /// Best-effort signal delivery via a direct `kill(2)` syscall on the
    /// child's pid (§4.2). Uses `libc` rather than shelling out to `kill`,
    /// since the pid is already held as a `std::process::Child`.
    pub fn signal(&self, kind: Signal) {
        let sig = match kind {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, sig);
        }
    }

    /// Send TERM, wait up to 5s, then KILL; resolves on reap with exit code
    /// and optional signal (§4.2, §5, P4).
    pub fn terminate(&mut self) -> Result<ExitOutcome> {
        self.signal(Signal::Term);
        *self.stdin_closed.lock().unwrap() = true;

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(status) = self.child.try_wait()? {
                return Ok(self.finish(status));
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }

        self.signal(Signal::Kill);
        let status = self.child.wait()?;
        Ok(self.finish(status))
    }

    /// Non-blocking exit check; returns `None` while still running.
    pub fn try_wait(&mut self) -> Result<Option<ExitOutcome>> {
        match self.child.try_wait()? {
            Some(status) => Ok(Some(self.finish(status))),
            None => Ok(None),
        }
    }

    fn finish(&mut self, status: std::process::ExitStatus) -> ExitOutcome {
        *self.stdin_closed.lock().unwrap() = true;
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        let outcome = ExitOutcome {
            code: status.code(),
            signal,
        };
        self.shared.lock().unwrap().exited = Some(outcome);
        if let Some(h) = self.stdout_thread.take() {
            let _ = h.join();
        }
        if let Some(h) = self.stderr_thread.take() {
            let _ = h.join();
        }
        outcome
    }

    /// Drain any decoded stream events produced since the last call.
    pub fn drain_events(&self) -> Vec<StreamEvent> {
        let mut guard = self.shared.lock().unwrap();
        std::mem::take(&mut guard.pending_events)
    }

    /// Tail of the in-memory ring buffer (most recent `n` lines, or all).
    pub fn read_recent(&self, n: Option<usize>) -> Vec<String> {
        let guard = self.shared.lock().unwrap();
        match n {
            Some(n) => guard.ring.iter().rev().take(n).rev().cloned().collect(),
            None => guard.ring.iter().cloned().collect(),
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.shared.lock().unwrap().last_activity
    }

    pub fn errors_log_path(&self) -> &Path {
        &self.errors_log
    }
}

/// Everything the scheduler needs from an attached worker process (§4.2,
/// §4.6). Generalizes `WorkerProcess` into a trait so the scheduler can be
/// driven in tests by a fake process that never touches a real OS pipe.
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;
    fn send(&mut self, text: &str) -> Result<()>;
    fn drain_events(&self) -> Vec<StreamEvent>;
    fn read_recent(&self, n: Option<usize>) -> Vec<String>;
    fn last_activity(&self) -> DateTime<Utc>;
    fn try_wait(&mut self) -> Result<Option<ExitOutcome>>;
    fn terminate(&mut self) -> Result<ExitOutcome>;
}

impl ProcessHandle for WorkerProcess {
    fn pid(&self) -> u32 {
        WorkerProcess::pid(self)
    }
    fn send(&mut self, text: &str) -> Result<()> {
        WorkerProcess::send(self, text)
    }
    fn drain_events(&self) -> Vec<StreamEvent> {
        WorkerProcess::drain_events(self)
    }
    fn read_recent(&self, n: Option<usize>) -> Vec<String> {
        WorkerProcess::read_recent(self, n)
    }
    fn last_activity(&self) -> DateTime<Utc> {
        WorkerProcess::last_activity(self)
    }
    fn try_wait(&mut self) -> Result<Option<ExitOutcome>> {
        WorkerProcess::try_wait(self)
    }
    fn terminate(&mut self) -> Result<ExitOutcome> {
        WorkerProcess::terminate(self)
    }
}

/// Spawns worker processes (§4.2). A trait so the scheduler can be
/// constructed with a fake spawner in tests instead of launching real
/// subprocesses.
pub trait ProcessSpawner: Send + Sync {
    type Handle: ProcessHandle;
    fn spawn(&self, config: &ProcessConfig, errors_log: PathBuf) -> Result<Self::Handle>;
}

/// Spawns real OS subprocesses via `WorkerProcess::start`.
pub struct RealSpawner;

impl ProcessSpawner for RealSpawner {
    type Handle = WorkerProcess;
    fn spawn(&self, config: &ProcessConfig, errors_log: PathBuf) -> Result<WorkerProcess> {
        WorkerProcess::start(config, errors_log)
    }
}
