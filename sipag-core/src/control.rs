//! Control API (§4.7): the client-facing surface over the scheduler.
//!
//! `Controller<S, F, W, P>` is a thin wrapper around `Scheduler<S, F, W, P>`
//! that adds the event stream (§3 "Event", §5 "Shared resources" —
//! subscribers are a read-only view of published events) and a background
//! tick loop, so a caller (the `sipag` CLI, or any other frontend) gets one
//! object that both dispatches commands and drives ticks. Generalized the
//! way the teacher's `WorkerOrchestrator<G, S, C>` is generalized over
//! ports (`worker/orchestrator.rs`).
use std::collections::VecDeque;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;

use crate::config::Config;
use crate::forge::ForgeClient;
use crate::process::ProcessSpawner;
use crate::scheduler::{Event, EventSink, Scheduler, WorktreeTool};
use crate::store::StateStore;
use crate::worker::model::WorkerRecord;

/// Bounded per-subscriber event buffer (§5 "Backpressure"). A subscriber
/// that falls behind this many unread events is dropped.
const SUBSCRIBER_BUFFER: usize = 256;

/// Fans published events out to subscribers. Delivery is best-effort per
/// subscriber (§4.7): a full channel means that subscriber is lagging and is
/// dropped rather than blocking the publisher.
#[derive(Default)]
struct EventBus {
    subscribers: Mutex<Vec<SyncSender<Event>>>,
}

impl EventBus {
    fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = sync_channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    fn publish(&self, event: Event) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false, // subscriber_lagged (§5).
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: Event) {
        self.publish(event);
    }
}

/// One subscriber's view of the event stream (§4.7): a snapshot of current
/// workers taken at connect time, then a live receiver for everything
/// published after that point.
pub struct EventSubscription {
    pub snapshot: Vec<WorkerRecord>,
    pub receiver: Receiver<Event>,
}

/// The Control API (§4.7). Owns the scheduler and the background tick
/// thread; `shutdown` stops the thread and terminates attached processes.
pub struct Controller<S, F, W, P: ProcessSpawner> {
    scheduler: Arc<Scheduler<S, F, W, P>>,
    bus: Arc<EventBus>,
    poll_interval: Duration,
    tick_thread: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<std::sync::atomic::AtomicBool>,
}

impl<S, F, W, P> Controller<S, F, W, P>
where
    S: StateStore + Send + Sync + 'static,
    F: ForgeClient + Send + Sync + 'static,
    W: WorktreeTool + Send + Sync + 'static,
    P: ProcessSpawner + Send + Sync + 'static,
    P::Handle: Send + 'static,
{
    /// Construct a controller over the given ports and recover any
    /// persisted workers from a prior run (§4.6 "Restart recovery").
    pub fn new(store: S, forge: F, worktrees: W, spawner: P, config: Config) -> Result<Self> {
        let bus = Arc::new(EventBus::default());
        let poll_interval = config.poll_interval;
        let scheduler = Arc::new(Scheduler::new(store, forge, worktrees, spawner, config, bus.clone()));
        scheduler.recover()?;
        Ok(Controller {
            scheduler,
            bus,
            poll_interval,
            tick_thread: Mutex::new(None),
            stop: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    /// Start the background tick loop (§4.6 "Tick model"). Idempotent: a
    /// second call while a loop is already running is a no-op.
    pub fn start(&self) {
        let mut guard = self.tick_thread.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let scheduler = self.scheduler.clone();
        let stop = self.stop.clone();
        let interval = self.poll_interval;
        *guard = Some(std::thread::spawn(move || {
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let _ = scheduler.tick();
                std::thread::sleep(interval);
            }
        }));
    }

    /// Run ticks inline without a background thread, for callers (tests,
    /// the CLI's one-shot invocations) that want synchronous control.
    pub fn tick_once(&self) -> Result<()> {
        self.scheduler.tick()
    }

    pub fn spawn(&self, id: &str, repo: &str, base_ref: &str, task: &str) -> Result<WorkerRecord> {
        self.scheduler.spawn(id, repo, base_ref, task)
    }

    pub fn list(&self, include_terminal: bool) -> Result<Vec<WorkerRecord>> {
        self.scheduler.list(include_terminal)
    }

    pub fn status(&self, id: &str) -> Result<WorkerRecord> {
        self.scheduler.status(id)
    }

    pub fn send(&self, id: &str, message: &str) -> Result<()> {
        self.scheduler.send(id, message)
    }

    pub fn read(&self, id: &str, lines: Option<usize>) -> Result<Vec<String>> {
        self.scheduler.read(id, lines)
    }

    pub fn stop_worker(&self, id: &str) -> Result<()> {
        self.scheduler.stop(id)
    }

    pub fn merge(&self, id: &str) -> Result<bool> {
        self.scheduler.merge(id)
    }

    pub fn cleanup(&self, id: Option<&str>) -> Result<usize> {
        self.scheduler.cleanup(id)
    }

    /// Subscribe to the event stream, with an initial snapshot of current
    /// workers delivered first (§4.7 "Event stream").
    pub fn subscribe(&self) -> Result<EventSubscription> {
        let snapshot = self.scheduler.list(true)?;
        let receiver = self.bus.subscribe();
        Ok(EventSubscription { snapshot, receiver })
    }

    /// Scheduler shutdown (§5): stop the tick loop, then TERM-then-KILL
    /// every attached process, bounded by `shutdown_timeout` per worker.
    pub fn shutdown(&self) {
        self.stop.store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(handle) = self.tick_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.scheduler.shutdown();
    }
}

/// Drains every currently-pending event without blocking. Useful for
/// control surfaces (like the CLI) that poll the stream rather than
/// blocking on it.
pub fn drain_pending(receiver: &Receiver<Event>) -> VecDeque<Event> {
    let mut out = VecDeque::new();
    while let Ok(event) = receiver.try_recv() {
        out.push_back(event);
    }
    out
}
