//! State Store (§4.3): durable per-worker state plus a registry index;
//! append-only output/error logs.
use std::fs;
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::worker::model::{Registry, WorkerRecord};

/// Write `content` to `path` atomically using a temp file + rename.
///
/// On POSIX, `rename(2)` within the same directory is atomic — readers
/// always see either the old complete file or the new complete file, never a
/// partial write. The worker registry is a shared coordination point between
/// the scheduler and any external inspector reading `registry.json` directly.
fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(content.as_bytes())?;
    f.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Persistence contract for worker records (§4.3).
pub trait StateStore: Send + Sync {
    fn save(&self, record: &WorkerRecord) -> Result<()>;
    fn load(&self, id: &str) -> Result<Option<WorkerRecord>>;
    fn load_all(&self) -> Result<Vec<WorkerRecord>>;
    fn remove(&self, id: &str) -> Result<()>;
    fn append_output(&self, id: &str, line: &str) -> Result<()>;
    fn append_error(&self, id: &str, line: &str) -> Result<()>;
    fn read_output(&self, id: &str, lines: Option<usize>) -> Result<Vec<String>>;
    fn cleanup(&self, max_age: chrono::Duration) -> Result<usize>;
}

/// Filesystem-backed state store rooted at `<state_root>` (§6):
/// `registry.json`, and per-worker `<id>/state.json`, `<id>/output.jsonl`,
/// `<id>/errors.log`.
pub struct FileStateStore {
    root: PathBuf,
    registry_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileStateStore {
            root: root.into(),
            registry_lock: Mutex::new(()),
        }
    }

    fn registry_path(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    fn worker_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn state_path(&self, id: &str) -> PathBuf {
        self.worker_dir(id).join("state.json")
    }

    fn output_path(&self, id: &str) -> PathBuf {
        self.worker_dir(id).join("output.jsonl")
    }

    fn errors_path(&self, id: &str) -> PathBuf {
        self.worker_dir(id).join("errors.log")
    }

    fn read_registry(&self) -> Result<Registry> {
        match fs::read_to_string(self.registry_path()) {
            Ok(content) => {
                let reg: Registry =
                    serde_json::from_str(&content).context("parsing registry.json")?;
                Ok(reg.migrate())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Registry::new(Utc::now())),
            Err(e) => Err(e.into()),
        }
    }

    fn write_registry(&self, registry: &Registry) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let content = serde_json::to_string_pretty(registry)?;
        atomic_write(&self.registry_path(), &content)
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn save(&self, record: &WorkerRecord) -> Result<()> {
        let _guard = self.registry_lock.lock().unwrap();
        fs::create_dir_all(self.worker_dir(&record.id))?;

        let content = serde_json::to_string_pretty(record)?;
        atomic_write(&self.state_path(&record.id), &content)?;

        let mut registry = self.read_registry()?;
        registry.workers.insert(record.id.clone(), record.clone());
        registry.last_updated = Utc::now();
        self.write_registry(&registry)?;
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<WorkerRecord>> {
        match fs::read_to_string(self.state_path(id)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn load_all(&self) -> Result<Vec<WorkerRecord>> {
        let registry = self.read_registry()?;
        Ok(registry.workers.into_values().collect())
    }

    fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.registry_lock.lock().unwrap();
        let dir = self.worker_dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        let mut registry = self.read_registry()?;
        registry.workers.remove(id);
        registry.last_updated = Utc::now();
        self.write_registry(&registry)?;
        Ok(())
    }

    fn append_output(&self, id: &str, line: &str) -> Result<()> {
        self.append_line(&self.output_path(id), line)
    }

    fn append_error(&self, id: &str, line: &str) -> Result<()> {
        let ts = Utc::now().to_rfc3339();
        self.append_line(&self.errors_path(id), &format!("[{ts}] {line}"))
    }

    fn read_output(&self, id: &str, lines: Option<usize>) -> Result<Vec<String>> {
        let content = match fs::read_to_string(self.output_path(id)) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let all: Vec<String> = content.lines().map(|l| l.to_string()).collect();
        match lines {
            Some(n) if n < all.len() => Ok(all[all.len() - n..].to_vec()),
            _ => Ok(all),
        }
    }

    fn cleanup(&self, max_age: chrono::Duration) -> Result<usize> {
        let _guard = self.registry_lock.lock().unwrap();
        let mut registry = self.read_registry()?;
        let now = Utc::now();
        let cutoff = now - max_age;
        let to_remove: Vec<String> = registry
            .workers
            .values()
            .filter(|w| w.state.is_terminal() && w.last_activity < cutoff)
            .map(|w| w.id.clone())
            .collect();

        for id in &to_remove {
            let dir = self.worker_dir(id);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            registry.workers.remove(id);
        }
        if !to_remove.is_empty() {
            registry.last_updated = now;
            self.write_registry(&registry)?;
        }
        Ok(to_remove.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::model::WorkerState;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn record(id: &str) -> WorkerRecord {
        WorkerRecord::new(id, "o/r", "/wt", "feature/x", "task", now())
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        let rec = record("feat");
        store.save(&rec).unwrap();
        let loaded = store.load("feat").unwrap().unwrap();
        assert_eq!(loaded.id, "feat");
        assert_eq!(loaded.state, WorkerState::Spawning);
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(store.load("ghost").unwrap().is_none());
    }

    #[test]
    fn save_upserts_registry_index() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        store.save(&record("a")).unwrap();
        store.save(&record("b")).unwrap();
        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn remove_deletes_directory_and_registry_entry() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        store.save(&record("a")).unwrap();
        store.remove("a").unwrap();
        assert!(store.load("a").unwrap().is_none());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn append_and_read_output_tail() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        store.save(&record("a")).unwrap();
        for i in 0..5 {
            store.append_output("a", &format!("line {i}")).unwrap();
        }
        let tail = store.read_output("a", Some(2)).unwrap();
        assert_eq!(tail, vec!["line 3".to_string(), "line 4".to_string()]);
    }

    #[test]
    fn append_error_writes_timestamped_lines() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        store.save(&record("a")).unwrap();
        store.append_error("a", "boom").unwrap();
        let content = fs::read_to_string(dir.path().join("a/errors.log")).unwrap();
        assert!(content.contains("boom"));
    }

    #[test]
    fn cleanup_removes_only_old_terminal_workers() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());

        let mut stale = record("stale");
        stale.state = WorkerState::Merged;
        stale.last_activity = now() - chrono::Duration::days(10);
        store.save(&stale).unwrap();

        let mut fresh_terminal = record("fresh");
        fresh_terminal.state = WorkerState::Merged;
        store.save(&fresh_terminal).unwrap();

        let mut active = record("active");
        active.state = WorkerState::Working;
        active.last_activity = now() - chrono::Duration::days(10);
        store.save(&active).unwrap();

        let removed = store.cleanup(chrono::Duration::days(7)).unwrap();
        assert_eq!(removed, 1);
        assert!(store.load("stale").unwrap().is_none());
        assert!(store.load("fresh").unwrap().is_some());
        assert!(store.load("active").unwrap().is_some());
    }

    #[test]
    fn registry_schema_version_is_preserved_across_saves() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        store.save(&record("a")).unwrap();
        let content = fs::read_to_string(dir.path().join("registry.json")).unwrap();
        let registry: Registry = serde_json::from_str(&content).unwrap();
        assert_eq!(registry.version, Registry::CURRENT_VERSION);
    }
}
