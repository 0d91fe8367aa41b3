//! File-backed task store with asynchronous durability.
//!
//! Mutations mark the in-memory map dirty and return immediately; a
//! background flusher snapshots the whole map every five seconds (and once
//! on close) and atomically renames a temp sibling over the canonical path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::StoreError;
use crate::models::{ListRequest, Task};

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

pub struct FileStore {
    path: PathBuf,
    inner: RwLock<StoreInner>,
    shutdown_tx: watch::Sender<bool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

struct StoreInner {
    tasks: HashMap<String, Task>,
    dirty: bool,
}

impl FileStore {
    /// Opens (or creates) the store at `path` and starts the background
    /// flusher. An absent or empty file is an empty store; a file that
    /// exists but does not parse is fatal.
    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<FileStore>, StoreError> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(StoreError::CreateDir)?;
            }
        }

        let tasks = load_tasks(&path)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let store = Arc::new(FileStore {
            path,
            inner: RwLock::new(StoreInner {
                tasks,
                dirty: false,
            }),
            shutdown_tx,
            flusher: Mutex::new(None),
        });

        let handle = tokio::spawn(background_flusher(store.clone(), shutdown_rx));
        *store.flusher.lock().unwrap() = Some(handle);

        Ok(store)
    }

    /// Stores or updates a task.
    pub fn save(&self, task: Task) {
        let mut inner = self.inner.write().unwrap();
        inner.tasks.insert(task.id.clone(), task);
        inner.dirty = true;
    }

    pub fn get(&self, id: &str) -> Result<Task, StoreError> {
        let inner = self.inner.read().unwrap();
        inner
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Lists tasks matching the filter, newest first, sliced by
    /// offset/limit. Status and tag criteria compose conjunctively; a task
    /// must carry every requested tag.
    pub fn list(&self, filter: &ListRequest) -> Vec<Task> {
        let inner = self.inner.read().unwrap();
        let mut result: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| matches_filter(t, filter))
            .cloned()
            .collect();
        drop(inner);

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        if filter.offset > 0 {
            if filter.offset >= result.len() {
                return Vec::new();
            }
            result.drain(..filter.offset);
        }
        if filter.limit > 0 && filter.limit < result.len() {
            result.truncate(filter.limit);
        }
        result
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner.tasks.remove(id).is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        inner.dirty = true;
        Ok(())
    }

    pub fn update_status(&self, id: &str, status: crate::models::TaskStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        task.status = status;
        inner.dirty = true;
        Ok(())
    }

    /// Immediately persists the map, clearing the dirty flag.
    pub fn force_flush(&self) -> std::io::Result<()> {
        self.inner.write().unwrap().dirty = false;
        self.persist()
    }

    /// Stops the background flusher after one final snapshot.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.flusher.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Serializes the map under the read lock, then swaps the snapshot in
    /// with a temp-file rename so readers of the canonical path never see a
    /// partial write.
    fn persist(&self) -> std::io::Result<()> {
        let data = {
            let inner = self.inner.read().unwrap();
            serde_json::to_vec_pretty(&inner.tasks)?
        };
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)
    }

    fn take_dirty(&self) -> bool {
        self.inner.read().unwrap().dirty
    }

    fn clear_dirty(&self) {
        self.inner.write().unwrap().dirty = false;
    }
}

async fn background_flusher(store: Arc<FileStore>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(FLUSH_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                if store.take_dirty() {
                    match store.persist() {
                        Ok(()) => store.clear_dirty(),
                        // Dirty stays set; the write is retried next tick.
                        Err(e) => warn!(error = %e, path = %store.path.display(), "task store flush failed"),
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if let Err(e) = store.persist() {
                    warn!(error = %e, path = %store.path.display(), "final task store flush failed");
                }
                return;
            }
        }
    }
}

fn load_tasks(path: &Path) -> Result<HashMap<String, Task>, StoreError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(StoreError::Read(e)),
    };
    if data.is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_slice(&data).map_err(StoreError::Corrupt)
}

fn matches_filter(task: &Task, filter: &ListRequest) -> bool {
    if !filter.status.is_empty() && !filter.status.contains(&task.status) {
        return false;
    }
    filter.tags.iter().all(|tag| task.tags.contains(tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Engine, TaskStatus};
    use chrono::Utc;

    fn make_task(id: &str, status: TaskStatus, tags: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            prompt: format!("prompt for {id}"),
            work_dir: "/tmp".into(),
            status,
            engine: Engine::Copilot,
            pid: None,
            output: String::new(),
            output_tail: String::new(),
            error: String::new(),
            exit_code: None,
            model: String::new(),
            log_file: String::new(),
            progress: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            dependencies: Vec::new(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            priority: 0,
            timeout: Default::default(),
            mcp_config: String::new(),
            extra_args: Vec::new(),
        }
    }

    #[tokio::test]
    async fn save_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("tasks.json")).unwrap();

        store.save(make_task("task-1", TaskStatus::Pending, &[]));
        let task = store.get("task-1").unwrap();
        assert_eq!(task.id, "task-1");

        store.delete("task-1").unwrap();
        assert!(matches!(store.get("task-1"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete("task-1"), Err(StoreError::NotFound(_))));
        store.close().await;
    }

    #[tokio::test]
    async fn list_filters_and_slices() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("tasks.json")).unwrap();

        for i in 0..5 {
            let status = if i % 2 == 0 {
                TaskStatus::Pending
            } else {
                TaskStatus::Completed
            };
            let mut task = make_task(&format!("task-{i}"), status, &["batch"]);
            task.created_at = Utc::now() + chrono::Duration::seconds(i);
            store.save(task);
        }

        let all = store.list(&ListRequest::default());
        assert_eq!(all.len(), 5);
        // Newest first.
        assert_eq!(all[0].id, "task-4");

        let pending = store.list(&ListRequest {
            status: vec![TaskStatus::Pending],
            ..Default::default()
        });
        assert_eq!(pending.len(), 3);

        let tagged = store.list(&ListRequest {
            tags: vec!["batch".into(), "missing".into()],
            ..Default::default()
        });
        assert!(tagged.is_empty());

        let sliced = store.list(&ListRequest {
            limit: 2,
            offset: 1,
            ..Default::default()
        });
        assert_eq!(sliced.len(), 2);
        assert_eq!(sliced[0].id, "task-3");

        let past_end = store.list(&ListRequest {
            offset: 99,
            ..Default::default()
        });
        assert!(past_end.is_empty());
        store.close().await;
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.save(make_task("task-keep", TaskStatus::Completed, &["x"]));
            store.close().await;
        }

        let store = FileStore::open(&path).unwrap();
        let task = store.get("task-keep").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.tags, vec!["x".to_string()]);
        store.close().await;
    }

    #[tokio::test]
    async fn missing_and_empty_files_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");

        let store = FileStore::open(&path).unwrap();
        assert!(store.list(&ListRequest::default()).is_empty());
        store.close().await;

        std::fs::write(&path, b"").unwrap();
        let store = FileStore::open(&path).unwrap();
        assert!(store.list(&ListRequest::default()).is_empty());
        store.close().await;
    }

    #[tokio::test]
    async fn corrupt_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(FileStore::open(&path), Err(StoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn update_status_marks_dirty_and_applies() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("tasks.json")).unwrap();
        store.save(make_task("task-s", TaskStatus::Pending, &[]));
        store.update_status("task-s", TaskStatus::Cancelled).unwrap();
        assert_eq!(store.get("task-s").unwrap().status, TaskStatus::Cancelled);
        store.close().await;
    }
}
