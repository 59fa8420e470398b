//! One filesystem watcher per registered project.
//!
//! Each project gets a `notify` watcher on the parent directory of its tasks
//! file plus a task that turns raw events into settled updates:
//!
//! ```text
//! notify ──► WatchSignal channel ──► settle (size/mtime stable) ──► read + parse
//!                                                                      │
//!                        registry.update_data ◄── commit ◄────────────┘
//!                                │
//!                                └──► updates channel ──► hub broadcast
//! ```

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use log::{debug, error, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::path_guard::{PathGuard, SafePath};
use super::registry::ProjectRegistry;
use crate::config::ServerConfig;
use crate::error::{Result, SyncError};
use crate::web::BroadcastMessage;

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub stability_threshold: Duration,
    pub poll_interval: Duration,
    pub max_file_bytes: u64,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for WatchOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            stability_threshold: config.stability_threshold,
            poll_interval: config.poll_interval,
            max_file_bytes: config.max_file_bytes,
        }
    }
}

enum WatchSignal {
    Changed,
    Failed(String),
}

struct WatchHandle {
    generation: u64,
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type HandleMap = Arc<Mutex<HashMap<String, WatchHandle>>>;

/// Writes a new document into the registry, then queues its broadcast.
#[derive(Clone)]
struct Committer {
    registry: Arc<ProjectRegistry>,
    updates: mpsc::UnboundedSender<BroadcastMessage>,
}

impl Committer {
    async fn commit(&self, project_id: &str, data: Value) -> bool {
        let at = Utc::now();
        if !self.registry.update_data(project_id, data.clone(), at).await {
            debug!("[watch] {} no longer registered, dropping update", project_id);
            return false;
        }
        if self
            .updates
            .send(BroadcastMessage::file_update(project_id, data, at))
            .is_err()
        {
            debug!("[watch] update channel closed, {} not broadcast", project_id);
        }
        true
    }
}

pub struct WatchManager {
    guard: PathGuard,
    options: WatchOptions,
    committer: Committer,
    handles: HandleMap,
    next_generation: AtomicU64,
}

impl WatchManager {
    pub fn new(
        guard: PathGuard,
        registry: Arc<ProjectRegistry>,
        updates: mpsc::UnboundedSender<BroadcastMessage>,
        options: WatchOptions,
    ) -> Self {
        Self {
            guard,
            options,
            committer: Committer { registry, updates },
            handles: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Attach a watcher for `project_id`, replacing any existing one.
    pub async fn watch(&self, project_id: &str, file_path: &Path) -> Result<()> {
        let mut handles = self.handles.lock().await;
        if handles.remove(project_id).is_some() {
            info!("[watch] replacing existing watcher for {}", project_id);
        }

        let file = self
            .guard
            .sanitize(file_path, None)
            .ok_or_else(|| SyncError::invalid_path(file_path.display().to_string()))?;
        let (dir, file_name) = split_target(&file)?;

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let target = file_name.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    if is_relevant(&event, &target) {
                        let _ = signal_tx.send(WatchSignal::Changed);
                    }
                }
                Err(e) => {
                    let _ = signal_tx.send(WatchSignal::Failed(e.to_string()));
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| SyncError::Watch(format!("Failed to create watcher: {}", e)))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| SyncError::Watch(format!("Failed to watch {}: {}", dir.display(), e)))?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let task = WatchTask {
            project_id: project_id.to_string(),
            file: file.clone(),
            generation,
            options: self.options.clone(),
            committer: self.committer.clone(),
            handles: Arc::clone(&self.handles),
        };
        let task = tokio::spawn(task.run(signal_rx));

        handles.insert(
            project_id.to_string(),
            WatchHandle {
                generation,
                _watcher: watcher,
                task,
            },
        );
        info!("[watch] watching {} for project {}", file, project_id);
        Ok(())
    }

    /// Detach the watcher for `project_id`. Returns whether one existed.
    pub async fn unwatch(&self, project_id: &str) -> bool {
        let removed = self.handles.lock().await.remove(project_id).is_some();
        if removed {
            info!("[watch] stopped watching project {}", project_id);
        }
        removed
    }

    pub async fn unwatch_all(&self) {
        let drained: Vec<(String, WatchHandle)> = self.handles.lock().await.drain().collect();
        if !drained.is_empty() {
            info!("[watch] closing {} watcher(s)", drained.len());
        }
    }

    pub async fn is_watching(&self, project_id: &str) -> bool {
        self.handles.lock().await.contains_key(project_id)
    }

    pub async fn active_count(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Commit a freshly loaded document outside the change handler (rewatch).
    pub async fn commit(&self, project_id: &str, data: Value) -> bool {
        self.committer.commit(project_id, data).await
    }
}

struct WatchTask {
    project_id: String,
    file: SafePath,
    generation: u64,
    options: WatchOptions,
    committer: Committer,
    handles: HandleMap,
}

impl WatchTask {
    async fn run(self, mut signals: mpsc::UnboundedReceiver<WatchSignal>) {
        while let Some(signal) = signals.recv().await {
            if let WatchSignal::Failed(reason) = signal {
                self.fail(&reason).await;
                return;
            }

            if let Err(reason) = settle(self.file.as_path(), &mut signals, &self.options).await {
                self.fail(&reason).await;
                return;
            }

            match load_document(self.file.as_path(), self.options.max_file_bytes).await {
                Ok(data) => {
                    if self.committer.commit(&self.project_id, data).await {
                        debug!("[watch] {} updated from {}", self.project_id, self.file);
                    }
                }
                Err(err @ (SyncError::Parse { .. } | SyncError::FileTooLarge { .. })) => {
                    warn!(
                        "[watch] {}: keeping last good data, {}",
                        self.project_id, err
                    );
                }
                Err(err) => {
                    self.fail(&err.to_string()).await;
                    return;
                }
            }
        }
    }

    /// Drop this task's handle so the project reads as not watching. The
    /// registry keeps its last good data.
    async fn fail(&self, reason: &str) {
        error!(
            "[watch] watcher for {} stopped ({}): {}",
            self.project_id, self.file, reason
        );
        let mut handles = self.handles.lock().await;
        let current = handles.get(&self.project_id).map(|h| h.generation);
        if current == Some(self.generation) {
            handles.remove(&self.project_id);
        }
    }
}

/// Wait until the file's size and mtime hold still for the stability
/// threshold, absorbing any events that arrive meanwhile.
async fn settle(
    path: &Path,
    signals: &mut mpsc::UnboundedReceiver<WatchSignal>,
    options: &WatchOptions,
) -> std::result::Result<(), String> {
    let mut last = fingerprint(path).await;
    let mut stable_since = Instant::now();

    loop {
        tokio::time::sleep(options.poll_interval).await;

        while let Ok(signal) = signals.try_recv() {
            match signal {
                WatchSignal::Changed => stable_since = Instant::now(),
                WatchSignal::Failed(reason) => return Err(reason),
            }
        }

        let current = fingerprint(path).await;
        if current != last {
            last = current;
            stable_since = Instant::now();
            continue;
        }
        if stable_since.elapsed() >= options.stability_threshold {
            return Ok(());
        }
    }
}

async fn fingerprint(path: &Path) -> Option<(u64, Option<SystemTime>)> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .map(|meta| (meta.len(), meta.modified().ok()))
}

fn is_relevant(event: &Event, target: &OsStr) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }
    event.need_rescan()
        || event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(target))
}

fn split_target(file: &SafePath) -> Result<(PathBuf, OsString)> {
    let path = file.as_path();
    match (path.parent(), path.file_name()) {
        (Some(dir), Some(name)) => Ok((dir.to_path_buf(), name.to_os_string())),
        _ => Err(SyncError::invalid_path(path.display().to_string())),
    }
}

/// Read and parse a JSON document, refusing files above `max_bytes`.
pub async fn load_document(path: &Path, max_bytes: u64) -> Result<Value> {
    let io_error = |source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    };

    let meta = tokio::fs::metadata(path).await.map_err(io_error)?;
    if !meta.is_file() {
        return Err(SyncError::Validation(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    if meta.len() > max_bytes {
        return Err(SyncError::FileTooLarge {
            path: path.to_path_buf(),
            size: meta.len(),
            max: max_bytes,
        });
    }

    let bytes = tokio::fs::read(path).await.map_err(io_error)?;
    if bytes.len() as u64 > max_bytes {
        return Err(SyncError::FileTooLarge {
            path: path.to_path_buf(),
            size: bytes.len() as u64,
            max: max_bytes,
        });
    }

    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        serde_json::from_slice::<Value>(&bytes).map_err(|source| SyncError::Parse {
            path: owned,
            source,
        })
    })
    .await
    .map_err(|e| SyncError::Internal(format!("JSON parse task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::registry::ProjectRecord;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        file: PathBuf,
        registry: Arc<ProjectRegistry>,
        manager: WatchManager,
        updates: mpsc::UnboundedReceiver<BroadcastMessage>,
    }

    async fn fixture(initial: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let tasks_dir = dir.path().join("tasks");
        std::fs::create_dir_all(&tasks_dir).unwrap();
        let file = tasks_dir.join("tasks.json");
        std::fs::write(&file, initial).unwrap();

        let guard = PathGuard::default();
        let registry = Arc::new(ProjectRegistry::new());
        registry
            .add(ProjectRecord::new(
                "p1".into(),
                "Project".into(),
                dir.path().to_path_buf(),
                guard.sanitize(&file, None).unwrap(),
                serde_json::from_str(initial).unwrap(),
            ))
            .await
            .unwrap();

        let (tx, updates) = mpsc::unbounded_channel();
        let manager = WatchManager::new(guard, Arc::clone(&registry), tx, WatchOptions::default());
        Fixture {
            _dir: dir,
            file,
            registry,
            manager,
            updates,
        }
    }

    async fn next_update(rx: &mut mpsc::UnboundedReceiver<BroadcastMessage>) -> BroadcastMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for update")
            .expect("update channel closed")
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<BroadcastMessage>) {
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(rx.try_recv().is_err(), "unexpected extra update");
    }

    #[tokio::test]
    async fn burst_of_writes_yields_one_update_with_final_content() {
        let mut fx = fixture(r#"{"tasks":[]}"#).await;
        fx.manager.watch("p1", &fx.file).await.unwrap();

        for n in 1..=5 {
            std::fs::write(&fx.file, format!(r#"{{"tasks":[{{"id":{n}}}]}}"#)).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let update = next_update(&mut fx.updates).await;
        assert_eq!(update.project_id(), "p1");
        assert_eq!(update.data(), &json!({"tasks": [{"id": 5}]}));

        let stored = fx.registry.get("p1").await.unwrap();
        assert_eq!(stored.data, json!({"tasks": [{"id": 5}]}));
        assert_eq!(stored.last_updated, update.timestamp());

        assert_quiet(&mut fx.updates).await;
    }

    #[tokio::test]
    async fn atomic_rename_save_is_observed() {
        let mut fx = fixture(r#"{"tasks":[]}"#).await;
        fx.manager.watch("p1", &fx.file).await.unwrap();

        let staged = fx.file.with_file_name("tasks.json.tmp");
        std::fs::write(&staged, r#"{"tasks":[{"id":7}]}"#).unwrap();
        std::fs::rename(&staged, &fx.file).unwrap();

        let update = next_update(&mut fx.updates).await;
        assert_eq!(update.data(), &json!({"tasks": [{"id": 7}]}));
        assert!(fx.manager.is_watching("p1").await);

        std::fs::write(&fx.file, r#"{"tasks":[]}"#).unwrap();
        let update = next_update(&mut fx.updates).await;
        assert_eq!(update.data(), &json!({"tasks": []}));
    }

    #[tokio::test]
    async fn invalid_json_keeps_last_good_data() {
        let mut fx = fixture(r#"{"tasks":[{"id":1}]}"#).await;
        fx.manager.watch("p1", &fx.file).await.unwrap();

        std::fs::write(&fx.file, "{ not json").unwrap();
        assert_quiet(&mut fx.updates).await;
        assert_eq!(
            fx.registry.get("p1").await.unwrap().data,
            json!({"tasks": [{"id": 1}]})
        );
        assert!(fx.manager.is_watching("p1").await);

        std::fs::write(&fx.file, r#"{"tasks":[]}"#).unwrap();
        let update = next_update(&mut fx.updates).await;
        assert_eq!(update.data(), &json!({"tasks": []}));
    }

    #[tokio::test]
    async fn unwatch_stops_updates() {
        let mut fx = fixture(r#"{"tasks":[]}"#).await;
        fx.manager.watch("p1", &fx.file).await.unwrap();
        assert!(fx.manager.unwatch("p1").await);
        assert!(!fx.manager.unwatch("p1").await);

        std::fs::write(&fx.file, r#"{"tasks":[{"id":9}]}"#).unwrap();
        assert_quiet(&mut fx.updates).await;
        assert_eq!(fx.manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn deleted_file_clears_handle_and_keeps_data() {
        let mut fx = fixture(r#"{"tasks":[{"id":1}]}"#).await;
        fx.manager.watch("p1", &fx.file).await.unwrap();

        std::fs::remove_file(&fx.file).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while fx.manager.is_watching("p1").await {
            assert!(Instant::now() < deadline, "watcher never reported the deletion");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(fx.updates.try_recv().is_err());
        assert_eq!(
            fx.registry.get("p1").await.unwrap().data,
            json!({"tasks": [{"id": 1}]})
        );
    }

    #[tokio::test]
    async fn rewatch_replaces_previous_handle() {
        let mut fx = fixture(r#"{"tasks":[]}"#).await;
        fx.manager.watch("p1", &fx.file).await.unwrap();
        fx.manager.watch("p1", &fx.file).await.unwrap();
        assert_eq!(fx.manager.active_count().await, 1);

        std::fs::write(&fx.file, r#"{"tasks":[{"id":2}]}"#).unwrap();
        next_update(&mut fx.updates).await;
        assert_quiet(&mut fx.updates).await;
    }

    #[tokio::test]
    async fn watch_rejects_unsafe_paths() {
        let fx = fixture(r#"{"tasks":[]}"#).await;
        let err = fx
            .manager
            .watch("p1", Path::new("/etc/passwd"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidPath { .. }));
        assert!(!fx.manager.is_watching("p1").await);
    }

    #[tokio::test]
    async fn commit_skips_unregistered_projects() {
        let mut fx = fixture(r#"{"tasks":[]}"#).await;
        assert!(!fx.manager.commit("ghost", json!({})).await);
        assert!(fx.updates.try_recv().is_err());

        assert!(fx.manager.commit("p1", json!({"tasks": [1]})).await);
        assert_eq!(next_update(&mut fx.updates).await.project_id(), "p1");
    }

    #[tokio::test]
    async fn load_document_enforces_size_limit() {
        let fx = fixture(r#"{"tasks":[1,2,3]}"#).await;
        let err = load_document(&fx.file, 4).await.unwrap_err();
        assert!(matches!(err, SyncError::FileTooLarge { .. }));
        assert_eq!(
            load_document(&fx.file, 1024).await.unwrap(),
            json!({"tasks": [1, 2, 3]})
        );
    }
}
