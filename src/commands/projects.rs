//! Project operations shared by the HTTP handlers and the `SyncServer` API.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use log::{info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use super::discovery::{DiscoveryEvent, DiscoveryReport, SkippedProject};
use super::path_guard::{PathGuard, SafePath};
use super::registry::{ProjectRecord, ProjectSummary};
use super::watch_manager::load_document;
use crate::error::{Result, SyncError};
use crate::web::AppState;

/// Locations probed, in order, when a request names no tasks file.
const TASKS_FILE_CANDIDATES: &[&str] = &["tasks/tasks.json", ".taskmaster/tasks/tasks.json"];

const MAX_ID_LEN: usize = 128;
const MAX_NAME_LEN: usize = 256;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AddProjectRequest {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub tasks_file: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDetails {
    #[serde(flatten)]
    pub record: ProjectRecord,
    pub task_count: usize,
    /// False once the watcher failed; data is then the last good copy.
    pub watching: bool,
}

impl ProjectDetails {
    fn new(record: ProjectRecord, watching: bool) -> Self {
        Self {
            task_count: record.task_count(),
            record,
            watching,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub project_count: usize,
    pub connections: usize,
    /// Seconds since the server state was built.
    pub uptime: u64,
}

/// Serializes add / remove / rewatch per project id so a removal can never
/// interleave with the watcher attach of a concurrent add.
#[derive(Debug, Default)]
pub struct ProjectLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectLocks {
    pub async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Entries nobody holds or waits on are only referenced by the map.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"))
}

pub fn validate_id(id: &str) -> Result<()> {
    if id.len() > MAX_ID_LEN || !id_pattern().is_match(id) {
        return Err(SyncError::Validation(format!(
            "project id must match [A-Za-z0-9_-]+ (max {} chars)",
            MAX_ID_LEN
        )));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_NAME_LEN {
        return Err(SyncError::Validation(format!(
            "project name must be 1-{} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

/// Pick the tasks file for a project root: an explicit path resolved against
/// the root, or the first existing default location.
async fn resolve_tasks_file(guard: &PathGuard, root: &Path, explicit: Option<&str>) -> Result<SafePath> {
    if let Some(explicit) = explicit {
        return guard
            .sanitize(explicit, Some(root))
            .ok_or_else(|| SyncError::invalid_path(explicit));
    }

    for candidate in TASKS_FILE_CANDIDATES {
        let Some(safe) = guard.sanitize(candidate, Some(root)) else {
            continue;
        };
        if tokio::fs::try_exists(safe.as_path()).await.unwrap_or(false) {
            return Ok(safe);
        }
    }
    Err(SyncError::not_found(format!(
        "tasks file under {}",
        root.display()
    )))
}

async fn require_dir(path: &Path) -> Result<()> {
    let meta = tokio::fs::metadata(path).await.map_err(|source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(SyncError::Validation(format!(
            "{} is not a directory",
            path.display()
        )));
    }
    Ok(())
}

/// Validate, load, register and watch a project.
pub async fn add_project(state: &AppState, request: AddProjectRequest) -> Result<ProjectDetails> {
    validate_id(&request.id)?;
    validate_name(&request.name)?;
    let _op = state.locks.acquire(&request.id).await;

    let root: PathBuf = state
        .guard
        .sanitize_dir(&request.path)
        .ok_or_else(|| SyncError::invalid_path(&request.path))?;

    if state.registry.contains(&request.id).await {
        return Err(SyncError::Conflict { id: request.id });
    }

    require_dir(&root).await?;
    let tasks_file = resolve_tasks_file(&state.guard, &root, request.tasks_file.as_deref()).await?;
    let data = load_document(tasks_file.as_path(), state.config.max_file_bytes).await?;

    let record = ProjectRecord::new(
        request.id.clone(),
        request.name.trim().to_string(),
        root,
        tasks_file.clone(),
        data,
    );
    state.registry.add(record.clone()).await?;

    if let Err(err) = state.watchers.watch(&record.id, tasks_file.as_path()).await {
        warn!("[projects] rolling back {}: {}", record.id, err);
        state.registry.remove(&record.id).await;
        return Err(err);
    }

    info!(
        "[projects] added {} ({} tasks) from {}",
        record.id,
        record.task_count(),
        tasks_file
    );
    Ok(ProjectDetails::new(record, true))
}

/// Detach the watcher and drop the record.
pub async fn remove_project(state: &AppState, id: &str) -> Result<()> {
    let _op = state.locks.acquire(id).await;
    state.watchers.unwatch(id).await;
    if !state.registry.remove(id).await {
        return Err(SyncError::not_found(format!("project {}", id)));
    }
    info!("[projects] removed {}", id);
    Ok(())
}

pub async fn get_project(state: &AppState, id: &str) -> Result<ProjectDetails> {
    let record = state
        .registry
        .get(id)
        .await
        .ok_or_else(|| SyncError::not_found(format!("project {}", id)))?;
    let watching = state.watchers.is_watching(id).await;
    Ok(ProjectDetails::new(record, watching))
}

pub async fn list_projects(state: &AppState) -> Vec<ProjectSummary> {
    state.registry.list().await
}

/// Re-read a project's file, publish it, and attach a fresh watcher. This is
/// the way back from a failed watcher.
pub async fn rewatch_project(state: &AppState, id: &str) -> Result<ProjectDetails> {
    let _op = state.locks.acquire(id).await;
    let record = state
        .registry
        .get(id)
        .await
        .ok_or_else(|| SyncError::not_found(format!("project {}", id)))?;

    let tasks_file = record.tasks_file_path.as_path();
    let data = load_document(tasks_file, state.config.max_file_bytes).await?;
    state.watchers.commit(id, data).await;
    state.watchers.watch(id, tasks_file).await?;

    info!("[projects] re-attached watcher for {}", id);
    get_project(state, id).await
}

pub async fn health(state: &AppState) -> HealthReport {
    HealthReport {
        status: "ok",
        project_count: state.registry.count().await,
        connections: state.hub.connection_count().await,
        uptime: state.started_at.elapsed().as_secs(),
    }
}

/// Drain a discovery stream, registering every project it finds. Ids that
/// fail to add (already registered, bad path, unreadable file) are reported
/// as skipped.
pub async fn import_discovered(
    state: &AppState,
    mut events: mpsc::Receiver<DiscoveryEvent>,
) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();

    while let Some(event) = events.recv().await {
        match event {
            DiscoveryEvent::Progress {
                scanned,
                found,
                current,
            } => {
                log::debug!(
                    "[discovery] scanned {} dirs, found {} ({:?})",
                    scanned,
                    found,
                    current
                );
            }
            DiscoveryEvent::Found(descriptor) => {
                let id = descriptor.id.clone();
                let request = AddProjectRequest {
                    id: descriptor.id,
                    name: descriptor.name,
                    path: descriptor.path.to_string_lossy().into_owned(),
                    tasks_file: Some(descriptor.tasks_file.to_string_lossy().into_owned()),
                };
                match add_project(state, request).await {
                    Ok(_) => report.added.push(id),
                    Err(err) => {
                        warn!("[discovery] skipping {}: {}", id, err);
                        report.skipped.push(SkippedProject {
                            id,
                            reason: err.to_string(),
                        });
                    }
                }
            }
            DiscoveryEvent::Complete { total } => {
                info!("[discovery] scan complete, {} candidate(s)", total);
            }
            DiscoveryEvent::Failed { message } => {
                warn!("[discovery] scan failed: {}", message);
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_format() {
        assert!(validate_id("p1").is_ok());
        assert!(validate_id("my_project-2").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("../etc").is_err());
        assert!(validate_id("has space").is_err());
        assert!(validate_id(&"x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn project_locks_serialize_one_id() {
        let locks = Arc::new(ProjectLocks::default());
        let held = locks.acquire("p1").await;

        let waiter = tokio::spawn({
            let locks = Arc::clone(&locks);
            async move {
                let _op = locks.acquire("p1").await;
            }
        });
        let _other = locks.acquire("p2").await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap();
    }

    #[test]
    fn name_must_not_be_blank() {
        assert!(validate_name("Project").is_ok());
        assert!(validate_name("   ").is_err());
    }
}
