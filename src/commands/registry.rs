//! In-memory project registry.
//!
//! Pure data: the registry never starts or stops watchers. Callers pair
//! `remove` with [`super::watch_manager::WatchManager::unwatch`].

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use super::path_guard::SafePath;
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub tasks_file_path: SafePath,
    pub data: Value,
    pub last_updated: DateTime<Utc>,
}

impl ProjectRecord {
    pub fn new(id: String, name: String, path: PathBuf, tasks_file_path: SafePath, data: Value) -> Self {
        Self {
            id,
            name,
            path,
            tasks_file_path,
            data,
            last_updated: Utc::now(),
        }
    }

    pub fn task_count(&self) -> usize {
        count_tasks(&self.data)
    }

    pub fn summary(&self) -> ProjectSummary {
        ProjectSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            path: self.path.clone(),
            task_count: self.task_count(),
            last_updated: self.last_updated,
        }
    }
}

/// Lightweight projection returned by list calls. Never carries the payload.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub task_count: usize,
    pub last_updated: DateTime<Utc>,
}

/// Counts `tasks` in either the flat layout (`{"tasks": [...]}`) or the
/// tagged one (`{"master": {"tasks": [...]}, "feature-x": {...}}`).
pub fn count_tasks(data: &Value) -> usize {
    if let Some(tasks) = data.get("tasks").and_then(Value::as_array) {
        return tasks.len();
    }
    data.as_object()
        .map(|tags| {
            tags.values()
                .filter_map(|tag| tag.get("tasks").and_then(Value::as_array))
                .map(Vec::len)
                .sum()
        })
        .unwrap_or(0)
}

#[derive(Default)]
pub struct ProjectRegistry {
    projects: RwLock<HashMap<String, ProjectRecord>>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record. An existing id is left untouched.
    pub async fn add(&self, record: ProjectRecord) -> Result<()> {
        let mut projects = self.projects.write().await;
        if projects.contains_key(&record.id) {
            return Err(SyncError::Conflict { id: record.id });
        }
        projects.insert(record.id.clone(), record);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<ProjectRecord> {
        self.projects.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.projects.read().await.contains_key(id)
    }

    pub async fn list(&self) -> Vec<ProjectSummary> {
        let projects = self.projects.read().await;
        let mut summaries: Vec<ProjectSummary> =
            projects.values().map(ProjectRecord::summary).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.projects.write().await.remove(id).is_some()
    }

    /// Replace the cached document. Returns `false` if the project is gone.
    pub async fn update_data(&self, id: &str, data: Value, at: DateTime<Utc>) -> bool {
        match self.projects.write().await.get_mut(id) {
            Some(record) => {
                record.data = data;
                record.last_updated = at;
                true
            }
            None => false,
        }
    }

    pub async fn count(&self) -> usize {
        self.projects.read().await.len()
    }
}
