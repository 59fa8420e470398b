//! State shared by every route, the error envelope and the frame pushed to
//! WebSocket sessions.

pub mod gates;
pub mod hub;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::commands::path_guard::PathGuard;
use crate::commands::projects::ProjectLocks;
use crate::commands::registry::ProjectRegistry;
use crate::commands::watch_manager::WatchManager;
use crate::config::ServerConfig;
use gates::{OriginPolicy, RateLimiter};
use hub::ConnectionHub;

/// Application state shared across all routes
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub guard: PathGuard,
    /// Project records, the single source of truth for cached task data
    pub registry: Arc<ProjectRegistry>,
    /// One watcher per registered project
    pub watchers: Arc<WatchManager>,
    /// Live WebSocket sessions
    pub hub: Arc<ConnectionHub>,
    /// Per-project serialization of add / remove / rewatch
    pub locks: Arc<ProjectLocks>,
    pub origins: OriginPolicy,
    pub limiter: Arc<RateLimiter>,
    pub started_at: Instant,
}

/// Envelope for error bodies: `{"success": false, "data": null, "error": ..}`.
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn error(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Frame pushed to every session when a watched file settles.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    project_id: String,
    data: Value,
    timestamp: DateTime<Utc>,
}

impl BroadcastMessage {
    pub const FILE_UPDATE: &'static str = "fileUpdate";

    pub fn file_update(project_id: impl Into<String>, data: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: Self::FILE_UPDATE,
            project_id: project_id.into(),
            data,
            timestamp,
        }
    }

    pub fn kind(&self) -> &str {
        self.kind
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
