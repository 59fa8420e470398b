use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A candidate project yielded by a discovery scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDescriptor {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub tasks_file: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DiscoveryEvent {
    Progress {
        scanned: usize,
        found: usize,
        current: Option<PathBuf>,
    },
    Found(ProjectDescriptor),
    Complete {
        total: usize,
    },
    Failed {
        message: String,
    },
}

/// A scanner that walks `roots` and reports what it sees on `events`.
///
/// The scanning strategy belongs to the implementation; the server only
/// consumes the events.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn discover(
        &self,
        roots: Vec<PathBuf>,
        events: mpsc::Sender<DiscoveryEvent>,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    pub added: Vec<String>,
    pub skipped: Vec<SkippedProject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedProject {
    pub id: String,
    pub reason: String,
}
