pub mod commands;
pub mod config;
pub mod error;
pub mod web;
pub mod web_server;

pub use commands::discovery::{DiscoveryEvent, DiscoveryReport, DiscoverySource, ProjectDescriptor};
pub use commands::projects::{AddProjectRequest, HealthReport, ProjectDetails};
pub use commands::registry::{ProjectRecord, ProjectSummary};
pub use config::ServerConfig;
pub use error::{Result, SyncError};
pub use web::BroadcastMessage;
pub use web_server::{create_router, start_web_mode, SyncServer};
