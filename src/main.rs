//! tasksync server binary
//!
//! ```bash
//! tasksync --port 3001 --allowed-origin http://localhost:5173
//! ```

use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;

use tasksync_lib::{start_web_mode, ServerConfig};

/// Live WebSocket feed for tasks.json files
#[derive(Parser, Debug)]
#[command(name = "tasksync")]
#[command(about = "Watch project tasks files and push changes to WebSocket clients")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "TASKSYNC_PORT", default_value_t = 3001)]
    port: u16,

    /// Host to bind to
    #[arg(long, env = "TASKSYNC_HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    /// Origin admitted for WebSocket upgrades and CORS (repeatable)
    #[arg(long = "allowed-origin", env = "TASKSYNC_ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Maximum concurrent WebSocket sessions
    #[arg(long, env = "TASKSYNC_MAX_CONNECTIONS", default_value_t = 100)]
    max_connections: usize,

    /// Rate limit window in seconds
    #[arg(long, env = "TASKSYNC_RATE_LIMIT_WINDOW", default_value_t = 60)]
    rate_limit_window: u64,

    /// Requests allowed per client per window (0 disables)
    #[arg(long, env = "TASKSYNC_RATE_LIMIT_MAX", default_value_t = 100)]
    rate_limit_max: usize,

    /// Heartbeat interval in seconds
    #[arg(
        long,
        env = "TASKSYNC_HEARTBEAT",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    heartbeat: u64,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::default()
            .with_port(self.port)
            .with_allowed_origins(self.allowed_origins)
            .with_max_connections(self.max_connections)
            .with_rate_limit(Duration::from_secs(self.rate_limit_window), self.rate_limit_max)
            .with_heartbeat_interval(Duration::from_secs(self.heartbeat));
        config.host = self.host;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    log::info!(
        "[main] starting on {} (max {} connections)",
        config.bind_addr(),
        config.max_connections
    );
    start_web_mode(config).await
}
