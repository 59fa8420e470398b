use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocket;
use axum::http::{header, HeaderMap, StatusCode};
use axum::{
    extract::{Path, State as AxumState, WebSocketUpgrade},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post, MethodRouter},
    Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tower::ServiceBuilder;

use crate::commands::discovery::{DiscoveryEvent, DiscoveryReport, DiscoverySource};
use crate::commands::path_guard::PathGuard;
use crate::commands::projects::{
    self, AddProjectRequest, HealthReport, ProjectDetails, ProjectLocks,
};
use crate::commands::registry::{ProjectRegistry, ProjectSummary};
use crate::commands::watch_manager::{WatchManager, WatchOptions};
use crate::config::ServerConfig;
use crate::error::{Result, SyncError};
use crate::web::gates::{self, OriginPolicy, RateLimiter};
use crate::web::hub::ConnectionHub;
use crate::web::{AppState, BroadcastMessage};

/// Add a project and start watching its tasks file
async fn create_project(
    AxumState(state): AxumState<AppState>,
    payload: std::result::Result<Json<AddProjectRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ProjectDetails>)> {
    let Json(request) = payload.map_err(|e| SyncError::Validation(e.body_text()))?;
    let project = projects::add_project(&state, request).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// List registered projects without their task payloads
async fn get_projects(AxumState(state): AxumState<AppState>) -> Json<Vec<ProjectSummary>> {
    Json(projects::list_projects(&state).await)
}

async fn get_project(
    Path(id): Path<String>,
    AxumState(state): AxumState<AppState>,
) -> Result<Json<ProjectDetails>> {
    Ok(Json(projects::get_project(&state, &id).await?))
}

async fn delete_project(
    Path(id): Path<String>,
    AxumState(state): AxumState<AppState>,
) -> Result<Json<serde_json::Value>> {
    projects::remove_project(&state, &id).await?;
    Ok(Json(json!({ "success": true })))
}

/// Re-attach a watcher after it failed
async fn rewatch_project(
    Path(id): Path<String>,
    AxumState(state): AxumState<AppState>,
) -> Result<Json<ProjectDetails>> {
    Ok(Json(projects::rewatch_project(&state, &id).await?))
}

async fn get_health(AxumState(state): AxumState<AppState>) -> Json<HealthReport> {
    Json(projects::health(&state).await)
}

/// Router for the projects collection
fn projects_router() -> MethodRouter<AppState> {
    MethodRouter::<AppState>::new()
        .get(get_projects)
        .post(create_project)
}

/// Router for single project operations
fn project_router() -> MethodRouter<AppState> {
    MethodRouter::<AppState>::new()
        .get(get_project)
        .delete(delete_project)
}

/// WebSocket upgrade for the live update feed
async fn feed_websocket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    AxumState(state): AxumState<AppState>,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !state.origins.allows(origin) {
        log::warn!("[ws] rejected upgrade from origin {:?}", origin);
        return SyncError::Forbidden(origin.unwrap_or_default().to_string()).into_response();
    }
    if !state.hub.has_capacity().await {
        return SyncError::Unavailable(format!(
            "connection limit of {} reached",
            state.hub.max_connections()
        ))
        .into_response();
    }

    ws.on_upgrade(move |socket| feed_websocket_handler(socket, state))
}

async fn feed_websocket_handler(socket: WebSocket, state: AppState) {
    if let Err(e) = state.hub.accept(socket).await {
        log::warn!("[ws] session not accepted: {}", e);
    }
}

/// Build the shared state with no background tasks running yet. The returned
/// receiver carries committed updates to the hub.
fn build_state(config: ServerConfig) -> (AppState, mpsc::UnboundedReceiver<BroadcastMessage>) {
    let guard = PathGuard::default();
    let registry = Arc::new(ProjectRegistry::new());
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let watchers = Arc::new(WatchManager::new(
        guard.clone(),
        Arc::clone(&registry),
        updates_tx,
        WatchOptions::from(&config),
    ));

    let state = AppState {
        guard,
        registry,
        watchers,
        locks: Arc::new(ProjectLocks::default()),
        hub: Arc::new(ConnectionHub::from_config(&config)),
        origins: OriginPolicy::new(&config.allowed_origins),
        limiter: Arc::new(RateLimiter::new(
            config.rate_limit_window,
            config.rate_limit_max_requests,
        )),
        started_at: Instant::now(),
        config: Arc::new(config),
    };
    (state, updates_rx)
}

/// Build the HTTP + WebSocket router over `state`
pub fn create_router(state: AppState) -> Router {
    let gates = ServiceBuilder::new()
        .layer(state.origins.cors_layer())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            gates::rate_limit_gate,
        ));

    Router::new()
        // WebSocket feed at the root
        .route("/", get(feed_websocket))
        .route("/health", get(get_health))
        .route("/projects", projects_router())
        .route("/projects/{id}", project_router())
        .route("/projects/{id}/watch", post(rewatch_project))
        .layer(gates)
        .with_state(state)
}

struct Running {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    serve: JoinHandle<std::io::Result<()>>,
    forwarder: JoinHandle<()>,
}

/// Composition root: owns every component, runs construct -> start -> stop.
pub struct SyncServer {
    state: AppState,
    updates: Option<mpsc::UnboundedReceiver<BroadcastMessage>>,
    running: Option<Running>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let (state, updates) = build_state(config);
        Self {
            state,
            updates: Some(updates),
            running: None,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// Bind the listener and start forwarding committed updates to the hub.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.running.is_some() {
            return Err(SyncError::Internal("server already started".to_string()));
        }
        let mut updates = self
            .updates
            .take()
            .ok_or_else(|| SyncError::Internal("server cannot be restarted".to_string()))?;

        let addr = self.state.config.bind_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| SyncError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| SyncError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let hub = Arc::clone(&self.state.hub);
        let forwarder = tokio::spawn(async move {
            while let Some(message) = updates.recv().await {
                hub.broadcast(&message).await;
            }
        });

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let app = self.router();
        let serve = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        });

        log::info!("[server] listening on http://{}", local_addr);
        self.running = Some(Running {
            local_addr,
            shutdown,
            serve,
            forwarder,
        });
        Ok(local_addr)
    }

    /// Stop accepting, close every session, detach every watcher and wait for
    /// the listener to drain.
    pub async fn stop(&mut self) {
        let grace = self.state.config.shutdown_grace;
        // The listener stops first so no upgrade lands after `close_all`.
        let running = self.running.take().map(|running| {
            let _ = running.shutdown.send(());
            (running.serve, running.forwarder)
        });

        self.state.hub.close_all("server shutting down", grace).await;
        self.state.watchers.unwatch_all().await;

        let Some((mut serve, forwarder)) = running else {
            return;
        };
        match tokio::time::timeout(grace * 2, &mut serve).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => log::error!("[server] listener exited with error: {}", e),
            Ok(Err(e)) => log::error!("[server] listener task failed: {}", e),
            Err(_) => {
                log::warn!("[server] listener did not drain in time, aborting");
                serve.abort();
            }
        }
        forwarder.abort();
        log::info!("[server] stopped");
    }

    pub async fn add_project(&self, request: AddProjectRequest) -> Result<ProjectDetails> {
        projects::add_project(&self.state, request).await
    }

    pub async fn remove_project(&self, id: &str) -> Result<()> {
        projects::remove_project(&self.state, id).await
    }

    pub async fn get_project(&self, id: &str) -> Result<ProjectDetails> {
        projects::get_project(&self.state, id).await
    }

    pub async fn list_projects(&self) -> Vec<ProjectSummary> {
        projects::list_projects(&self.state).await
    }

    pub async fn rewatch_project(&self, id: &str) -> Result<ProjectDetails> {
        projects::rewatch_project(&self.state, id).await
    }

    pub async fn health(&self) -> HealthReport {
        projects::health(&self.state).await
    }

    pub async fn import_discovered(&self, events: mpsc::Receiver<DiscoveryEvent>) -> DiscoveryReport {
        projects::import_discovered(&self.state, events).await
    }

    /// Run `source` over `roots` and register what it finds.
    pub async fn discover(
        &self,
        source: Arc<dyn DiscoverySource>,
        roots: Vec<PathBuf>,
    ) -> DiscoveryReport {
        let (tx, rx) = mpsc::channel(64);
        let scan = tokio::spawn(async move {
            if let Err(e) = source.discover(roots, tx.clone()).await {
                let _ = tx
                    .send(DiscoveryEvent::Failed {
                        message: e.to_string(),
                    })
                    .await;
            }
        });

        let report = self.import_discovered(rx).await;
        if let Err(e) = scan.await {
            log::error!("[discovery] scan task failed: {}", e);
        }
        report
    }
}

/// Start the server and run until Ctrl-C
pub async fn start_web_mode(config: ServerConfig) -> anyhow::Result<()> {
    let mut server = SyncServer::new(config);
    let addr = server.start().await?;
    println!("tasksync listening on http://{} (WebSocket at ws://{}/)", addr, addr);

    tokio::signal::ctrl_c().await?;
    log::info!("[server] Ctrl-C received, shutting down");
    server.stop().await;
    Ok(())
}
