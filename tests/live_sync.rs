use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use tasksync_lib::{
    AddProjectRequest, DiscoveryEvent, DiscoverySource, ProjectDescriptor, ServerConfig,
    SyncServer,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn tasks_file(root: &Path) -> PathBuf {
    root.join("tasks").join("tasks.json")
}

fn write_tasks(root: &Path, body: &str) {
    let file = tasks_file(root);
    std::fs::create_dir_all(file.parent().unwrap()).unwrap();
    std::fs::write(file, body).unwrap();
}

fn request(id: &str, root: &Path) -> AddProjectRequest {
    AddProjectRequest {
        id: id.to_string(),
        name: format!("Project {}", id),
        path: root.to_string_lossy().into_owned(),
        tasks_file: None,
    }
}

async fn start(config: ServerConfig) -> (SyncServer, SocketAddr) {
    let mut server = SyncServer::new(config.with_port(0));
    let addr = server.start().await.unwrap();
    (server, addr)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{}/", addr)).await.unwrap();
    client
}

async fn wait_for_connections(server: &SyncServer, expected: usize) {
    for _ in 0..100 {
        if server.state().hub.connection_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("hub never reached {} connection(s)", expected);
}

/// Next text frame as JSON, or `None` if nothing arrives within `wait`.
async fn next_update(client: &mut Client, wait: Duration) -> Option<Value> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let frame = tokio::time::timeout_at(deadline, client.next()).await.ok()??;
        match frame.unwrap() {
            Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn file_change_reaches_client_once() {
    let root = tempfile::tempdir().unwrap();
    write_tasks(root.path(), r#"{"tasks":[]}"#);
    let (mut server, addr) = start(ServerConfig::default()).await;
    server.add_project(request("p1", root.path())).await.unwrap();

    let mut client = connect(addr).await;
    wait_for_connections(&server, 1).await;

    write_tasks(root.path(), r#"{"tasks":[{"id":1}]}"#);

    let update = next_update(&mut client, Duration::from_secs(5))
        .await
        .expect("no fileUpdate received");
    assert_eq!(update["type"], "fileUpdate");
    assert_eq!(update["projectId"], "p1");
    assert_eq!(update["data"], json!({"tasks": [{"id": 1}]}));
    assert!(update["timestamp"].is_string());

    assert!(next_update(&mut client, Duration::from_millis(500)).await.is_none());

    let project = server.get_project("p1").await.unwrap();
    assert_eq!(project.task_count, 1);
    server.stop().await;
}

#[tokio::test]
async fn removed_project_goes_quiet() {
    let root = tempfile::tempdir().unwrap();
    write_tasks(root.path(), r#"{"tasks":[]}"#);
    let (mut server, addr) = start(ServerConfig::default()).await;
    server.add_project(request("p1", root.path())).await.unwrap();

    let mut client = connect(addr).await;
    wait_for_connections(&server, 1).await;

    server.remove_project("p1").await.unwrap();
    write_tasks(root.path(), r#"{"tasks":[{"id":1}]}"#);

    assert!(next_update(&mut client, Duration::from_millis(600)).await.is_none());
    assert!(server.get_project("p1").await.is_err());
    server.stop().await;
}

#[tokio::test]
async fn connection_ceiling_rejects_with_503() {
    let (mut server, addr) = start(ServerConfig::default().with_max_connections(1)).await;

    let _first = connect(addr).await;
    wait_for_connections(&server, 1).await;

    match connect_async(format!("ws://{}/", addr)).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 503),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("second connection should be refused"),
    }
    assert_eq!(server.state().hub.connection_count().await, 1);
    server.stop().await;
}

#[tokio::test]
async fn disallowed_origin_is_forbidden() {
    let config = ServerConfig::default().with_allowed_origins(["http://localhost:5173"]);
    let (mut server, addr) = start(config).await;

    let mut request = format!("ws://{}/", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "https://evil.example".parse().unwrap());
    match connect_async(request).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 403),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("foreign origin should be refused"),
    }

    let mut request = format!("ws://{}/", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "http://localhost:5173".parse().unwrap());
    assert!(connect_async(request).await.is_ok());
    server.stop().await;
}

#[tokio::test]
async fn silent_client_is_reaped() {
    let config = ServerConfig::default().with_heartbeat_interval(Duration::from_millis(100));
    let (mut server, addr) = start(config).await;

    // Never polled, so pings go unanswered.
    let _client = connect(addr).await;
    wait_for_connections(&server, 1).await;
    wait_for_connections(&server, 0).await;
    server.stop().await;
}

#[tokio::test]
async fn zero_heartbeat_still_frees_closed_sessions() {
    let config = ServerConfig::default().with_heartbeat_interval(Duration::ZERO);
    let (mut server, addr) = start(config).await;

    for _ in 0..3 {
        let mut client = connect(addr).await;
        // Polling answers the pings.
        let reader = tokio::spawn(async move { while client.next().await.is_some() {} });
        wait_for_connections(&server, 1).await;
        reader.abort();
        wait_for_connections(&server, 0).await;
    }
    assert!(server.state().hub.has_capacity().await);
    server.stop().await;
}

#[tokio::test]
async fn stop_sends_normal_closure() {
    let (mut server, addr) = start(ServerConfig::default()).await;
    let mut client = connect(addr).await;
    wait_for_connections(&server, 1).await;

    let reader = tokio::spawn(async move {
        while let Some(frame) = client.next().await {
            if let Ok(Message::Close(frame)) = frame {
                return frame.map(|frame| frame.code);
            }
        }
        None
    });

    server.stop().await;
    let code = tokio::time::timeout(Duration::from_secs(3), reader)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(code, Some(CloseCode::Normal));
    assert_eq!(server.state().hub.connection_count().await, 0);
    assert_eq!(server.state().watchers.active_count().await, 0);
}

struct FixedSource {
    found: Vec<ProjectDescriptor>,
}

#[async_trait]
impl DiscoverySource for FixedSource {
    async fn discover(
        &self,
        roots: Vec<PathBuf>,
        events: mpsc::Sender<DiscoveryEvent>,
    ) -> anyhow::Result<()> {
        events
            .send(DiscoveryEvent::Progress {
                scanned: roots.len(),
                found: self.found.len(),
                current: roots.first().cloned(),
            })
            .await?;
        for descriptor in &self.found {
            events.send(DiscoveryEvent::Found(descriptor.clone())).await?;
        }
        events
            .send(DiscoveryEvent::Complete {
                total: self.found.len(),
            })
            .await?;
        Ok(())
    }
}

#[tokio::test]
async fn discovery_registers_found_projects() {
    let good = tempfile::tempdir().unwrap();
    write_tasks(good.path(), r#"{"tasks":[{"id":1},{"id":2}]}"#);
    let empty = tempfile::tempdir().unwrap();

    let source = FixedSource {
        found: vec![
            ProjectDescriptor {
                id: "good".to_string(),
                name: "Good".to_string(),
                path: good.path().to_path_buf(),
                tasks_file: tasks_file(good.path()),
            },
            ProjectDescriptor {
                id: "empty".to_string(),
                name: "Empty".to_string(),
                path: empty.path().to_path_buf(),
                tasks_file: tasks_file(empty.path()),
            },
        ],
    };

    let server = SyncServer::new(ServerConfig::default());
    let report = server
        .discover(Arc::new(source), vec![good.path().to_path_buf()])
        .await;

    assert_eq!(report.added, vec!["good".to_string()]);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].id, "empty");
    assert_eq!(server.get_project("good").await.unwrap().task_count, 2);
}
