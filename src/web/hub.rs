//! Live WebSocket sessions and the broadcast primitive.
//!
//! Every accepted socket is driven by one task that owns both halves of the
//! connection. The hub only keeps the session's outbound channel, so a slow
//! or dead client can never block a broadcast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::BroadcastMessage;
use crate::config::{ServerConfig, MIN_HEARTBEAT_INTERVAL};
use crate::error::{Result, SyncError};

pub type SessionId = String;

/// Close-frame reasons are capped at 123 bytes by the protocol.
const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug)]
pub(crate) enum Outbound {
    Text(Utf8Bytes),
    Close { code: u16, reason: Utf8Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Ping,
    Expired,
}

/// Pong bookkeeping shared between the hub and a session task.
#[derive(Debug)]
pub struct Liveness {
    alive: AtomicBool,
    last_pong_ms: AtomicI64,
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            alive: AtomicBool::new(true),
            last_pong_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }
}

impl Liveness {
    /// Called on every heartbeat tick. A ping that went unanswered since the
    /// previous tick expires the session.
    pub fn on_tick(&self) -> Heartbeat {
        if self.alive.swap(false, Ordering::AcqRel) {
            Heartbeat::Ping
        } else {
            Heartbeat::Expired
        }
    }

    pub fn on_pong(&self) {
        self.alive.store(true, Ordering::Release);
        self.last_pong_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    pub fn last_pong_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_pong_ms.load(Ordering::Acquire))
            .unwrap_or_else(Utc::now)
    }
}

/// Information about an active WebSocket session
struct SessionInfo {
    sender: mpsc::Sender<Outbound>,
    liveness: Arc<Liveness>,
    created_at: Instant,
    abort: Option<AbortHandle>,
}

impl SessionInfo {
    fn terminate(self) {
        if let Some(abort) = self.abort {
            abort.abort();
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct ConnectionHub {
    sessions: Mutex<HashMap<SessionId, SessionInfo>>,
    max_connections: usize,
    heartbeat_interval: Duration,
    send_buffer: usize,
    /// Cleared by `close_all`; no session registers afterwards.
    accepting: AtomicBool,
}

impl ConnectionHub {
    pub fn new(max_connections: usize, heartbeat_interval: Duration, send_buffer: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_connections,
            heartbeat_interval: heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL),
            send_buffer: send_buffer.max(1),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.max_connections,
            config.heartbeat_interval,
            config.send_buffer,
        )
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub async fn connection_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn has_capacity(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
            && self.connection_count().await < self.max_connections
    }

    /// Take ownership of an upgraded socket and start its session task.
    ///
    /// Callers check origin and capacity before upgrading; capacity is checked
    /// again here because concurrent upgrades can race past the first check.
    pub async fn accept(self: &Arc<Self>, mut socket: WebSocket) -> Result<SessionId> {
        let (id, outbound, liveness) = match self.register().await {
            Ok(session) => session,
            Err(err) => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AGAIN,
                        reason: Utf8Bytes::from_static("server at connection limit"),
                    })))
                    .await;
                return Err(err);
            }
        };

        let task = tokio::spawn(run_session(
            Arc::clone(self),
            id.clone(),
            socket,
            outbound,
            liveness,
            self.heartbeat_interval,
        ));
        if let Some(info) = self.sessions.lock().await.get_mut(&id) {
            info.abort = Some(task.abort_handle());
        }
        Ok(id)
    }

    pub(crate) async fn register(
        &self,
    ) -> Result<(SessionId, mpsc::Receiver<Outbound>, Arc<Liveness>)> {
        let mut sessions = self.sessions.lock().await;
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SyncError::Unavailable("server is shutting down".to_string()));
        }
        if sessions.len() >= self.max_connections {
            warn!(
                "[hub] rejecting session, {} of {} connections in use",
                sessions.len(),
                self.max_connections
            );
            return Err(SyncError::Unavailable(format!(
                "connection limit of {} reached",
                self.max_connections
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (sender, outbound) = mpsc::channel(self.send_buffer);
        let liveness = Arc::new(Liveness::default());
        sessions.insert(
            id.clone(),
            SessionInfo {
                sender,
                liveness: Arc::clone(&liveness),
                created_at: Instant::now(),
                abort: None,
            },
        );
        info!(
            "[hub] session {} connected ({} active)",
            id,
            sessions.len()
        );
        Ok((id, outbound, liveness))
    }

    async fn remove(&self, id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(info) = sessions.remove(id) {
            info!(
                "[hub] session {} closed after {:?} ({} active)",
                id,
                info.created_at.elapsed(),
                sessions.len()
            );
        }
    }

    /// Fan a message out to every live session. A session whose channel is
    /// closed or full is dropped on its own; the rest still receive the frame.
    pub async fn broadcast(&self, message: &BroadcastMessage) -> BroadcastReport {
        let frame = match serde_json::to_string(message) {
            Ok(json) => Utf8Bytes::from(json),
            Err(e) => {
                error!("[hub] failed to serialize broadcast: {}", e);
                return BroadcastReport::default();
            }
        };

        let targets: Vec<(SessionId, mpsc::Sender<Outbound>)> = self
            .sessions
            .lock()
            .await
            .iter()
            .map(|(id, info)| (id.clone(), info.sender.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (id, sender) in targets {
            match sender.try_send(Outbound::Text(frame.clone())) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    let reason = match err {
                        TrySendError::Full(_) => "send buffer full",
                        TrySendError::Closed(_) => "connection closed",
                    };
                    warn!("[hub] dropping session {}: {}", id, reason);
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut sessions = self.sessions.lock().await;
            for id in &failed {
                if let Some(info) = sessions.remove(id) {
                    info.terminate();
                }
            }
            report.dropped = failed.len();
        }

        debug!(
            "[hub] {} for {} delivered to {} session(s), {} dropped",
            message.kind(),
            message.project_id(),
            report.delivered,
            report.dropped
        );
        report
    }

    /// Send a normal-closure frame to every session, wait up to `grace` for
    /// them to leave, then terminate whatever is still open.
    /// Registration stays closed afterwards.
    pub async fn close_all(&self, reason: &str, grace: Duration) {
        self.accepting.store(false, Ordering::Release);
        let targets: Vec<mpsc::Sender<Outbound>> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|info| info.sender.clone())
            .collect();
        if targets.is_empty() {
            return;
        }

        info!("[hub] closing {} session(s): {}", targets.len(), reason);
        let reason = Utf8Bytes::from(truncate_reason(reason).to_string());
        for sender in targets {
            let _ = sender.try_send(Outbound::Close {
                code: close_code::NORMAL,
                reason: reason.clone(),
            });
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.connection_count().await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let stragglers: Vec<(SessionId, SessionInfo)> =
            self.sessions.lock().await.drain().collect();
        for (id, info) in stragglers {
            warn!(
                "[hub] force-terminating session {} (last pong {})",
                id,
                info.liveness.last_pong_at()
            );
            info.terminate();
        }
    }
}

fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// Removes its session from the hub when the session task ends, including
/// when the task is aborted or panics.
struct SessionGuard {
    hub: Option<Arc<ConnectionHub>>,
    id: SessionId,
}

impl SessionGuard {
    async fn release(mut self) {
        if let Some(hub) = self.hub.take() {
            hub.remove(&self.id).await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(hub) = self.hub.take() else {
            return;
        };
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { hub.remove(&id).await });
            }
            Err(_) => warn!("[hub] no runtime to release session {}", id),
        }
    }
}

async fn run_session(
    hub: Arc<ConnectionHub>,
    id: SessionId,
    socket: WebSocket,
    mut outbound: mpsc::Receiver<Outbound>,
    liveness: Arc<Liveness>,
    heartbeat: Duration,
) {
    let guard = SessionGuard {
        hub: Some(hub),
        id: id.clone(),
    };
    let (mut sink, mut stream) = socket.split();
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        debug!("[hub] send to {} failed: {}", id, e);
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame { code, reason })))
                        .await;
                }
                None => break,
            },
            _ = ticker.tick() => match liveness.on_tick() {
                Heartbeat::Ping => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
                Heartbeat::Expired => {
                    warn!(
                        "[hub] session {} missed heartbeat (last pong {}), terminating",
                        id,
                        liveness.last_pong_at()
                    );
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Pong(_))) => liveness.on_pong(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("[hub] receive from {} failed: {}", id, e);
                    break;
                }
            },
        }
    }

    guard.release().await;
}
