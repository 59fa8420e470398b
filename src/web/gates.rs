//! Per-request gates that run before any handler: origin policy, CORS and a
//! sliding-window rate limiter keyed by client IP.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, Method, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use super::AppState;
use crate::error::SyncError;

/// Client windows are swept once the map grows past this many entries.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: Arc<Vec<String>>,
}

impl OriginPolicy {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: Arc::new(
                allowed
                    .into_iter()
                    .map(|origin| origin.as_ref().trim_end_matches('/').to_string())
                    .collect(),
            ),
        }
    }

    /// Requests without an `Origin` header come from non-browser clients and
    /// pass. With no configured list only loopback origins are admitted.
    pub fn allows(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        let origin = origin.trim_end_matches('/');
        if self.allowed.is_empty() {
            return is_loopback_origin(origin);
        }
        self.allowed
            .iter()
            .any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(origin))
    }

    pub fn cors_layer(&self) -> CorsLayer {
        let policy = self.clone();
        CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(
                move |origin: &HeaderValue, _parts: &axum::http::request::Parts| {
                    origin
                        .to_str()
                        .map(|origin| policy.allows(Some(origin)))
                        .unwrap_or(false)
                },
            ))
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers(Any)
    }
}

fn is_loopback_origin(origin: &str) -> bool {
    origin
        .parse::<Uri>()
        .ok()
        .and_then(|uri| uri.host().map(str::to_ascii_lowercase))
        .map(|host| matches!(host.as_str(), "localhost" | "127.0.0.1" | "[::1]" | "::1"))
        .unwrap_or(false)
}

/// Sliding-window limiter: at most `max_requests` per client within any
/// `window`-long span.
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    hits: Mutex<HashMap<Option<IpAddr>, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// `max_requests == 0` disables limiting.
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request. `Err` carries how long until the client may retry.
    pub async fn check(&self, client: Option<IpAddr>) -> Result<(), Duration> {
        if self.max_requests == 0 {
            return Ok(());
        }

        let now = Instant::now();
        let mut hits = self.hits.lock().await;
        let window = hits.entry(client).or_default();
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) >= self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.max_requests {
            let retry_after = window
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(retry_after);
        }
        window.push_back(now);

        if hits.len() > PRUNE_THRESHOLD {
            let span = self.window;
            hits.retain(|_, window| {
                window
                    .back()
                    .map(|last| now.duration_since(*last) < span)
                    .unwrap_or(false)
            });
        }
        Ok(())
    }
}

pub async fn rate_limit_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    match state.limiter.check(client).await {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            log::warn!(
                "[gates] rate limit hit for {:?} on {} {}",
                client,
                request.method(),
                request.uri().path()
            );
            SyncError::RateLimited { retry_after }.into_response()
        }
    }
}
