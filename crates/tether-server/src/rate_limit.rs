//! Per-client request metering.
//!
//! Every request costs one credit plus one credit per started MiB of its
//! declared body, so a client pushing a large snapshot drains its bucket
//! faster than one asking `filesSend` questions.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, State},
    http::{header::CONTENT_LENGTH, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;
use tracing::warn;

const CREDIT_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
struct Allowance {
    credits: f64,
    updated: Instant,
}

impl Allowance {
    fn refill(&mut self, now: Instant, per_sec: f64, burst: f64) {
        let elapsed = now.duration_since(self.updated).as_secs_f64();
        self.credits = (self.credits + elapsed * per_sec).min(burst);
        self.updated = now;
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    clients: Arc<Mutex<HashMap<IpAddr, Allowance>>>,
    per_sec: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(per_sec: f64, burst: f64) -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            per_sec,
            burst,
        }
    }

    /// Take `cost` credits from `ip`. A cost above the burst size is capped
    /// to it so one oversized upload can still get through a full bucket.
    pub async fn try_spend(&self, ip: IpAddr, cost: f64) -> bool {
        let now = Instant::now();
        let cost = cost.min(self.burst);
        let mut clients = self.clients.lock().await;
        let allowance = clients.entry(ip).or_insert_with(|| Allowance {
            credits: self.burst,
            updated: now,
        });
        allowance.refill(now, self.per_sec, self.burst);
        if allowance.credits < cost {
            return false;
        }
        allowance.credits -= cost;
        true
    }

    /// Forget clients that have been quiet for `idle`.
    pub async fn forget_idle(&self, idle: Duration) {
        let now = Instant::now();
        self.clients
            .lock()
            .await
            .retain(|_, a| now.duration_since(a.updated) < idle);
    }

    pub async fn tracked_clients(&self) -> usize {
        self.clients.lock().await.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(50.0, 200.0)
    }
}

/// One credit, plus one per started MiB of `Content-Length`.
pub fn request_cost<B>(req: &Request<B>) -> f64 {
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    (1 + declared.div_ceil(CREDIT_BYTES)) as f64
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(ip) = client_ip(&req) {
        let cost = request_cost(&req);
        if !limiter.try_spend(ip, cost).await {
            warn!(ip = %ip, cost, path = %req.uri().path(), "Rate limit exceeded");
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
    }
    Ok(next.run(req).await)
}

/// ConnectInfo first, then X-Forwarded-For.
fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(addr.ip());
    }
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
}
