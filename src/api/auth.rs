//! Webhook authentication and per-IP rate limiting for the control API
//! (spec.md §6).
//!
//! `constant_time_eq` and the rejection-as-`IntoResponse` shape are adapted
//! from the teacher pack's bearer-token middleware; the sliding-window
//! limiter with burst allowance is adapted from `RateLimitLayer` in the
//! `cooprefr-bettersys` example, substituting `parking_lot::Mutex` for the
//! same reason that example uses it: the lock is held only across a few
//! arithmetic ops, never across an await point.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde_json::json;
use sha2::Sha256;
use tracing::warn;

/// Byte-for-byte comparison that always walks both slices fully, so a
/// mismatch does not return faster the earlier the differing byte is.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn hmac_hex(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Authenticates a webhook call: either the `:token` path segment must
/// equal `hex(HMAC-SHA256(secret, body))`, or the body's `secret` field must
/// equal the shared secret directly, compared in constant time either way.
/// An empty configured secret always rejects (spec.md §7 "missing/invalid
/// secret => 403").
pub fn authenticate_webhook(secret: &str, token_segment: Option<&str>, body_secret: Option<&str>, raw_body: &[u8]) -> bool {
    if secret.is_empty() {
        warn!("webhook auth: WEBHOOK_SECRET is not configured, rejecting all webhook calls");
        return false;
    }
    if let Some(token) = token_segment {
        if let Some(expected) = hmac_hex(secret, raw_body) {
            if constant_time_eq(token.as_bytes(), expected.as_bytes()) {
                return true;
            }
        }
    }
    if let Some(provided) = body_secret {
        if constant_time_eq(provided.as_bytes(), secret.as_bytes()) {
            return true;
        }
    }
    false
}

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl AuthRejection {
    pub fn forbidden(message: &'static str) -> Self {
        Self { status: StatusCode::FORBIDDEN, message }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (self.status, axum::Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub burst: u32,
}

struct RateLimitEntry {
    count: u32,
    window_start: Instant,
}

enum RateLimitResult {
    Allowed,
    BurstUsed,
    Exceeded { retry_after: Duration },
}

/// Per-IP sliding-window limiter shared across all mutating control-API
/// routes (spec.md §6 "10/min per IP on all mutating endpoints").
#[derive(Clone)]
pub struct RateLimitLayer {
    config: RateLimitConfig,
    state: Arc<Mutex<HashMap<IpAddr, RateLimitEntry>>>,
}

impl RateLimitLayer {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, state: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn check(&self, ip: IpAddr) -> RateLimitResult {
        let mut state = self.state.lock();
        let now = Instant::now();

        let entry = state.entry(ip).or_insert(RateLimitEntry { count: 0, window_start: now });
        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;

        let limit = self.config.max_requests + self.config.burst;
        let reset_at = entry.window_start + self.config.window;

        if entry.count > limit {
            RateLimitResult::Exceeded { retry_after: reset_at.duration_since(now) }
        } else if entry.count > self.config.max_requests {
            RateLimitResult::BurstUsed
        } else {
            RateLimitResult::Allowed
        }
    }

    /// Evicts IPs that have been idle for two full windows; callers run this
    /// from a periodic background task so the map does not grow unbounded.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let window = self.config.window;
        state.retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
    }
}

pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(limiter): State<RateLimitLayer>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match limiter.check(addr.ip()) {
        RateLimitResult::Allowed | RateLimitResult::BurstUsed => next.run(request).await,
        RateLimitResult::Exceeded { retry_after } => {
            warn!(ip = %addr.ip(), retry_after_secs = retry_after.as_secs(), "control api: rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.as_secs().to_string())],
                axum::Json(json!({
                    "status": "rate_limited",
                    "retry_after_seconds": retry_after.as_secs(),
                })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_rejects_length_mismatch() {
        assert!(!constant_time_eq(b"short", b"longer-value"));
    }

    #[test]
    fn constant_time_eq_accepts_identical_slices() {
        assert!(constant_time_eq(b"same-secret", b"same-secret"));
    }

    #[test]
    fn authenticate_rejects_empty_configured_secret() {
        assert!(!authenticate_webhook("", None, Some("anything"), b""));
    }

    #[test]
    fn authenticate_accepts_matching_body_secret() {
        assert!(authenticate_webhook("topsecret", None, Some("topsecret"), b"{}"));
    }

    #[test]
    fn authenticate_accepts_matching_hmac_token() {
        let body = br#"{"alert_id":"a1"}"#;
        let expected = hmac_hex("topsecret", body).unwrap();
        assert!(authenticate_webhook("topsecret", Some(&expected), None, body));
    }

    #[test]
    fn authenticate_rejects_wrong_token() {
        let body = br#"{"alert_id":"a1"}"#;
        assert!(!authenticate_webhook("topsecret", Some("wrong"), None, body));
    }

    #[test]
    fn rate_limiter_allows_then_bursts_then_exceeds() {
        let limiter = RateLimitLayer::new(RateLimitConfig { max_requests: 2, window: Duration::from_secs(60), burst: 1 });
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(matches!(limiter.check(ip), RateLimitResult::Allowed));
        assert!(matches!(limiter.check(ip), RateLimitResult::Allowed));
        assert!(matches!(limiter.check(ip), RateLimitResult::BurstUsed));
        assert!(matches!(limiter.check(ip), RateLimitResult::Exceeded { .. }));
    }
}
