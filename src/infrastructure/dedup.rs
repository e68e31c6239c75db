//! In-process idempotency cache for admitted signal alert ids (spec.md §3,
//! §9 "external KV is an explicit non-goal"). `is_degraded` always reports
//! `true`: there is no external store to fail over from, so the dedup gate
//! is never the strong idempotency guarantee a shared KV would provide.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::ports::Dedup;

pub struct InProcessDedup {
    expiries: Mutex<HashMap<String, Instant>>,
}

impl InProcessDedup {
    pub fn new() -> Self {
        Self { expiries: Mutex::new(HashMap::new()) }
    }

    fn evict_expired(expiries: &mut HashMap<String, Instant>) {
        let now = Instant::now();
        expiries.retain(|_, expires_at| *expires_at > now);
    }
}

impl Default for InProcessDedup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dedup for InProcessDedup {
    async fn has(&self, id: &str) -> Result<bool> {
        let mut expiries = self.expiries.lock().await;
        Self::evict_expired(&mut expiries);
        Ok(expiries.contains_key(id))
    }

    async fn set(&self, id: &str, ttl: Duration) -> Result<()> {
        let mut expiries = self.expiries.lock().await;
        expiries.insert(id.to_string(), Instant::now() + ttl);
        Ok(())
    }

    fn is_degraded(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_has_reports_true_until_ttl_elapses() {
        let dedup = InProcessDedup::new();
        assert!(!dedup.has("a1").await.unwrap());
        dedup.set("a1", Duration::from_millis(20)).await.unwrap();
        assert!(dedup.has("a1").await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!dedup.has("a1").await.unwrap());
    }

    #[test]
    fn always_reports_degraded() {
        let dedup = InProcessDedup::new();
        assert!(dedup.is_degraded());
    }
}
