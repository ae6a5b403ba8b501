use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::now_ms;

const WINDOW_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    window_started_ms: u64,
    accepted: u32,
}

/// Fixed one-minute window per client key. A limit of zero disables it.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    per_minute: u32,
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn enabled(&self) -> bool {
        self.per_minute > 0
    }

    /// Counts one request for `key`. `Err` carries the milliseconds until
    /// the window resets.
    pub fn check(&self, key: &str) -> Result<(), u64> {
        self.check_at(key, now_ms())
    }

    fn check_at(&self, key: &str, now: u64) -> Result<(), u64> {
        if !self.enabled() {
            return Ok(());
        }
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if buckets.len() > 4_096 {
            buckets.retain(|_, bucket| now.saturating_sub(bucket.window_started_ms) < WINDOW_MS);
        }
        let bucket = buckets.entry(key.to_string()).or_default();
        if bucket.window_started_ms == 0
            || now.saturating_sub(bucket.window_started_ms) >= WINDOW_MS
        {
            bucket.window_started_ms = now;
            bucket.accepted = 0;
        }
        if bucket.accepted >= self.per_minute {
            let retry_after = WINDOW_MS.saturating_sub(now.saturating_sub(bucket.window_started_ms));
            return Err(retry_after);
        }
        bucket.accepted += 1;
        Ok(())
    }
}
