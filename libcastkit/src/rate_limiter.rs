//! Rate limiting
//!
//! Two layers:
//! - [`Throttle`] spaces consecutive calls of the same operation inside one
//!   adapter (the in-memory rate-limit cache).
//! - [`HourlyQuota`] caps posts per network per clock hour across runs, backed
//!   by the `rate_windows` table. cast-send consults it before publishing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::db::Database;
use crate::error::Result;

/// Per-operation minimum spacing
///
/// Each operation name (`post`, `like`, `upload`…) has its own clock, so a
/// burst of likes never delays a post.
#[derive(Debug)]
pub struct Throttle {
    default_interval: Duration,
    overrides: HashMap<String, Duration>,
    last_call: Mutex<HashMap<String, Instant>>,
}

impl Throttle {
    pub fn new(default_interval: Duration) -> Self {
        Self {
            default_interval,
            overrides: HashMap::new(),
            last_call: Mutex::new(HashMap::new()),
        }
    }

    /// A throttle that never waits
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn with_interval(mut self, op: &str, interval: Duration) -> Self {
        self.overrides.insert(op.to_string(), interval);
        self
    }

    pub fn interval(&self, op: &str) -> Duration {
        self.overrides
            .get(op)
            .copied()
            .unwrap_or(self.default_interval)
    }

    /// How long a call to `op` made now would have to wait
    pub fn remaining(&self, op: &str) -> Duration {
        let last_call = self.last_call.lock().unwrap_or_else(|p| p.into_inner());
        match last_call.get(op) {
            Some(last) => {
                let next = *last + self.interval(op);
                next.saturating_duration_since(Instant::now())
            }
            None => Duration::ZERO,
        }
    }

    /// Wait until `op` may run, then record the call
    ///
    /// The slot is reserved before sleeping so concurrent callers queue up
    /// behind each other instead of all waking at the same instant.
    pub async fn acquire(&self, op: &str) {
        let wait = {
            let mut last_call = self.last_call.lock().unwrap_or_else(|p| p.into_inner());
            let now = Instant::now();
            let slot = match last_call.get(op) {
                Some(last) => (*last + self.interval(op)).max(now),
                None => now,
            };
            last_call.insert(op.to_string(), slot);
            slot.saturating_duration_since(now)
        };

        if !wait.is_zero() {
            tracing::debug!(op, wait_ms = wait.as_millis() as u64, "throttling");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Posts-per-hour quotas persisted in SQLite
pub struct HourlyQuota {
    limits: HashMap<String, u32>,
}

impl HourlyQuota {
    /// `limits` maps network name to posts per hour; unlisted networks are unlimited
    pub fn new(limits: HashMap<String, u32>) -> Self {
        Self { limits }
    }

    pub fn limit(&self, network: &str) -> Option<u32> {
        self.limits.get(network).copied()
    }

    pub async fn check(&self, db: &Database, network: &str, now: i64) -> Result<bool> {
        let Some(limit) = self.limit(network) else {
            return Ok(true);
        };
        let count = db.rate_window_count(network, window_start(now)).await?;
        Ok(count < limit)
    }

    pub async fn record(&self, db: &Database, network: &str, now: i64) -> Result<()> {
        db.increment_rate_window(network, window_start(now)).await
    }

    /// Returns false, recording nothing, when the quota is used up
    pub async fn check_and_record(&self, db: &Database, network: &str, now: i64) -> Result<bool> {
        if !self.check(db, network, now).await? {
            return Ok(false);
        }
        self.record(db, network, now).await?;
        Ok(true)
    }

    /// Drop windows that ended before `cutoff`
    pub async fn cleanup_old_windows(&self, db: &Database, cutoff: i64) -> Result<u64> {
        db.delete_rate_windows_before(window_start(cutoff)).await
    }
}

/// Start of the hourly window containing `timestamp`
pub fn window_start(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(3600)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_start_floors_to_hour() {
        assert_eq!(window_start(0), 0);
        assert_eq!(window_start(3599), 0);
        assert_eq!(window_start(3600), 3600);
        assert_eq!(window_start(7322), 7200);
    }

    #[tokio::test]
    async fn test_throttle_spaces_same_operation() {
        let throttle = Throttle::new(Duration::from_millis(50));
        let start = Instant::now();
        throttle.acquire("post").await;
        throttle.acquire("post").await;
        throttle.acquire("post").await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_throttle_operations_are_independent() {
        let throttle = Throttle::new(Duration::from_secs(60));
        throttle.acquire("post").await;
        assert!(throttle.remaining("post") > Duration::from_secs(50));
        assert_eq!(throttle.remaining("like"), Duration::ZERO);

        let start = Instant::now();
        throttle.acquire("like").await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_throttle_override() {
        let throttle = Throttle::new(Duration::from_secs(60)).with_interval("like", Duration::ZERO);
        assert_eq!(throttle.interval("like"), Duration::ZERO);
        assert_eq!(throttle.interval("post"), Duration::from_secs(60));
        throttle.acquire("like").await;
        assert_eq!(throttle.remaining("like"), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_disabled_throttle_never_waits() {
        let throttle = Throttle::disabled();
        for _ in 0..5 {
            throttle.acquire("post").await;
        }
        assert_eq!(throttle.remaining("post"), Duration::ZERO);
    }

    fn quota(limit: u32) -> HourlyQuota {
        let mut limits = HashMap::new();
        limits.insert("x".to_string(), limit);
        HourlyQuota::new(limits)
    }

    #[tokio::test]
    async fn test_quota_blocks_after_limit() {
        let db = Database::in_memory().await.unwrap();
        let quota = quota(3);
        let now = 1_700_000_000;
        for i in 0..3 {
            assert!(quota.check_and_record(&db, "x", now).await.unwrap(), "post {}", i);
        }
        assert!(!quota.check_and_record(&db, "x", now).await.unwrap());
        assert_eq!(db.rate_window_count("x", window_start(now)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_quota_resets_next_hour() {
        let db = Database::in_memory().await.unwrap();
        let quota = quota(1);
        let now = 1_700_000_000;
        assert!(quota.check_and_record(&db, "x", now).await.unwrap());
        assert!(!quota.check(&db, "x", now).await.unwrap());
        assert!(quota.check(&db, "x", now + 3600).await.unwrap());
    }

    #[tokio::test]
    async fn test_unlisted_network_is_unlimited() {
        let db = Database::in_memory().await.unwrap();
        let quota = quota(0);
        assert!(!quota.check(&db, "x", 0).await.unwrap());
        assert!(quota.check(&db, "telegram", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_old_windows() {
        let db = Database::in_memory().await.unwrap();
        let quota = quota(10);
        quota.record(&db, "x", 3600).await.unwrap();
        quota.record(&db, "x", 36_000).await.unwrap();
        assert_eq!(quota.cleanup_old_windows(&db, 36_000).await.unwrap(), 1);
    }
}
