//! Keyed request-rate limiting with fixed quota windows.
//!
//! Counters are created on first use and reclaimed lazily: a sweep runs a
//! minute after the first access, refills entries that stayed active, and
//! drops the ones nothing touched for two idle intervals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Sweep interval for idle counter reclamation
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Default quota for password-auth attempts per client address
pub const DEFAULT_AUTH_QUOTA: i64 = 50;

/// Default window for password-auth attempts
pub const DEFAULT_AUTH_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
#[error("rate limited")]
pub struct RateLimitError {
    /// End of the active window
    pub expires: Instant,
}

impl RateLimitError {
    /// Seconds until the client may retry
    pub fn retry_after(&self) -> u64 {
        self.expires
            .saturating_duration_since(Instant::now())
            .as_secs()
            .max(1)
    }
}

/// A single key's remaining allowance
pub struct RlCounter {
    init: i64,
    remaining: AtomicI64,
    expires: Mutex<Instant>,
    touched: AtomicBool,
}

impl RlCounter {
    fn new(quota: i64, expires: Instant) -> Self {
        Self {
            init: quota,
            remaining: AtomicI64::new(quota),
            expires: Mutex::new(expires),
            touched: AtomicBool::new(false),
        }
    }

    /// Consumes one unit of quota
    pub fn use_quota(&self) -> Result<(), RateLimitError> {
        if self.init <= 0 {
            return Ok(());
        }

        if self.remaining.fetch_sub(1, Ordering::SeqCst) - 1 < 0 {
            return Err(RateLimitError {
                expires: *self.expires.lock().unwrap(),
            });
        }

        Ok(())
    }

    /// Restores the full quota. Called after successful validation so that
    /// legitimate clients never burn through their allowance.
    pub fn reset(&self) {
        self.remaining.store(self.init, Ordering::SeqCst);
    }
}

/// Sharded allowance map with lazy cleanup
pub struct RateLimiter {
    quota: i64,
    window: Duration,

    entries: Mutex<HashMap<String, Arc<RlCounter>>>,
    cleanup_scheduled: AtomicBool,
}

impl RateLimiter {
    pub fn new(quota: i64, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            quota,
            window,
            entries: Mutex::new(HashMap::new()),
            cleanup_scheduled: AtomicBool::new(false),
        })
    }

    /// Limiter preset used by proxy slots for password auth
    pub fn with_defaults() -> Arc<Self> {
        Self::new(DEFAULT_AUTH_QUOTA, DEFAULT_AUTH_WINDOW)
    }

    /// Fetches or creates the counter for `key`, extending its window
    pub fn get(self: &Arc<Self>, key: &str) -> Arc<RlCounter> {
        let mut entries = self.entries.lock().unwrap();

        if self
            .cleanup_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let handle = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(CLEANUP_INTERVAL).await;
                if let Some(rl) = Weak::upgrade(&handle) {
                    rl.cleanup();
                }
            });
        }

        let now = Instant::now();

        let ctr = entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RlCounter::new(self.quota, now + self.window)))
            .clone();

        {
            let mut expires = ctr.expires.lock().unwrap();
            if *expires < now {
                ctr.remaining.store(ctr.init, Ordering::SeqCst);
            }
            *expires = now + self.window;
        }

        ctr.touched.store(true, Ordering::SeqCst);

        ctr
    }

    fn cleanup(&self) {
        let mut entries = self.entries.lock().unwrap();

        self.cleanup_scheduled.store(false, Ordering::SeqCst);

        let now = Instant::now();

        entries.retain(|_, ctr| {
            if *ctr.expires.lock().unwrap() >= now {
                return true;
            }

            // refill entries that saw traffic since the last sweep,
            // drop the rest
            if ctr.touched.swap(false, Ordering::SeqCst) {
                ctr.remaining.store(ctr.init, Ordering::SeqCst);
                return true;
            }

            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_quota_exhaustion() {
        let rl = RateLimiter::new(3, Duration::from_secs(60));

        let ctr = rl.get("pw:10.0.0.1");
        for _ in 0..3 {
            ctr.use_quota().expect("quota available");
        }

        assert!(ctr.use_quota().is_err());

        // other keys are unaffected
        assert!(rl.get("pw:10.0.0.2").use_quota().is_ok());
    }

    #[tokio::test]
    async fn test_reset_restores_quota() {
        let rl = RateLimiter::new(2, Duration::from_secs(60));

        let ctr = rl.get("key");
        ctr.use_quota().unwrap();
        ctr.use_quota().unwrap();
        assert!(ctr.use_quota().is_err());

        ctr.reset();
        assert!(ctr.use_quota().is_ok());
    }

    #[tokio::test]
    async fn test_zero_quota_never_limits() {
        let rl = RateLimiter::new(0, Duration::from_secs(60));

        let ctr = rl.get("key");
        for _ in 0..1000 {
            ctr.use_quota().unwrap();
        }
    }

    #[tokio::test]
    async fn test_window_refill() {
        tokio::time::pause();

        let rl = RateLimiter::new(1, Duration::from_secs(10));

        let ctr = rl.get("key");
        ctr.use_quota().unwrap();
        assert!(ctr.use_quota().is_err());

        tokio::time::advance(Duration::from_secs(11)).await;

        // refetch past the window refills the allowance
        let ctr = rl.get("key");
        assert!(ctr.use_quota().is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_reclaims_idle_entries() {
        tokio::time::pause();

        let rl = RateLimiter::new(5, Duration::from_secs(10));
        let _ = rl.get("stale");

        tokio::time::advance(Duration::from_secs(11)).await;

        // first sweep: expired but touched, kept and refilled
        rl.cleanup();
        assert_eq!(rl.entries.lock().unwrap().len(), 1);

        // second sweep with no access in between: dropped
        rl.cleanup();
        assert!(rl.entries.lock().unwrap().is_empty());
    }
}
