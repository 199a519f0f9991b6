//! Test helper utilities and common testing patterns

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::time::{sleep, Instant};

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    ///
    /// Uses tokio time, so under a paused runtime the wait advances the mock clock
    /// instead of sleeping for real.
    pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    /// Midnight UTC on 2024-01-01, a convenient anchor for cron tests
    pub fn midnight() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }
}
