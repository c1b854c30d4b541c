//! Rate limiting for backpressure signals.
//!
//! Ensures a job asks its producer for more work at most once per interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Per-key minimum-interval throttle.
#[derive(Clone)]
pub struct BackpressureThrottle {
    interval: Duration,
    last_sent: Arc<RwLock<HashMap<String, Instant>>>,
}

impl BackpressureThrottle {
    /// Create a throttle allowing one signal per `interval` and key.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Whether a signal for `key` may go out now. A `true` answer records the
    /// signal as sent.
    pub async fn check(&self, key: &str) -> bool {
        let mut last_sent = self.last_sent.write().await;
        let now = Instant::now();

        if let Some(at) = last_sent.get(key) {
            if now.duration_since(*at) < self.interval {
                return false;
            }
        }

        last_sent.insert(key.to_string(), now);
        true
    }

    /// Forget a key.
    pub async fn reset(&self, key: &str) {
        self.last_sent.write().await.remove(key);
    }

    /// Clean up entries whose interval has long passed.
    pub async fn cleanup(&self) {
        let mut last_sent = self.last_sent.write().await;
        let now = Instant::now();
        let interval = self.interval;

        last_sent.retain(|_, at| now.duration_since(*at) < interval * 2);
    }

    /// Number of tracked keys.
    pub async fn tracked(&self) -> usize {
        self.last_sent.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_signal_within_interval_is_suppressed() {
        let throttle = BackpressureThrottle::new(Duration::from_secs(10));

        assert!(throttle.check("job1").await);
        assert!(!throttle.check("job1").await);
        assert_eq!(throttle.tracked().await, 1);
    }

    #[tokio::test]
    async fn test_separate_keys() {
        let throttle = BackpressureThrottle::new(Duration::from_secs(10));

        assert!(throttle.check("job1").await);
        assert!(throttle.check("job2").await);
        assert_eq!(throttle.tracked().await, 2);
    }

    #[tokio::test]
    async fn test_reset() {
        let throttle = BackpressureThrottle::new(Duration::from_secs(10));

        throttle.check("job1").await;
        throttle.reset("job1").await;
        assert!(throttle.check("job1").await);
    }

    #[tokio::test]
    async fn test_zero_interval_never_throttles() {
        let throttle = BackpressureThrottle::new(Duration::ZERO);

        assert!(throttle.check("job1").await);
        assert!(throttle.check("job1").await);
        throttle.cleanup().await;
        assert_eq!(throttle.tracked().await, 0);
    }
}
