//! Per-source minimum-gap rate limiting.
//!
//! Each source name gets its own async mutex holding the completion time of the
//! last permitted call. The lock is held across the sleep, so concurrent callers
//! for the same source queue up and are released one interval apart, while
//! callers for different sources never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// Minimum gap between two calls to the same source.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<Instant>>>>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn slot(&self, source: &str) -> Arc<tokio::sync::Mutex<Option<Instant>>> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }

    /// Wait until a call to `source` is permitted, then record it.
    pub async fn acquire(&self, source: &str) {
        let slot = self.slot(source);
        let mut last = slot.lock().await;

        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.interval {
                let wait = self.interval - elapsed;
                tracing::info!("Rate limiting {}: sleeping for {:.2}s", source, wait.as_secs_f64());
                tokio::time::sleep(wait).await;
            }
        }

        *last = Some(Instant::now());
        tracing::debug!("API call permitted for {}", source);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_call_is_immediate() {
        let limiter = RateLimiter::default();
        let start = Instant::now();
        limiter.acquire("pubmed").await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_calls_are_spaced() {
        let limiter = RateLimiter::default();
        let mut completions = Vec::new();
        for _ in 0..4 {
            limiter.acquire("arxiv").await;
            completions.push(Instant::now());
        }
        for pair in completions.windows(2) {
            assert!(pair[1] - pair[0] >= DEFAULT_INTERVAL);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sources_are_independent() {
        let limiter = RateLimiter::default();
        limiter.acquire("pubmed").await;
        let start = Instant::now();
        limiter.acquire("arxiv").await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_time_counts_toward_interval() {
        let limiter = RateLimiter::default();
        limiter.acquire("nsf").await;
        tokio::time::advance(Duration::from_millis(1500)).await;
        let start = Instant::now();
        limiter.acquire("nsf").await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(500));
        assert!(waited < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_same_source_are_serialized() {
        let limiter = Arc::new(RateLimiter::default());
        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire("semantic_scholar").await;
                Instant::now()
            }));
        }

        let mut completions = Vec::new();
        for handle in handles {
            completions.push(handle.await.unwrap());
        }
        completions.sort();
        for pair in completions.windows(2) {
            assert!(pair[1] - pair[0] >= DEFAULT_INTERVAL);
        }
    }
}
