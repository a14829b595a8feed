// Copyright (c) James Kassemi, SC, US. All rights reserved.

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Jittered exponential backoff for units of work that can lose a lock race.
///
/// Only errors the caller classifies as retryable are retried; everything
/// else propagates on the first attempt. The additive jitter keeps two
/// writers that deadlocked against each other from retrying in lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64, jitter_ms: u64) -> Self {
        let clamped_attempts = max_attempts.max(1);
        let clamped_base = base_delay_ms.max(1);
        let clamped_max_delay = max_delay_ms.max(clamped_base);
        Self {
            max_attempts: clamped_attempts,
            base_delay_ms: clamped_base,
            max_delay_ms: clamped_max_delay,
            jitter_ms,
        }
    }

    /// Policy used for per-(symbol, expiration) ingestion transactions.
    pub fn default_ingest() -> Self {
        Self::new(3, 100, 5_000, 100)
    }

    fn next_delay(&self, attempt: usize) -> Duration {
        let exp = 2_u64.saturating_pow(attempt as u32);
        let mut delay = self.base_delay_ms.saturating_mul(exp);
        if delay > self.max_delay_ms {
            delay = self.max_delay_ms;
        }
        if self.jitter_ms > 0 {
            let mut rng = rand::thread_rng();
            delay = delay.saturating_add(rng.gen_range(0..=self.jitter_ms));
        }
        Duration::from_millis(delay)
    }

    /// Run `op` until it succeeds, it fails with a non-retryable error, or
    /// `max_attempts` attempts are exhausted. The last error is returned
    /// unchanged.
    pub async fn retry_if<F, Fut, T, E, R>(&self, mut op: F, is_retryable: R) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(val) => return Ok(val),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !is_retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.next_delay(attempt - 1);
                    sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_ingest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn new_clamps_input_parameters() {
        let policy = RetryPolicy::new(0, 0, 0, 0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay_ms, 1);
        assert_eq!(policy.max_delay_ms, 1);
    }

    #[test]
    fn next_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, 100, 500, 0);
        let delays: Vec<_> = (0..5).map(|attempt| policy.next_delay(attempt)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[3], Duration::from_millis(500)); // capped
        assert_eq!(delays[4], Duration::from_millis(500));
    }

    #[test]
    fn next_delay_jitter_stays_within_bound() {
        let policy = RetryPolicy::new(3, 100, 5_000, 100);
        for attempt in 0..3 {
            let delay = policy.next_delay(attempt);
            let base = 100 * 2_u64.pow(attempt as u32);
            assert!(delay >= Duration::from_millis(base));
            assert!(delay <= Duration::from_millis(base + 100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_retryable_errors_until_success() {
        let policy = RetryPolicy::new(3, 10, 10, 0);
        let attempts = Arc::new(AtomicUsize::new(0));
        let result: Result<&'static str, &str> = policy
            .retry_if(
                |attempt| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        if attempt < 2 {
                            Err("deadlock")
                        } else {
                            Ok("ok")
                        }
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts() {
        let policy = RetryPolicy::new(3, 5, 5, 0);
        let attempts = Arc::new(AtomicUsize::new(0));
        let result: Result<(), &str> = policy
            .retry_if(
                |_| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err("deadlock")
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(result, Err("deadlock"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_propagate_immediately() {
        let policy = RetryPolicy::new(5, 5, 5, 0);
        let attempts = Arc::new(AtomicUsize::new(0));
        let result: Result<(), &str> = policy
            .retry_if(
                |_| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err("constraint violation")
                    }
                },
                |err: &&str| *err == "deadlock",
            )
            .await;
        assert_eq!(result, Err("constraint violation"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
