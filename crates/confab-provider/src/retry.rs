use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;

use crate::{is_retryable, LlmBackend};

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const MAX_JITTER_MS: u64 = 500;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_delay: MIN_BACKOFF,
            max_delay: MAX_BACKOFF,
        }
    }

    /// Exponential delay for the given 1-based attempt, plus uniform jitter.
    pub fn delay(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as u32;
        let base = self
            .min_delay
            .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_MS);
        base + Duration::from_millis(jitter)
    }
}

/// Wraps any backend with the bounded exponential-backoff retry schedule.
/// Only retryable failures (429/5xx/timeout/connect) are re-attempted.
pub struct Retrying<B> {
    inner: B,
    policy: RetryPolicy,
}

impl<B> Retrying<B> {
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<B: LlmBackend> LlmBackend for Retrying<B> {
    async fn query(&self, prompt: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.query(prompt).await {
                Ok(text) => return Ok(text),
                Err(err) if attempt < self.policy.max_attempts && is_retryable(&err) => {
                    let delay = self.policy.delay(attempt);
                    tracing::warn!(
                        backend = self.inner.name(),
                        attempt,
                        max = self.policy.max_attempts,
                        "retryable backend error, backing off {}ms: {err:#}",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
