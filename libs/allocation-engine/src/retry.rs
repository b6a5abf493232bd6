use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter for contended `CapacityGuard::reserve`
/// calls. Grounded on the retry loop of a scheduling consistency service
/// that slept a fixed `100ms * attempt` between attempts; this redesigns
/// that into exponential backoff with jitter so concurrent losers don't
/// wake up in lockstep and immediately collide again.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub factor: f64,
    pub jitter: f64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 100,
            factor: 2.0,
            jitter: 0.5,
            cap_ms: 1000,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// `attempt` is 1-based: the delay awaited before retrying after the
    /// `attempt`-th failure.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.base_ms as f64 * self.factor.powi(attempt.saturating_sub(1) as i32);
        let capped = raw.min(self.cap_ms as f64);
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_millis((capped * jitter_factor).max(0.0) as u64)
    }
}

/// Runs `op` until it succeeds or `policy.max_attempts` is exhausted,
/// sleeping a jittered exponential backoff between attempts. The last
/// error is returned verbatim.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(_) if attempt < policy.max_attempts => {
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
            Err(err) => return Err(err),
        }
    }
}
