//! Driver configuration.

use std::time::Duration;

/// Session pool sizing and maintenance settings.
#[derive(Debug, Clone)]
pub struct SessionPoolConfig {
    /// Sessions the pool keeps alive even when idle. Default: 1.
    pub min_sessions: usize,
    /// Hard ceiling on sessions owned by the pool, counting idle,
    /// checked-out and in-flight creations. Default: 100.
    pub max_sessions: usize,
    /// Share of idle sessions kept prepared with a read-write
    /// transaction handle, in `[0.0, 1.0]`. Default: 0.5.
    pub write_fraction: f64,
    /// How long `acquire` waits for a session before failing with
    /// `ClientError::PoolExhausted`. Default: 30s.
    pub acquire_timeout: Duration,
    /// Idle sessions unused for longer than this are destroyed, down to
    /// `min_sessions`. Default: 30 minutes.
    pub idle_timeout: Duration,
    /// Idle sessions unused for longer than this get a keep-alive ping
    /// so the server does not garbage-collect the handle. Must be below
    /// the server's session expiry (one hour). Default: 50 minutes.
    pub keepalive_interval: Duration,
    /// How often the background maintenance task runs. Default: 10s.
    pub maintenance_interval: Duration,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            min_sessions: 1,
            max_sessions: 100,
            write_fraction: 0.5,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30 * 60),
            keepalive_interval: Duration::from_secs(50 * 60),
            maintenance_interval: Duration::from_secs(10),
        }
    }
}

/// Backoff tuning for transparently retried transaction aborts.
///
/// The delay before attempt `n` is `initial_backoff * multiplier^(n-1)`,
/// capped at `max_backoff`, with half-jitter applied.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry. Default: 50ms.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay. Default: 10s.
    pub max_backoff: Duration,
    /// Exponential growth factor. Default: 2.0.
    pub multiplier: f64,
    /// Abort retry budget; `None` retries until the deadline (if any).
    /// Default: None.
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before retry number `attempt` (1-based), jittered
    /// uniformly into `[d/2, d]`.
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = self.initial_backoff.as_secs_f64() * exp;
        let capped = raw.min(self.max_backoff.as_secs_f64());
        let jittered = rand::thread_rng().gen_range((capped / 2.0)..=capped.max(f64::MIN_POSITIVE));
        Duration::from_secs_f64(jittered)
    }
}
