use std::time::Duration;

/// Capped exponential backoff for failed reconciles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound on any delay
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `failures + 1`: `base * 2^failures`, capped at `max`
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Configuration for the workload controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Deadline for one reconcile
    pub reconcile_timeout: Duration,
    pub backoff: BackoffConfig,
    /// Enqueue every existing template at startup
    pub resync_on_start: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            reconcile_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            resync_on_start: true,
        }
    }
}
