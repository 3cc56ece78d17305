use std::time::Duration;

/// Tuning for the settlement engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on every individual store call. Exceeding it surfaces as
    /// `Unavailable`.
    pub store_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
        }
    }
}

/// Tuning for the change feed relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Events buffered per listener before it is considered lagging.
    pub channel_capacity: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on each reconciliation read.
    pub store_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            store_timeout: Duration::from_secs(5),
        }
    }
}

impl RelayConfig {
    /// Exponential backoff for the given zero-based retry attempt, capped at
    /// `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeskConfig {
    pub engine: EngineConfig,
    pub relay: RelayConfig,
}
