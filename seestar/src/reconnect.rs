//! Bounded auto-reconnect bookkeeping
//!
//! Counts unexpected disconnects ("misses") inside a sliding quiet window.
//! A miss more than `miss_window` after the previous one starts the count
//! over; once the count passes `max_retries` the client gives up.

use std::time::{Duration, Instant};

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Pause between teardown and the next connect attempt (default: 300ms)
    pub retry_delay_ms: u64,
    /// Attempts allowed inside one miss window (default: 3)
    pub max_retries: u32,
    /// Quiet period after which the miss counter resets (default: 60 seconds)
    pub miss_window_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 300,
            max_retries: 3,
            miss_window_secs: 60,
        }
    }
}

impl ReconnectConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn miss_window(&self) -> Duration {
        Duration::from_secs(self.miss_window_secs)
    }
}

/// What to do after a miss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again; carries the 1-based attempt number
    Retry { attempt: u32 },
    /// Attempts exhausted inside the window
    GiveUp { misses: u32 },
}

/// Miss counter
#[derive(Debug, Clone)]
pub struct ReconnectTracker {
    config: ReconnectConfig,
    miss_count: u32,
    last_miss: Option<Instant>,
}

impl ReconnectTracker {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            miss_count: 0,
            last_miss: None,
        }
    }

    pub fn miss_count(&self) -> u32 {
        self.miss_count
    }

    /// Record an unexpected disconnect observed at `now`
    pub fn record_miss(&mut self, now: Instant) -> ReconnectDecision {
        if let Some(last) = self.last_miss {
            if now.saturating_duration_since(last) > self.config.miss_window() {
                self.miss_count = 0;
            }
        }
        self.last_miss = Some(now);
        self.miss_count += 1;

        if self.miss_count > self.config.max_retries {
            ReconnectDecision::GiveUp {
                misses: self.miss_count,
            }
        } else {
            ReconnectDecision::Retry {
                attempt: self.miss_count,
            }
        }
    }

    /// Forget all misses after a successful reconnect
    pub fn reset(&mut self) {
        self.miss_count = 0;
    }
}

impl Default for ReconnectTracker {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}
