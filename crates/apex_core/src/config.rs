//! Engine configuration.
//!
//! Every struct deserializes with defaults for missing fields, so a host can
//! ship a partial JSON document.

use crate::error::{CoreResult, MediationError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Circuit breaker settings, applied per source id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive faults that open the circuit
    pub failure_threshold: u32,
    /// Cooldown before a half-open probe, in milliseconds
    pub reset_timeout_ms: u64,
    /// Probes admitted in half-open; this many successes close the circuit
    pub half_open_max_attempts: u32,
}

impl BreakerConfig {
    /// Set failure threshold
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set reset timeout
    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set half-open probe count
    #[must_use]
    pub fn with_half_open_max_attempts(mut self, attempts: u32) -> Self {
        self.half_open_max_attempts = attempts;
        self
    }

    /// Cooldown as a duration
    #[must_use]
    pub const fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Check settings
    ///
    /// # Errors
    ///
    /// Returns error if a count is zero
    pub fn validate(&self) -> CoreResult<()> {
        if self.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "must be at least 1"));
        }
        if self.half_open_max_attempts == 0 {
            return Err(invalid("breaker.half_open_max_attempts", "must be at least 1"));
        }
        Ok(())
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_max_attempts: 3,
        }
    }
}

/// Rate limiter settings, applied per source id over a sliding 1s window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Calls admitted per source per second
    pub max_requests_per_second: u32,
}

impl RateLimitConfig {
    /// Set the per-second budget
    #[must_use]
    pub fn with_max_requests_per_second(mut self, max: u32) -> Self {
        self.max_requests_per_second = max;
        self
    }

    /// Check settings
    ///
    /// # Errors
    ///
    /// Returns error if the budget is zero
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_requests_per_second == 0 {
            return Err(invalid("rate_limit.max_requests_per_second", "must be at least 1"));
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: 10,
        }
    }
}

/// Settings for the priority-weighted scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeightedConfig {
    /// Scale weights by observed fill rate
    pub use_performance_weighting: bool,
    /// Samples needed before stats influence weight or timeout
    pub min_sample_size: u64,
    /// Upper bound on concurrently running attempts under preload
    pub max_concurrent_requests: usize,
    /// Shrink timeouts toward observed latency
    pub adaptive_timeouts_enabled: bool,
    /// Treat fills under the source floor as no-fills
    pub bid_floor_enabled: bool,
    /// Start lower tiers while a higher tier is still running
    pub parallel_preload: bool,
}

impl PriorityWeightedConfig {
    /// Enable or disable performance weighting
    #[must_use]
    pub fn with_performance_weighting(mut self, enabled: bool) -> Self {
        self.use_performance_weighting = enabled;
        self
    }

    /// Set minimum sample size
    #[must_use]
    pub fn with_min_sample_size(mut self, samples: u64) -> Self {
        self.min_sample_size = samples;
        self
    }

    /// Set concurrency bound
    #[must_use]
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    /// Enable or disable adaptive timeouts
    #[must_use]
    pub fn with_adaptive_timeouts(mut self, enabled: bool) -> Self {
        self.adaptive_timeouts_enabled = enabled;
        self
    }

    /// Enable or disable bid floor enforcement
    #[must_use]
    pub fn with_bid_floor(mut self, enabled: bool) -> Self {
        self.bid_floor_enabled = enabled;
        self
    }

    /// Enable or disable parallel preload
    #[must_use]
    pub fn with_parallel_preload(mut self, enabled: bool) -> Self {
        self.parallel_preload = enabled;
        self
    }

    /// Number of tiers that may run at once
    #[must_use]
    pub fn lookahead(&self) -> usize {
        if self.parallel_preload {
            self.max_concurrent_requests.max(1)
        } else {
            1
        }
    }

    /// Check settings
    ///
    /// # Errors
    ///
    /// Returns error if the concurrency bound is zero
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_concurrent_requests == 0 {
            return Err(invalid("weighted.max_concurrent_requests", "must be at least 1"));
        }
        Ok(())
    }

    /// Parse from JSON
    ///
    /// # Errors
    ///
    /// Returns error if parsing or validation fails
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for PriorityWeightedConfig {
    fn default() -> Self {
        Self {
            use_performance_weighting: true,
            min_sample_size: 10,
            max_concurrent_requests: 3,
            adaptive_timeouts_enabled: true,
            bid_floor_enabled: true,
            parallel_preload: false,
        }
    }
}

/// Top-level dispatcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Circuit breaker settings
    pub breaker: BreakerConfig,
    /// Rate limiter settings
    pub rate_limit: RateLimitConfig,
    /// Enforce source floors in waterfall mode
    pub bid_floor_enabled: bool,
    /// Seed for weighted selection; random when absent
    pub seed: Option<u64>,
}

impl DispatcherConfig {
    /// Set breaker settings
    #[must_use]
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Set rate limit settings
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Enable or disable bid floor enforcement
    #[must_use]
    pub fn with_bid_floor(mut self, enabled: bool) -> Self {
        self.bid_floor_enabled = enabled;
        self
    }

    /// Fix the selection seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check settings
    ///
    /// # Errors
    ///
    /// Returns the first invalid nested setting
    pub fn validate(&self) -> CoreResult<()> {
        self.breaker.validate()?;
        self.rate_limit.validate()
    }

    /// Parse from JSON
    ///
    /// # Errors
    ///
    /// Returns error if parsing or validation fails
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            bid_floor_enabled: true,
            seed: None,
        }
    }
}

fn invalid(field: &str, reason: &str) -> MediationError {
    MediationError::Validation {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
