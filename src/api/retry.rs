//! Retry policy with exponential backoff and jitter
//!
//! # Policy
//!
//! - `attempt >= limit` stops
//! - Auth failures never retry
//! - Rate limited: `base * 2^attempt * 1.5 * jitter`
//! - Server error / transient network: `base * 2^attempt * jitter`
//! - Anything else stops
//!
//! Jitter is drawn uniformly from `[0.8, 1.2]` by default. The policy holds no
//! state between calls; [`RetryPolicy::decide_with_jitter`] takes the jitter
//! factor explicitly so decisions can be checked without randomness.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Why an attempt failed, as far as retrying is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCause {
    RateLimited,
    ServerError,
    TransientNetwork,
    AuthFailure,
    Other,
}

impl RetryCause {
    /// Classify an HTTP status code
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => RetryCause::RateLimited,
            500..=599 => RetryCause::ServerError,
            401 => RetryCause::AuthFailure,
            _ => RetryCause::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetryCause::RateLimited => "rate_limited",
            RetryCause::ServerError => "server_error",
            RetryCause::TransientNetwork => "transient_network",
            RetryCause::AuthFailure => "auth_failure",
            RetryCause::Other => "other",
        }
    }
}

/// One failed attempt of a logical request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    pub attempt_index: u32,
    pub classified_cause: RetryCause,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Stop,
    RetryAfter(Duration),
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Extra multiplier applied to rate-limit backoff
    #[serde(default = "default_rate_limit_multiplier")]
    pub rate_limit_multiplier: f64,

    #[serde(default = "default_jitter_min")]
    pub jitter_min: f64,

    #[serde(default = "default_jitter_max")]
    pub jitter_max: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_rate_limit_multiplier() -> f64 {
    1.5
}

fn default_jitter_min() -> f64 {
    0.8
}

fn default_jitter_max() -> f64 {
    1.2
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            rate_limit_multiplier: default_rate_limit_multiplier(),
            jitter_min: default_jitter_min(),
            jitter_max: default_jitter_max(),
        }
    }
}

impl RetryConfig {
    /// Get base backoff as Duration
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Stateless retry decision function
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retry limit applied by the client
    pub fn limit(&self) -> u32 {
        self.config.max_retries
    }

    /// Decide for a failed attempt against the configured limit
    pub fn next(&self, attempt: RetryAttempt) -> RetryDecision {
        self.decide(attempt.classified_cause, attempt.attempt_index, self.limit())
    }

    /// Decide using thread-local randomness for jitter
    pub fn decide(&self, cause: RetryCause, attempt_index: u32, limit: u32) -> RetryDecision {
        self.decide_with_rng(cause, attempt_index, limit, &mut rand::thread_rng())
    }

    /// Decide drawing jitter from `rng`
    pub fn decide_with_rng<R: Rng + ?Sized>(
        &self,
        cause: RetryCause,
        attempt_index: u32,
        limit: u32,
        rng: &mut R,
    ) -> RetryDecision {
        let (low, high) = self.jitter_bounds();
        let jitter = if high > low { rng.gen_range(low..=high) } else { low };
        self.decide_with_jitter(cause, attempt_index, limit, jitter)
    }

    /// Decide with an explicit jitter factor
    pub fn decide_with_jitter(
        &self,
        cause: RetryCause,
        attempt_index: u32,
        limit: u32,
        jitter: f64,
    ) -> RetryDecision {
        if attempt_index >= limit {
            return RetryDecision::Stop;
        }

        let multiplier = match cause {
            RetryCause::RateLimited => self.config.rate_limit_multiplier,
            RetryCause::ServerError | RetryCause::TransientNetwork => 1.0,
            RetryCause::AuthFailure | RetryCause::Other => return RetryDecision::Stop,
        };

        // Cap the exponent so huge attempt counts cannot overflow the Duration
        let exponent = attempt_index.min(30) as i32;
        let secs = self.config.base_delay().as_secs_f64() * 2f64.powi(exponent) * multiplier * jitter;
        RetryDecision::RetryAfter(Duration::from_secs_f64(secs.max(0.0)))
    }

    fn jitter_bounds(&self) -> (f64, f64) {
        let low = self.config.jitter_min.min(self.config.jitter_max);
        let high = self.config.jitter_min.max(self.config.jitter_max);
        (low, high)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
