use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::outcome::ErrorCategory;

/// Immutable settings handed to the balancer at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BalancerConfig {
    /// Total dispatch attempts per request, including the first.
    pub max_attempts: u32,
    pub attempt_timeout_ms: u64,
    /// Upper bound on the whole request, retries and backoff included.
    pub request_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Uniform jitter added to each backoff, in `[0, backoff_jitter_ms)`.
    pub backoff_jitter_ms: u64,
    pub pull_timeout_ms: u64,
    /// Headroom required on top of a model's estimated footprint.
    pub memory_safety_margin_mb: u64,
    /// When every eligible instance is Unhealthy, pick the least bad one
    /// instead of failing.
    pub allow_degraded_fallback: bool,
    /// Response times in the same bucket are treated as equal when ranking.
    pub latency_bucket_ms: u64,
    pub health: HealthThresholds,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_ms: 120_000,
            request_timeout_ms: 300_000,
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
            backoff_jitter_ms: 100,
            pull_timeout_ms: 3_600_000,
            memory_safety_margin_mb: 512,
            allow_degraded_fallback: false,
            latency_bucket_ms: 100,
            health: HealthThresholds::default(),
        }
    }
}

impl BalancerConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.attempt_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err("timeouts must be non-zero".to_string());
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err("backoff_max_ms must be >= backoff_base_ms".to_string());
        }
        self.health.validate()
    }
}

/// Health score update rule and status thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthThresholds {
    /// Below this score an instance is Unhealthy.
    pub unhealthy_below: f64,
    /// Below this score (and not Unhealthy) an instance is Degraded.
    pub degraded_below: f64,
    /// Consecutive failures that force Unhealthy regardless of score.
    pub max_consecutive_failures: u32,
    pub success_increment: f64,
    pub timeout_penalty: f64,
    pub network_penalty: f64,
    pub server_error_penalty: f64,
    pub invalid_response_penalty: f64,
    pub client_error_penalty: f64,
    /// Smoothing factor for the response time moving average.
    pub ema_alpha: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            unhealthy_below: 0.3,
            degraded_below: 0.7,
            max_consecutive_failures: 3,
            success_increment: 0.1,
            timeout_penalty: 0.25,
            network_penalty: 0.25,
            server_error_penalty: 0.2,
            invalid_response_penalty: 0.1,
            client_error_penalty: 0.05,
            ema_alpha: 0.2,
        }
    }
}

impl HealthThresholds {
    pub fn penalty(&self, category: ErrorCategory) -> f64 {
        match category {
            ErrorCategory::Timeout => self.timeout_penalty,
            ErrorCategory::Network => self.network_penalty,
            ErrorCategory::ServerError(code) if code >= 500 => self.server_error_penalty,
            ErrorCategory::ServerError(_) => self.client_error_penalty,
            ErrorCategory::InvalidResponse => self.invalid_response_penalty,
            ErrorCategory::Cancelled => 0.0,
        }
    }

    fn validate(&self) -> Result<(), String> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.unhealthy_below) || !in_unit(self.degraded_below) {
            return Err("health thresholds must be within [0, 1]".to_string());
        }
        if self.unhealthy_below > self.degraded_below {
            return Err("unhealthy_below must not exceed degraded_below".to_string());
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err("ema_alpha must be within (0, 1]".to_string());
        }
        Ok(())
    }
}
