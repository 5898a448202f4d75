use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Balancer-wide counters. Read by the `/metrics` endpoint of the binary.
#[derive(Debug, Default)]
pub struct BalancerStats {
    attempts_total: AtomicU64,
    retries_total: AtomicU64,
    retry_success_total: AtomicU64,
    requests_succeeded_total: AtomicU64,
    requests_failed_total: AtomicU64,
    pulls_started_total: AtomicU64,
    pulls_failed_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub attempts_total: u64,
    pub retries_total: u64,
    pub retry_success_total: u64,
    pub requests_succeeded_total: u64,
    pub requests_failed_total: u64,
    pub pulls_started_total: u64,
    pub pulls_failed_total: u64,
}

impl BalancerStats {
    pub fn inc_attempts(&self) {
        self.attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retry_success(&self) {
        self.retry_success_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_succeeded(&self) {
        self.requests_succeeded_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.requests_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pulls_started(&self) {
        self.pulls_started_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pulls_failed(&self) {
        self.pulls_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            attempts_total: self.attempts_total.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            retry_success_total: self.retry_success_total.load(Ordering::Relaxed),
            requests_succeeded_total: self.requests_succeeded_total.load(Ordering::Relaxed),
            requests_failed_total: self.requests_failed_total.load(Ordering::Relaxed),
            pulls_started_total: self.pulls_started_total.load(Ordering::Relaxed),
            pulls_failed_total: self.pulls_failed_total.load(Ordering::Relaxed),
        }
    }
}
