use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tessera_common::{BalancerError, BalancerResult, InstanceSnapshot, ModelRequirement};

/// A selectable instance presented to the routing strategy.
pub struct Candidate<'a> {
    pub instance: &'a InstanceSnapshot,
}

/// Trait for pluggable routing strategies.
/// The [`Selector`] filters candidates (eligible, not Unhealthy), then
/// delegates the pick to the strategy.
pub trait RoutingStrategy: Send + Sync {
    /// Select one candidate from the list. Returns the index into `candidates`.
    fn select(&self, candidates: &[Candidate]) -> Option<usize>;

    /// Human-readable name for logging / metrics.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// HealthWeighted: health score over load, then latency, then round robin
// ---------------------------------------------------------------------------

const SCORE_EPSILON: f64 = 1e-9;

pub struct HealthWeighted {
    latency_bucket_ms: f64,
    sequence: AtomicU64,
    last_selected: DashMap<String, u64>,
}

impl HealthWeighted {
    pub fn new(latency_bucket_ms: u64) -> Self {
        Self {
            latency_bucket_ms: latency_bucket_ms.max(1) as f64,
            sequence: AtomicU64::new(0),
            last_selected: DashMap::new(),
        }
    }

    /// Health score divided by one plus the in-flight count, so an idle
    /// instance at 0.8 beats a busy one at 1.0.
    fn effective_score(inst: &InstanceSnapshot) -> f64 {
        inst.health_score / (1.0 + inst.in_flight as f64)
    }

    fn latency_bucket(&self, inst: &InstanceSnapshot) -> u64 {
        // No samples yet sorts first so new instances get traffic.
        inst.avg_response_ms
            .map(|ms| (ms / self.latency_bucket_ms) as u64)
            .unwrap_or(0)
    }
}

impl RoutingStrategy for HealthWeighted {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        let best = candidates
            .iter()
            .map(|c| Self::effective_score(c.instance))
            .fold(f64::NEG_INFINITY, f64::max);

        let top: Vec<usize> = (0..candidates.len())
            .filter(|&i| Self::effective_score(candidates[i].instance) >= best - SCORE_EPSILON)
            .collect();

        let fastest = top
            .iter()
            .map(|&i| self.latency_bucket(candidates[i].instance))
            .min()?;

        let idx = top
            .into_iter()
            .filter(|&i| self.latency_bucket(candidates[i].instance) == fastest)
            .min_by_key(|&i| {
                let inst = candidates[i].instance;
                let last = self
                    .last_selected
                    .get(inst.instance_id())
                    .map(|v| *v.value())
                    .unwrap_or(0);
                (last, inst.info.gpu_index)
            })?;

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_selected
            .insert(candidates[idx].instance.instance_id().to_string(), seq);
        Some(idx)
    }

    fn name(&self) -> &'static str {
        "health_weighted"
    }
}

// ---------------------------------------------------------------------------
// LeastPending: pick the instance with fewest in-flight requests
// ---------------------------------------------------------------------------

pub struct LeastPending;

impl RoutingStrategy for LeastPending {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        let mut best_idx: Option<usize> = None;
        let mut best_pending = u64::MAX;

        for (i, c) in candidates.iter().enumerate() {
            if c.instance.in_flight < best_pending {
                best_pending = c.instance.in_flight;
                best_idx = Some(i);
            }
        }

        best_idx
    }

    fn name(&self) -> &'static str {
        "least_pending"
    }
}

/// Parse a strategy name string into a boxed strategy.
pub fn parse_strategy(name: &str, latency_bucket_ms: u64) -> Result<Box<dyn RoutingStrategy>, String> {
    match name {
        "health_weighted" => Ok(Box::new(HealthWeighted::new(latency_bucket_ms))),
        "least_pending" => Ok(Box::new(LeastPending)),
        other => Err(format!(
            "unknown routing strategy '{}', available: health_weighted, least_pending",
            other
        )),
    }
}

/// Applies the health gate around a [`RoutingStrategy`].
pub struct Selector {
    strategy: Box<dyn RoutingStrategy>,
    allow_degraded_fallback: bool,
}

impl Selector {
    pub fn new(strategy: Box<dyn RoutingStrategy>, allow_degraded_fallback: bool) -> Self {
        tracing::info!(strategy = strategy.name(), allow_degraded_fallback, "selector initialized");
        Self {
            strategy,
            allow_degraded_fallback,
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Pick one instance out of `eligible`.
    ///
    /// Fails with `NoEligibleInstance` on an empty set and `NoHealthyInstance`
    /// when every eligible instance is Unhealthy (unless degraded fallback is on).
    pub fn select(
        &self,
        requirement: &ModelRequirement,
        eligible: &[InstanceSnapshot],
    ) -> BalancerResult<InstanceSnapshot> {
        if eligible.is_empty() {
            return Err(BalancerError::NoEligibleInstance {
                model: requirement.model_name.clone(),
                required_mb: requirement.estimated_memory_mb,
            });
        }

        let healthy: Vec<Candidate> = eligible
            .iter()
            .filter(|i| i.is_selectable())
            .map(|instance| Candidate { instance })
            .collect();

        let candidates = if !healthy.is_empty() {
            healthy
        } else if self.allow_degraded_fallback {
            tracing::warn!(model=%requirement.model_name, "all eligible instances unhealthy, using degraded fallback");
            let mut all: Vec<&InstanceSnapshot> = eligible.iter().collect();
            all.sort_by(|a, b| {
                b.health_score
                    .total_cmp(&a.health_score)
                    .then(a.in_flight.cmp(&b.in_flight))
                    .then(a.info.gpu_index.cmp(&b.info.gpu_index))
            });
            return Ok(all[0].clone());
        } else {
            return Err(BalancerError::NoHealthyInstance {
                model: requirement.model_name.clone(),
            });
        };

        self.strategy
            .select(&candidates)
            .map(|i| candidates[i].instance.clone())
            .ok_or_else(|| BalancerError::NoHealthyInstance {
                model: requirement.model_name.clone(),
            })
    }
}
