use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tessera_common::{
    BalancerConfig, BalancerError, BalancerResult, ErrorCategory, InstanceSnapshot,
    ModelRequirement, RequestOutcome,
};

use crate::backend::{BackendError, GeneratePayload, GenerateResponse, InferenceBackend};
use crate::models::ModelManager;
use crate::registry::InstanceRegistry;
use crate::stats::BalancerStats;
use crate::strategy::Selector;

/// A generate call that succeeded, and where it ran.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Completion {
    pub instance_id: String,
    pub attempts: u32,
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub response: GenerateResponse,
}

/// Runs one request to completion: select, ensure the model, dispatch, and on
/// transient failure back off and try a different instance.
pub struct Executor {
    registry: Arc<InstanceRegistry>,
    selector: Selector,
    models: Arc<ModelManager>,
    backend: Arc<dyn InferenceBackend>,
    config: BalancerConfig,
    stats: Arc<BalancerStats>,
}

impl Executor {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        selector: Selector,
        models: Arc<ModelManager>,
        backend: Arc<dyn InferenceBackend>,
        config: BalancerConfig,
        stats: Arc<BalancerStats>,
    ) -> Self {
        Self {
            registry,
            selector,
            models,
            backend,
            config,
            stats,
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.selector.strategy_name()
    }

    /// Pick an instance, skipping those that already failed this request.
    /// When skipping leaves nothing selectable, the full eligible set is used.
    fn select(
        &self,
        requirement: &ModelRequirement,
        failed: &[String],
    ) -> BalancerResult<InstanceSnapshot> {
        let eligible = self
            .registry
            .list_eligible(requirement, self.config.memory_safety_margin_mb);
        let fresh: Vec<InstanceSnapshot> = eligible
            .iter()
            .filter(|i| !failed.iter().any(|f| f == i.instance_id()))
            .cloned()
            .collect();
        if fresh.iter().any(|i| i.is_selectable()) {
            self.selector.select(requirement, &fresh)
        } else {
            self.selector.select(requirement, &eligible)
        }
    }

    pub async fn execute(
        &self,
        requirement: &ModelRequirement,
        payload: &GeneratePayload,
        cancel: &CancellationToken,
        request_timeout: Duration,
    ) -> BalancerResult<Completion> {
        let started = Instant::now();
        let mut deadline = started + request_timeout;
        let max_attempts = self.config.max_attempts.max(1);
        let mut failed: Vec<String> = Vec::new();
        let mut last_error: Option<BackendError> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(BalancerError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(match last_error {
                    Some(last) => {
                        BalancerError::from_category(last.category, last.message, attempt - 1)
                    }
                    None => BalancerError::Timeout {
                        attempts: attempt - 1,
                    },
                });
            }

            let instance = match self.select(requirement, &failed) {
                Ok(instance) => instance,
                Err(e) => {
                    return Err(match last_error {
                        // Selection dried up mid-retry; the transport error is more useful.
                        Some(last) => {
                            BalancerError::from_category(last.category, last.message, attempt - 1)
                        }
                        None => e,
                    })
                }
            };
            let instance_id = instance.instance_id().to_string();

            // Pull time runs on the pull timeout, not the request budget.
            let pull_started = Instant::now();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BalancerError::Cancelled),
                r = self.models.ensure_available(&instance.info, &requirement.model_name) => r?,
            }
            deadline += pull_started.elapsed();
            let remaining = deadline.saturating_duration_since(Instant::now());

            self.stats.inc_attempts();
            if attempt > 1 {
                self.stats.inc_retries();
            }
            let attempt_timeout = self.config.attempt_timeout().min(remaining);
            tracing::debug!(instance_id=%instance_id, attempt, timeout_ms=attempt_timeout.as_millis() as u64, "dispatching");

            let guard = self.registry.begin_dispatch(&instance_id);
            let sent = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(BackendError::new(ErrorCategory::Cancelled, "cancelled by caller")),
                r = tokio::time::timeout(
                    attempt_timeout,
                    self.backend.generate(&instance.info, &requirement.model_name, payload),
                ) => match r {
                    Ok(r) => r,
                    Err(_) => Err(BackendError::new(
                        ErrorCategory::Timeout,
                        format!("no response within {}ms", attempt_timeout.as_millis()),
                    )),
                },
            };
            let elapsed = sent.elapsed();
            drop(guard);

            match result {
                Ok(response) => {
                    self.registry
                        .report_outcome(&RequestOutcome::success(&instance_id, elapsed));
                    if attempt > 1 {
                        self.stats.inc_retry_success();
                    }
                    return Ok(Completion {
                        instance_id,
                        attempts: attempt,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        response,
                    });
                }
                Err(err) => {
                    self.registry.report_outcome(&RequestOutcome::failure(
                        &instance_id,
                        elapsed,
                        err.category,
                    ));
                    if err.category == ErrorCategory::Cancelled {
                        return Err(BalancerError::Cancelled);
                    }
                    if !err.category.is_retryable() {
                        tracing::warn!(instance_id=%instance_id, attempt, error=%err, "attempt failed, not retryable");
                        return Err(BalancerError::from_category(err.category, err.message, attempt));
                    }
                    tracing::warn!(instance_id=%instance_id, attempt, max_attempts, error=%err, "attempt failed");
                    failed.push(instance_id);
                    last_error = Some(err);
                }
            }

            if attempt < max_attempts {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let delay = backoff_delay(&self.config, attempt).min(remaining);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(BalancerError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(match last_error {
            Some(last) => BalancerError::from_category(last.category, last.message, max_attempts),
            None => BalancerError::Timeout {
                attempts: max_attempts,
            },
        })
    }
}

/// `base * 2^(attempt-1)` capped at the configured maximum, plus uniform
/// jitter in `[0, jitter)`.
pub(crate) fn backoff_delay(config: &BalancerConfig, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    let exponential = config.backoff_base_ms.saturating_mul(1u64 << shift);
    let capped = exponential.min(config.backoff_max_ms);
    let jitter = if config.backoff_jitter_ms > 0 {
        rand::thread_rng().gen_range(0..config.backoff_jitter_ms)
    } else {
        0
    };
    Duration::from_millis(capped.saturating_add(jitter))
}
