use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use tessera_common::requirement::validate_model_name;
use tessera_common::{
    normalize_model_name, BalancerConfig, BalancerError, BalancerResult, GpuTelemetry,
    HealthReport, InstanceInfo, InstanceSnapshot, ModelInfo, ModelRequirement,
};

pub mod backend;
pub mod eligibility;
pub mod executor;
pub mod health;
pub mod models;
pub mod registry;
pub mod stats;
pub mod strategy;

#[cfg(test)]
mod test_support;

use backend::{GeneratePayload, InferenceBackend};
use executor::{Completion, Executor};
use models::ModelManager;
use registry::InstanceRegistry;
use stats::{BalancerStats, StatsSnapshot};
use strategy::{HealthWeighted, RoutingStrategy, Selector};

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Replaces the configured request timeout for this call.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Load balancer over a fixed pool of backend instances, one per accelerator.
pub struct Balancer {
    config: BalancerConfig,
    registry: Arc<InstanceRegistry>,
    models: Arc<ModelManager>,
    executor: Executor,
    stats: Arc<BalancerStats>,
}

impl std::fmt::Debug for Balancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer")
            .field("instances", &self.registry.len())
            .field("strategy", &self.executor.strategy_name())
            .finish()
    }
}

impl Balancer {
    pub fn new(
        instances: Vec<InstanceInfo>,
        config: BalancerConfig,
        backend: Arc<dyn InferenceBackend>,
    ) -> BalancerResult<Arc<Self>> {
        let strategy = Box::new(HealthWeighted::new(config.latency_bucket_ms));
        Self::with_strategy(instances, config, backend, strategy)
    }

    pub fn with_strategy(
        instances: Vec<InstanceInfo>,
        config: BalancerConfig,
        backend: Arc<dyn InferenceBackend>,
        strategy: Box<dyn RoutingStrategy>,
    ) -> BalancerResult<Arc<Self>> {
        config.validate().map_err(BalancerError::Validation)?;
        if instances.is_empty() {
            return Err(BalancerError::Validation(
                "at least one instance is required".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for info in &instances {
            if !seen.insert(info.instance_id.as_str()) {
                return Err(BalancerError::Validation(format!(
                    "duplicate instance id '{}'",
                    info.instance_id
                )));
            }
        }

        let stats = Arc::new(BalancerStats::default());
        let registry = InstanceRegistry::new(instances, config.health.clone());
        let models = Arc::new(ModelManager::new(
            Arc::clone(&registry),
            Arc::clone(&backend),
            config.pull_timeout(),
            Arc::clone(&stats),
        ));
        let selector = Selector::new(strategy, config.allow_degraded_fallback);
        let executor = Executor::new(
            Arc::clone(&registry),
            selector,
            Arc::clone(&models),
            backend,
            config.clone(),
            Arc::clone(&stats),
        );

        tracing::info!(
            instances = registry.len(),
            max_attempts = config.max_attempts,
            strategy = executor.strategy_name(),
            "balancer initialized"
        );

        Ok(Arc::new(Self {
            config,
            registry,
            models,
            executor,
            stats,
        }))
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run `payload` against `model` on the best instance, retrying transient
    /// failures elsewhere. Without an explicit requirement, one is derived
    /// from the model profile table.
    pub async fn generate(
        &self,
        model: &str,
        payload: &GeneratePayload,
        requirement: Option<ModelRequirement>,
        cancel: &CancellationToken,
        options: CallOptions,
    ) -> BalancerResult<Completion> {
        validate_model_name(model).map_err(BalancerError::Validation)?;
        if payload.prompt.trim().is_empty() {
            return Err(BalancerError::Validation("prompt must not be empty".to_string()));
        }
        let timeout = options.timeout.unwrap_or_else(|| self.config.request_timeout());
        if timeout.is_zero() {
            return Err(BalancerError::Validation("timeout must be non-zero".to_string()));
        }

        let requirement = match requirement {
            Some(mut r) => {
                r.model_name = normalize_model_name(model);
                r
            }
            None => ModelRequirement::for_model(model),
        };

        let result = self
            .executor
            .execute(&requirement, payload, cancel, timeout)
            .await;
        match &result {
            Ok(done) => {
                self.stats.inc_succeeded();
                tracing::info!(
                    model=%requirement.model_name,
                    instance_id=%done.instance_id,
                    attempts=done.attempts,
                    elapsed_ms=done.elapsed_ms,
                    "generate completed"
                );
            }
            Err(e) => {
                self.stats.inc_failed();
                tracing::warn!(model=%requirement.model_name, kind=e.kind(), attempts=e.attempts(), error=%e, "generate failed");
            }
        }
        result
    }

    /// Whether any instance has `model`. Answers from the cache when it can,
    /// otherwise asks every instance.
    pub async fn is_model_available(
        &self,
        model: &str,
        cancel: &CancellationToken,
    ) -> BalancerResult<bool> {
        validate_model_name(model).map_err(BalancerError::Validation)?;
        if !self.registry.instances_with_model(model).is_empty() {
            return Ok(true);
        }
        self.refresh_all(cancel).await?;
        Ok(!self.registry.instances_with_model(model).is_empty())
    }

    /// Union of the models present on every reachable instance, by name.
    pub async fn list_models(&self, cancel: &CancellationToken) -> BalancerResult<Vec<ModelInfo>> {
        let per_instance = self.refresh_all(cancel).await?;
        let mut merged: BTreeMap<String, ModelInfo> = BTreeMap::new();
        for model in per_instance.into_iter().flatten() {
            merged.entry(normalize_model_name(&model.name)).or_insert(model);
        }
        Ok(merged.into_values().collect())
    }

    /// List models on all instances concurrently. Fails only when none answer.
    async fn refresh_all(&self, cancel: &CancellationToken) -> BalancerResult<Vec<Vec<ModelInfo>>> {
        let instances = self.registry.snapshot();
        let timeout = self.config.request_timeout();
        let calls = instances.iter().map(|inst| async move {
            match tokio::time::timeout(timeout, self.models.refresh(&inst.info)).await {
                Ok(r) => r,
                Err(_) => Err(backend::BackendError::new(
                    tessera_common::ErrorCategory::Timeout,
                    "listing models timed out",
                )),
            }
        });

        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BalancerError::Cancelled),
            r = join_all(calls) => r,
        };

        let mut lists = Vec::new();
        let mut last_error = None;
        for (inst, result) in instances.iter().zip(results) {
            match result {
                Ok(models) => lists.push(models),
                Err(e) => {
                    tracing::warn!(instance_id=%inst.instance_id(), error=%e, "listing models failed");
                    last_error = Some(e);
                }
            }
        }
        match (lists.is_empty(), last_error) {
            (true, Some(e)) => Err(BalancerError::from_category(e.category, e.message, 1)),
            _ => Ok(lists),
        }
    }

    pub fn health_report(&self) -> HealthReport {
        health::report(&self.registry)
    }

    /// Probe every instance once and return the updated report.
    pub async fn probe(&self) -> HealthReport {
        health::probe_all(&self.registry, &self.models, self.config.attempt_timeout()).await
    }

    pub fn update_telemetry(&self, telemetry: GpuTelemetry) -> bool {
        self.registry.update_telemetry(telemetry)
    }

    pub fn set_health_score(&self, instance_id: &str, score: f64) -> BalancerResult<InstanceSnapshot> {
        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return Err(BalancerError::Validation(format!(
                "score must be within [0, 1], got {score}"
            )));
        }
        self.registry
            .set_health_score(instance_id, score)
            .ok_or_else(|| BalancerError::Validation(format!("unknown instance '{instance_id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use tessera_common::{HealthStatus, ModelAvailability};

    use crate::test_support::{Behavior, MockBackend};

    const MODEL: &str = "llama3:8b";

    fn instances(n: u32) -> Vec<InstanceInfo> {
        (0..n)
            .map(|i| InstanceInfo::for_gpu(i, "127.0.0.1", 11434))
            .collect()
    }

    fn fast_config() -> BalancerConfig {
        BalancerConfig {
            attempt_timeout_ms: 1_000,
            request_timeout_ms: 10_000,
            backoff_base_ms: 10,
            backoff_max_ms: 100,
            backoff_jitter_ms: 0,
            ..BalancerConfig::default()
        }
    }

    fn balancer(n: u32, config: BalancerConfig) -> (Arc<Balancer>, Arc<MockBackend>) {
        let mock = Arc::new(MockBackend::new().with_model(MODEL));
        let b = Balancer::new(instances(n), config, mock.clone()).unwrap();
        (b, mock)
    }

    fn payload() -> GeneratePayload {
        GeneratePayload {
            prompt: "hello".to_string(),
            ..Default::default()
        }
    }

    fn telemetry(gpu: u32, total: u64, used: u64) -> GpuTelemetry {
        GpuTelemetry {
            gpu_index: gpu,
            memory_total_mb: total,
            memory_used_mb: used,
            temperature_c: None,
            utilization_pct: None,
            power_draw_w: None,
            healthy: true,
            supports_fp16: None,
            supports_bf16: None,
            updated_at_ms: 0,
        }
    }

    async fn gen(b: &Balancer) -> BalancerResult<Completion> {
        b.generate(MODEL, &payload(), None, &CancellationToken::new(), CallOptions::default())
            .await
    }

    #[test]
    fn test_new_rejects_bad_input() {
        let mock: Arc<dyn InferenceBackend> = Arc::new(MockBackend::new());
        assert!(matches!(
            Balancer::new(vec![], BalancerConfig::default(), mock.clone()),
            Err(BalancerError::Validation(_))
        ));
        let dup = vec![
            InstanceInfo::for_gpu(0, "127.0.0.1", 11434),
            InstanceInfo::for_gpu(0, "127.0.0.1", 11434),
        ];
        assert!(Balancer::new(dup, BalancerConfig::default(), mock.clone()).is_err());
        let bad = BalancerConfig {
            max_attempts: 0,
            ..BalancerConfig::default()
        };
        assert!(Balancer::new(instances(1), bad, mock).is_err());
    }

    #[tokio::test]
    async fn test_generate_validates_request() {
        let (b, mock) = balancer(2, fast_config());
        let cancel = CancellationToken::new();
        let empty = GeneratePayload::default();
        assert!(matches!(
            b.generate(MODEL, &empty, None, &cancel, CallOptions::default()).await,
            Err(BalancerError::Validation(_))
        ));
        assert!(matches!(
            b.generate("bad model!", &payload(), None, &cancel, CallOptions::default()).await,
            Err(BalancerError::Validation(_))
        ));
        assert!(matches!(
            b.generate(MODEL, &payload(), None, &cancel, CallOptions::with_timeout(Duration::ZERO)).await,
            Err(BalancerError::Validation(_))
        ));
        assert_eq!(mock.total_generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_generate_round_robins_equal_instances() {
        let (b, mock) = balancer(3, fast_config());
        for _ in 0..30 {
            let done = gen(&b).await.unwrap();
            assert_eq!(done.attempts, 1);
            assert!(done.response.response.starts_with(&done.instance_id));
        }
        for id in ["gpu0", "gpu1", "gpu2"] {
            let calls = mock.generate_calls(id);
            assert!((9..=11).contains(&calls), "{id}: {calls}");
        }
        assert_eq!(b.stats().requests_succeeded_total, 30);
        assert_eq!(b.stats().attempts_total, 30);
    }

    #[tokio::test]
    async fn test_requirement_too_large_contacts_no_backend() {
        let (b, mock) = balancer(2, fast_config());
        b.update_telemetry(telemetry(0, 8_000, 1_000));
        b.update_telemetry(telemetry(1, 16_000, 2_000));

        let requirement = ModelRequirement::for_model(MODEL).with_memory_mb(40_000);
        let err = b
            .generate(MODEL, &payload(), Some(requirement), &CancellationToken::new(), CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::NoEligibleInstance { required_mb: 40_000, .. }));
        assert_eq!(mock.total_generate_calls(), 0);
        assert_eq!(mock.list_calls.load(Ordering::SeqCst), 0);
        assert_eq!(mock.pull_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unhealthy_instance_gets_no_traffic_until_restored() {
        let (b, mock) = balancer(2, fast_config());
        mock.set_behavior("gpu0", Behavior::Network);
        // The first failure retries onto gpu1.
        let done = gen(&b).await.unwrap();
        assert_eq!(done.instance_id, "gpu1");
        assert_eq!(done.attempts, 2);
        for _ in 0..2 {
            b.registry().report_outcome(&tessera_common::RequestOutcome::failure(
                "gpu0",
                Duration::from_millis(1),
                tessera_common::ErrorCategory::Network,
            ));
        }
        let gpu0 = b.registry().get("gpu0").unwrap();
        assert_eq!(gpu0.status, HealthStatus::Unhealthy);
        assert!(!gpu0.is_selectable());
        mock.set_behavior("gpu0", Behavior::Ok);

        let before = mock.generate_calls("gpu0");
        let mut handles = Vec::new();
        for _ in 0..100 {
            let b = Arc::clone(&b);
            handles.push(tokio::spawn(async move { gen(&b).await }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap().instance_id, "gpu1");
        }
        assert_eq!(mock.generate_calls("gpu0"), before);

        b.set_health_score("gpu0", 1.0).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            seen.insert(gen(&b).await.unwrap().instance_id);
        }
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_probe_recovers_unhealthy_instance() {
        let (b, mock) = balancer(2, fast_config());
        for _ in 0..3 {
            b.registry().report_outcome(&tessera_common::RequestOutcome::failure(
                "gpu0",
                Duration::from_millis(1),
                tessera_common::ErrorCategory::Timeout,
            ));
        }
        assert_eq!(b.health_report().unhealthy_instances, 1);

        let report = b.probe().await;
        assert_eq!(report.unhealthy_instances, 0);
        assert!(b.registry().get("gpu0").unwrap().is_selectable());
        assert_eq!(mock.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_timing_out_backend_uses_every_attempt() {
        let config = fast_config();
        let (b, mock) = balancer(3, config.clone());
        for id in ["gpu0", "gpu1", "gpu2"] {
            mock.set_behavior(id, Behavior::Hang);
        }

        let started = tokio::time::Instant::now();
        let err = gen(&b).await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err, BalancerError::Timeout { attempts: 3 });
        // One attempt per instance: every retry was re-selected elsewhere.
        for id in ["gpu0", "gpu1", "gpu2"] {
            assert_eq!(mock.generate_calls(id), 1, "{id}");
            assert_eq!(b.registry().get(id).unwrap().in_flight, 0);
        }
        let bound = Duration::from_millis(config.attempt_timeout_ms * 3 + config.backoff_max_ms * 2 + 50);
        assert!(elapsed <= bound, "{elapsed:?}");
        assert!(elapsed >= Duration::from_millis(config.attempt_timeout_ms * 3));
        assert_eq!(b.stats().retries_total, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_bounds_retries() {
        let config = BalancerConfig {
            request_timeout_ms: 1_500,
            ..fast_config()
        };
        let (b, mock) = balancer(3, config);
        for id in ["gpu0", "gpu1", "gpu2"] {
            mock.set_behavior(id, Behavior::Hang);
        }
        let started = tokio::time::Instant::now();
        let err = gen(&b).await.unwrap_err();
        assert!(matches!(err, BalancerError::Timeout { .. }));
        assert!(started.elapsed() <= Duration::from_millis(1_600));
        assert!(mock.total_generate_calls() <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted_between_attempts_keeps_last_category() {
        let config = BalancerConfig {
            request_timeout_ms: 50,
            backoff_base_ms: 100,
            ..fast_config()
        };
        let (b, mock) = balancer(2, config);
        mock.set_behavior("gpu0", Behavior::Status(503));
        mock.set_behavior("gpu1", Behavior::Status(503));
        let err = gen(&b).await.unwrap_err();
        assert_eq!(mock.total_generate_calls(), 1);
        assert!(matches!(
            err,
            BalancerError::ServerError {
                status: 503,
                attempts: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_non_retryable_error_surfaces_immediately() {
        let (b, mock) = balancer(2, fast_config());
        mock.set_behavior("gpu0", Behavior::Status(404));
        mock.set_behavior("gpu1", Behavior::Status(404));
        let err = gen(&b).await.unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.category(), Some(tessera_common::ErrorCategory::ServerError(404)));
        assert_eq!(mock.total_generate_calls(), 1);
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_budget_with_final_category() {
        let (b, mock) = balancer(2, fast_config());
        mock.set_behavior("gpu0", Behavior::Status(503));
        mock.set_behavior("gpu1", Behavior::Status(502));
        let err = gen(&b).await.unwrap_err();
        assert!(matches!(err, BalancerError::ServerError { attempts: 3, .. }));
        assert_eq!(mock.total_generate_calls(), 3);
    }

    #[tokio::test]
    async fn test_cancel_leaves_health_untouched() {
        let (b, mock) = balancer(1, fast_config());
        mock.set_behavior("gpu0", Behavior::Delay(Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = b
            .generate(MODEL, &payload(), None, &cancel, CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, BalancerError::Cancelled);

        let s = b.registry().get("gpu0").unwrap();
        assert_eq!(s.total_errors, 0);
        assert_eq!(s.health_score, 1.0);
        assert_eq!(s.in_flight, 0);
        assert_eq!(s.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_generate_pulls_missing_model_once_per_instance() {
        let mock = Arc::new(MockBackend::new());
        mock.set_pull_delay(Duration::from_millis(20));
        let b = Balancer::new(instances(1), fast_config(), mock.clone()).unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let b = Arc::clone(&b);
            handles.push(tokio::spawn(async move {
                b.generate("phi3", &payload(), None, &CancellationToken::new(), CallOptions::default())
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(mock.pull_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            b.registry().availability("gpu0", "phi3"),
            ModelAvailability::Available
        );
        assert_eq!(b.stats().pulls_started_total, 1);
    }

    #[tokio::test]
    async fn test_pull_failure_is_fatal() {
        let mock = Arc::new(MockBackend::new());
        mock.set_pull_error(Some("pull model manifest: file does not exist"));
        let b = Balancer::new(instances(2), fast_config(), mock.clone()).unwrap();
        let err = b
            .generate("nosuch:1b", &payload(), None, &CancellationToken::new(), CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BalancerError::PullFailed { .. }));
        assert_eq!(mock.total_generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_list_models_and_availability() {
        let (b, mock) = balancer(2, fast_config());
        let cancel = CancellationToken::new();

        let models = b.list_models(&cancel).await.unwrap();
        let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec![MODEL]);

        assert!(b.is_model_available("LLAMA3:8B", &cancel).await.unwrap());
        assert!(!b.is_model_available("mistral", &cancel).await.unwrap());

        mock.set_list_down("gpu0", true);
        mock.set_list_down("gpu1", true);
        assert!(matches!(
            b.list_models(&cancel).await,
            Err(BalancerError::Network { .. })
        ));

        cancel.cancel();
        assert_eq!(b.list_models(&cancel).await, Err(BalancerError::Cancelled));
    }

    #[test]
    fn test_set_health_score_validation() {
        let (b, _mock) = balancer(1, fast_config());
        assert!(b.set_health_score("gpu0", 1.5).is_err());
        assert!(b.set_health_score("gpu0", f64::NAN).is_err());
        assert!(b.set_health_score("gpu7", 0.5).is_err());
        assert_eq!(b.set_health_score("gpu0", 0.5).unwrap().status, HealthStatus::Degraded);
    }
}
