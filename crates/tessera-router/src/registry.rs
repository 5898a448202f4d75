use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;

use tessera_common::{
    normalize_model_name, ErrorCategory, GpuTelemetry, HealthStatus, HealthThresholds,
    InstanceInfo, InstanceSnapshot, ModelAvailability, ModelRequirement, RequestOutcome,
};

use crate::eligibility;
use crate::now_ms;

#[derive(Debug, Clone)]
struct InstanceRecord {
    info: InstanceInfo,
    status: HealthStatus,
    health_score: f64,
    in_flight: u64,
    total_requests: u64,
    total_errors: u64,
    consecutive_failures: u32,
    avg_response_ms: Option<f64>,
    last_health_check_ms: Option<u64>,
    telemetry: Option<GpuTelemetry>,
}

impl InstanceRecord {
    fn new(info: InstanceInfo) -> Self {
        Self {
            info,
            status: HealthStatus::Healthy,
            health_score: 1.0,
            in_flight: 0,
            total_requests: 0,
            total_errors: 0,
            consecutive_failures: 0,
            avg_response_ms: None,
            last_health_check_ms: None,
            telemetry: None,
        }
    }

    fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            info: self.info.clone(),
            status: self.status,
            health_score: self.health_score,
            in_flight: self.in_flight,
            total_requests: self.total_requests,
            total_errors: self.total_errors,
            consecutive_failures: self.consecutive_failures,
            avg_response_ms: self.avg_response_ms,
            last_health_check_ms: self.last_health_check_ms,
            telemetry: self.telemetry.clone(),
        }
    }

    fn apply_success(&mut self, elapsed: Duration, th: &HealthThresholds) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        self.avg_response_ms = Some(match self.avg_response_ms {
            Some(avg) => th.ema_alpha * sample + (1.0 - th.ema_alpha) * avg,
            None => sample,
        });
        self.consecutive_failures = 0;
        self.health_score = (self.health_score + th.success_increment).min(1.0);
        self.status = derive_status(self.health_score, self.consecutive_failures, th);
    }

    fn apply_failure(&mut self, category: ErrorCategory, th: &HealthThresholds) {
        self.total_errors = self.total_errors.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.health_score = (self.health_score - th.penalty(category)).max(0.0);
        self.status = derive_status(self.health_score, self.consecutive_failures, th);
    }
}

fn derive_status(score: f64, consecutive_failures: u32, th: &HealthThresholds) -> HealthStatus {
    if score < th.unhealthy_below || consecutive_failures >= th.max_consecutive_failures {
        HealthStatus::Unhealthy
    } else if score < th.degraded_below {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[derive(Debug)]
struct ModelSlot {
    state: ModelAvailability,
    /// Present while a pull is in flight; joiners subscribe here.
    waiter: Option<watch::Receiver<ModelAvailability>>,
}

/// What a caller of [`InstanceRegistry::claim_pull`] must do next.
#[derive(Debug)]
pub(crate) enum PullTicket {
    /// Model is already on the instance.
    Ready,
    /// Another caller is pulling; wait for its result.
    Join(watch::Receiver<ModelAvailability>),
    /// This caller owns the pull and must publish the result.
    Lead(watch::Sender<ModelAvailability>),
}

/// Live state of every backend instance plus per-instance model availability.
///
/// Entries are sharded, so updates to one instance never wait on another.
pub struct InstanceRegistry {
    instances: DashMap<String, InstanceRecord>,
    models: DashMap<(String, String), ModelSlot>,
    thresholds: HealthThresholds,
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("instances", &self.instances.len())
            .finish()
    }
}

impl InstanceRegistry {
    pub fn new(infos: Vec<InstanceInfo>, thresholds: HealthThresholds) -> Arc<Self> {
        let instances = DashMap::new();
        for info in infos {
            tracing::info!(instance_id=%info.instance_id, gpu_index=info.gpu_index, base_url=%info.base_url(), "registered instance");
            instances.insert(info.instance_id.clone(), InstanceRecord::new(info));
        }
        Arc::new(Self {
            instances,
            models: DashMap::new(),
            thresholds,
        })
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, instance_id: &str) -> Option<InstanceSnapshot> {
        self.instances.get(instance_id).map(|r| r.snapshot())
    }

    /// Copy of every instance, ordered by accelerator index.
    pub fn snapshot(&self) -> Vec<InstanceSnapshot> {
        let mut out: Vec<InstanceSnapshot> = self.instances.iter().map(|r| r.snapshot()).collect();
        out.sort_by_key(|s| s.info.gpu_index);
        out
    }

    /// Instances whose accelerator can hold `requirement`, in accelerator order.
    /// Health is not filtered here; see [`InstanceSnapshot::is_selectable`].
    pub fn list_eligible(
        &self,
        requirement: &ModelRequirement,
        memory_margin_mb: u64,
    ) -> Vec<InstanceSnapshot> {
        eligibility::eligible(self.snapshot(), requirement, memory_margin_mb)
    }

    /// Count a request as in flight on `instance_id` until the guard drops.
    pub fn begin_dispatch(self: &Arc<Self>, instance_id: &str) -> Option<InFlightGuard> {
        let mut rec = self.instances.get_mut(instance_id)?;
        rec.in_flight = rec.in_flight.saturating_add(1);
        Some(InFlightGuard {
            registry: Arc::clone(self),
            instance_id: instance_id.to_string(),
        })
    }

    fn end_dispatch(&self, instance_id: &str) {
        if let Some(mut rec) = self.instances.get_mut(instance_id) {
            rec.in_flight = rec.in_flight.saturating_sub(1);
        }
    }

    /// Fold one dispatch attempt into the instance's health.
    ///
    /// Cancellations are caller-driven and leave health untouched.
    pub fn report_outcome(&self, outcome: &RequestOutcome) {
        let Some(mut rec) = self.instances.get_mut(&outcome.instance_id) else {
            tracing::warn!(instance_id=%outcome.instance_id, "outcome for unknown instance");
            return;
        };
        let before = rec.status;
        match outcome.error {
            None => {
                rec.total_requests = rec.total_requests.saturating_add(1);
                rec.apply_success(outcome.elapsed, &self.thresholds);
            }
            Some(ErrorCategory::Cancelled) => {
                tracing::debug!(instance_id=%outcome.instance_id, "cancelled attempt not counted against health");
                return;
            }
            Some(category) => {
                rec.total_requests = rec.total_requests.saturating_add(1);
                rec.apply_failure(category, &self.thresholds);
            }
        }
        log_transition(&rec, before);
    }

    /// Fold a health probe result in. Probes move the score like requests do
    /// but are not counted as traffic.
    pub fn record_probe(&self, instance_id: &str, result: Result<Duration, ErrorCategory>) {
        let Some(mut rec) = self.instances.get_mut(instance_id) else {
            return;
        };
        let before = rec.status;
        rec.last_health_check_ms = Some(now_ms());
        match result {
            Ok(elapsed) => rec.apply_success(elapsed, &self.thresholds),
            Err(ErrorCategory::Cancelled) => return,
            Err(category) => rec.apply_failure(category, &self.thresholds),
        }
        log_transition(&rec, before);
    }

    /// Operator override of an instance's score. Clears the failure streak so
    /// the status follows the new score.
    pub fn set_health_score(&self, instance_id: &str, score: f64) -> Option<InstanceSnapshot> {
        let mut rec = self.instances.get_mut(instance_id)?;
        let before = rec.status;
        rec.health_score = score.clamp(0.0, 1.0);
        rec.consecutive_failures = 0;
        rec.status = derive_status(rec.health_score, 0, &self.thresholds);
        log_transition(&rec, before);
        Some(rec.snapshot())
    }

    /// Attach the latest hardware reading to the instance on that accelerator.
    pub fn update_telemetry(&self, telemetry: GpuTelemetry) -> bool {
        for mut rec in self.instances.iter_mut() {
            if rec.info.gpu_index == telemetry.gpu_index {
                rec.telemetry = Some(telemetry);
                return true;
            }
        }
        tracing::warn!(gpu_index = telemetry.gpu_index, "telemetry for unknown accelerator");
        false
    }

    pub fn availability(&self, instance_id: &str, model: &str) -> ModelAvailability {
        let key = (instance_id.to_string(), normalize_model_name(model));
        self.models
            .get(&key)
            .map(|slot| slot.state.clone())
            .unwrap_or(ModelAvailability::Absent)
    }

    /// Decide, atomically per (instance, model), whether the caller leads a
    /// new pull, joins one in flight, or needs nothing.
    pub(crate) fn claim_pull(&self, instance_id: &str, model: &str) -> PullTicket {
        let key = (instance_id.to_string(), normalize_model_name(model));
        let mut slot = self.models.entry(key).or_insert_with(|| ModelSlot {
            state: ModelAvailability::Absent,
            waiter: None,
        });
        if slot.state == ModelAvailability::Available {
            return PullTicket::Ready;
        }
        if slot.state == ModelAvailability::Pulling {
            // A closed channel means the leader died without publishing; lead afresh.
            match slot.waiter.clone() {
                Some(rx) if rx.has_changed().is_ok() => return PullTicket::Join(rx),
                Some(_) => {
                    tracing::warn!(instance_id=%instance_id, model=%model, "pull leader vanished, restarting pull");
                }
                None => {}
            }
        }
        let (tx, rx) = watch::channel(ModelAvailability::Pulling);
        slot.state = ModelAvailability::Pulling;
        slot.waiter = Some(rx);
        PullTicket::Lead(tx)
    }

    /// Record the terminal state of a pull started via [`Self::claim_pull`].
    pub(crate) fn finish_pull(&self, instance_id: &str, model: &str, state: ModelAvailability) {
        let key = (instance_id.to_string(), normalize_model_name(model));
        if let Some(mut slot) = self.models.get_mut(&key) {
            slot.state = state;
            slot.waiter = None;
        }
    }

    /// Replace the instance's known model set with what the backend listed.
    /// Keys with a pull in flight are left alone.
    pub(crate) fn sync_models(&self, instance_id: &str, listed: &[String]) {
        let listed: Vec<String> = listed.iter().map(|m| normalize_model_name(m)).collect();
        for mut slot in self.models.iter_mut() {
            let (id, model) = slot.key().clone();
            if id == instance_id
                && slot.state == ModelAvailability::Available
                && !listed.contains(&model)
            {
                slot.state = ModelAvailability::Absent;
            }
        }
        for model in listed {
            let mut slot = self
                .models
                .entry((instance_id.to_string(), model))
                .or_insert_with(|| ModelSlot {
                    state: ModelAvailability::Absent,
                    waiter: None,
                });
            if slot.waiter.is_none() {
                slot.state = ModelAvailability::Available;
            }
        }
    }

    /// Instances on which `model` is known to be present.
    pub fn instances_with_model(&self, model: &str) -> Vec<String> {
        let model = normalize_model_name(model);
        let mut out: Vec<String> = self
            .models
            .iter()
            .filter(|slot| slot.key().1 == model && slot.state == ModelAvailability::Available)
            .map(|slot| slot.key().0.clone())
            .collect();
        out.sort();
        out
    }
}

fn log_transition(rec: &InstanceRecord, before: HealthStatus) {
    if rec.status != before {
        tracing::info!(
            instance_id=%rec.info.instance_id,
            from=?before,
            to=?rec.status,
            score=rec.health_score,
            consecutive_failures=rec.consecutive_failures,
            "instance health changed"
        );
    }
}

/// Decrements the instance's in-flight gauge on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<InstanceRegistry>,
    instance_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.end_dispatch(&self.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(n: u32) -> Arc<InstanceRegistry> {
        let infos = (0..n)
            .map(|i| InstanceInfo::for_gpu(i, "127.0.0.1", 11434))
            .collect();
        InstanceRegistry::new(infos, HealthThresholds::default())
    }

    fn fail(reg: &InstanceRegistry, id: &str, category: ErrorCategory) {
        reg.report_outcome(&RequestOutcome::failure(id, Duration::from_millis(5), category));
    }

    #[test]
    fn test_snapshot_is_ordered_by_gpu() {
        let reg = registry(4);
        let ids: Vec<String> = reg.snapshot().iter().map(|s| s.instance_id().to_string()).collect();
        assert_eq!(ids, vec!["gpu0", "gpu1", "gpu2", "gpu3"]);
    }

    #[test]
    fn test_success_updates_counters_and_ema() {
        let reg = registry(1);
        reg.report_outcome(&RequestOutcome::success("gpu0", Duration::from_millis(100)));
        reg.report_outcome(&RequestOutcome::success("gpu0", Duration::from_millis(200)));
        let s = reg.get("gpu0").unwrap();
        assert_eq!(s.total_requests, 2);
        assert_eq!(s.total_errors, 0);
        // 0.2 * 200 + 0.8 * 100
        let avg = s.avg_response_ms.unwrap();
        assert!((avg - 120.0).abs() < 1e-9);
        assert_eq!(s.health_score, 1.0);
    }

    #[test]
    fn test_three_consecutive_failures_mark_unhealthy() {
        let reg = registry(1);
        fail(&reg, "gpu0", ErrorCategory::Network);
        assert_eq!(reg.get("gpu0").unwrap().status, HealthStatus::Healthy);
        fail(&reg, "gpu0", ErrorCategory::Timeout);
        assert_eq!(reg.get("gpu0").unwrap().status, HealthStatus::Degraded);
        fail(&reg, "gpu0", ErrorCategory::Network);
        let s = reg.get("gpu0").unwrap();
        assert_eq!(s.status, HealthStatus::Unhealthy);
        assert!(!s.is_selectable());
        assert_eq!(s.total_errors, 3);
    }

    #[test]
    fn test_consecutive_failures_force_unhealthy_despite_score() {
        let reg = registry(1);
        for _ in 0..3 {
            fail(&reg, "gpu0", ErrorCategory::ServerError(404));
        }
        let s = reg.get("gpu0").unwrap();
        assert!(s.health_score > 0.7);
        assert_eq!(s.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_recovery_is_gradual() {
        let reg = registry(1);
        for _ in 0..3 {
            fail(&reg, "gpu0", ErrorCategory::Timeout);
        }
        reg.record_probe("gpu0", Ok(Duration::from_millis(3)));
        let s = reg.get("gpu0").unwrap();
        assert_eq!(s.status, HealthStatus::Degraded);
        assert!(s.is_selectable());
        assert!(s.last_health_check_ms.is_some());
        // Probes are not traffic.
        assert_eq!(s.total_requests, 3);

        for _ in 0..5 {
            reg.record_probe("gpu0", Ok(Duration::from_millis(3)));
        }
        assert_eq!(reg.get("gpu0").unwrap().status, HealthStatus::Healthy);
    }

    #[test]
    fn test_cancelled_outcome_is_ignored() {
        let reg = registry(1);
        fail(&reg, "gpu0", ErrorCategory::Cancelled);
        let s = reg.get("gpu0").unwrap();
        assert_eq!(s.total_errors, 0);
        assert_eq!(s.health_score, 1.0);
        assert_eq!(s.consecutive_failures, 0);
    }

    #[test]
    fn test_penalty_depends_on_severity() {
        let reg = registry(2);
        fail(&reg, "gpu0", ErrorCategory::Timeout);
        fail(&reg, "gpu1", ErrorCategory::InvalidResponse);
        assert!(reg.get("gpu0").unwrap().health_score < reg.get("gpu1").unwrap().health_score);
    }

    #[test]
    fn test_in_flight_guard() {
        let reg = registry(1);
        let g1 = reg.begin_dispatch("gpu0").unwrap();
        let g2 = reg.begin_dispatch("gpu0").unwrap();
        assert_eq!(reg.get("gpu0").unwrap().in_flight, 2);
        drop(g1);
        assert_eq!(reg.get("gpu0").unwrap().in_flight, 1);
        drop(g2);
        assert_eq!(reg.get("gpu0").unwrap().in_flight, 0);
        assert!(reg.begin_dispatch("gpu9").is_none());
    }

    #[test]
    fn test_set_health_score() {
        let reg = registry(1);
        for _ in 0..3 {
            fail(&reg, "gpu0", ErrorCategory::Network);
        }
        let s = reg.set_health_score("gpu0", 1.0).unwrap();
        assert_eq!(s.status, HealthStatus::Healthy);
        assert_eq!(s.consecutive_failures, 0);
        assert!(reg.set_health_score("nope", 1.0).is_none());
    }

    #[test]
    fn test_update_telemetry_by_gpu_index() {
        let reg = registry(2);
        let t = GpuTelemetry {
            gpu_index: 1,
            memory_total_mb: 24_576,
            memory_used_mb: 1_024,
            temperature_c: Some(60),
            utilization_pct: Some(10),
            power_draw_w: None,
            healthy: true,
            supports_fp16: None,
            supports_bf16: None,
            updated_at_ms: 0,
        };
        assert!(reg.update_telemetry(t.clone()));
        assert_eq!(reg.get("gpu1").unwrap().telemetry, Some(t.clone()));
        assert!(reg.get("gpu0").unwrap().telemetry.is_none());
        assert!(!reg.update_telemetry(GpuTelemetry { gpu_index: 7, ..t }));
    }

    #[test]
    fn test_claim_pull_collapses() {
        let reg = registry(1);
        let PullTicket::Lead(tx) = reg.claim_pull("gpu0", "llama3") else {
            panic!("first caller must lead");
        };
        assert_eq!(reg.availability("gpu0", "llama3:latest"), ModelAvailability::Pulling);
        assert!(matches!(reg.claim_pull("gpu0", "llama3:latest"), PullTicket::Join(_)));
        // Different key proceeds independently.
        assert!(matches!(reg.claim_pull("gpu0", "mistral"), PullTicket::Lead(_)));

        reg.finish_pull("gpu0", "llama3", ModelAvailability::Available);
        let _ = tx.send(ModelAvailability::Available);
        assert!(matches!(reg.claim_pull("gpu0", "llama3"), PullTicket::Ready));
    }

    #[test]
    fn test_failed_pull_can_be_retried() {
        let reg = registry(1);
        let _lead = reg.claim_pull("gpu0", "llama3");
        reg.finish_pull("gpu0", "llama3", ModelAvailability::PullFailed("disk full".into()));
        assert_eq!(
            reg.availability("gpu0", "llama3"),
            ModelAvailability::PullFailed("disk full".into())
        );
        assert!(matches!(reg.claim_pull("gpu0", "llama3"), PullTicket::Lead(_)));
    }

    #[test]
    fn test_abandoned_pull_is_led_again() {
        let reg = registry(1);
        let PullTicket::Lead(tx) = reg.claim_pull("gpu0", "llama3") else {
            panic!("first caller must lead");
        };
        let PullTicket::Join(joined) = reg.claim_pull("gpu0", "llama3") else {
            panic!("second caller must join");
        };
        // Leader gone without finish_pull, as when its task panics.
        drop(tx);
        assert_eq!(reg.availability("gpu0", "llama3"), ModelAvailability::Pulling);
        assert!(joined.has_changed().is_err());

        let PullTicket::Lead(tx) = reg.claim_pull("gpu0", "llama3") else {
            panic!("a dead pull must be taken over");
        };
        assert!(matches!(reg.claim_pull("gpu0", "llama3"), PullTicket::Join(_)));
        drop(tx);
    }

    #[test]
    fn test_sync_models() {
        let reg = registry(2);
        reg.sync_models("gpu0", &["llama3:8b".to_string(), "mistral".to_string()]);
        assert_eq!(reg.availability("gpu0", "mistral:latest"), ModelAvailability::Available);
        assert_eq!(reg.instances_with_model("llama3:8b"), vec!["gpu0"]);

        reg.sync_models("gpu0", &["mistral".to_string()]);
        assert_eq!(reg.availability("gpu0", "llama3:8b"), ModelAvailability::Absent);
        assert_eq!(reg.availability("gpu1", "mistral"), ModelAvailability::Absent);
    }
}
