use std::time::{Duration, Instant};

use futures_util::future::join_all;

use tessera_common::{ErrorCategory, HealthReport, HealthStatus, InstanceInfo};

use crate::models::ModelManager;
use crate::now_ms;
use crate::registry::InstanceRegistry;

/// Summarize the registry as it is right now.
pub fn report(registry: &InstanceRegistry) -> HealthReport {
    let instances = registry.snapshot();
    let count = |status: HealthStatus| instances.iter().filter(|i| i.status == status).count();
    HealthReport {
        total_instances: instances.len(),
        healthy_instances: count(HealthStatus::Healthy),
        degraded_instances: count(HealthStatus::Degraded),
        unhealthy_instances: count(HealthStatus::Unhealthy),
        generated_at_ms: now_ms(),
        instances,
    }
}

/// Probe one instance via its model list. A successful probe also refreshes
/// the availability cache.
pub async fn probe_instance(
    registry: &InstanceRegistry,
    models: &ModelManager,
    instance: &InstanceInfo,
    timeout: Duration,
) -> Result<Duration, ErrorCategory> {
    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, models.refresh(instance)).await {
        Ok(Ok(_)) => Ok(started.elapsed()),
        Ok(Err(e)) => {
            tracing::debug!(instance_id=%instance.instance_id, error=%e, "probe failed");
            Err(e.category)
        }
        Err(_) => {
            tracing::debug!(instance_id=%instance.instance_id, "probe timed out");
            Err(ErrorCategory::Timeout)
        }
    };
    registry.record_probe(&instance.instance_id, result);
    result
}

/// Probe every instance concurrently and return the refreshed report.
pub async fn probe_all(
    registry: &InstanceRegistry,
    models: &ModelManager,
    timeout: Duration,
) -> HealthReport {
    let instances = registry.snapshot();
    join_all(
        instances
            .iter()
            .map(|inst| probe_instance(registry, models, &inst.info, timeout)),
    )
    .await;
    report(registry)
}
