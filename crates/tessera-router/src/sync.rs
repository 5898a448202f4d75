use std::sync::Arc;
use std::time::Duration;

use tessera_common::HealthStatus;
use tessera_router::Balancer;

/// Periodically probe every instance so that ones marked Unhealthy by request
/// failures can earn their way back.
pub async fn probe_loop(balancer: Arc<Balancer>, interval: Duration) -> anyhow::Result<()> {
    if interval.is_zero() {
        anyhow::bail!("probe interval must be non-zero");
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let report = balancer.probe().await;
        if report.unhealthy_instances > 0 {
            let down: Vec<&str> = report
                .instances
                .iter()
                .filter(|i| i.status == HealthStatus::Unhealthy)
                .map(|i| i.instance_id())
                .collect();
            tracing::warn!(
                unhealthy = report.unhealthy_instances,
                instances = ?down,
                "probe round finished with unhealthy instances"
            );
        } else {
            tracing::debug!(
                healthy = report.healthy_instances,
                degraded = report.degraded_instances,
                "probe round finished"
            );
        }
    }
}
