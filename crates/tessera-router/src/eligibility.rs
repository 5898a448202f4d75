use tessera_common::{InstanceSnapshot, ModelRequirement};

/// Keep only instances whose accelerator can take `requirement`.
///
/// An instance without telemetry yet is kept: nothing shows it too small.
pub fn eligible(
    instances: Vec<InstanceSnapshot>,
    requirement: &ModelRequirement,
    memory_margin_mb: u64,
) -> Vec<InstanceSnapshot> {
    let needed_mb = requirement.estimated_memory_mb.saturating_add(memory_margin_mb);
    instances
        .into_iter()
        .filter(|inst| {
            let Some(gpu) = inst.telemetry.as_ref() else {
                return true;
            };
            if !gpu.healthy {
                tracing::debug!(instance_id=%inst.instance_id(), "accelerator reports unhealthy");
                return false;
            }
            if requirement.precision.fp16 && gpu.supports_fp16 == Some(false) {
                return false;
            }
            if requirement.precision.bf16 && gpu.supports_bf16 == Some(false) {
                return false;
            }
            let free_mb = gpu.memory_free_mb();
            if free_mb < needed_mb {
                tracing::debug!(
                    instance_id=%inst.instance_id(),
                    free_mb,
                    needed_mb,
                    model=%requirement.model_name,
                    "not enough free accelerator memory"
                );
                return false;
            }
            true
        })
        .collect()
}
