use serde::{Deserialize, Serialize};

use crate::gpu::GpuTelemetry;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Static identity of one backend instance bound to one accelerator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceInfo {
    /// Stable identifier, e.g. "gpu0".
    pub instance_id: String,
    pub gpu_index: u32,
    pub host: String,
    pub port: u16,
}

impl InstanceInfo {
    /// Build the instance serving accelerator `gpu_index`. Each accelerator gets
    /// its own server on `base_port + gpu_index`.
    pub fn for_gpu(gpu_index: u32, host: &str, base_port: u16) -> Self {
        let port = base_port.saturating_add(gpu_index.min(u16::MAX as u32) as u16);
        Self {
            instance_id: format!("gpu{gpu_index}"),
            gpu_index,
            host: host.to_string(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Point-in-time copy of an instance's live state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSnapshot {
    pub info: InstanceInfo,
    pub status: HealthStatus,
    pub health_score: f64,
    pub in_flight: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub consecutive_failures: u32,
    /// Exponential moving average of successful response times.
    pub avg_response_ms: Option<f64>,
    pub last_health_check_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<GpuTelemetry>,
}

impl InstanceSnapshot {
    pub fn instance_id(&self) -> &str {
        &self.info.instance_id
    }

    /// Unhealthy instances never take normal traffic.
    pub fn is_selectable(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}
