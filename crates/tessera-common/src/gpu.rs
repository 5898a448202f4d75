use serde::{Deserialize, Serialize};

/// Latest hardware reading for one accelerator, as reported by an external collector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuTelemetry {
    pub gpu_index: u32,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    #[serde(default)]
    pub temperature_c: Option<u32>,
    #[serde(default)]
    pub utilization_pct: Option<u32>,
    #[serde(default)]
    pub power_draw_w: Option<f64>,
    #[serde(default = "default_true")]
    pub healthy: bool,
    /// `Some(false)` means the device is known not to support fp16.
    #[serde(default)]
    pub supports_fp16: Option<bool>,
    #[serde(default)]
    pub supports_bf16: Option<bool>,
    #[serde(default)]
    pub updated_at_ms: u64,
}

fn default_true() -> bool {
    true
}

impl GpuTelemetry {
    pub fn memory_free_mb(&self) -> u64 {
        self.memory_total_mb.saturating_sub(self.memory_used_mb)
    }
}
