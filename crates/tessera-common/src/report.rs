use serde::{Deserialize, Serialize};

use crate::instance::InstanceSnapshot;

/// Summary of registry state at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub degraded_instances: usize,
    pub unhealthy_instances: usize,
    pub generated_at_ms: u64,
    pub instances: Vec<InstanceSnapshot>,
}
