pub mod config;
pub mod error;
pub mod gpu;
pub mod instance;
pub mod model;
pub mod outcome;
pub mod report;
pub mod requirement;

pub use config::{BalancerConfig, HealthThresholds};
pub use error::{BalancerError, BalancerResult};
pub use gpu::GpuTelemetry;
pub use instance::{HealthStatus, InstanceInfo, InstanceSnapshot};
pub use model::{ModelAvailability, ModelInfo, PullProgress};
pub use outcome::{ErrorCategory, RequestOutcome};
pub use report::HealthReport;
pub use requirement::{normalize_model_name, ModelProfile, ModelRequirement, Precision};

pub mod telemetry;
