use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// A model present on a backend instance, as listed by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub digest: String,
}

/// Per (instance, model) materialization state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state", content = "error")]
pub enum ModelAvailability {
    Absent,
    Pulling,
    Available,
    PullFailed(String),
}

impl ModelAvailability {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Available | Self::PullFailed(_))
    }
}

/// One progress line of a streaming model pull.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PullProgress {
    pub fn percent(&self) -> Option<f64> {
        match (self.total, self.completed) {
            (Some(total), Some(done)) if total > 0 => Some(done as f64 / total as f64 * 100.0),
            _ => None,
        }
    }
}
