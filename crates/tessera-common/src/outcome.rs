use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Timeout,
    Cancelled,
    InvalidResponse,
    ServerError(u16),
}

impl ErrorCategory {
    /// Network, timeouts and 5xx are worth another attempt; anything the caller
    /// caused (cancellation, bad data, 4xx) is not.
    pub fn is_retryable(self) -> bool {
        match self {
            Self::Network | Self::Timeout => true,
            Self::ServerError(code) => code >= 500,
            Self::Cancelled | Self::InvalidResponse => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidResponse => "invalid_response",
            Self::ServerError(code) if code >= 500 => "server_5xx",
            Self::ServerError(_) => "server_4xx",
        }
    }
}

/// Result of one dispatch attempt against one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    pub instance_id: String,
    pub elapsed: Duration,
    /// `None` on success.
    pub error: Option<ErrorCategory>,
}

impl RequestOutcome {
    pub fn success(instance_id: &str, elapsed: Duration) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            elapsed,
            error: None,
        }
    }

    pub fn failure(instance_id: &str, elapsed: Duration, category: ErrorCategory) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            elapsed,
            error: Some(category),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
