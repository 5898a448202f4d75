use thiserror::Error;

use crate::outcome::ErrorCategory;

/// Every failure the balancer surfaces to callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BalancerError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("no instance can hold model '{model}' ({required_mb} MiB required)")]
    NoEligibleInstance { model: String, required_mb: u64 },

    #[error("no healthy instance for model '{model}'")]
    NoHealthyInstance { model: String },

    #[error("network error after {attempts} attempt(s): {message}")]
    Network { message: String, attempts: u32 },

    #[error("timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid response after {attempts} attempt(s): {message}")]
    InvalidResponse { message: String, attempts: u32 },

    #[error("backend returned {status} after {attempts} attempt(s): {message}")]
    ServerError {
        status: u16,
        message: String,
        attempts: u32,
    },

    #[error("pulling model '{model}' on {instance_id} failed: {message}")]
    PullFailed {
        model: String,
        instance_id: String,
        message: String,
    },
}

impl BalancerError {
    /// Build the caller-facing error for a transport failure category.
    pub fn from_category(category: ErrorCategory, message: String, attempts: u32) -> Self {
        match category {
            ErrorCategory::Network => Self::Network { message, attempts },
            ErrorCategory::Timeout => Self::Timeout { attempts },
            ErrorCategory::Cancelled => Self::Cancelled,
            ErrorCategory::InvalidResponse => Self::InvalidResponse { message, attempts },
            ErrorCategory::ServerError(status) => Self::ServerError {
                status,
                message,
                attempts,
            },
        }
    }

    /// Dispatch attempts made before this error surfaced. Zero when no backend
    /// was contacted.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Network { attempts, .. }
            | Self::Timeout { attempts }
            | Self::InvalidResponse { attempts, .. }
            | Self::ServerError { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::Network { .. } => Some(ErrorCategory::Network),
            Self::Timeout { .. } => Some(ErrorCategory::Timeout),
            Self::Cancelled => Some(ErrorCategory::Cancelled),
            Self::InvalidResponse { .. } => Some(ErrorCategory::InvalidResponse),
            Self::ServerError { status, .. } => Some(ErrorCategory::ServerError(*status)),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NoEligibleInstance { .. } => "no_eligible_instance",
            Self::NoHealthyInstance { .. } => "no_healthy_instance",
            Self::Network { .. } => "network",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::ServerError { .. } => "server_error",
            Self::PullFailed { .. } => "pull_failed",
        }
    }
}

pub type BalancerResult<T> = Result<T, BalancerError>;
