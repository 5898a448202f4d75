//! Client side of the per-instance inference server API.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tessera_common::{ErrorCategory, InstanceInfo, ModelInfo, PullProgress};

/// Caller-supplied generation input; the model is chosen by the balancer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GeneratePayload {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerateResponse {
    pub model: String,
    pub response: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{}: {}", .category.as_str(), .message)]
pub struct BackendError {
    pub category: ErrorCategory,
    pub message: String,
}

impl BackendError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

/// The three endpoints the balancer needs from a backend instance.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn generate(
        &self,
        instance: &InstanceInfo,
        model: &str,
        payload: &GeneratePayload,
    ) -> Result<GenerateResponse, BackendError>;

    async fn list_models(&self, instance: &InstanceInfo) -> Result<Vec<ModelInfo>, BackendError>;

    /// Download `model` onto the instance, reporting progress lines as they arrive.
    /// Returns once the backend reports completion.
    async fn pull_model(
        &self,
        instance: &InstanceInfo,
        model: &str,
        on_progress: &(dyn for<'p> Fn(&'p PullProgress) + Send + Sync),
    ) -> Result<(), BackendError>;
}

fn classify_reqwest_error(error: &reqwest::Error) -> ErrorCategory {
    if error.is_timeout() {
        return ErrorCategory::Timeout;
    }
    if error.is_decode() {
        return ErrorCategory::InvalidResponse;
    }
    if let Some(status) = error.status() {
        return ErrorCategory::ServerError(status.as_u16());
    }
    ErrorCategory::Network
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        BackendError::new(classify_reqwest_error(&e), e.to_string())
    }
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    #[serde(flatten)]
    payload: &'a GeneratePayload,
    stream: bool,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

/// Ollama-compatible HTTP backend.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    http: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(connect_timeout: Duration) -> Result<Self, BackendError> {
        // Per-call deadlines are enforced by the caller; pulls can run for an hour.
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| BackendError::new(ErrorCategory::Network, e.to_string()))?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BackendError::new(
            ErrorCategory::ServerError(status.as_u16()),
            error_message(&body).unwrap_or_else(|| format!("HTTP {status}")),
        ))
    }
}

/// Ollama reports failures as `{"error": "..."}`.
fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn generate(
        &self,
        instance: &InstanceInfo,
        model: &str,
        payload: &GeneratePayload,
    ) -> Result<GenerateResponse, BackendError> {
        let url = format!("{}/api/generate", instance.base_url());
        let resp = self
            .http
            .post(url)
            .json(&GenerateBody {
                model,
                payload,
                stream: false,
            })
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        let bytes = resp.bytes().await?;
        serde_json::from_slice::<GenerateResponse>(&bytes).map_err(|e| {
            BackendError::new(
                ErrorCategory::InvalidResponse,
                format!("malformed generate response: {e}"),
            )
        })
    }

    async fn list_models(&self, instance: &InstanceInfo) -> Result<Vec<ModelInfo>, BackendError> {
        let url = format!("{}/api/tags", instance.base_url());
        let resp = self.http.get(url).send().await?;
        let resp = Self::check_status(resp).await?;
        let bytes = resp.bytes().await?;
        let tags = serde_json::from_slice::<TagsResponse>(&bytes).map_err(|e| {
            BackendError::new(
                ErrorCategory::InvalidResponse,
                format!("malformed tags response: {e}"),
            )
        })?;
        Ok(tags.models)
    }

    async fn pull_model(
        &self,
        instance: &InstanceInfo,
        model: &str,
        on_progress: &(dyn for<'p> Fn(&'p PullProgress) + Send + Sync),
    ) -> Result<(), BackendError> {
        let url = format!("{}/api/pull", instance.base_url());
        let resp = self
            .http
            .post(url)
            .json(&serde_json::json!({ "model": model, "stream": true }))
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;

        let mut stream = resp.bytes_stream();
        let mut buf = BytesMut::new();
        let mut completed = false;
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line = buf.split_to(pos + 1);
                if handle_pull_line(&line, on_progress)? {
                    completed = true;
                }
            }
        }
        if !buf.is_empty() && handle_pull_line(&buf, on_progress)? {
            completed = true;
        }

        if completed {
            Ok(())
        } else {
            Err(BackendError::new(
                ErrorCategory::InvalidResponse,
                "pull stream ended without success status",
            ))
        }
    }
}

/// Parse one NDJSON progress line. Returns `Ok(true)` on the final success line.
fn handle_pull_line(
    line: &[u8],
    on_progress: &(dyn for<'p> Fn(&'p PullProgress) + Send + Sync),
) -> Result<bool, BackendError> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Ok(false);
    }
    let progress: PullProgress = serde_json::from_slice(trimmed).map_err(|e| {
        BackendError::new(
            ErrorCategory::InvalidResponse,
            format!("malformed pull progress: {e}"),
        )
    })?;
    if let Some(err) = progress.error.as_deref() {
        return Err(BackendError::new(ErrorCategory::ServerError(500), err));
    }
    on_progress(&progress);
    Ok(progress.status == "success")
}
