use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use tessera_common::{BalancerError, GpuTelemetry, ModelRequirement, Precision};
use tessera_router::backend::GeneratePayload;
use tessera_router::CallOptions;

use crate::state::AppState;

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Caller-facing status for each failure kind.
pub fn error_status(err: &BalancerError) -> StatusCode {
    match err {
        BalancerError::Validation(_) => StatusCode::BAD_REQUEST,
        BalancerError::NoEligibleInstance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        BalancerError::NoHealthyInstance { .. } => StatusCode::SERVICE_UNAVAILABLE,
        BalancerError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        // Client closed request.
        BalancerError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        BalancerError::Network { .. }
        | BalancerError::InvalidResponse { .. }
        | BalancerError::ServerError { .. } => StatusCode::BAD_GATEWAY,
        BalancerError::PullFailed { .. } => StatusCode::FAILED_DEPENDENCY,
    }
}

fn error_response(err: &BalancerError) -> Response {
    let body = json!({
        "error": {
            "kind": err.kind(),
            "message": err.to_string(),
            "attempts": err.attempts(),
        }
    });
    (error_status(err), Json(body)).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    error_response(&BalancerError::Validation(message.into()))
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    #[serde(flatten)]
    pub payload: GeneratePayload,
    /// Overrides the profile table's memory estimate.
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub precision: Option<Precision>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl GenerateRequest {
    fn requirement(&self) -> Option<ModelRequirement> {
        if self.memory_mb.is_none() && self.precision.is_none() {
            return None;
        }
        let mut requirement = ModelRequirement::for_model(&self.model);
        if let Some(mb) = self.memory_mb {
            requirement = requirement.with_memory_mb(mb);
        }
        if let Some(precision) = self.precision {
            requirement = requirement.with_precision(precision);
        }
        Some(requirement)
    }
}

pub async fn generate(State(st): State<AppState>, req: Request<Body>) -> Response {
    let body_bytes = match axum::body::to_bytes(req.into_body(), st.max_request_body_bytes).await {
        Ok(b) => b,
        Err(_) => {
            st.metrics
                .request_too_large_total
                .fetch_add(1, Ordering::Relaxed);
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };
    let request = match serde_json::from_slice::<GenerateRequest>(&body_bytes) {
        Ok(r) => r,
        Err(e) => return bad_request(format!("malformed request body: {e}")),
    };

    let options = CallOptions {
        timeout: request.timeout_ms.map(Duration::from_millis),
    };
    // A client disconnect drops this future, and the in-flight call with it.
    let cancel = CancellationToken::new();

    match st
        .balancer
        .generate(
            &request.model,
            &request.payload,
            request.requirement(),
            &cancel,
            options,
        )
        .await
    {
        Ok(done) => (StatusCode::OK, Json(done)).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    models: Vec<tessera_common::ModelInfo>,
}

pub async fn list_models(State(st): State<AppState>) -> Response {
    let cancel = CancellationToken::new();
    match st.balancer.list_models(&cancel).await {
        Ok(models) => (StatusCode::OK, Json(ModelsResponse { models })).into_response(),
        Err(e) => error_response(&e),
    }
}

pub async fn model_available(State(st): State<AppState>, Path(name): Path<String>) -> Response {
    let cancel = CancellationToken::new();
    match st.balancer.is_model_available(&name, &cancel).await {
        Ok(available) => {
            let instances = st.balancer.registry().instances_with_model(&name);
            (
                StatusCode::OK,
                Json(json!({
                    "model": tessera_common::normalize_model_name(&name),
                    "available": available,
                    "instances": instances,
                })),
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

pub async fn health(State(st): State<AppState>) -> Response {
    (StatusCode::OK, Json(st.balancer.health_report())).into_response()
}

pub async fn put_telemetry(
    State(st): State<AppState>,
    Json(readings): Json<Vec<GpuTelemetry>>,
) -> Response {
    let mut unknown = Vec::new();
    let mut updated = 0usize;
    for mut reading in readings {
        if reading.updated_at_ms == 0 {
            reading.updated_at_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        }
        let gpu = reading.gpu_index;
        if st.balancer.update_telemetry(reading) {
            updated += 1;
        } else {
            unknown.push(gpu);
        }
    }
    (
        StatusCode::OK,
        Json(json!({ "updated": updated, "unknown_gpus": unknown })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ScoreUpdate {
    pub score: f64,
}

pub async fn put_score(
    State(st): State<AppState>,
    Path(instance_id): Path<String>,
    Json(update): Json<ScoreUpdate>,
) -> Response {
    match st.balancer.set_health_score(&instance_id, update.score) {
        Ok(snapshot) => {
            tracing::info!(instance_id=%instance_id, score=update.score, status=?snapshot.status, "health score overridden");
            (StatusCode::OK, Json(snapshot)).into_response()
        }
        Err(e) => error_response(&e),
    }
}
