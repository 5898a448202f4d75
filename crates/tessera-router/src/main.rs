mod args;
mod handlers;
mod metrics;
mod state;
mod sync;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use clap::Parser;

use tessera_router::backend::OllamaBackend;
use tessera_router::Balancer;

use crate::args::Args;
use crate::handlers::{
    generate, health, healthz, list_models, model_available, put_score, put_telemetry,
};
use crate::metrics::{metrics_handler, track_requests};
use crate::state::AppState;
use crate::sync::probe_loop;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let otel_guard = tessera_common::telemetry::init_tracing(
        "tessera-router",
        args.otlp_url.as_deref(),
        args.otlp_token.as_deref(),
        &args.log_format,
    );

    let strategy =
        tessera_router::strategy::parse_strategy(&args.routing_strategy, args.latency_bucket_ms)
            .unwrap_or_else(|e| {
                tracing::error!(error=%e, "invalid routing strategy");
                std::process::exit(1);
            });

    let backend = OllamaBackend::new(Duration::from_millis(args.connect_timeout_ms))
        .map_err(|e| anyhow::anyhow!("failed to build backend client: {e}"))?;

    let balancer = Balancer::with_strategy(
        args.instances(),
        args.balancer_config(),
        Arc::new(backend),
        strategy,
    )
    .map_err(|e| anyhow::anyhow!("invalid balancer configuration: {e}"))?;

    if args.probe_interval_secs > 0 {
        let balancer_for_probe = balancer.clone();
        let interval = Duration::from_secs(args.probe_interval_secs);
        tokio::spawn(async move {
            if let Err(e) = probe_loop(balancer_for_probe, interval).await {
                tracing::error!(error=%e, "probe loop exited");
            }
        });
    } else {
        tracing::warn!("probe_interval_secs is 0, health probing disabled");
    }

    let st = AppState {
        balancer,
        metrics: Arc::new(metrics::Metrics::default()),
        max_request_body_bytes: args.max_request_body_bytes,
    };

    let api_routes = Router::new()
        .route("/api/generate", post(generate))
        .route("/api/models", get(list_models))
        .route("/api/models/:name/available", get(model_available))
        .route("/api/health", get(health))
        .route("/api/telemetry", put(put_telemetry))
        .route("/api/instances/:id/score", put(put_score));

    let public_routes = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler));

    let app = public_routes
        .merge(api_routes)
        .layer(middleware::from_fn_with_state(st.clone(), track_requests))
        .with_state(st);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    tracing::info!(listen_addr=%args.listen_addr, "tessera-router listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(provider) = otel_guard {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error=%e, "failed to flush traces");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error=%e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
