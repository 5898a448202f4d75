use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use tessera_common::HealthStatus;

use crate::state::AppState;

#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub requests_inflight: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
    pub request_too_large_total: AtomicU64,
}

fn status_value(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Healthy => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::Unhealthy => 2,
    }
}

pub fn render(st: &AppState) -> String {
    let m = &st.metrics;
    let stats = st.balancer.stats();
    let mut body = format!(
        "tessera_router_requests_total {}\ntessera_router_requests_inflight {}\ntessera_router_responses_2xx {}\ntessera_router_responses_4xx {}\ntessera_router_responses_5xx {}\ntessera_router_request_too_large_total {}\n",
        m.requests_total.load(Ordering::Relaxed),
        m.requests_inflight.load(Ordering::Relaxed),
        m.status_2xx.load(Ordering::Relaxed),
        m.status_4xx.load(Ordering::Relaxed),
        m.status_5xx.load(Ordering::Relaxed),
        m.request_too_large_total.load(Ordering::Relaxed),
    );
    let _ = write!(
        body,
        "tessera_balancer_attempts_total {}\ntessera_balancer_retries_total {}\ntessera_balancer_retry_success_total {}\ntessera_balancer_generate_success_total {}\ntessera_balancer_generate_failure_total {}\ntessera_balancer_pulls_started_total {}\ntessera_balancer_pulls_failed_total {}\n",
        stats.attempts_total,
        stats.retries_total,
        stats.retry_success_total,
        stats.requests_succeeded_total,
        stats.requests_failed_total,
        stats.pulls_started_total,
        stats.pulls_failed_total,
    );

    for inst in st.balancer.health_report().instances {
        let id = inst.instance_id();
        let _ = writeln!(body, "tessera_instance_health_score{{instance=\"{id}\"}} {}", inst.health_score);
        let _ = writeln!(body, "tessera_instance_status{{instance=\"{id}\"}} {}", status_value(inst.status));
        let _ = writeln!(body, "tessera_instance_inflight{{instance=\"{id}\"}} {}", inst.in_flight);
        let _ = writeln!(body, "tessera_instance_requests_total{{instance=\"{id}\"}} {}", inst.total_requests);
        let _ = writeln!(body, "tessera_instance_errors_total{{instance=\"{id}\"}} {}", inst.total_errors);
        if let Some(avg) = inst.avg_response_ms {
            let _ = writeln!(body, "tessera_instance_avg_response_ms{{instance=\"{id}\"}} {avg:.1}");
        }
    }
    body
}

pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    (axum::http::StatusCode::OK, render(&st))
}

/// Holds one unit of `requests_inflight`; a dropped request future releases it too.
struct InflightGuard<'a>(&'a Metrics);

impl<'a> InflightGuard<'a> {
    fn enter(metrics: &'a Metrics) -> Self {
        metrics.requests_inflight.fetch_add(1, Ordering::Relaxed);
        Self(metrics)
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.requests_inflight.fetch_sub(1, Ordering::Relaxed);
    }
}

pub async fn track_requests(
    State(st): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, std::convert::Infallible> {
    let inflight = InflightGuard::enter(&st.metrics);
    let resp = next.run(req).await;
    drop(inflight);
    st.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

    let status = resp.status().as_u16();
    if status >= 500 {
        st.metrics.status_5xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 400 {
        st.metrics.status_4xx.fetch_add(1, Ordering::Relaxed);
    } else if status >= 200 {
        st.metrics.status_2xx.fetch_add(1, Ordering::Relaxed);
    }

    Ok(resp)
}
