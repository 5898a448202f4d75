use std::sync::Arc;

use tessera_router::Balancer;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub balancer: Arc<Balancer>,
    pub metrics: Arc<Metrics>,
    pub max_request_body_bytes: usize,
}
