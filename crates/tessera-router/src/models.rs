use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use tessera_common::{
    normalize_model_name, BalancerError, BalancerResult, ErrorCategory, InstanceInfo,
    ModelAvailability, ModelInfo, PullProgress,
};

use crate::backend::{BackendError, InferenceBackend};
use crate::registry::{InstanceRegistry, PullTicket};
use crate::stats::BalancerStats;

/// Makes sure a model is present on an instance before anything is sent to it.
///
/// Concurrent callers for the same (instance, model) share one pull. The pull
/// runs in its own task, so a caller that gives up does not abort it for the
/// others.
pub struct ModelManager {
    registry: Arc<InstanceRegistry>,
    backend: Arc<dyn InferenceBackend>,
    pull_timeout: Duration,
    stats: Arc<BalancerStats>,
}

impl ModelManager {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        backend: Arc<dyn InferenceBackend>,
        pull_timeout: Duration,
        stats: Arc<BalancerStats>,
    ) -> Self {
        Self {
            registry,
            backend,
            pull_timeout,
            stats,
        }
    }

    pub fn availability(&self, instance_id: &str, model: &str) -> ModelAvailability {
        self.registry.availability(instance_id, model)
    }

    /// Resolve once the model is Available on `instance`, or fail with the
    /// pull error. A previously failed key is pulled again.
    pub async fn ensure_available(&self, instance: &InstanceInfo, model: &str) -> BalancerResult<()> {
        let model = normalize_model_name(model);
        let mut rx = match self.registry.claim_pull(&instance.instance_id, &model) {
            PullTicket::Ready => return Ok(()),
            PullTicket::Join(rx) => {
                tracing::debug!(instance_id=%instance.instance_id, model=%model, "joining pull in flight");
                rx
            }
            PullTicket::Lead(tx) => {
                let rx = tx.subscribe();
                self.spawn_pull(instance.clone(), model.clone(), tx);
                rx
            }
        };

        match wait_terminal(&mut rx).await {
            ModelAvailability::Available => Ok(()),
            ModelAvailability::PullFailed(message) => Err(BalancerError::PullFailed {
                model,
                instance_id: instance.instance_id.clone(),
                message,
            }),
            other => Err(BalancerError::PullFailed {
                model,
                instance_id: instance.instance_id.clone(),
                message: format!("pull ended in state {other:?}"),
            }),
        }
    }

    /// Re-read the instance's model list from the backend and replace the cache.
    pub async fn refresh(&self, instance: &InstanceInfo) -> Result<Vec<ModelInfo>, BackendError> {
        let models = self.backend.list_models(instance).await?;
        let names: Vec<String> = models.iter().map(|m| m.name.clone()).collect();
        self.registry.sync_models(&instance.instance_id, &names);
        tracing::debug!(instance_id=%instance.instance_id, count=models.len(), "model list refreshed");
        Ok(models)
    }

    fn spawn_pull(&self, instance: InstanceInfo, model: String, tx: watch::Sender<ModelAvailability>) {
        let registry = Arc::clone(&self.registry);
        let backend = Arc::clone(&self.backend);
        let stats = Arc::clone(&self.stats);
        let pull_timeout = self.pull_timeout;

        tokio::spawn(async move {
            let state = match materialize(backend.as_ref(), &stats, &instance, &model, pull_timeout).await {
                Ok(()) => ModelAvailability::Available,
                Err(e) => {
                    stats.inc_pulls_failed();
                    tracing::warn!(instance_id=%instance.instance_id, model=%model, error=%e, "model pull failed");
                    ModelAvailability::PullFailed(e.message)
                }
            };
            registry.finish_pull(&instance.instance_id, &model, state.clone());
            // Nobody left waiting is fine; the registry already holds the result.
            let _ = tx.send(state);
        });
    }
}

/// Check the backend's list first; pull only when the model is missing.
async fn materialize(
    backend: &dyn InferenceBackend,
    stats: &BalancerStats,
    instance: &InstanceInfo,
    model: &str,
    pull_timeout: Duration,
) -> Result<(), BackendError> {
    match backend.list_models(instance).await {
        Ok(models) if models.iter().any(|m| normalize_model_name(&m.name) == model) => {
            tracing::debug!(instance_id=%instance.instance_id, model=%model, "model already present");
            return Ok(());
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(instance_id=%instance.instance_id, error=%e, "listing models failed, pulling anyway");
        }
    }

    stats.inc_pulls_started();
    tracing::info!(instance_id=%instance.instance_id, model=%model, "pulling model");
    let started = Instant::now();
    let instance_id = instance.instance_id.clone();
    let on_progress = move |p: &PullProgress| {
        tracing::debug!(instance_id=%instance_id, status=%p.status, percent=?p.percent(), "pull progress");
    };

    tokio::time::timeout(pull_timeout, backend.pull_model(instance, model, &on_progress))
        .await
        .map_err(|_| {
            BackendError::new(
                ErrorCategory::Timeout,
                format!("pull did not finish within {}s", pull_timeout.as_secs()),
            )
        })??;

    tracing::info!(
        instance_id=%instance.instance_id,
        model=%model,
        elapsed_ms=started.elapsed().as_millis() as u64,
        "model pulled"
    );
    Ok(())
}

async fn wait_terminal(rx: &mut watch::Receiver<ModelAvailability>) -> ModelAvailability {
    loop {
        {
            let state = rx.borrow_and_update();
            if state.is_terminal() {
                return state.clone();
            }
        }
        if rx.changed().await.is_err() {
            let state = rx.borrow().clone();
            if state.is_terminal() {
                return state;
            }
            return ModelAvailability::PullFailed("pull task exited without a result".to_string());
        }
    }
}
