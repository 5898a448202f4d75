//! Scripted in-process backend for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tessera_common::{normalize_model_name, ErrorCategory, InstanceInfo, ModelInfo, PullProgress};

use crate::backend::{BackendError, GeneratePayload, GenerateResponse, InferenceBackend};

/// How `generate` behaves on one instance.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Behavior {
    Ok,
    Delay(Duration),
    /// Never completes; only a timeout or cancellation ends the call.
    Hang,
    Status(u16),
    Network,
    Invalid,
}

#[derive(Debug, Default)]
pub(crate) struct MockBackend {
    behaviors: Mutex<HashMap<String, Behavior>>,
    /// Models present on every instance.
    everywhere: Mutex<Vec<String>>,
    /// Models pulled onto a given instance.
    pulled: Mutex<HashSet<(String, String)>>,
    pull_delay: Mutex<Duration>,
    pull_error: Mutex<Option<String>>,
    list_down: Mutex<HashSet<String>>,
    generate_calls: Mutex<HashMap<String, u64>>,
    pub pull_calls: AtomicU64,
    pub list_calls: AtomicU64,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(self, model: &str) -> Self {
        self.everywhere
            .lock()
            .unwrap()
            .push(normalize_model_name(model));
        self
    }

    pub fn set_behavior(&self, instance_id: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), behavior);
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        *self.pull_delay.lock().unwrap() = delay;
    }

    pub fn set_pull_error(&self, error: Option<&str>) {
        *self.pull_error.lock().unwrap() = error.map(str::to_string);
    }

    /// Make `list_models` fail with a network error on this instance.
    pub fn set_list_down(&self, instance_id: &str, down: bool) {
        let mut set = self.list_down.lock().unwrap();
        if down {
            set.insert(instance_id.to_string());
        } else {
            set.remove(instance_id);
        }
    }

    pub fn generate_calls(&self, instance_id: &str) -> u64 {
        self.generate_calls
            .lock()
            .unwrap()
            .get(instance_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_generate_calls(&self) -> u64 {
        self.generate_calls.lock().unwrap().values().sum()
    }

    fn has_model(&self, instance_id: &str, model: &str) -> bool {
        let model = normalize_model_name(model);
        self.everywhere.lock().unwrap().contains(&model)
            || self
                .pulled
                .lock()
                .unwrap()
                .contains(&(instance_id.to_string(), model))
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn generate(
        &self,
        instance: &InstanceInfo,
        model: &str,
        payload: &GeneratePayload,
    ) -> Result<GenerateResponse, BackendError> {
        *self
            .generate_calls
            .lock()
            .unwrap()
            .entry(instance.instance_id.clone())
            .or_default() += 1;

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&instance.instance_id)
            .cloned()
            .unwrap_or(Behavior::Ok);

        match behavior {
            Behavior::Ok => {}
            Behavior::Delay(d) => tokio::time::sleep(d).await,
            Behavior::Hang => std::future::pending::<()>().await,
            Behavior::Status(code) => {
                return Err(BackendError::new(
                    ErrorCategory::ServerError(code),
                    format!("HTTP {code}"),
                ))
            }
            Behavior::Network => {
                return Err(BackendError::new(ErrorCategory::Network, "connection refused"))
            }
            Behavior::Invalid => {
                return Err(BackendError::new(ErrorCategory::InvalidResponse, "garbage"))
            }
        }

        Ok(GenerateResponse {
            model: model.to_string(),
            response: format!("{} says: {}", instance.instance_id, payload.prompt),
            done: true,
            total_duration: None,
            prompt_eval_count: None,
            eval_count: None,
        })
    }

    async fn list_models(&self, instance: &InstanceInfo) -> Result<Vec<ModelInfo>, BackendError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.list_down.lock().unwrap().contains(&instance.instance_id) {
            return Err(BackendError::new(ErrorCategory::Network, "connection refused"));
        }
        let mut names: Vec<String> = self.everywhere.lock().unwrap().clone();
        names.extend(
            self.pulled
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| *id == instance.instance_id)
                .map(|(_, m)| m.clone()),
        );
        Ok(names
            .into_iter()
            .map(|name| ModelInfo {
                name,
                size: 1,
                modified_at: None,
                digest: String::new(),
            })
            .collect())
    }

    async fn pull_model(
        &self,
        instance: &InstanceInfo,
        model: &str,
        on_progress: &(dyn for<'p> Fn(&'p PullProgress) + Send + Sync),
    ) -> Result<(), BackendError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.pull_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let error = self.pull_error.lock().unwrap().clone();
        if let Some(error) = error {
            return Err(BackendError::new(ErrorCategory::ServerError(500), error));
        }
        on_progress(&PullProgress {
            status: "success".to_string(),
            ..Default::default()
        });
        self.pulled
            .lock()
            .unwrap()
            .insert((instance.instance_id.clone(), normalize_model_name(model)));
        Ok(())
    }
}

#[test]
fn test_mock_tracks_pulled_models() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let mock = MockBackend::new().with_model("mistral");
    let inst = InstanceInfo::for_gpu(0, "127.0.0.1", 11434);
    rt.block_on(async {
        assert!(mock.has_model("gpu0", "mistral:latest"));
        assert!(!mock.has_model("gpu0", "llama3:8b"));
        mock.pull_model(&inst, "llama3:8b", &|_| {}).await.unwrap();
        assert!(mock.has_model("gpu0", "llama3:8b"));
        assert!(!mock.has_model("gpu1", "llama3:8b"));
        assert_eq!(mock.list_models(&inst).await.unwrap().len(), 2);
    });
}
