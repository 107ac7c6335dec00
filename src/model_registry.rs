//! Embedding Model Registry: owns the single embedding worker, arbitrates
//! load/unload/reuse, and recovers from worker crashes. See `SPEC_FULL.md`
//! §4 / spec.md §4.2.

use crate::embedding_worker::{resolve_model, EmbeddingWorker, WorkerState, MODEL_LOAD_TIMEOUT};
use crate::error::{DaemonError, DaemonResult};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

/// Factory so the registry can respawn a fresh worker after a crash without
/// depending on a concrete worker type.
pub type WorkerFactory = Arc<dyn Fn() -> Box<dyn EmbeddingWorker> + Send + Sync>;

pub struct ModelRegistry {
    factory: WorkerFactory,
    worker: Mutex<Box<dyn EmbeddingWorker>>,
    current_model: Mutex<Option<String>>,
}

impl ModelRegistry {
    pub fn new(factory: WorkerFactory) -> Self {
        let worker = (factory)();
        Self { factory, worker: Mutex::new(worker), current_model: Mutex::new(None) }
    }

    pub async fn current_model(&self) -> Option<String> {
        self.current_model.lock().await.clone()
    }

    /// Ensures the worker is alive and `model_id` is current. No-op if
    /// already current; otherwise unloads whatever is loaded, then loads
    /// `model_id`, bounded by `MODEL_LOAD_TIMEOUT`.
    pub async fn get_service(&self, model_id: &str) -> DaemonResult<()> {
        self.respawn_if_crashed().await;

        {
            let current = self.current_model.lock().await;
            if current.as_deref() == Some(model_id) {
                return Ok(());
            }
        }

        let spec = resolve_model(model_id)?;

        {
            let worker = self.worker.lock().await;
            if worker.current_model().is_some() {
                worker.unload_model()?;
            }
        }
        *self.current_model.lock().await = None;

        let worker = self.worker.lock().await;
        let load_result = timeout(MODEL_LOAD_TIMEOUT, async { worker.load_model(&spec) }).await;
        match load_result {
            Ok(Ok(())) => {
                drop(worker);
                *self.current_model.lock().await = Some(model_id.to_string());
                info!(model = model_id, "model loaded");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(model = model_id, error = %e, "model load failed");
                Err(e)
            }
            Err(_) => Err(DaemonError::ModelLoadTimeout(MODEL_LOAD_TIMEOUT)),
        }
    }

    /// Embeds `texts` with whatever model `get_service` last made current.
    pub async fn embed(&self, texts: &[&str]) -> DaemonResult<Vec<Vec<f32>>> {
        let worker = self.worker.lock().await;
        worker.embed(texts)
    }

    /// External notification (e.g. from the indexing queue freeing RAM for a
    /// query) that the registry's bookkeeping of `current_model` is stale.
    pub async fn notify_model_unloaded(&self) {
        *self.current_model.lock().await = None;
    }

    pub async fn cleanup(&self) {
        let worker = self.worker.lock().await;
        worker.shutdown();
        drop(worker);
        *self.current_model.lock().await = None;
    }

    /// One automatic respawn on an observed crash, per spec.md §7's
    /// fatal-worker policy; a second consecutive crash surfaces to the
    /// caller as a failed `get_service` instead of respawning indefinitely.
    async fn respawn_if_crashed(&self) {
        let crashed = { self.worker.lock().await.state() == WorkerState::Crashed };
        if crashed {
            warn!("embedding worker crashed, respawning");
            let fresh = (self.factory)();
            *self.worker.lock().await = fresh;
            *self.current_model.lock().await = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding_worker::StubEmbeddingWorker;

    fn stub_factory() -> WorkerFactory {
        Arc::new(|| Box::new(StubEmbeddingWorker::new()) as Box<dyn EmbeddingWorker>)
    }

    #[tokio::test]
    async fn get_service_is_noop_when_already_current() {
        let registry = ModelRegistry::new(stub_factory());
        registry.get_service("minilm").await.unwrap();
        registry.get_service("minilm").await.unwrap();
        assert_eq!(registry.current_model().await.as_deref(), Some("minilm"));
    }

    #[tokio::test]
    async fn switching_models_unloads_then_loads() {
        let registry = ModelRegistry::new(stub_factory());
        registry.get_service("minilm").await.unwrap();
        registry.get_service("mpnet").await.unwrap();
        assert_eq!(registry.current_model().await.as_deref(), Some("mpnet"));
    }

    #[tokio::test]
    async fn unsupported_model_is_rejected() {
        let registry = ModelRegistry::new(stub_factory());
        assert!(registry.get_service("bogus").await.is_err());
    }

    #[tokio::test]
    async fn notify_unloaded_clears_current_model() {
        let registry = ModelRegistry::new(stub_factory());
        registry.get_service("minilm").await.unwrap();
        registry.notify_model_unloaded().await;
        assert!(registry.current_model().await.is_none());
    }
}
