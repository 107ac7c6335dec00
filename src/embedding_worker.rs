//! Embedding worker: the black-box process the Model Registry drives through
//! `{uninitialized, initialized-idle, loading, ready, unloading, crashed}`.
//! See `SPEC_FULL.md` §4 / spec.md §4.2.
//!
//! Grounded on the teacher's `semantic.rs` (candle BERT loading + mean-pooled,
//! L2-normalized sentence embeddings), reshaped from a one-shot batch index
//! builder into a resident worker a registry can load/unload/query.

use crate::error::{DaemonError, DaemonResult};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    InitializedIdle,
    Loading,
    Ready,
    Unloading,
    Crashed,
}

/// Parameters resolved from a model identifier string. Mirrors the teacher's
/// `resolve_model` preset table, generalized to the model ids the daemon's
/// catalog exposes rather than codebase-search-specific presets.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub model_id: String,
    pub repo_id: String,
    pub dim: usize,
}

pub fn resolve_model(model_id: &str) -> DaemonResult<ModelSpec> {
    match model_id {
        "minilm" | "all-MiniLM-L6-v2" => Ok(ModelSpec {
            model_id: model_id.to_string(),
            repo_id: "sentence-transformers/all-MiniLM-L6-v2".into(),
            dim: 384,
        }),
        "mpnet" | "all-mpnet-base-v2" => Ok(ModelSpec {
            model_id: model_id.to_string(),
            repo_id: "sentence-transformers/all-mpnet-base-v2".into(),
            dim: 768,
        }),
        other => Err(DaemonError::UnsupportedModel(other.to_string())),
    }
}

/// The worker surface the Model Registry drives. A real implementation wraps
/// a candle `BertModel` + `Tokenizer`; tests use `StubEmbeddingWorker`
/// instead of pulling in model weights.
pub trait EmbeddingWorker: Send + Sync {
    fn state(&self) -> WorkerState;
    fn current_model(&self) -> Option<String>;

    /// Blocking: fetches weights/tokenizer (network or HF cache) and moves
    /// to `Ready`. Bounded by the registry's 30s `waitForState` timeout.
    fn load_model(&self, spec: &ModelSpec) -> DaemonResult<()>;

    fn unload_model(&self) -> DaemonResult<()>;

    /// Mean-pooled, L2-normalized embeddings, one vector per input text.
    fn embed(&self, texts: &[&str]) -> DaemonResult<Vec<Vec<f32>>>;

    fn shutdown(&self);
}

/// Candle-backed worker. Model loading follows the teacher's `load_model`:
/// HF Hub repo fetch of `config.json` / `tokenizer.json` / `model.safetensors`,
/// then `VarBuilder::from_mmaped_safetensors` into a `BertModel`. Embedding
/// follows `encode_batch`'s mean-pool-then-L2-normalize pipeline.
#[cfg(feature = "semantic")]
pub mod candle_worker {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::VarBuilder;
    use candle_transformers::models::bert::{BertModel, Config as BertConfig};
    use hf_hub::{api::sync::Api, Repo, RepoType};
    use std::sync::RwLock;
    use tokenizers::Tokenizer;

    struct Loaded {
        model: BertModel,
        tokenizer: Tokenizer,
        device: Device,
        spec: ModelSpec,
    }

    pub struct CandleEmbeddingWorker {
        inner: RwLock<Option<Loaded>>,
        state: RwLock<WorkerState>,
    }

    impl CandleEmbeddingWorker {
        pub fn new() -> Self {
            Self {
                inner: RwLock::new(None),
                state: RwLock::new(WorkerState::Uninitialized),
            }
        }

        fn select_device() -> Device {
            Device::Cpu
        }
    }

    impl Default for CandleEmbeddingWorker {
        fn default() -> Self {
            Self::new()
        }
    }

    impl EmbeddingWorker for CandleEmbeddingWorker {
        fn state(&self) -> WorkerState {
            *self.state.read().unwrap()
        }

        fn current_model(&self) -> Option<String> {
            self.inner.read().unwrap().as_ref().map(|l| l.spec.model_id.clone())
        }

        fn load_model(&self, spec: &ModelSpec) -> DaemonResult<()> {
            *self.state.write().unwrap() = WorkerState::Loading;

            let device = Self::select_device();
            let api = Api::new().map_err(|e| {
                *self.state.write().unwrap() = WorkerState::Crashed;
                DaemonError::WorkerCrashed(format!("HF API init failed: {e}"))
            })?;
            let repo = api.repo(Repo::with_revision(
                spec.repo_id.clone(),
                RepoType::Model,
                "main".to_string(),
            ));

            let load = || -> Result<Loaded, String> {
                let config_path =
                    repo.get("config.json").map_err(|e| format!("config.json: {e}"))?;
                let tokenizer_path =
                    repo.get("tokenizer.json").map_err(|e| format!("tokenizer.json: {e}"))?;
                let weights_path =
                    repo.get("model.safetensors").map_err(|e| format!("model.safetensors: {e}"))?;

                let config_str = std::fs::read_to_string(&config_path)
                    .map_err(|e| format!("reading config: {e}"))?;
                let config: BertConfig =
                    serde_json::from_str(&config_str).map_err(|e| format!("parsing config: {e}"))?;
                let tokenizer = Tokenizer::from_file(&tokenizer_path)
                    .map_err(|e| format!("loading tokenizer: {e}"))?;
                let vb = unsafe {
                    VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device)
                        .map_err(|e| format!("loading weights: {e}"))?
                };
                let model =
                    BertModel::load(vb, &config).map_err(|e| format!("loading BERT model: {e}"))?;
                Ok(Loaded { model, tokenizer, device: device.clone(), spec: spec.clone() })
            };

            match load() {
                Ok(loaded) => {
                    *self.inner.write().unwrap() = Some(loaded);
                    *self.state.write().unwrap() = WorkerState::Ready;
                    Ok(())
                }
                Err(e) => {
                    *self.state.write().unwrap() = WorkerState::Crashed;
                    Err(DaemonError::WorkerCrashed(e))
                }
            }
        }

        fn unload_model(&self) -> DaemonResult<()> {
            *self.state.write().unwrap() = WorkerState::Unloading;
            *self.inner.write().unwrap() = None;
            *self.state.write().unwrap() = WorkerState::InitializedIdle;
            Ok(())
        }

        fn embed(&self, texts: &[&str]) -> DaemonResult<Vec<Vec<f32>>> {
            let guard = self.inner.read().unwrap();
            let loaded = guard
                .as_ref()
                .ok_or_else(|| DaemonError::Internal("embed called with no model loaded".into()))?;
            encode_batch(&loaded.model, &loaded.tokenizer, &loaded.device, texts, loaded.spec.dim)
                .map_err(DaemonError::WorkerCrashed)
        }

        fn shutdown(&self) {
            *self.inner.write().unwrap() = None;
            *self.state.write().unwrap() = WorkerState::Uninitialized;
        }
    }

    /// Mean pooling over the attention mask, then L2 normalization — matches
    /// the teacher's `encode_batch` exactly, only generalized off the
    /// codebase-search `Chunk`/`dim` locals to plain `&str` inputs.
    fn encode_batch(
        model: &BertModel,
        tokenizer: &Tokenizer,
        device: &Device,
        texts: &[&str],
        dim: usize,
    ) -> Result<Vec<Vec<f32>>, String> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| format!("tokenization failed: {e}"))?;
        let max_len = encodings.iter().map(|e| e.get_ids().len()).max().unwrap_or(0);

        let mut all_ids: Vec<u32> = Vec::new();
        let mut all_mask: Vec<u32> = Vec::new();
        let mut all_type_ids: Vec<u32> = Vec::new();
        for enc in &encodings {
            let ids = enc.get_ids();
            let mask = enc.get_attention_mask();
            let type_ids = enc.get_type_ids();
            let pad_len = max_len - ids.len();
            all_ids.extend_from_slice(ids);
            all_ids.extend(std::iter::repeat(0u32).take(pad_len));
            all_mask.extend_from_slice(mask);
            all_mask.extend(std::iter::repeat(0u32).take(pad_len));
            all_type_ids.extend_from_slice(type_ids);
            all_type_ids.extend(std::iter::repeat(0u32).take(pad_len));
        }

        let batch_size = texts.len();
        let input_ids = Tensor::from_vec(all_ids, (batch_size, max_len), device)
            .map_err(|e| format!("tensor creation failed: {e}"))?;
        let attention_mask = Tensor::from_vec(
            all_mask.iter().map(|&x| x as f32).collect::<Vec<_>>(),
            (batch_size, max_len),
            device,
        )
        .map_err(|e| format!("tensor creation failed: {e}"))?;
        let token_type_ids = Tensor::from_vec(all_type_ids, (batch_size, max_len), device)
            .map_err(|e| format!("tensor creation failed: {e}"))?;

        let output = model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))
            .map_err(|e| format!("forward pass failed: {e}"))?;

        let mask_expanded = attention_mask
            .unsqueeze(2)
            .map_err(|e| format!("unsqueeze failed: {e}"))?
            .broadcast_as(output.shape())
            .map_err(|e| format!("broadcast failed: {e}"))?;
        let masked = output.mul(&mask_expanded).map_err(|e| format!("mul failed: {e}"))?;
        let summed = masked.sum(1).map_err(|e| format!("sum failed: {e}"))?;
        let mask_sum = mask_expanded
            .sum(1)
            .map_err(|e| format!("mask sum failed: {e}"))?
            .clamp(1e-9, f64::MAX)
            .map_err(|e| format!("clamp failed: {e}"))?;
        let mean_pooled = summed.div(&mask_sum).map_err(|e| format!("div failed: {e}"))?;

        let norms = mean_pooled
            .sqr()
            .map_err(|e| format!("sqr failed: {e}"))?
            .sum(1)
            .map_err(|e| format!("norm sum failed: {e}"))?
            .sqrt()
            .map_err(|e| format!("sqrt failed: {e}"))?
            .unsqueeze(1)
            .map_err(|e| format!("unsqueeze failed: {e}"))?
            .broadcast_as(mean_pooled.shape())
            .map_err(|e| format!("broadcast failed: {e}"))?
            .clamp(1e-9, f64::MAX)
            .map_err(|e| format!("clamp failed: {e}"))?;
        let normalized = mean_pooled.div(&norms).map_err(|e| format!("div failed: {e}"))?;

        let flat: Vec<f32> = normalized
            .flatten_all()
            .map_err(|e| format!("flatten failed: {e}"))?
            .to_vec1()
            .map_err(|e| format!("to_vec1 failed: {e}"))?;

        let mut result = Vec::with_capacity(batch_size);
        for i in 0..batch_size {
            let start = i * dim;
            let end = start + dim;
            result.push(flat[start..end].to_vec());
        }
        Ok(result)
    }
}

/// Deterministic fixed-width worker for tests and for builds without the
/// `semantic` feature: hashes each text into a repeatable pseudo-embedding
/// so similarity tests have something stable to compare against.
pub struct StubEmbeddingWorker {
    state: std::sync::RwLock<WorkerState>,
    current: std::sync::RwLock<Option<ModelSpec>>,
}

impl StubEmbeddingWorker {
    pub fn new() -> Self {
        Self {
            state: std::sync::RwLock::new(WorkerState::Uninitialized),
            current: std::sync::RwLock::new(None),
        }
    }
}

impl Default for StubEmbeddingWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingWorker for StubEmbeddingWorker {
    fn state(&self) -> WorkerState {
        *self.state.read().unwrap()
    }

    fn current_model(&self) -> Option<String> {
        self.current.read().unwrap().as_ref().map(|s| s.model_id.clone())
    }

    fn load_model(&self, spec: &ModelSpec) -> DaemonResult<()> {
        *self.current.write().unwrap() = Some(spec.clone());
        *self.state.write().unwrap() = WorkerState::Ready;
        Ok(())
    }

    fn unload_model(&self) -> DaemonResult<()> {
        *self.current.write().unwrap() = None;
        *self.state.write().unwrap() = WorkerState::InitializedIdle;
        Ok(())
    }

    fn embed(&self, texts: &[&str]) -> DaemonResult<Vec<Vec<f32>>> {
        let dim = self.current.read().unwrap().as_ref().map(|s| s.dim).unwrap_or(8);
        Ok(texts
            .iter()
            .map(|t| {
                use std::hash::{Hash, Hasher};
                let mut h = std::collections::hash_map::DefaultHasher::new();
                t.hash(&mut h);
                let seed = h.finish();
                (0..dim)
                    .map(|i| (((seed.wrapping_add(i as u64)) % 1000) as f32) / 1000.0)
                    .collect()
            })
            .collect())
    }

    fn shutdown(&self) {
        *self.current.write().unwrap() = None;
        *self.state.write().unwrap() = WorkerState::Uninitialized;
    }
}

pub const MODEL_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_model_rejects_unknown_id() {
        assert!(resolve_model("not-a-model").is_err());
    }

    #[test]
    fn stub_worker_transitions_through_states() {
        let w = StubEmbeddingWorker::new();
        assert_eq!(w.state(), WorkerState::Uninitialized);
        let spec = resolve_model("minilm").unwrap();
        w.load_model(&spec).unwrap();
        assert_eq!(w.state(), WorkerState::Ready);
        assert_eq!(w.current_model().as_deref(), Some("minilm"));
        w.unload_model().unwrap();
        assert_eq!(w.state(), WorkerState::InitializedIdle);
        assert!(w.current_model().is_none());
    }

    #[test]
    fn stub_worker_embeds_deterministically() {
        let w = StubEmbeddingWorker::new();
        w.load_model(&resolve_model("minilm").unwrap()).unwrap();
        let a = w.embed(&["hello world"]).unwrap();
        let b = w.embed(&["hello world"]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 384);
    }
}
