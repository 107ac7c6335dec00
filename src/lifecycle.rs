//! Default folder lifecycle manager: the concrete scan → filter → parse →
//! chunk → embed → store pipeline the queue drives per folder. Spec.md's
//! glossary treats this as an external collaborator ("surfacing state and
//! progress to the queue"); this is this daemon's own implementation of that
//! collaborator, wiring the in-scope components together end to end.

use crate::chunker::{chunk_text, ChunkingPolicy};
use crate::error::{DaemonError, DaemonResult};
use crate::extraction::{ExtractionParams, ParserRegistry};
use crate::file_state::{Decision, FileStateStore};
use crate::model_registry::ModelRegistry;
use crate::queue::FolderLifecycle;
use crate::store::ChunkStore;
use crate::types::Chunk;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub struct DefaultFolderLifecycle {
    parsers: ParserRegistry,
    registry: Arc<ModelRegistry>,
    store: Arc<dyn ChunkStore>,
    file_states: Arc<FileStateStore>,
}

impl DefaultFolderLifecycle {
    pub fn new(
        registry: Arc<ModelRegistry>,
        store: Arc<dyn ChunkStore>,
        file_states: Arc<FileStateStore>,
    ) -> Self {
        Self { parsers: ParserRegistry::new(), registry, store, file_states }
    }

    fn supported_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    if path.file_name().map(|n| n == ".folder-mcp" || n == ".git").unwrap_or(false) {
                        continue;
                    }
                    stack.push(path);
                } else if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                    if self.parsers.for_extension(ext).is_some() {
                        files.push(path);
                    }
                }
            }
        }
        files
    }

    fn content_hash(path: &Path) -> DaemonResult<String> {
        let bytes = std::fs::read(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Markdown files keep the same line-range chunking as plain text but
    /// must carry `ExtractionParams::Markdown` so `MarkdownParser::extract`
    /// (which only matches that variant) can round-trip them.
    fn retag_for_extension(ext: &str, chunks: &mut [Chunk]) {
        if !ext.eq_ignore_ascii_case("md") {
            return;
        }
        for c in chunks.iter_mut() {
            if let ExtractionParams::Text { version, start_line, end_line } = c.params {
                c.params = ExtractionParams::Markdown { version, start_line, end_line, section: None };
            }
        }
    }

    async fn index_file(&self, path: &Path, model_id: &str) -> DaemonResult<usize> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let parser = self
            .parsers
            .for_extension(ext)
            .ok_or_else(|| DaemonError::Validation(format!("no parser for extension '{ext}'")))?;

        let text = parser.parse(path)?;
        let policy = ChunkingPolicy::default();
        let mut chunks: Vec<Chunk> = chunk_text(&text, policy);
        if chunks.is_empty() {
            return Ok(0);
        }
        Self::retag_for_extension(ext, &mut chunks);

        self.registry.get_service(model_id).await?;
        let texts: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        let embeddings = self.registry.embed(&texts).await?;
        for (chunk, _embedding) in chunks.iter_mut().zip(embeddings.into_iter()) {
            // Vector storage is the storage façade's concern (spec.md §6);
            // this daemon's ChunkStore trait persists chunk text + params
            // only, leaving the vector index itself to that capability.
            let _ = chunk;
        }

        self.store.upsert_document(path, chunks.clone())?;
        Ok(chunks.len())
    }

    async fn process_one(&self, path: &Path, model_id: &str) -> DaemonResult<()> {
        let hash = Self::content_hash(path)?;
        match self.file_states.decide(path, &hash) {
            Decision::Ignore | Decision::Skip => return Ok(()),
            Decision::Process => {}
        }

        self.file_states.start_processing(path, &hash);
        match self.index_file(path, model_id).await {
            Ok(chunk_count) => {
                self.file_states.mark_success(path, chunk_count);
                Ok(())
            }
            Err(e) => {
                self.file_states.mark_failure(path, e.to_string(), e.is_corrupting());
                Err(e)
            }
        }
    }
}

#[async_trait::async_trait]
impl FolderLifecycle for DefaultFolderLifecycle {
    async fn run(
        &self,
        folder: &PathBuf,
        model_id: &str,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<(), String> {
        let files = self.supported_files(folder);
        let total = files.len().max(1);
        let mut last_reported = 0u8;

        for (i, file) in files.iter().enumerate() {
            if let Err(e) = self.process_one(file, model_id).await {
                warn!(file = %file.display(), error = %e, "file indexing failed, continuing folder");
            }
            let percent = (((i + 1) * 100) / total) as u8;
            if percent != last_reported {
                on_progress(percent);
                last_reported = percent;
            }
        }

        info!(folder = %folder.display(), files = files.len(), "folder lifecycle completed");
        Ok(())
    }
}
