//! Daemon kernel: wires the queue, model registry, watcher supervisor, file
//! state, FMDM publisher, and broadcast throttler into a single owned
//! context, and enforces the single-instance registry file. See
//! `SPEC_FULL.md` §3 / spec.md §2 ("Control flow"), §9 ("Replace runtime
//! singletons with injected state").

use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::fmdm::FmdmPublisher;
use crate::model_registry::ModelRegistry;
use crate::queue::{IndexingQueue, Priority};
use crate::throttle::BroadcastThrottler;
use crate::types::{now_ms, ClientConnection, ClientType, FolderEntry, FolderStatus};
use crate::watcher::{WatchConfig, WatcherSupervisor};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    pid: u32,
    http_port: u16,
    ws_port: u16,
    start_time: u64,
    version: String,
}

/// Acquires the single-instance registry file at `<home>/.folder-mcp/daemon.pid`.
/// Returns `Err` without writing anything when a live peer is detected —
/// Testable Property 10.
pub struct SingletonGuard {
    path: PathBuf,
}

impl SingletonGuard {
    pub fn acquire(config: &DaemonConfig) -> DaemonResult<Self> {
        let path = DaemonConfig::home_registry_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if let Ok(existing) = std::fs::read_to_string(&path) {
            if let Ok(registry) = serde_json::from_str::<RegistryFile>(&existing) {
                if process_is_alive(registry.pid) {
                    return Err(DaemonError::Internal(format!(
                        "daemon already running (pid {})",
                        registry.pid
                    )));
                }
            }
        }

        let record = RegistryFile {
            pid: std::process::id(),
            http_port: config.http_port,
            ws_port: config.ws_port,
            start_time: SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0),
            version: DAEMON_VERSION.to_string(),
        };
        let json = serde_json::to_string_pretty(&record)?;

        let tmp_path = path.with_extension("pid.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &path)?;

        Ok(Self { path })
    }
}

impl Drop for SingletonGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    false
}

pub struct DaemonKernel {
    pub config: DaemonConfig,
    pub registry: Arc<ModelRegistry>,
    pub queue: Arc<IndexingQueue>,
    pub watchers: Arc<WatcherSupervisor>,
    pub fmdm: Arc<FmdmPublisher>,
    pub throttler: Arc<BroadcastThrottler<Box<dyn Fn() + Send + Sync>>>,
    folders: DashMap<PathBuf, FolderEntry>,
    connections: DashMap<String, ClientConnection>,
}

impl DaemonKernel {
    pub fn new(config: DaemonConfig, registry: Arc<ModelRegistry>, queue: Arc<IndexingQueue>) -> Arc<Self> {
        let fmdm = Arc::new(FmdmPublisher::new(DAEMON_VERSION));
        let fmdm_for_throttle = Arc::clone(&fmdm);
        let folders: DashMap<PathBuf, FolderEntry> = DashMap::new();
        let rate = config.broadcast_rate_per_sec;
        let debounce = std::time::Duration::from_millis(config.broadcast_debounce_ms);

        let throttler = BroadcastThrottler::new(rate, debounce, Box::new(move || {
            fmdm_for_throttle.broadcast_current();
        }) as Box<dyn Fn() + Send + Sync>);

        Arc::new(Self {
            config,
            registry,
            queue,
            watchers: Arc::new(WatcherSupervisor::new()),
            fmdm,
            throttler,
            folders,
            connections: DashMap::new(),
        })
    }

    #[cfg(test)]
    pub fn for_test(config: DaemonConfig, registry: Arc<ModelRegistry>, queue: Arc<IndexingQueue>) -> Self {
        let fmdm = Arc::new(FmdmPublisher::new(DAEMON_VERSION));
        let fmdm_for_throttle = Arc::clone(&fmdm);
        let throttler = BroadcastThrottler::new(5, std::time::Duration::from_millis(50), Box::new(move || {
            fmdm_for_throttle.broadcast_current();
        }) as Box<dyn Fn() + Send + Sync>);
        Self {
            config,
            registry,
            queue,
            watchers: Arc::new(WatcherSupervisor::new()),
            fmdm,
            throttler,
            folders: DashMap::new(),
            connections: DashMap::new(),
        }
    }

    pub fn supported_models(&self) -> Vec<String> {
        self.config.supported_models.clone()
    }

    pub fn register_connection(&self, client_type: ClientType) -> String {
        let conn = crate::ws_protocol::new_connection(client_type);
        let id = conn.connection_id.clone();
        self.connections.insert(id.clone(), conn);
        id
    }

    pub fn unregister_connection(&self, connection_id: &str) {
        self.connections.remove(connection_id);
    }

    pub fn touch_connection(&self, connection_id: &str) {
        if let Some(mut conn) = self.connections.get_mut(connection_id) {
            conn.last_activity = now_ms();
        }
    }

    /// Drops connections whose last activity predates `idle_after_ms`,
    /// mirroring the teacher's "prune idle sessions every 5 minutes" loop
    /// over `McpSession`, generalized to this daemon's millisecond
    /// timestamps instead of `Instant`.
    pub fn prune_idle_connections(&self, idle_after_ms: u64) {
        let cutoff = now_ms().saturating_sub(idle_after_ms);
        let before = self.connections.len();
        self.connections.retain(|_, conn| conn.last_activity > cutoff);
        let pruned = before - self.connections.len();
        if pruned > 0 {
            info!(pruned, remaining = self.connections.len(), "pruned idle websocket connections");
        }
    }

    pub fn folder_info(&self, path: &Path) -> Option<FolderEntry> {
        self.folders.get(path).map(|e| e.clone())
    }

    pub fn validate_folder(&self, path: &Path, model_id: Option<&str>) -> DaemonResult<()> {
        if let Some(model_id) = model_id {
            if !self.config.supported_models.iter().any(|m| m == model_id) {
                return Err(DaemonError::UnsupportedModel(model_id.to_string()));
            }
        }
        let metadata = std::fs::metadata(path).map_err(|_| DaemonError::PathNotFound(path.to_path_buf()))?;
        if !metadata.is_dir() {
            return Err(DaemonError::NotADirectory(path.to_path_buf()));
        }
        Ok(())
    }

    /// Validates model + path, removes any descendant entries if `path` is
    /// an ancestor of existing folders (Testable Property 7), persists, and
    /// enqueues with `pending` status without blocking on indexing.
    pub async fn add_folder(self: &Arc<Self>, path: PathBuf, model_id: String) -> DaemonResult<Option<String>> {
        self.validate_folder(&path, Some(&model_id))?;
        let canonical = path.canonicalize().unwrap_or(path);

        let mut removed_descendants = Vec::new();
        for entry in self.folders.iter() {
            if canonical.is_ancestor_of_path(entry.key()) && entry.key() != &canonical {
                removed_descendants.push(entry.key().clone());
            }
        }
        for descendant in &removed_descendants {
            self.folders.remove(descendant);
            self.queue.remove_folder(descendant).await;
        }

        self.folders.insert(canonical.clone(), FolderEntry::new(canonical.clone(), model_id.clone()));
        self.queue.add_folder(canonical.clone(), model_id, Priority::Normal).await;
        self.start_watching(canonical.clone());
        self.publish_snapshot();

        let warning = if removed_descendants.is_empty() {
            None
        } else {
            Some(format!(
                "folder '{}' is an ancestor of {} existing entries; they were removed",
                canonical.display(),
                removed_descendants.len()
            ))
        };
        Ok(warning)
    }

    pub async fn remove_folder(self: &Arc<Self>, path: &Path) {
        self.folders.remove(path);
        self.queue.remove_folder(&path.to_path_buf()).await;
        self.watchers.stop_watching(path);
        self.publish_snapshot();
    }

    /// Starts the per-folder watcher (spec.md §4.3) whose coalesced batches
    /// re-enqueue the folder for incremental reindexing. `add_folder` is
    /// idempotent while queued/active, so a batch arriving mid-index just
    /// extends the existing work item rather than duplicating it.
    fn start_watching(self: &Arc<Self>, path: PathBuf) {
        let config = WatchConfig {
            debounce_ms: self.config.watch_debounce_ms,
            batch_size: self.config.watch_batch_size,
            ..WatchConfig::default()
        };
        let this = Arc::clone(self);
        let watch_root = path.clone();
        // The debounce loop runs on a plain OS thread with no ambient Tokio
        // context (see `watcher::FolderWatch::start`), so `on_batch` can't
        // call `tokio::spawn` directly; capture this async call site's
        // runtime handle instead.
        let handle = tokio::runtime::Handle::current();
        let on_batch = move |batch: Vec<crate::watcher::WatchEvent>| {
            if batch.is_empty() {
                return;
            }
            let Some(model_id) = this.folders.get(&watch_root).map(|e| e.model_id.clone()) else {
                return;
            };
            let queue = Arc::clone(&this.queue);
            let folder = watch_root.clone();
            handle.spawn(async move {
                queue.add_folder(folder, model_id, Priority::Normal).await;
            });
        };
        if let Err(e) = self.watchers.watch(path.clone(), config, on_batch) {
            warn!(path = %path.display(), error = %e, "failed to start file watcher");
        }
    }

    pub fn set_folder_status(&self, path: &Path, status: FolderStatus, progress: Option<u8>) {
        if let Some(mut entry) = self.folders.get_mut(path) {
            entry.status = status;
            entry.progress = progress;
        }
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let folders: Vec<FolderEntry> = self.folders.iter().map(|e| e.value().clone()).collect();
        self.fmdm.publish(folders);
        self.throttler.request_broadcast();
    }
}

trait AncestorOf {
    fn is_ancestor_of_path(&self, other: &Path) -> bool;
}

impl AncestorOf for Path {
    fn is_ancestor_of_path(&self, other: &Path) -> bool {
        other.starts_with(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding_worker::StubEmbeddingWorker;
    use crate::queue::FolderLifecycle;

    struct NoopLifecycle;
    #[async_trait::async_trait]
    impl FolderLifecycle for NoopLifecycle {
        async fn run(
            &self,
            _folder: &PathBuf,
            _model_id: &str,
            _on_progress: &(dyn Fn(u8) + Send + Sync),
        ) -> Result<(), String> {
            Ok(())
        }
    }

    fn test_kernel() -> Arc<DaemonKernel> {
        let registry = Arc::new(ModelRegistry::new(Arc::new(|| {
            Box::new(StubEmbeddingWorker::new()) as Box<dyn crate::embedding_worker::EmbeddingWorker>
        })));
        let queue = IndexingQueue::new(Arc::clone(&registry), Arc::new(NoopLifecycle));
        Arc::new(DaemonKernel::for_test(DaemonConfig::default(), registry, queue))
    }

    #[tokio::test]
    async fn validate_rejects_unsupported_model() {
        let kernel = test_kernel();
        let dir = tempfile::tempdir().unwrap();
        assert!(kernel.validate_folder(dir.path(), Some("bogus")).is_err());
    }

    #[tokio::test]
    async fn validate_rejects_missing_path() {
        let kernel = test_kernel();
        assert!(kernel.validate_folder(Path::new("/does/not/exist"), None).is_err());
    }

    #[tokio::test]
    async fn add_ancestor_removes_descendants() {
        let kernel = test_kernel();
        let root = tempfile::tempdir().unwrap();
        let child = root.path().join("child");
        std::fs::create_dir(&child).unwrap();

        kernel.add_folder(child.clone(), "minilm".to_string()).await.unwrap();
        assert!(kernel.folder_info(&child.canonicalize().unwrap()).is_some());

        let warning = kernel
            .add_folder(root.path().to_path_buf(), "minilm".to_string())
            .await
            .unwrap();
        assert!(warning.is_some());
        assert!(kernel.folder_info(&child.canonicalize().unwrap()).is_none());
        assert!(kernel.folder_info(&root.path().canonicalize().unwrap()).is_some());
    }
}
