//! Folder Indexing Queue: serializes indexing across folders, coordinates
//! model switches through the `ModelRegistry`, and yields to on-demand
//! search traffic. See `SPEC_FULL.md` §4 / spec.md §4.1 and Testable
//! Properties 1-3, 9.
//!
//! Grounded on the Design Notes' "replace event-emitter with string events
//! with a typed channel" recommendation: every state change is a
//! `QueueEvent` variant on a `tokio::sync::broadcast` channel rather than a
//! stringly-typed emitter.

use crate::model_registry::ModelRegistry;
use crate::types::{now_ms, Priority, TimestampMs, WorkItemStatus};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Duration;
use tracing::{info, warn};

pub const FOLDER_INDEXING_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const SEARCH_KEEP_ALIVE: Duration = Duration::from_secs(3 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    SemanticSearch,
    AgentActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Processing,
    Paused(PauseReason),
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub folder: PathBuf,
    pub model_id: String,
    pub priority: Priority,
    pub seq: u64,
    pub added_at: TimestampMs,
    pub status: WorkItemStatus,
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued { folder: PathBuf },
    LoadingModel { folder: PathBuf, model_id: String },
    Indexing { folder: PathBuf },
    Progress { folder: PathBuf, percent: u8 },
    Completed { folder: PathBuf },
    Failed { folder: PathBuf, reason: String },
    Paused { reason: PauseReason },
    Resumed,
}

/// External collaborator that performs scan → filter → parse → chunk →
/// embed → store for one folder, reporting progress and a terminal outcome.
/// Kept as a trait so the queue's scheduling logic is testable without a
/// real filesystem walk.
#[async_trait::async_trait]
pub trait FolderLifecycle: Send + Sync {
    async fn run(
        &self,
        folder: &PathBuf,
        model_id: &str,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<(), String>;
}

struct QueueInner {
    pending: VecDeque<WorkItem>,
    state: QueueState,
    active: Option<WorkItem>,
    seq_counter: u64,
}

pub struct IndexingQueue {
    inner: Mutex<QueueInner>,
    registry: Arc<ModelRegistry>,
    lifecycle: Arc<dyn FolderLifecycle>,
    tx: broadcast::Sender<QueueEvent>,
    wake: Notify,
    stopped: AtomicBool,
    last_mcp_call_ms: AtomicU64,
}

impl IndexingQueue {
    pub fn new(registry: Arc<ModelRegistry>, lifecycle: Arc<dyn FolderLifecycle>) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(256);
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                state: QueueState::Idle,
                active: None,
                seq_counter: 0,
            }),
            registry,
            lifecycle,
            tx,
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
            last_mcp_call_ms: AtomicU64::new(0),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.tx.send(event);
    }

    /// Idempotent for a folder already queued or active. `immediate` items
    /// are inserted after existing immediates and before any normals;
    /// otherwise appended FIFO.
    pub async fn add_folder(self: &Arc<Self>, folder: PathBuf, model_id: String, priority: Priority) {
        {
            let mut inner = self.inner.lock().await;
            let already_present = inner.pending.iter().any(|w| w.folder == folder)
                || inner.active.as_ref().map(|w| &w.folder) == Some(&folder);
            if already_present {
                return;
            }

            inner.seq_counter += 1;
            let item = WorkItem {
                folder: folder.clone(),
                model_id,
                priority,
                seq: inner.seq_counter,
                added_at: now_ms(),
                status: WorkItemStatus::Queued,
            };

            match priority {
                Priority::Immediate => {
                    let insert_at =
                        inner.pending.iter().take_while(|w| w.priority == Priority::Immediate).count();
                    inner.pending.insert(insert_at, item);
                }
                Priority::Normal => inner.pending.push_back(item),
            }
        }
        self.emit(QueueEvent::Enqueued { folder });
        self.wake.notify_one();
    }

    /// Removes from the pending list only; a currently-processing item must
    /// finish or be cancelled via `stop`.
    pub async fn remove_folder(&self, folder: &PathBuf) {
        let mut inner = self.inner.lock().await;
        inner.pending.retain(|w| &w.folder != folder);
    }

    pub async fn pause(&self, reason: PauseReason) {
        {
            let mut inner = self.inner.lock().await;
            inner.state = QueueState::Paused(reason);
        }
        if reason == PauseReason::SemanticSearch {
            self.registry.notify_model_unloaded().await;
        }
        self.emit(QueueEvent::Paused { reason });
    }

    /// Clears pause only if no stronger reason remains; scheduling resumes
    /// on the next tick rather than synchronously here.
    pub async fn resume(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.state = QueueState::Idle;
        }
        self.emit(QueueEvent::Resumed);
        self.wake.notify_one();
    }

    pub async fn state(&self) -> QueueState {
        self.inner.lock().await.state
    }

    /// (1) stamps the MCP-call timestamp, (2) pauses with `agent-active`,
    /// (3) makes `model_id` current, (4) runs `do_search`, (5) arms a
    /// 3-minute keep-alive after which the queue resumes iff the pause
    /// reason is still `agent-active`.
    pub async fn process_semantic_search<Fut>(
        self: &Arc<Self>,
        model_id: &str,
        do_search: impl FnOnce() -> Fut,
    ) -> crate::error::DaemonResult<()>
    where
        Fut: std::future::Future<Output = ()>,
    {
        self.last_mcp_call_ms.store(now_ms(), Ordering::SeqCst);
        self.pause(PauseReason::AgentActive).await;
        self.registry.get_service(model_id).await?;
        do_search().await;
        self.arm_keep_alive();
        Ok(())
    }

    fn arm_keep_alive(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let stamp_at_arm = now_ms();
        tokio::spawn(async move {
            tokio::time::sleep(SEARCH_KEEP_ALIVE).await;
            let last_call = this.last_mcp_call_ms.load(Ordering::SeqCst);
            // Only the timer armed by the most recent call should resume —
            // a fresher call re-arms its own timer and supersedes this one.
            if last_call != stamp_at_arm {
                return;
            }
            let still_agent_active =
                matches!(this.inner.lock().await.state, QueueState::Paused(PauseReason::AgentActive));
            if still_agent_active {
                this.resume().await;
            }
        });
    }

    /// Cancels pending work, waits for the active item's cancellation point,
    /// unloads the current model.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        {
            let mut inner = self.inner.lock().await;
            inner.pending.clear();
        }
        self.registry.cleanup().await;
        self.wake.notify_one();
    }

    /// The scheduler main loop: dequeues while idle-and-not-paused, drives
    /// one folder through `loading-model → indexing → {completed|failed}`,
    /// then yields via a deferred tick so incoming immediates interleave
    /// fairly before the next dequeue.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }

            let next = {
                let mut inner = self.inner.lock().await;
                if inner.state != QueueState::Idle {
                    None
                } else {
                    inner.pending.pop_front()
                }
            };

            let Some(item) = next else {
                self.wake.notified().await;
                continue;
            };

            self.process_item(item).await;
            // Deferred tick: yield to the runtime so an immediate enqueued
            // during this item's processing is observed before the next pop.
            tokio::task::yield_now().await;
        }
    }

    async fn process_item(&self, mut item: WorkItem) {
        {
            let mut inner = self.inner.lock().await;
            inner.state = QueueState::Processing;
            item.status = WorkItemStatus::LoadingModel;
            inner.active = Some(item.clone());
        }
        self.emit(QueueEvent::LoadingModel { folder: item.folder.clone(), model_id: item.model_id.clone() });

        if let Err(e) = self.registry.get_service(&item.model_id).await {
            warn!(folder = %item.folder.display(), error = %e, "model load failed, folder indexing aborted");
            self.emit(QueueEvent::Failed { folder: item.folder.clone(), reason: e.to_string() });
            self.finish_item().await;
            return;
        }

        {
            let mut inner = self.inner.lock().await;
            if let Some(active) = inner.active.as_mut() {
                active.status = WorkItemStatus::Indexing;
            }
        }
        self.emit(QueueEvent::Indexing { folder: item.folder.clone() });

        let folder = item.folder.clone();
        let tx = self.tx.clone();
        let on_progress = move |percent: u8| {
            let _ = tx.send(QueueEvent::Progress { folder: folder.clone(), percent });
        };

        let result = tokio::time::timeout(
            FOLDER_INDEXING_TIMEOUT,
            self.lifecycle.run(&item.folder, &item.model_id, &on_progress),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                info!(folder = %item.folder.display(), "folder indexing completed");
                self.emit(QueueEvent::Completed { folder: item.folder.clone() });
            }
            Ok(Err(reason)) => {
                warn!(folder = %item.folder.display(), %reason, "folder indexing failed");
                self.emit(QueueEvent::Failed { folder: item.folder.clone(), reason });
            }
            Err(_) => {
                warn!(folder = %item.folder.display(), "folder indexing timed out after 1h");
                self.emit(QueueEvent::Failed {
                    folder: item.folder.clone(),
                    reason: "indexing timeout".into(),
                });
            }
        }

        self.finish_item().await;
    }

    async fn finish_item(&self) {
        let mut inner = self.inner.lock().await;
        inner.active = None;
        if inner.state == QueueState::Processing {
            inner.state = QueueState::Idle;
        }
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn active_folder(&self) -> Option<PathBuf> {
        self.inner.lock().await.active.as_ref().map(|w| w.folder.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding_worker::StubEmbeddingWorker;
    use std::sync::Mutex as StdMutex;

    struct InstantLifecycle {
        completions: Arc<StdMutex<Vec<PathBuf>>>,
    }

    #[async_trait::async_trait]
    impl FolderLifecycle for InstantLifecycle {
        async fn run(
            &self,
            folder: &PathBuf,
            _model_id: &str,
            _on_progress: &(dyn Fn(u8) + Send + Sync),
        ) -> Result<(), String> {
            self.completions.lock().unwrap().push(folder.clone());
            Ok(())
        }
    }

    fn registry() -> Arc<ModelRegistry> {
        Arc::new(ModelRegistry::new(Arc::new(|| {
            Box::new(StubEmbeddingWorker::new()) as Box<dyn crate::embedding_worker::EmbeddingWorker>
        })))
    }

    #[tokio::test]
    async fn duplicate_add_folder_is_a_noop() {
        let completions = Arc::new(StdMutex::new(Vec::new()));
        let lifecycle = Arc::new(InstantLifecycle { completions });
        let queue = IndexingQueue::new(registry(), lifecycle);
        queue.add_folder(PathBuf::from("/A"), "minilm".into(), Priority::Normal).await;
        queue.add_folder(PathBuf::from("/A"), "minilm".into(), Priority::Normal).await;
        assert_eq!(queue.pending_len().await, 1);
    }

    #[tokio::test]
    async fn immediate_items_are_ordered_before_normals() {
        let completions = Arc::new(StdMutex::new(Vec::new()));
        let lifecycle = Arc::new(InstantLifecycle { completions });
        let queue = IndexingQueue::new(registry(), lifecycle);
        queue.add_folder(PathBuf::from("/N1"), "minilm".into(), Priority::Normal).await;
        queue.add_folder(PathBuf::from("/N2"), "minilm".into(), Priority::Normal).await;
        queue.add_folder(PathBuf::from("/I1"), "minilm".into(), Priority::Immediate).await;

        let order: Vec<PathBuf> = {
            let inner = queue.inner.lock().await;
            inner.pending.iter().map(|w| w.folder.clone()).collect()
        };
        assert_eq!(order, vec![PathBuf::from("/I1"), PathBuf::from("/N1"), PathBuf::from("/N2")]);
    }

    #[tokio::test]
    async fn run_processes_queue_to_completion() {
        let completions = Arc::new(StdMutex::new(Vec::new()));
        let lifecycle = Arc::new(InstantLifecycle { completions: Arc::clone(&completions) });
        let queue = IndexingQueue::new(registry(), lifecycle);
        queue.add_folder(PathBuf::from("/A"), "minilm".into(), Priority::Normal).await;
        queue.add_folder(PathBuf::from("/B"), "minilm".into(), Priority::Normal).await;

        let runner = Arc::clone(&queue);
        let handle = tokio::spawn(async move { runner.run().await });

        for _ in 0..200 {
            if completions.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(completions.lock().unwrap().len(), 2);
        queue.stop().await;
        let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;
    }

    #[tokio::test]
    async fn remove_folder_drops_pending_item() {
        let completions = Arc::new(StdMutex::new(Vec::new()));
        let lifecycle = Arc::new(InstantLifecycle { completions });
        let queue = IndexingQueue::new(registry(), lifecycle);
        queue.add_folder(PathBuf::from("/A"), "minilm".into(), Priority::Normal).await;
        queue.remove_folder(&PathBuf::from("/A")).await;
        assert_eq!(queue.pending_len().await, 0);
    }
}
