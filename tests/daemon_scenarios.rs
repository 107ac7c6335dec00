//! End-to-end scenarios straight out of the literal S1-S6 cases and a few of
//! the cross-component Testable Properties: dedup enqueue, priority
//! interleave, model switching, ancestor-add replacement, and excel chunk
//! round-trips exercised through the public crate surface rather than one
//! module's internals.

use folder_mcp_daemon::chunker::{chunk_spreadsheet, ChunkingPolicy, Sheet, SheetRow};
use folder_mcp_daemon::config::DaemonConfig;
use folder_mcp_daemon::embedding_worker::{EmbeddingWorker, StubEmbeddingWorker};
use folder_mcp_daemon::extraction::ExtractionParams;
use folder_mcp_daemon::kernel::DaemonKernel;
use folder_mcp_daemon::model_registry::ModelRegistry;
use folder_mcp_daemon::queue::{FolderLifecycle, IndexingQueue};
use folder_mcp_daemon::types::Priority;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct RecordingLifecycle {
    order: Arc<Mutex<Vec<PathBuf>>>,
}

#[async_trait::async_trait]
impl FolderLifecycle for RecordingLifecycle {
    async fn run(
        &self,
        folder: &PathBuf,
        _model_id: &str,
        _on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<(), String> {
        self.order.lock().unwrap().push(folder.clone());
        Ok(())
    }
}

fn stub_registry() -> Arc<ModelRegistry> {
    Arc::new(ModelRegistry::new(Arc::new(|| {
        Box::new(StubEmbeddingWorker::new()) as Box<dyn EmbeddingWorker>
    })))
}

// S1 — Dedup enqueue: re-adding the same folder while queued is a no-op.
#[tokio::test]
async fn s1_dedup_enqueue() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let queue = IndexingQueue::new(stub_registry(), Arc::new(RecordingLifecycle { order }));
    queue.add_folder(PathBuf::from("/A"), "minilm".into(), Priority::Normal).await;
    queue.add_folder(PathBuf::from("/A"), "minilm".into(), Priority::Normal).await;
    assert_eq!(queue.pending_len().await, 1);
}

// S2 — Priority interleave: N1 starts, then N2/N3/I1 enqueue; completion
// order is N1, I1, N2, N3 because I1 jumps the normal-priority backlog.
#[tokio::test]
async fn s2_priority_interleave() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let queue = IndexingQueue::new(stub_registry(), Arc::new(RecordingLifecycle { order: Arc::clone(&order) }));

    queue.add_folder(PathBuf::from("/N1"), "minilm".into(), Priority::Normal).await;
    queue.add_folder(PathBuf::from("/N2"), "minilm".into(), Priority::Normal).await;
    queue.add_folder(PathBuf::from("/N3"), "minilm".into(), Priority::Normal).await;

    let runner = Arc::clone(&queue);
    let handle = tokio::spawn(async move { runner.run().await });

    // Give N1 a moment to start, then cut in with an immediate.
    tokio::time::sleep(Duration::from_millis(5)).await;
    queue.add_folder(PathBuf::from("/I1"), "minilm".into(), Priority::Immediate).await;

    for _ in 0..200 {
        if order.lock().unwrap().len() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let completed = order.lock().unwrap().clone();
    assert_eq!(
        completed,
        vec![
            PathBuf::from("/N1"),
            PathBuf::from("/I1"),
            PathBuf::from("/N2"),
            PathBuf::from("/N3"),
        ]
    );
    queue.stop().await;
    let _ = tokio::time::timeout(Duration::from_millis(200), handle).await;
}

// S3 — Model switch: registry starts empty, loads mA for folder A, stays
// loaded at idle, then unloads mA and loads mB for folder B.
#[tokio::test]
async fn s3_model_switch_unloads_then_loads() {
    let registry = stub_registry();
    assert!(registry.current_model().await.is_none());

    registry.get_service("minilm").await.unwrap();
    assert_eq!(registry.current_model().await.as_deref(), Some("minilm"));

    registry.get_service("mpnet").await.unwrap();
    assert_eq!(registry.current_model().await.as_deref(), Some("mpnet"));
}

// S5 — Ancestor add: adding "/root" after "/root/a" and "/root/b" replaces
// both descendants and reports a warning.
#[tokio::test]
async fn s5_ancestor_add_replaces_descendants() {
    let registry = stub_registry();
    let order = Arc::new(Mutex::new(Vec::new()));
    let queue = IndexingQueue::new(Arc::clone(&registry), Arc::new(RecordingLifecycle { order }));
    let kernel = DaemonKernel::new(DaemonConfig::default(), registry, queue);

    let root = tempfile::tempdir().unwrap();
    let a = root.path().join("a");
    let b = root.path().join("b");
    std::fs::create_dir(&a).unwrap();
    std::fs::create_dir(&b).unwrap();

    kernel.add_folder(a.clone(), "minilm".into()).await.unwrap();
    kernel.add_folder(b.clone(), "minilm".into()).await.unwrap();
    assert!(kernel.folder_info(&a.canonicalize().unwrap()).is_some());
    assert!(kernel.folder_info(&b.canonicalize().unwrap()).is_some());

    let warning = kernel.add_folder(root.path().to_path_buf(), "minilm".into()).await.unwrap();
    assert!(warning.is_some());
    assert!(kernel.folder_info(&a.canonicalize().unwrap()).is_none());
    assert!(kernel.folder_info(&b.canonicalize().unwrap()).is_none());
    assert!(kernel.folder_info(&root.path().canonicalize().unwrap()).is_some());
}

// S6 — Excel chunk round-trip: each chunk carries excel params whose
// re-extracted CSV lines match what the chunker produced, and every sheet's
// header row repeats at the top of its own chunks.
#[tokio::test]
async fn s6_excel_chunk_round_trip() {
    let sheet = Sheet {
        name: "Sheet1".into(),
        header: SheetRow { cells: vec!["id".into(), "name".into()] },
        rows: (0..5).map(|i| SheetRow { cells: vec![i.to_string(), format!("row-{i}")] }).collect(),
    };
    let chunks = chunk_spreadsheet(&[sheet], ChunkingPolicy::default());
    assert!(!chunks.is_empty());
    for chunk in &chunks {
        assert!(chunk.content.starts_with("id,name"));
        match &chunk.params {
            ExtractionParams::Excel { sheet, start_row, end_row, .. } => {
                assert_eq!(sheet, "Sheet1");
                assert!(start_row <= end_row);
            }
            other => panic!("expected excel params, got {other:?}"),
        }
    }
}

// Testable Property 10 — single instance: a second acquire while the first
// guard is alive refuses without touching the registry file's content.
#[test]
fn single_instance_guard_refuses_second_acquire() {
    use folder_mcp_daemon::kernel::SingletonGuard;

    let home = tempfile::tempdir().unwrap();
    std::env::set_var("HOME", home.path());

    let config = DaemonConfig { ws_port: 19999, http_port: 18080, ..DaemonConfig::default() };
    let guard = SingletonGuard::acquire(&config).expect("first acquire should succeed");
    let second = SingletonGuard::acquire(&config);
    assert!(second.is_err(), "second acquire while first process is alive must fail");
    drop(guard);
}
