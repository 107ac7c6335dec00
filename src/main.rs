//! folder-mcpd binary — thin CLI shell over the [`folder_mcp_daemon`] library crate.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use folder_mcp_daemon::config::DaemonConfig;
use folder_mcp_daemon::embedding_worker::{EmbeddingWorker, StubEmbeddingWorker};
use folder_mcp_daemon::kernel::{DaemonKernel, SingletonGuard};
use folder_mcp_daemon::lifecycle::DefaultFolderLifecycle;
use folder_mcp_daemon::model_registry::ModelRegistry;
use folder_mcp_daemon::queue::IndexingQueue;
use folder_mcp_daemon::store::InMemoryChunkStore;
use folder_mcp_daemon::{file_state::FileStateStore, ws_protocol};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Local document-indexing daemon — watches folders, chunks and embeds
/// documents, serves semantic search to AI agents.
#[derive(Parser)]
#[command(name = "folder-mcpd", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to a TOML config file (overrides compiled defaults, overridden
    /// by FOLDER_MCP_* environment variables).
    #[arg(long)]
    config: Option<PathBuf>,

    /// WebSocket control-plane port.
    #[arg(long)]
    ws_port: Option<u16>,

    /// Default embedding model for newly added folders.
    #[arg(long)]
    model: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground (default if no subcommand is given).
    Run,
    /// Add a folder to the daemon's index via a one-shot WebSocket call.
    AddFolder {
        path: PathBuf,
        #[arg(long, default_value = "minilm")]
        model: String,
    },
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, shutting down");
    }
}

async fn ws_handler(State(kernel): State<Arc<DaemonKernel>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_protocol::handle_socket(kernel, socket))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("folder_mcp_daemon=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = DaemonConfig::load(cli.config.as_deref());
    if let Some(port) = cli.ws_port {
        config.ws_port = port;
    }
    if let Some(model) = &cli.model {
        config.default_model = model.clone();
    }

    let guard = match SingletonGuard::acquire(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("folder-mcpd: {e}");
            std::process::exit(1);
        }
    };

    // The `semantic` feature supplies a candle-backed worker; without it the
    // daemon still runs end to end against the deterministic stub.
    #[cfg(feature = "semantic")]
    let factory: folder_mcp_daemon::model_registry::WorkerFactory = Arc::new(|| {
        Box::new(folder_mcp_daemon::embedding_worker::candle_worker::CandleEmbeddingWorker::new())
            as Box<dyn EmbeddingWorker>
    });
    #[cfg(not(feature = "semantic"))]
    let factory: folder_mcp_daemon::model_registry::WorkerFactory =
        Arc::new(|| Box::new(StubEmbeddingWorker::new()) as Box<dyn EmbeddingWorker>);

    let registry = Arc::new(ModelRegistry::new(factory));
    let store = Arc::new(InMemoryChunkStore::new());
    let file_states = Arc::new(FileStateStore::new());
    let lifecycle = Arc::new(DefaultFolderLifecycle::new(
        Arc::clone(&registry),
        store,
        Arc::clone(&file_states),
    ));
    let queue = IndexingQueue::new(Arc::clone(&registry), lifecycle);

    let kernel = DaemonKernel::new(config.clone(), registry, Arc::clone(&queue));

    match cli.command {
        Some(Commands::AddFolder { path, model }) => {
            if let Err(e) = kernel.add_folder(path, model).await {
                eprintln!("folder-mcpd: {e}");
                std::process::exit(1);
            }
            return;
        }
        Some(Commands::Run) | None => {}
    }

    let queue_runner = Arc::clone(&queue);
    tokio::spawn(async move { queue_runner.run().await });

    // Reclaim file states stuck in `processing` (worker crash, killed -9)
    // every 10 minutes, per SPEC_FULL.md's reaper design.
    let reap_states = Arc::clone(&file_states);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
        loop {
            interval.tick().await;
            reap_states.reap_stuck();
        }
    });

    // Prune idle websocket connections every 5 minutes, mirroring the
    // teacher's MCP session cleanup loop.
    let prune_kernel = Arc::clone(&kernel);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            prune_kernel.prune_idle_connections(30 * 60 * 1000);
        }
    });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::clone(&kernel));

    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], kernel.config.ws_port));
    info!(%addr, "folder-mcpd listening");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind websocket port");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    queue.stop().await;
    drop(guard);
}
