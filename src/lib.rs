//! folder-mcp-daemon — local document-indexing daemon: watches folders,
//! chunks and embeds documents, serves semantic search to AI agents over a
//! WebSocket control plane.

pub mod chunker;
pub mod config;
pub mod embedding_worker;
pub mod error;
pub mod extraction;
pub mod file_state;
pub mod fmdm;
pub mod kernel;
pub mod lifecycle;
pub mod model_registry;
pub mod queue;
pub mod store;
pub mod throttle;
pub mod types;
pub mod watcher;
pub mod ws_protocol;

pub use error::{DaemonError, DaemonResult};
pub use kernel::DaemonKernel;
