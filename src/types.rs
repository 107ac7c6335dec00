//! Core data model: folder entries, file fingerprints, chunks, queue items,
//! client connections, and the fleet-management snapshot (FMDM) broadcast to
//! clients. See `SPEC_FULL.md` §9.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Kept as a plain integer (rather than
/// `chrono::DateTime`) on the wire so JSON payloads stay small and diffable.
pub type TimestampMs = u64;

pub fn now_ms() -> TimestampMs {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Folder entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FolderStatus {
    Pending,
    LoadingModel,
    Indexing,
    Active,
    Ready,
    Error,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderEntry {
    pub path: PathBuf,
    pub model_id: String,
    pub status: FolderStatus,
    /// 0..=100, set while `status == Indexing`.
    pub progress: Option<u8>,
    pub added_at: TimestampMs,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl FolderEntry {
    pub fn new(path: PathBuf, model_id: String) -> Self {
        Self {
            path,
            model_id,
            status: FolderStatus::Pending,
            progress: None,
            added_at: now_ms(),
            error_message: None,
        }
    }

    /// True if `self.path` is an ancestor directory of `other` (or equal).
    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        other.starts_with(&self.path)
    }
}

// ---------------------------------------------------------------------------
// File fingerprint
// ---------------------------------------------------------------------------

/// Identity of a file's on-disk content, independent of its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub rel_path: String,
    pub size: u64,
    pub modified_ms: TimestampMs,
    /// Hex-encoded SHA-256 over the file's bytes. Canonical identity — see
    /// `FileStateRecord`.
    pub content_hash: String,
}

// ---------------------------------------------------------------------------
// File-state record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Pending,
    Processing,
    Indexed,
    Failed,
    Skipped,
    Corrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStateRecord {
    pub abs_path: PathBuf,
    pub content_hash: String,
    pub state: ProcessingState,
    pub last_attempt_ms: Option<TimestampMs>,
    pub success_ms: Option<TimestampMs>,
    pub failure_reason: Option<String>,
    pub attempt_count: u32,
    pub chunk_count: Option<usize>,
}

impl FileStateRecord {
    pub fn new_pending(abs_path: PathBuf, content_hash: String) -> Self {
        Self {
            abs_path,
            content_hash,
            state: ProcessingState::Pending,
            last_attempt_ms: None,
            success_ms: None,
            failure_reason: None,
            attempt_count: 0,
            chunk_count: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SemanticMetadata {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub key_phrases: Vec<String>,
    #[serde(default)]
    pub readability_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    pub token_count_estimate: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub params: crate::extraction::ExtractionParams,
    #[serde(default)]
    pub semantic: SemanticMetadata,
}

// ---------------------------------------------------------------------------
// Queued folder work item
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Ordered so `Normal < Immediate`; a max-heap-by-priority then yields
    /// immediates first. FIFO within a class is enforced by a separate
    /// monotonic sequence number (see `queue::WorkItem`).
    Normal,
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Queued,
    LoadingModel,
    Indexing,
    Completed,
    Failed,
}

// ---------------------------------------------------------------------------
// Client connection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientType {
    Ui,
    Cli,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConnection {
    pub connection_id: String,
    pub client_type: ClientType,
    pub connected_at: TimestampMs,
    pub last_activity: TimestampMs,
}

// ---------------------------------------------------------------------------
// FMDM — fleet management data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareSummary {
    pub cpu_cores: usize,
    pub has_gpu: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FmdmSnapshot {
    /// Strictly increasing; a client must discard any snapshot whose
    /// revision is not greater than the last one it applied, regardless of
    /// transport arrival order.
    pub revision: u64,
    pub folders: Vec<FolderEntry>,
    pub daemon_version: String,
    pub hardware: HardwareSummary,
}

impl FmdmSnapshot {
    pub fn empty(daemon_version: impl Into<String>) -> Self {
        Self {
            revision: 0,
            folders: Vec::new(),
            daemon_version: daemon_version.into(),
            hardware: HardwareSummary {
                cpu_cores: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
                has_gpu: false,
            },
        }
    }
}
