//! File State Manager: decides, per `(path, current-content-hash)`, whether a
//! file must be processed, skipped, retried, or ignored, and persists the
//! outcome. See `SPEC_FULL.md` §6 / spec.md §4.5.

use crate::types::{now_ms, FileStateRecord, ProcessingState, TimestampMs};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_ATTEMPTS: u32 = 3;
pub const RETRY_DELAY_MS: u64 = 24 * 60 * 60 * 1000;
pub const STUCK_PROCESSING_MS: u64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Process,
    Skip,
    Ignore,
}

/// Content-hash-keyed store of prior processing outcomes, keyed by absolute
/// path. One instance per indexed folder.
#[derive(Debug, Default)]
pub struct FileStateStore {
    records: DashMap<PathBuf, FileStateRecord>,
}

impl FileStateStore {
    pub fn new() -> Self {
        Self { records: DashMap::new() }
    }

    pub fn get(&self, path: &Path) -> Option<FileStateRecord> {
        self.records.get(path).map(|r| r.clone())
    }

    /// Apply the decision table of spec.md §4.5 and return what the caller
    /// should do with this file right now.
    pub fn decide(&self, path: &Path, current_hash: &str) -> Decision {
        self.decide_at(path, current_hash, now_ms())
    }

    fn decide_at(&self, path: &Path, current_hash: &str, now: TimestampMs) -> Decision {
        let prior = match self.records.get(path) {
            None => return Decision::Process,
            Some(r) => r.clone(),
        };

        if prior.content_hash != current_hash {
            return Decision::Process;
        }

        match prior.state {
            ProcessingState::Pending => Decision::Process,
            ProcessingState::Indexed => Decision::Skip,
            ProcessingState::Corrupted => Decision::Ignore,
            ProcessingState::Skipped => Decision::Skip,
            ProcessingState::Failed => {
                let attempts_ok = prior.attempt_count < MAX_ATTEMPTS;
                let elapsed = prior
                    .last_attempt_ms
                    .map(|t| now.saturating_sub(t))
                    .unwrap_or(u64::MAX);
                if attempts_ok && elapsed >= RETRY_DELAY_MS {
                    Decision::Process
                } else {
                    Decision::Skip
                }
            }
            ProcessingState::Processing => {
                let elapsed = prior
                    .last_attempt_ms
                    .map(|t| now.saturating_sub(t))
                    .unwrap_or(u64::MAX);
                if elapsed > STUCK_PROCESSING_MS {
                    Decision::Process
                } else {
                    Decision::Skip
                }
            }
        }
    }

    /// Record the start of an indexing attempt, incrementing `attempt_count`.
    pub fn start_processing(&self, path: &Path, content_hash: &str) {
        let now = now_ms();
        self.records
            .entry(path.to_path_buf())
            .and_modify(|r| {
                if r.content_hash != content_hash {
                    *r = FileStateRecord::new_pending(path.to_path_buf(), content_hash.to_string());
                }
                r.state = ProcessingState::Processing;
                r.last_attempt_ms = Some(now);
                r.attempt_count += 1;
            })
            .or_insert_with(|| {
                let mut r = FileStateRecord::new_pending(path.to_path_buf(), content_hash.to_string());
                r.state = ProcessingState::Processing;
                r.last_attempt_ms = Some(now);
                r.attempt_count = 1;
                r
            });
    }

    pub fn mark_success(&self, path: &Path, chunk_count: usize) {
        if let Some(mut r) = self.records.get_mut(path) {
            r.state = ProcessingState::Indexed;
            r.success_ms = Some(now_ms());
            r.chunk_count = Some(chunk_count);
            r.failure_reason = None;
        }
    }

    /// `is_corrupted` routes the file to the absorbing `corrupted` state
    /// rather than the retryable `failed` state — see `DaemonError::is_corrupting`.
    pub fn mark_failure(&self, path: &Path, reason: impl Into<String>, is_corrupted: bool) {
        if let Some(mut r) = self.records.get_mut(path) {
            r.state = if is_corrupted { ProcessingState::Corrupted } else { ProcessingState::Failed };
            r.failure_reason = Some(reason.into());
        }
    }

    pub fn mark_skipped(&self, path: &Path, content_hash: &str, reason: impl Into<String>) {
        let mut r = FileStateRecord::new_pending(path.to_path_buf(), content_hash.to_string());
        r.state = ProcessingState::Skipped;
        r.attempt_count = 1;
        r.failure_reason = Some(reason.into());
        self.records.insert(path.to_path_buf(), r);
    }

    pub fn remove(&self, path: &Path) {
        self.records.remove(path);
    }

    /// Proactively resets records stuck in `processing` past the stuck
    /// window back to `pending`, independent of whether `decide` is ever
    /// called on that path again (a folder that finished its scan won't
    /// revisit a file whose worker crashed mid-index). Driven by the
    /// periodic reaper task rather than inline in `decide_at`.
    pub fn reap_stuck(&self) {
        let cutoff = now_ms().saturating_sub(STUCK_PROCESSING_MS);
        let mut reclaimed = 0usize;
        for mut entry in self.records.iter_mut() {
            let r = entry.value_mut();
            if r.state == ProcessingState::Processing && r.last_attempt_ms.map(|t| t <= cutoff).unwrap_or(true) {
                r.state = ProcessingState::Pending;
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            tracing::info!(reclaimed, "reaper reclaimed stuck-processing file states");
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Duration form of the retry/stuck constants, for callers scheduling a
/// periodic reaper rather than comparing raw millisecond deltas.
pub fn retry_delay() -> Duration {
    Duration::from_millis(RETRY_DELAY_MS)
}

pub fn stuck_processing_window() -> Duration {
    Duration::from_millis(STUCK_PROCESSING_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_file_is_processed() {
        let store = FileStateStore::new();
        assert_eq!(store.decide(Path::new("/a"), "h1"), Decision::Process);
    }

    #[test]
    fn content_change_always_reprocesses() {
        let store = FileStateStore::new();
        store.start_processing(Path::new("/a"), "h1");
        store.mark_success(Path::new("/a"), 3);
        assert_eq!(store.decide(Path::new("/a"), "h2"), Decision::Process);
    }

    #[test]
    fn indexed_same_hash_is_skipped() {
        let store = FileStateStore::new();
        store.start_processing(Path::new("/a"), "h1");
        store.mark_success(Path::new("/a"), 3);
        assert_eq!(store.decide(Path::new("/a"), "h1"), Decision::Skip);
    }

    #[test]
    fn corrupted_same_hash_is_absorbing() {
        let store = FileStateStore::new();
        store.start_processing(Path::new("/a"), "h1");
        store.mark_failure(Path::new("/a"), "bad magic bytes", true);
        assert_eq!(store.decide(Path::new("/a"), "h1"), Decision::Ignore);
        // Even after another look, the same content hash never reprocesses.
        assert_eq!(store.decide(Path::new("/a"), "h1"), Decision::Ignore);
    }

    #[test]
    fn failed_retries_after_delay_within_attempt_cap() {
        let store = FileStateStore::new();
        store.start_processing(Path::new("/a"), "h1");
        store.mark_failure(Path::new("/a"), "disk hiccup", false);
        let now = store.records.get(Path::new("/a")).unwrap().last_attempt_ms.unwrap();

        assert_eq!(store.decide_at(Path::new("/a"), "h1", now + 1_000), Decision::Skip);
        assert_eq!(
            store.decide_at(Path::new("/a"), "h1", now + RETRY_DELAY_MS),
            Decision::Process
        );
    }

    #[test]
    fn failed_exhausts_attempt_cap() {
        let store = FileStateStore::new();
        for _ in 0..MAX_ATTEMPTS {
            store.start_processing(Path::new("/a"), "h1");
            store.mark_failure(Path::new("/a"), "still broken", false);
        }
        let now = store.records.get(Path::new("/a")).unwrap().last_attempt_ms.unwrap();
        assert_eq!(
            store.decide_at(Path::new("/a"), "h1", now + RETRY_DELAY_MS * 2),
            Decision::Skip
        );
    }

    #[test]
    fn stuck_processing_is_retried() {
        let store = FileStateStore::new();
        store.start_processing(Path::new("/a"), "h1");
        let now = store.records.get(Path::new("/a")).unwrap().last_attempt_ms.unwrap();
        assert_eq!(store.decide_at(Path::new("/a"), "h1", now + 1_000), Decision::Skip);
        assert_eq!(
            store.decide_at(Path::new("/a"), "h1", now + STUCK_PROCESSING_MS + 1),
            Decision::Process
        );
    }

    #[test]
    fn reap_stuck_resets_old_processing_entries_to_pending() {
        let store = FileStateStore::new();
        store.start_processing(Path::new("/a"), "h1");
        {
            let mut entry = store.records.get_mut(Path::new("/a")).unwrap();
            entry.last_attempt_ms = Some(now_ms().saturating_sub(STUCK_PROCESSING_MS + 1));
        }
        store.reap_stuck();
        assert_eq!(store.records.get(Path::new("/a")).unwrap().state, ProcessingState::Pending);
    }

    #[test]
    fn reap_stuck_leaves_recent_processing_entries_alone() {
        let store = FileStateStore::new();
        store.start_processing(Path::new("/a"), "h1");
        store.reap_stuck();
        assert_eq!(store.records.get(Path::new("/a")).unwrap().state, ProcessingState::Processing);
    }

    #[test]
    fn skipped_same_hash_stays_skipped() {
        let store = FileStateStore::new();
        store.mark_skipped(Path::new("/a"), "h1", "unsupported extension");
        assert_eq!(store.decide(Path::new("/a"), "h1"), Decision::Skip);
    }
}
