//! Per-folder file watching and event coalescing. Grounded on the teacher's
//! `watch.rs` debounce-loop pattern, generalized from one shared map over a
//! single process-wide watcher to a per-folder supervisor with include/exclude
//! globs. See `SPEC_FULL.md` §4 / spec.md §4.3.

use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;
pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Add,
    Change,
    Unlink,
    AddDir,
    UnlinkDir,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: PrimitiveKind,
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub debounce_ms: u64,
    pub batch_size: usize,
    pub batching_enabled: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            batching_enabled: true,
            include: vec!["**/*".to_string()],
            exclude: vec!["**/.folder-mcp/**".to_string(), "**/.git/**".to_string()],
        }
    }
}

fn build_globset(patterns: &[String]) -> notify::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        if let Ok(glob) = Glob::new(p) {
            builder.add(glob);
        }
    }
    builder.build().map_err(|e| notify::Error::generic(&e.to_string()))
}

fn passes_filters(path: &Path, include: &GlobSet, exclude: &GlobSet) -> bool {
    if exclude.is_match(path) {
        return false;
    }
    include.is_match(path)
}

fn event_kind_of(kind: &EventKind) -> Option<PrimitiveKind> {
    match kind {
        EventKind::Create(k) if matches!(k, notify::event::CreateKind::Folder) => {
            Some(PrimitiveKind::AddDir)
        }
        EventKind::Create(_) => Some(PrimitiveKind::Add),
        EventKind::Modify(_) => Some(PrimitiveKind::Change),
        EventKind::Remove(k) if matches!(k, notify::event::RemoveKind::Folder) => {
            Some(PrimitiveKind::UnlinkDir)
        }
        EventKind::Remove(_) => Some(PrimitiveKind::Unlink),
        _ => None,
    }
}

/// One folder's watch session: owns the `notify` watcher handle and a
/// debounce thread. Dropping it releases both — mirrors the teacher's
/// "dropping the watcher stops it" contract.
pub struct FolderWatch {
    _watcher: RecommendedWatcher,
    stop: Arc<Mutex<bool>>,
}

impl FolderWatch {
    /// `on_batch` is invoked once per debounce firing with the coalesced,
    /// filtered, ordered batch for this folder.
    pub fn start(
        root: PathBuf,
        config: WatchConfig,
        on_batch: impl Fn(Vec<WatchEvent>) + Send + 'static,
    ) -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel::<Event>();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )?;

        watcher.watch(&root, RecursiveMode::Recursive)?;
        info!(path = %root.display(), "watching folder");

        let stop = Arc::new(Mutex::new(false));
        let stop_clone = Arc::clone(&stop);
        let include = build_globset(&config.include)?;
        let exclude = build_globset(&config.exclude)?;

        std::thread::spawn(move || {
            debounce_loop(rx, config, include, exclude, on_batch, stop_clone);
        });

        Ok(Self { _watcher: watcher, stop })
    }

    /// `stopFileWatching` — cancels the debounce timer, clears the pending
    /// queue, and releases the watcher when this value is dropped. Pending
    /// events are intentionally discarded; they'll be rediscovered by the
    /// File State Manager's content-hash reconciliation on the next walk.
    pub fn stop(self) {
        *self.stop.lock().unwrap() = true;
    }
}

fn debounce_loop(
    rx: mpsc::Receiver<Event>,
    config: WatchConfig,
    include: GlobSet,
    exclude: GlobSet,
    on_batch: impl Fn(Vec<WatchEvent>),
    stop: Arc<Mutex<bool>>,
) {
    let mut pending: HashMap<PathBuf, (PrimitiveKind, Instant)> = HashMap::new();
    let debounce = Duration::from_millis(config.debounce_ms);

    loop {
        if *stop.lock().unwrap() {
            return;
        }

        match rx.recv_timeout(debounce) {
            Ok(event) => {
                let Some(kind) = event_kind_of(&event.kind) else { continue };
                let now = Instant::now();
                for path in event.paths {
                    if passes_filters(&path, &include, &exclude) {
                        // Latest event per path wins, per spec.md's
                        // "keep the latest event per path" coalescing rule.
                        pending.insert(path, (kind, now));
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if pending.is_empty() {
                    continue;
                }
                let batch = flush_batch(&mut pending, &config);
                if !batch.is_empty() {
                    on_batch(batch);
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Drains `pending` into an ordered batch: path-first, then chronological —
/// `unlink`-terminal paths whose most recent event is a removal are dropped
/// per spec.md's coalescing rule only when a later `add` hasn't superseded
/// them (handled upstream by "latest event per path wins").
fn flush_batch(
    pending: &mut HashMap<PathBuf, (PrimitiveKind, Instant)>,
    config: &WatchConfig,
) -> Vec<WatchEvent> {
    let mut entries: Vec<(PathBuf, PrimitiveKind, Instant)> = pending
        .drain()
        .map(|(p, (k, t))| (p, k, t))
        // unlink-terminal paths are dropped: a file's most recent event
        // being a removal means there's nothing left to (re)index.
        .filter(|(_, kind, _)| !matches!(kind, PrimitiveKind::Unlink | PrimitiveKind::UnlinkDir))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.2.cmp(&b.2)));

    let mut batch: Vec<WatchEvent> = entries
        .into_iter()
        .map(|(path, kind, _)| WatchEvent { path, kind })
        .collect();

    if config.batching_enabled && batch.len() > config.batch_size {
        warn!(dropped = batch.len() - config.batch_size, "watch batch exceeds configured size, truncating");
        batch.truncate(config.batch_size);
    }
    batch
}

/// Supervises one `FolderWatch` per registered root.
#[derive(Default)]
pub struct WatcherSupervisor {
    watches: Mutex<HashMap<PathBuf, FolderWatch>>,
}

impl WatcherSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(
        &self,
        root: PathBuf,
        config: WatchConfig,
        on_batch: impl Fn(Vec<WatchEvent>) + Send + 'static,
    ) -> notify::Result<()> {
        let watch = FolderWatch::start(root.clone(), config, on_batch)?;
        self.watches.lock().unwrap().insert(root, watch);
        Ok(())
    }

    pub fn stop_watching(&self, root: &Path) {
        if let Some(watch) = self.watches.lock().unwrap().remove(root) {
            watch.stop();
        }
    }

    pub fn is_watching(&self, root: &Path) -> bool {
        self.watches.lock().unwrap().contains_key(root)
    }
}
