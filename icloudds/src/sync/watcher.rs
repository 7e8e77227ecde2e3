use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::filter::PathFilter;
use super::suppress::SuppressionSet;

/// Coalesced change record handed to the reconciler's incremental path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    Upsert { path: String },
    Removed { path: String },
    Renamed { from: String, to: String },
}

impl LocalChange {
    fn sort_key(&self) -> &str {
        match self {
            LocalChange::Upsert { path } | LocalChange::Removed { path } => path,
            LocalChange::Renamed { to, .. } => to,
        }
    }
}

/// Raw event after path normalization, before debouncing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    Created(String),
    Modified(String),
    Removed(String),
    RenamedFrom(String, Option<usize>),
    RenamedTo(String, Option<usize>),
    RenamedBoth(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BucketState {
    Upsert,
    Removed,
    Renamed { from: String },
}

#[derive(Debug)]
struct Bucket {
    state: BucketState,
    // True while the path did not exist before this burst; a delete then
    // annihilates the bucket instead of emitting one.
    created_here: bool,
    last_event: Instant,
}

#[derive(Debug)]
struct PendingRenameFrom {
    path: String,
    tracker: Option<usize>,
    last_event: Instant,
}

/// Per-path accumulate-and-quiet-time state machine. A bucket releases
/// only after the debounce window has passed with no further events for
/// that path.
pub struct Debouncer {
    debounce: Duration,
    buckets: HashMap<String, Bucket>,
    pending_renames: Vec<PendingRenameFrom>,
}

impl Debouncer {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            buckets: HashMap::new(),
            pending_renames: Vec::new(),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.buckets.is_empty() || !self.pending_renames.is_empty()
    }

    pub fn ingest(&mut self, event: RawEvent, now: Instant) {
        trace!(?event, "watcher event");
        match event {
            RawEvent::Created(path) => match self.buckets.get_mut(&path) {
                Some(bucket) => {
                    if bucket.state == BucketState::Removed {
                        bucket.state = BucketState::Upsert;
                        bucket.created_here = false;
                    }
                    bucket.last_event = now;
                }
                None => {
                    self.buckets.insert(
                        path,
                        Bucket {
                            state: BucketState::Upsert,
                            created_here: true,
                            last_event: now,
                        },
                    );
                }
            },
            RawEvent::Modified(path) => match self.buckets.get_mut(&path) {
                Some(bucket) => {
                    if bucket.state == BucketState::Removed {
                        bucket.state = BucketState::Upsert;
                        bucket.created_here = false;
                    }
                    bucket.last_event = now;
                }
                None => {
                    self.buckets.insert(
                        path,
                        Bucket {
                            state: BucketState::Upsert,
                            created_here: false,
                            last_event: now,
                        },
                    );
                }
            },
            RawEvent::Removed(path) => {
                match self.buckets.get_mut(&path) {
                    Some(bucket) if bucket.created_here => {
                        // Create followed by delete within the window:
                        // the burst never happened.
                        self.buckets.remove(&path);
                    }
                    Some(bucket) => {
                        bucket.state = BucketState::Removed;
                        bucket.last_event = now;
                    }
                    None => {
                        self.buckets.insert(
                            path,
                            Bucket {
                                state: BucketState::Removed,
                                created_here: false,
                                last_event: now,
                            },
                        );
                    }
                }
            }
            RawEvent::RenamedFrom(path, tracker) => {
                self.pending_renames.push(PendingRenameFrom {
                    path,
                    tracker,
                    last_event: now,
                });
            }
            RawEvent::RenamedTo(path, tracker) => {
                let matched = self
                    .pending_renames
                    .iter()
                    .position(|p| p.tracker == tracker)
                    .or_else(|| self.pending_renames.iter().position(|p| p.tracker.is_none()));
                match matched {
                    Some(index) => {
                        let from = self.pending_renames.remove(index).path;
                        self.record_rename(from, path, now);
                    }
                    // No matching half: something was moved into the
                    // watched subtree from outside it.
                    None => self.ingest(RawEvent::Created(path), now),
                }
            }
            RawEvent::RenamedBoth(from, to) => self.record_rename(from, to, now),
        }
    }

    fn record_rename(&mut self, from: String, to: String, now: Instant) {
        // The move supersedes anything buffered for the source path.
        self.buckets.remove(&from);
        self.buckets.insert(
            to,
            Bucket {
                state: BucketState::Renamed { from },
                created_here: false,
                last_event: now,
            },
        );
    }

    /// Release buckets that have been quiet for the full debounce window,
    /// filtered and sorted by path.
    pub fn release(&mut self, now: Instant, filter: &PathFilter) -> Vec<LocalChange> {
        // A rename half that never found its partner is a move out of the
        // watched subtree, which locally is a delete.
        let debounce = self.debounce;
        let mut orphaned = Vec::new();
        self.pending_renames.retain(|pending| {
            if now.duration_since(pending.last_event) >= debounce {
                orphaned.push(pending.path.clone());
                false
            } else {
                true
            }
        });
        for path in orphaned {
            self.ingest(RawEvent::Removed(path), now - debounce);
        }

        let ready: Vec<String> = self
            .buckets
            .iter()
            .filter(|(_, bucket)| now.duration_since(bucket.last_event) >= debounce)
            .map(|(path, _)| path.clone())
            .collect();

        let mut records = Vec::new();
        for path in ready {
            let bucket = self.buckets.remove(&path).expect("bucket exists");
            let record = match bucket.state {
                BucketState::Upsert => LocalChange::Upsert { path },
                BucketState::Removed => LocalChange::Removed { path },
                BucketState::Renamed { from } => LocalChange::Renamed { from, to: path },
            };
            let accepted = match &record {
                LocalChange::Upsert { path } | LocalChange::Removed { path } => {
                    filter.accept(path)
                }
                LocalChange::Renamed { from, to } => filter.accept(from) && filter.accept(to),
            };
            if accepted {
                records.push(record);
            } else {
                trace!(?record, "released record dropped by filter");
            }
        }
        records.sort_by(|a, b| a.sort_key().cmp(b.sort_key()));
        if !records.is_empty() {
            debug!(count = records.len(), "watcher released records");
        }
        records
    }
}

/// Filesystem watcher for the sync root: suppression on arrival,
/// debounce/coalesce per path, filter on release.
pub struct LocalWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<notify::Event>,
    debouncer: Debouncer,
    root: PathBuf,
    filter: Arc<PathFilter>,
    suppress: SuppressionSet,
}

impl LocalWatcher {
    pub fn start(
        root: &Path,
        filter: Arc<PathFilter>,
        suppress: SuppressionSet,
        debounce: Duration,
    ) -> notify::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        Ok(Self {
            _watcher: watcher,
            rx,
            debouncer: Debouncer::new(debounce),
            root: root.to_path_buf(),
            filter,
            suppress,
        })
    }

    /// Pull everything the OS has queued, then release quiet buckets.
    pub fn drain(&mut self) -> Vec<LocalChange> {
        let now = Instant::now();
        while let Ok(event) = self.rx.try_recv() {
            for raw in map_event(&self.root, event) {
                self.ingest_raw(raw, now);
            }
        }
        self.debouncer.release(Instant::now(), &self.filter)
    }

    /// Suppression applies on arrival, before any debouncing.
    pub(crate) fn ingest_raw(&mut self, raw: RawEvent, now: Instant) {
        if self.is_suppressed(&raw) {
            trace!(?raw, "event suppressed");
            return;
        }
        self.debouncer.ingest(raw, now);
    }

    pub(crate) fn release_at(&mut self, now: Instant) -> Vec<LocalChange> {
        self.debouncer.release(now, &self.filter)
    }

    pub fn has_pending(&self) -> bool {
        self.debouncer.has_pending() || !self.rx.is_empty()
    }

    fn is_suppressed(&self, event: &RawEvent) -> bool {
        match event {
            RawEvent::Created(path)
            | RawEvent::Modified(path)
            | RawEvent::Removed(path)
            | RawEvent::RenamedFrom(path, _)
            | RawEvent::RenamedTo(path, _) => self.suppress.is_suppressed(path),
            RawEvent::RenamedBoth(from, to) => {
                self.suppress.is_suppressed(from) || self.suppress.is_suppressed(to)
            }
        }
    }
}

fn map_event(root: &Path, event: notify::Event) -> Vec<RawEvent> {
    let tracker = event.attrs.tracker();
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if event.paths.len() >= 2 {
                if let (Some(from), Some(to)) = (
                    relative_posix(root, &event.paths[0]),
                    relative_posix(root, &event.paths[1]),
                ) {
                    return vec![RawEvent::RenamedBoth(from, to)];
                }
            }
            Vec::new()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .filter_map(|p| relative_posix(root, p))
            .map(|p| RawEvent::RenamedFrom(p, tracker))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .filter_map(|p| relative_posix(root, p))
            .map(|p| RawEvent::RenamedTo(p, tracker))
            .collect(),
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .filter_map(|p| relative_posix(root, p).map(|rel| (rel, p.exists())))
            .map(|(rel, exists)| {
                if exists {
                    RawEvent::Modified(rel)
                } else {
                    RawEvent::Removed(rel)
                }
            })
            .collect(),
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter_map(|p| relative_posix(root, p))
            .map(RawEvent::Created)
            .collect(),
        EventKind::Modify(_) => event
            .paths
            .iter()
            .filter_map(|p| relative_posix(root, p))
            .map(RawEvent::Modified)
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(|p| relative_posix(root, p))
            .map(RawEvent::Removed)
            .collect(),
        _ => Vec::new(),
    }
}

fn relative_posix(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let rendered = relative.to_string_lossy().replace('\\', "/");
    if rendered.is_empty() {
        None
    } else {
        Some(rendered)
    }
}
