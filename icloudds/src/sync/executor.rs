use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use filetime::FileTime;
use icloud_core::{DriveApi, DriveHandle};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::local_scan::{rounded_up_mtime, truncated_mtime};
use super::plan::{Action, Plan, Side};
use super::replica::{parent_of, Node, SharedReplica};
use super::suppress::SuppressionSet;
use super::SyncError;

const MAX_ATTEMPTS: u32 = 3;

/// Who produced the plan. A refresh-origin plan mirrors mutations the
/// remote already performed, so its remote-side moves are bookkeeping
/// only; every other origin drives the remote for real.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOrigin {
    Initial,
    LocalEvents,
    RemoteRefresh,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub action: Action,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Applies ordered plans against the drive and the local filesystem,
/// keeping both live replicas in step with every successful action.
///
/// Remote-mutating actions run behind a width-1 gate; downloads fan out
/// onto the elastic pool.
pub struct Executor {
    drive: Arc<dyn DriveApi>,
    local: SharedReplica,
    remote: SharedReplica,
    root: PathBuf,
    suppress: SuppressionSet,
    remote_gate: Arc<Semaphore>,
    elastic: Arc<Semaphore>,
    backoff: Backoff,
    dead_letters: Arc<Mutex<Vec<DeadLetter>>>,
    cancel: CancellationToken,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        drive: Arc<dyn DriveApi>,
        local: SharedReplica,
        remote: SharedReplica,
        root: PathBuf,
        suppress: SuppressionSet,
        max_workers: usize,
        backoff: Backoff,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            drive,
            local,
            remote,
            root,
            suppress,
            remote_gate: Arc::new(Semaphore::new(1)),
            elastic: Arc::new(Semaphore::new(max_workers.max(1))),
            backoff,
            dead_letters: Arc::new(Mutex::new(Vec::new())),
            cancel,
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .expect("dead letter lock poisoned")
            .clone()
    }

    pub async fn apply(&self, plan: Plan, origin: PlanOrigin) -> ApplyStats {
        let mut stats = ApplyStats::default();
        let mut downloads: JoinSet<bool> = JoinSet::new();
        let actions = plan.actions;
        let mut idx = 0;

        while idx < actions.len() {
            if self.cancel.is_cancelled() {
                break;
            }
            let action = &actions[idx];

            if origin == PlanOrigin::RemoteRefresh
                && matches!(
                    action,
                    Action::MoveNode {
                        side: Side::Remote,
                        ..
                    }
                )
            {
                // The remote performed this move itself; the swapped-in
                // candidate already reflects it.
                stats.skipped += 1;
                idx += 1;
                continue;
            }

            if let Action::DownloadFile { path } = action {
                // A SetMTime for the same file belongs to the download
                // task, otherwise it would race the transfer.
                let mtime_override = match actions.get(idx + 1) {
                    Some(Action::SetMTime {
                        path: p,
                        side: Side::Local,
                        mtime,
                    }) if p == path => {
                        idx += 1;
                        Some(*mtime)
                    }
                    _ => None,
                };
                self.spawn_download(&mut downloads, path.clone(), mtime_override);
                idx += 1;
                continue;
            }

            match self.run_with_retry(action).await {
                Ok(()) => stats.completed += 1,
                Err(err) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    stats.failed += 1;
                    self.record_dead_letter(action.clone(), &err);
                }
            }
            idx += 1;
        }

        while let Some(joined) = downloads.join_next().await {
            match joined {
                Ok(true) => stats.completed += 1,
                Ok(false) => stats.failed += 1,
                Err(err) if err.is_cancelled() => {}
                Err(err) => std::panic::resume_unwind(err.into_panic()),
            }
        }
        if stats.failed > 0 {
            warn!(?stats, "plan applied with failures");
        } else if stats.completed > 0 {
            info!(
                completed = stats.completed,
                skipped = stats.skipped,
                "plan applied"
            );
        }
        stats
    }

    async fn run_with_retry(&self, action: &Action) -> Result<(), SyncError> {
        let mut attempt = 0u32;
        loop {
            match self.execute(action).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    attempt += 1;
                    let delay = self.backoff.delay(attempt);
                    warn!(%action, attempt, ?delay, %err, "transient failure, retrying");
                    if !self.sleep_or_cancel(delay).await {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn execute(&self, action: &Action) -> Result<(), SyncError> {
        debug!(%action, "executing");
        match action {
            Action::CreateFolder {
                path,
                side: Side::Remote,
            } => self.create_remote_folder(path).await,
            Action::CreateFolder {
                path,
                side: Side::Local,
            } => self.create_local_folder(path),
            Action::DeleteNode {
                path,
                side: Side::Remote,
            } => self.delete_remote(path).await,
            Action::DeleteNode {
                path,
                side: Side::Local,
            } => self.delete_local(path),
            Action::UploadFile { path } => self.upload(path).await,
            Action::MoveNode {
                from,
                to,
                side: Side::Remote,
            } => self.move_remote(from, to).await,
            Action::MoveNode {
                from,
                to,
                side: Side::Local,
            } => self.move_local(from, to),
            Action::SetMTime {
                path,
                side: Side::Local,
                mtime,
            } => self.set_local_mtime(path, *mtime),
            Action::SetMTime {
                path,
                side: Side::Remote,
                mtime,
            } => {
                // The drive has no mtime call; uploads carry it. Only the
                // replica record needs the winning value.
                let mut remote = self.remote.write();
                if let Some(node) = remote.get(path).cloned() {
                    let mut node = node;
                    node.mtime = Some(*mtime);
                    remote.insert(node);
                }
                Ok(())
            }
            Action::DownloadFile { .. } => unreachable!("downloads are spawned"),
        }
    }

    async fn create_remote_folder(&self, path: &str) -> Result<(), SyncError> {
        if self.remote.read().contains(path) {
            return Ok(());
        }
        let parent = parent_of(path).unwrap_or("");
        let parent_handle = self
            .remote
            .read()
            .handle_for(parent)
            .ok_or_else(|| SyncError::MissingHandle(parent.to_string()))?;
        let name = path.rsplit('/').next().unwrap_or(path);

        let _permit = self.acquire_remote_gate().await?;
        let handle = self.drive.create_folder(&parent_handle, name).await?;
        drop(_permit);

        self.remote
            .write()
            .insert(Node::folder(path).with_handle(handle));
        // When the folder came from a local event it already exists on
        // disk but not yet in the local replica.
        if self.local_path(path)?.is_dir() && !self.local.read().contains(path) {
            self.local.write().insert(Node::folder(path));
        }
        Ok(())
    }

    fn create_local_folder(&self, path: &str) -> Result<(), SyncError> {
        self.suppress.shield(path);
        std::fs::create_dir_all(self.local_path(path)?)?;
        self.suppress.shield(path);
        self.local.write().insert(Node::folder(path));
        Ok(())
    }

    async fn delete_remote(&self, path: &str) -> Result<(), SyncError> {
        let handle = match self.remote.read().handle_for(path) {
            Some(handle) => handle,
            // Already gone remotely; converged.
            None => {
                self.remote.write().remove(path);
                return Ok(());
            }
        };
        let _permit = self.acquire_remote_gate().await?;
        self.drive.delete(&handle).await?;
        drop(_permit);

        self.remote.write().remove(path);
        // Local deletions that triggered this action already removed the
        // files; drop the stale local nodes with them.
        if !self.local_path(path)?.exists() {
            self.local.write().remove(path);
        }
        Ok(())
    }

    fn delete_local(&self, path: &str) -> Result<(), SyncError> {
        self.suppress.shield(path);
        let target = self.local_path(path)?;
        match std::fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&target)?,
            Ok(_) => std::fs::remove_file(&target)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.suppress.shield(path);
        self.local.write().remove(path);
        Ok(())
    }

    async fn upload(&self, path: &str) -> Result<(), SyncError> {
        let source = self.local_path(path)?;
        let meta = std::fs::metadata(&source)?;
        let parent = parent_of(path).unwrap_or("");
        let parent_handle = self
            .remote
            .read()
            .handle_for(parent)
            .ok_or_else(|| SyncError::MissingHandle(parent.to_string()))?;
        let name = path.rsplit('/').next().unwrap_or(path);
        // The remote rounds subsecond mtimes up to the next whole second;
        // record the value it will end up with.
        let mtime = rounded_up_mtime(&meta);

        let _permit = self.acquire_remote_gate().await?;
        let handle = self.drive.upload(&parent_handle, name, &source, mtime).await?;
        drop(_permit);

        self.remote
            .write()
            .insert(Node::file(path, meta.len(), mtime).with_handle(handle));
        self.local
            .write()
            .insert(Node::file(path, meta.len(), truncated_mtime(&meta)));
        Ok(())
    }

    async fn move_remote(&self, from: &str, to: &str) -> Result<(), SyncError> {
        let handle = self
            .remote
            .read()
            .handle_for(from)
            .ok_or_else(|| SyncError::MissingHandle(from.to_string()))?;
        let new_parent = parent_of(to).unwrap_or("");
        let parent_handle = self
            .remote
            .read()
            .handle_for(new_parent)
            .ok_or_else(|| SyncError::MissingHandle(new_parent.to_string()))?;
        let new_name = to.rsplit('/').next().unwrap_or(to);

        let _permit = self.acquire_remote_gate().await?;
        self.drive.move_node(&handle, &parent_handle, new_name).await?;
        drop(_permit);

        self.remote.write().rename(from, to);
        // A move that originated locally has already happened on disk.
        if self.local_path(to)?.exists() && !self.local_path(from)?.exists() {
            self.local.write().rename(from, to);
        }
        Ok(())
    }

    fn move_local(&self, from: &str, to: &str) -> Result<(), SyncError> {
        self.suppress.shield(from);
        self.suppress.shield(to);
        let source = self.local_path(from)?;
        let target = self.local_path(to)?;
        if source.exists() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&source, &target)?;
        }
        self.suppress.shield(from);
        self.suppress.shield(to);
        self.local.write().rename(from, to);
        Ok(())
    }

    fn set_local_mtime(&self, path: &str, mtime: i64) -> Result<(), SyncError> {
        self.suppress.shield(path);
        filetime::set_file_mtime(self.local_path(path)?, FileTime::from_unix_time(mtime, 0))?;
        self.suppress.shield(path);
        let mut local = self.local.write();
        if let Some(node) = local.get(path).cloned() {
            let mut node = node;
            node.mtime = Some(mtime);
            local.insert(node);
        }
        Ok(())
    }

    fn spawn_download(
        &self,
        downloads: &mut JoinSet<bool>,
        path: String,
        mtime_override: Option<i64>,
    ) {
        let drive = Arc::clone(&self.drive);
        let local = self.local.clone();
        let remote = self.remote.clone();
        let suppress = self.suppress.clone();
        let elastic = Arc::clone(&self.elastic);
        let backoff = self.backoff;
        let cancel = self.cancel.clone();
        let dead_letters = Arc::clone(&self.dead_letters);
        let target = match local_path_under(&self.root, &path) {
            Ok(target) => target,
            Err(err) => {
                error!(path = %path, %err, "refusing download target");
                return;
            }
        };

        downloads.spawn(async move {
            let _permit = match elastic.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return false,
            };
            let (handle, size, mtime) = {
                let remote = remote.read();
                let Some(node) = remote.get(&path) else {
                    warn!(path = %path, "remote node vanished before download");
                    return false;
                };
                let Some(handle) = node.handle.clone() else {
                    warn!(path = %path, "remote node has no handle, skipping download");
                    return false;
                };
                (
                    handle,
                    node.size.unwrap_or(0),
                    mtime_override.or(node.mtime).unwrap_or(0),
                )
            };

            suppress.shield(&path);
            let mut attempt = 0u32;
            loop {
                if cancel.is_cancelled() {
                    return false;
                }
                match download_once(&*drive, &handle, &target, mtime).await {
                    Ok(()) => break,
                    Err(err) if err.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                        attempt += 1;
                        let delay = backoff.delay(attempt);
                        warn!(path = %path, attempt, ?delay, %err, "download failed, retrying");
                        tokio::select! {
                            _ = cancel.cancelled() => return false,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(err) => {
                        error!(path = %path, attempts = attempt + 1, %err, "download dead-lettered");
                        dead_letters
                            .lock()
                            .expect("dead letter lock poisoned")
                            .push(DeadLetter {
                                action: Action::DownloadFile { path: path.clone() },
                                error: err.to_string(),
                                attempts: attempt + 1,
                            });
                        return false;
                    }
                }
            }
            suppress.shield(&path);
            local.write().insert(Node::file(path, size, mtime));
            true
        });
    }

    async fn acquire_remote_gate(
        &self,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, SyncError> {
        self.remote_gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Io(std::io::Error::from(std::io::ErrorKind::Interrupted)))
    }

    async fn sleep_or_cancel(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn record_dead_letter(&self, action: Action, err: &SyncError) {
        error!(%action, %err, "action dead-lettered");
        self.dead_letters
            .lock()
            .expect("dead letter lock poisoned")
            .push(DeadLetter {
                action,
                error: err.to_string(),
                attempts: MAX_ATTEMPTS,
            });
    }

    fn local_path(&self, relative: &str) -> Result<PathBuf, SyncError> {
        local_path_under(&self.root, relative)
    }
}

async fn download_once(
    drive: &dyn DriveApi,
    handle: &DriveHandle,
    target: &Path,
    mtime: i64,
) -> Result<(), SyncError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    drive.download(handle, target).await?;
    filetime::set_file_mtime(target, FileTime::from_unix_time(mtime, 0))?;
    Ok(())
}

/// Replica paths are produced by our own scans, but never trust a
/// relative path not to climb out of the sync root.
fn local_path_under(root: &Path, relative: &str) -> Result<PathBuf, SyncError> {
    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(SyncError::UnsupportedPath(relative.to_string()));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::mock_drive::MockDrive;
    use std::fs;
    use tempfile::tempdir;

    fn quick_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(1), Duration::from_millis(4), false)
    }

    struct Fixture {
        drive: Arc<MockDrive>,
        executor: Executor,
        local: SharedReplica,
        remote: SharedReplica,
        suppress: SuppressionSet,
        _root: tempfile::TempDir,
        root: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let drive = Arc::new(MockDrive::new());
        let local = SharedReplica::default();
        let remote = SharedReplica::default();
        {
            let mut r = remote.write();
            r.set_root_handle(drive.handle(""));
        }
        let suppress = SuppressionSet::new(Duration::from_secs(12));
        let executor = Executor::new(
            Arc::clone(&drive) as Arc<dyn DriveApi>,
            local.clone(),
            remote.clone(),
            root.clone(),
            suppress.clone(),
            4,
            quick_backoff(),
            CancellationToken::new(),
        );
        Fixture {
            drive,
            executor,
            local,
            remote,
            suppress,
            _root: dir,
            root,
        }
    }

    fn plan(actions: Vec<Action>) -> Plan {
        Plan { actions }
    }

    #[tokio::test]
    async fn upload_records_rounded_mtime_on_both_replicas() {
        let f = fixture();
        fs::create_dir(f.root.join("A")).unwrap();
        fs::write(f.root.join("A/file.txt"), vec![b'x'; 100]).unwrap();
        filetime::set_file_mtime(
            f.root.join("A/file.txt"),
            FileTime::from_unix_time(1_700_000_000, 250_000_000),
        )
        .unwrap();
        f.drive.add_folder("A");
        f.remote.write().insert(
            Node::folder("A").with_handle(f.drive.handle("A")),
        );
        f.local.write().insert(Node::folder("A"));
        f.local
            .write()
            .insert(Node::file("A/file.txt", 100, 1_700_000_000));

        let stats = f
            .executor
            .apply(
                plan(vec![Action::UploadFile {
                    path: "A/file.txt".into(),
                }]),
                PlanOrigin::Initial,
            )
            .await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);

        // ceil(local mtime) lands on the next whole second.
        assert_eq!(f.drive.uploads(), vec![("A/file.txt".into(), 1_700_000_001)]);
        let remote = f.remote.read();
        let node = remote.get("A/file.txt").unwrap();
        assert_eq!(node.size, Some(100));
        assert_eq!(node.mtime, Some(1_700_000_001));
        assert!(node.handle.is_some());
        let local = f.local.read();
        assert_eq!(local.get("A/file.txt").unwrap().mtime, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn remote_mutations_never_overlap() {
        let f = fixture();
        for name in ["a.bin", "b.bin", "c.bin", "d.bin"] {
            fs::write(f.root.join(name), b"data").unwrap();
            f.local.write().insert(Node::file(name, 4, 100));
        }
        let actions = ["a.bin", "b.bin", "c.bin", "d.bin"]
            .iter()
            .map(|name| Action::UploadFile {
                path: (*name).into(),
            })
            .collect();

        let stats = f.executor.apply(plan(actions), PlanOrigin::Initial).await;
        assert_eq!(stats.completed, 4);
        assert_eq!(f.drive.max_concurrent_mutations(), 1);
    }

    #[tokio::test]
    async fn download_shields_path_and_sets_mtime() {
        let f = fixture();
        f.drive.add_file("img.png", 32, 1_700_000_500);
        f.remote.write().insert(
            Node::file("img.png", 32, 1_700_000_500).with_handle(f.drive.handle("img.png")),
        );

        let stats = f
            .executor
            .apply(
                plan(vec![Action::DownloadFile {
                    path: "img.png".into(),
                }]),
                PlanOrigin::Initial,
            )
            .await;
        assert_eq!(stats.completed, 1);

        let target = f.root.join("img.png");
        assert_eq!(fs::metadata(&target).unwrap().len(), 32);
        let mtime = FileTime::from_last_modification_time(&fs::metadata(&target).unwrap());
        assert_eq!(mtime.unix_seconds(), 1_700_000_500);
        // The watcher's echo of our own write must land inside the window.
        assert!(f.suppress.is_suppressed("img.png"));
        assert_eq!(
            f.local.read().get("img.png").unwrap().mtime,
            Some(1_700_000_500)
        );
    }

    #[tokio::test]
    async fn download_absorbs_following_set_mtime() {
        let f = fixture();
        f.drive.add_file("doc.txt", 8, 1_700_000_000);
        f.remote.write().insert(
            Node::file("doc.txt", 8, 1_700_000_000).with_handle(f.drive.handle("doc.txt")),
        );

        let stats = f
            .executor
            .apply(
                plan(vec![
                    Action::DownloadFile {
                        path: "doc.txt".into(),
                    },
                    Action::SetMTime {
                        path: "doc.txt".into(),
                        side: Side::Local,
                        mtime: 1_700_000_009,
                    },
                ]),
                PlanOrigin::Initial,
            )
            .await;
        assert_eq!(stats.completed, 1);
        let meta = fs::metadata(f.root.join("doc.txt")).unwrap();
        assert_eq!(
            FileTime::from_last_modification_time(&meta).unix_seconds(),
            1_700_000_009
        );
    }

    #[tokio::test]
    async fn local_delete_cascade_removes_tree_and_replica_nodes() {
        let f = fixture();
        fs::create_dir(f.root.join("X")).unwrap();
        fs::write(f.root.join("X/a"), b"1").unwrap();
        fs::write(f.root.join("X/b"), b"2").unwrap();
        {
            let mut local = f.local.write();
            local.insert(Node::folder("X"));
            local.insert(Node::file("X/a", 1, 1));
            local.insert(Node::file("X/b", 1, 2));
        }

        let stats = f
            .executor
            .apply(
                plan(vec![
                    Action::DeleteNode { path: "X/a".into(), side: Side::Local },
                    Action::DeleteNode { path: "X/b".into(), side: Side::Local },
                    Action::DeleteNode { path: "X".into(), side: Side::Local },
                ]),
                PlanOrigin::RemoteRefresh,
            )
            .await;
        assert_eq!(stats.completed, 3);
        assert!(!f.root.join("X").exists());
        assert!(f.local.read().is_empty());
        assert!(f.suppress.is_suppressed("X/a"));
        assert!(f.suppress.is_suppressed("X"));
    }

    #[tokio::test]
    async fn transient_failure_is_retried_to_success() {
        let f = fixture();
        fs::write(f.root.join("retry.txt"), b"r").unwrap();
        f.local.write().insert(Node::file("retry.txt", 1, 5));
        f.drive.fail_next_mutations(2);

        let stats = f
            .executor
            .apply(
                plan(vec![Action::UploadFile {
                    path: "retry.txt".into(),
                }]),
                PlanOrigin::LocalEvents,
            )
            .await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
        assert!(f.drive.exists("retry.txt"));
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_without_aborting_plan() {
        let f = fixture();
        fs::write(f.root.join("bad.txt"), b"b").unwrap();
        fs::write(f.root.join("good.txt"), b"g").unwrap();
        f.local.write().insert(Node::file("bad.txt", 1, 5));
        f.local.write().insert(Node::file("good.txt", 1, 5));
        f.drive.fail_next_mutations(MAX_ATTEMPTS as usize);

        let stats = f
            .executor
            .apply(
                plan(vec![
                    Action::UploadFile { path: "bad.txt".into() },
                    Action::UploadFile { path: "good.txt".into() },
                ]),
                PlanOrigin::LocalEvents,
            )
            .await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        let letters = f.executor.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, MAX_ATTEMPTS);
        assert!(f.drive.exists("good.txt"));
    }

    #[tokio::test]
    async fn local_move_renames_on_disk_and_in_replica() {
        let f = fixture();
        fs::create_dir(f.root.join("docs")).unwrap();
        fs::write(f.root.join("docs/old.pdf"), b"pdf").unwrap();
        {
            let mut local = f.local.write();
            local.insert(Node::folder("docs"));
            local.insert(Node::file("docs/old.pdf", 3, 9));
        }

        let stats = f
            .executor
            .apply(
                plan(vec![Action::MoveNode {
                    from: "docs/old.pdf".into(),
                    to: "docs/new.pdf".into(),
                    side: Side::Local,
                }]),
                PlanOrigin::RemoteRefresh,
            )
            .await;
        assert_eq!(stats.completed, 1);
        assert!(!f.root.join("docs/old.pdf").exists());
        assert!(f.root.join("docs/new.pdf").exists());
        assert!(f.local.read().contains("docs/new.pdf"));
        assert!(f.suppress.is_suppressed("docs/old.pdf"));
        assert!(f.suppress.is_suppressed("docs/new.pdf"));
    }

    #[tokio::test]
    async fn remote_move_mirror_is_skipped_on_refresh_origin() {
        let f = fixture();
        f.drive.add_file("a.txt", 1, 1);
        f.remote
            .write()
            .insert(Node::file("a.txt", 1, 1).with_handle(f.drive.handle("a.txt")));

        let stats = f
            .executor
            .apply(
                plan(vec![Action::MoveNode {
                    from: "a.txt".into(),
                    to: "b.txt".into(),
                    side: Side::Remote,
                }]),
                PlanOrigin::RemoteRefresh,
            )
            .await;
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.completed, 0);
        // Untouched: the candidate swap is the source of truth here.
        assert!(f.drive.exists("a.txt"));
    }

    #[tokio::test]
    async fn remote_move_from_local_events_drives_the_api() {
        let f = fixture();
        f.drive.add_folder("docs");
        f.drive.add_file("docs/old.pdf", 3, 9);
        {
            let mut remote = f.remote.write();
            remote.insert(Node::folder("docs").with_handle(f.drive.handle("docs")));
            remote.insert(
                Node::file("docs/old.pdf", 3, 9).with_handle(f.drive.handle("docs/old.pdf")),
            );
        }
        // The local rename already happened on disk.
        fs::create_dir(f.root.join("docs")).unwrap();
        fs::write(f.root.join("docs/new.pdf"), b"pdf").unwrap();
        {
            let mut local = f.local.write();
            local.insert(Node::folder("docs"));
            local.insert(Node::file("docs/old.pdf", 3, 9));
        }

        let stats = f
            .executor
            .apply(
                plan(vec![Action::MoveNode {
                    from: "docs/old.pdf".into(),
                    to: "docs/new.pdf".into(),
                    side: Side::Remote,
                }]),
                PlanOrigin::LocalEvents,
            )
            .await;
        assert_eq!(stats.completed, 1);
        assert!(f.drive.exists("docs/new.pdf"));
        assert!(!f.drive.exists("docs/old.pdf"));
        assert!(f.remote.read().contains("docs/new.pdf"));
        assert!(f.local.read().contains("docs/new.pdf"));
    }

    #[tokio::test]
    async fn create_remote_folder_is_idempotent_and_updates_local() {
        let f = fixture();
        fs::create_dir(f.root.join("New")).unwrap();

        let stats = f
            .executor
            .apply(
                plan(vec![
                    Action::CreateFolder { path: "New".into(), side: Side::Remote },
                    Action::CreateFolder { path: "New".into(), side: Side::Remote },
                ]),
                PlanOrigin::LocalEvents,
            )
            .await;
        assert_eq!(stats.completed, 2);
        assert!(f.drive.exists("New"));
        assert!(f.remote.read().get("New").unwrap().handle.is_some());
        assert!(f.local.read().contains("New"));
    }

    #[test]
    fn path_escapes_are_rejected() {
        let root = Path::new("/sync");
        assert!(local_path_under(root, "a/b.txt").is_ok());
        assert!(local_path_under(root, "../outside").is_err());
        assert!(local_path_under(root, "a/../../outside").is_err());
    }
}
