use std::sync::{Arc, RwLock};

use icloud_core::{DriveApi, DriveHandle, DriveKind};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use super::filter::PathFilter;
use super::replica::{Node, Replica, SharedReplica};
use super::SyncError;

/// Builds candidate remote replicas by parallel BFS over the drive tree.
pub struct RemoteScanner {
    drive: Arc<dyn DriveApi>,
    filter: Arc<PathFilter>,
    max_workers: usize,
}

impl RemoteScanner {
    pub fn new(drive: Arc<dyn DriveApi>, filter: Arc<PathFilter>, max_workers: usize) -> Self {
        Self {
            drive,
            filter,
            max_workers: max_workers.max(1),
        }
    }

    /// Full refresh: walk the whole tree into a private candidate, then
    /// apply the integrity gate. The candidate is returned only when the
    /// declared root file count matches what the walk found; otherwise it
    /// is discarded whole.
    pub async fn refresh(&self) -> Result<Replica, SyncError> {
        let summary = self.drive.list_root().await?;
        let candidate = Arc::new(RwLock::new(Replica::new()));
        {
            let mut replica = candidate.write().expect("candidate lock poisoned");
            replica.set_declared_file_count(summary.file_count);
            replica.set_trash_item_count(summary.trash_item_count);
            replica.set_root_handle(summary.handle.clone());
        }

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks: JoinSet<Result<Vec<(String, DriveHandle)>, SyncError>> = JoinSet::new();
        self.spawn_folder(&mut tasks, &candidate, &semaphore, String::new(), summary.handle);

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let joined = match joined {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => continue,
                Err(err) => std::panic::resume_unwind(err.into_panic()),
            };
            match joined {
                Ok(subfolders) => {
                    if first_error.is_none() {
                        for (path, handle) in subfolders {
                            self.spawn_folder(&mut tasks, &candidate, &semaphore, path, handle);
                        }
                    }
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                        tasks.abort_all();
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        let replica = Arc::try_unwrap(candidate)
            .expect("scan tasks drained")
            .into_inner()
            .expect("candidate lock poisoned");
        let counted = replica.file_count();
        if !replica.fold_check(summary.file_count) {
            return Err(SyncError::RefreshInconsistent {
                declared: summary.file_count,
                counted,
            });
        }
        debug!(
            nodes = replica.count_nodes(),
            files = counted,
            trash = replica.trash_item_count(),
            "remote refresh consistent"
        );
        Ok(replica)
    }

    /// Cheap change check between full refreshes: only the root's declared
    /// counts are fetched and compared against the values recorded at the
    /// last successful refresh.
    pub async fn check_changed(&self, live: &SharedReplica) -> Result<bool, SyncError> {
        let summary = self.drive.list_root().await?;
        let live = live.read();
        let changed = summary.file_count != live.declared_file_count()
            || summary.trash_item_count != live.trash_item_count();
        if changed {
            debug!(
                declared = summary.file_count,
                recorded = live.declared_file_count(),
                trash = summary.trash_item_count,
                recorded_trash = live.trash_item_count(),
                "remote change detected"
            );
        }
        Ok(changed)
    }

    fn spawn_folder(
        &self,
        tasks: &mut JoinSet<Result<Vec<(String, DriveHandle)>, SyncError>>,
        candidate: &Arc<RwLock<Replica>>,
        semaphore: &Arc<Semaphore>,
        path: String,
        handle: DriveHandle,
    ) {
        let drive = Arc::clone(&self.drive);
        let filter = Arc::clone(&self.filter);
        let candidate = Arc::clone(candidate);
        let semaphore = Arc::clone(semaphore);
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("scan semaphore closed");
            let children = drive.list_folder(&handle).await?;
            let mut subfolders = Vec::new();
            let mut replica = candidate.write().expect("candidate lock poisoned");
            for child in children {
                let child_path = if path.is_empty() {
                    child.name.clone()
                } else {
                    format!("{path}/{}", child.name)
                };
                if !filter.accept(&child_path) {
                    trace!(path = %child_path, "remote scan ignored");
                    continue;
                }
                match child.kind {
                    DriveKind::Folder => {
                        let mut node =
                            Node::folder(child_path.clone()).with_handle(child.handle.clone());
                        if let Some(count) = child.child_count {
                            node = node.with_child_count(count);
                        }
                        replica.insert(node);
                        subfolders.push((child_path, child.handle));
                    }
                    DriveKind::File => {
                        replica.insert(
                            Node::file(
                                child_path,
                                child.size.unwrap_or(0),
                                child.mtime.unwrap_or(0),
                            )
                            .with_handle(child.handle),
                        );
                    }
                    // Application bundles and anything else the drive
                    // invents are not files or folders we mirror.
                    DriveKind::AppLibrary | DriveKind::Unknown => {
                        trace!(path = %child_path, "skipping non-file non-folder item");
                    }
                }
            }
            Ok(subfolders)
        });
    }
}
