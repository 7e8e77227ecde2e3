use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use tracing::{debug, warn};

use super::plan::{Action, Plan, Side};
use super::replica::{parent_of, Node, NodeKind, Replica};
use super::watcher::LocalChange;

/// Local truncates mtimes and the remote rounds up on write, so a
/// one-second delta between otherwise identical files is noise.
pub const MTIME_TOLERANCE_SECS: i64 = 1;

/// Two-sided diff of the local and remote replicas: union of paths,
/// newer-mtime-wins for common files. Emitted in sorted path order, so
/// folder creations always precede actions inside them.
pub fn cross_side_plan(local: &Replica, remote: &Replica) -> Plan {
    let mut plan = Plan::new();
    let mut mismatched: Vec<String> = Vec::new();
    let union: BTreeSet<&String> = local.paths().chain(remote.paths()).collect();

    for path in union {
        if under_any(path, &mismatched) {
            continue;
        }
        match (local.get(path), remote.get(path)) {
            (Some(l), Some(r)) if l.kind != r.kind => {
                warn!(
                    path = %path,
                    "same path is a file on one side and a folder on the other, leaving both untouched"
                );
                mismatched.push(path.clone());
            }
            (Some(l), Some(r)) if l.is_file() && r.is_file() => {
                plan_common_file(&mut plan, l, r);
            }
            // Folders on both sides: nothing to do, children follow.
            (Some(_), Some(_)) => {}
            (Some(l), None) => match l.kind {
                NodeKind::Folder => plan.push(Action::CreateFolder {
                    path: path.clone(),
                    side: Side::Remote,
                }),
                NodeKind::File => plan.push(Action::UploadFile { path: path.clone() }),
            },
            (None, Some(r)) => match r.kind {
                NodeKind::Folder => plan.push(Action::CreateFolder {
                    path: path.clone(),
                    side: Side::Local,
                }),
                NodeKind::File => plan.push(Action::DownloadFile { path: path.clone() }),
            },
            (None, None) => unreachable!("path came from the union"),
        }
    }
    plan
}

fn plan_common_file(plan: &mut Plan, local: &Node, remote: &Node) {
    let l_mtime = local.mtime.unwrap_or(0);
    let r_mtime = remote.mtime.unwrap_or(0);
    let same_size = local.size == remote.size;

    if l_mtime == r_mtime {
        if !same_size {
            // Standoff: no timestamp to arbitrate with; never guess.
            warn!(
                path = %local.path,
                local_size = local.size.unwrap_or(0),
                remote_size = remote.size.unwrap_or(0),
                "equal mtime but different size, leaving both sides untouched"
            );
        }
        return;
    }
    if (l_mtime - r_mtime).abs() <= MTIME_TOLERANCE_SECS && same_size {
        return;
    }
    if l_mtime > r_mtime {
        debug!(path = %local.path, "local file is newer, uploading");
        plan.push(Action::UploadFile {
            path: local.path.clone(),
        });
        plan.push(Action::SetMTime {
            path: local.path.clone(),
            side: Side::Remote,
            mtime: l_mtime,
        });
    } else {
        debug!(path = %local.path, "remote file is newer, downloading");
        plan.push(Action::DownloadFile {
            path: local.path.clone(),
        });
        plan.push(Action::SetMTime {
            path: local.path.clone(),
            side: Side::Local,
            mtime: r_mtime,
        });
    }
}

/// Same-side diff between the live remote replica and a fresh candidate,
/// resolved against the local replica for files whose content changed.
///
/// Renames are detected first (unique handle or (kind, size, mtime)
/// match) and emitted as move pairs; whatever still differs afterwards
/// becomes local deletes, folder creations, and transfers.
pub fn refresh_plan(live: &Replica, candidate: &Replica, local: &Replica) -> Plan {
    let mut plan = Plan::new();
    let mut working = live.clone();

    while let Some((from, to)) = find_move(&working, candidate) {
        debug!(from = %from, to = %to, "remote rename detected");
        plan.push(Action::MoveNode {
            from: from.clone(),
            to: to.clone(),
            side: Side::Remote,
        });
        plan.push(Action::MoveNode {
            from: from.clone(),
            to: to.clone(),
            side: Side::Local,
        });
        working.rename(&from, &to);
    }

    let union: BTreeSet<&String> = working.paths().chain(candidate.paths()).collect();
    let mut deleted: Vec<String> = Vec::new();
    for path in union {
        if under_any(path, &deleted) {
            continue;
        }
        match (working.get(path), candidate.get(path)) {
            (Some(_), None) => {
                // Vanished remotely: delete the whole local subtree,
                // children before their parent.
                push_delete_subtree(&mut plan, &working, path);
                deleted.push(path.clone());
            }
            (None, Some(node)) => match node.kind {
                NodeKind::Folder => plan.push(Action::CreateFolder {
                    path: path.clone(),
                    side: Side::Local,
                }),
                NodeKind::File => plan.push(Action::DownloadFile { path: path.clone() }),
            },
            (Some(before), Some(after)) if before.is_file() && after.is_file() => {
                if before.mtime == after.mtime && before.size == after.size {
                    continue;
                }
                match local.get(path) {
                    Some(l) if l.is_file() => plan_common_file(&mut plan, l, after),
                    _ => plan.push(Action::DownloadFile { path: path.clone() }),
                }
            }
            (Some(before), Some(after)) if before.kind != after.kind => {
                warn!(path = %path, "remote item changed kind, leaving local side untouched");
                deleted.push(path.clone());
            }
            _ => {}
        }
    }
    plan
}

fn push_delete_subtree(plan: &mut Plan, replica: &Replica, path: &str) {
    let children: Vec<String> = replica
        .subtree_paths(path)
        .into_iter()
        .skip(1)
        .filter(|p| parent_of(p) == Some(path))
        .collect();
    for child in children {
        push_delete_subtree(plan, replica, &child);
    }
    plan.push(Action::DeleteNode {
        path: path.to_string(),
        side: Side::Local,
    });
}

/// Best remaining rename pair, shallow folders first so a single folder
/// rename never degenerates into per-child moves.
fn find_move(live: &Replica, candidate: &Replica) -> Option<(String, String)> {
    let vanished: Vec<&Node> = live
        .iter()
        .filter(|n| !candidate.contains(&n.path))
        .collect();
    let appeared: Vec<&Node> = candidate
        .iter()
        .filter(|n| !live.contains(&n.path))
        .collect();
    if vanished.is_empty() || appeared.is_empty() {
        return None;
    }

    let mut pairs: Vec<(&Node, &Node)> = Vec::new();
    for v in &vanished {
        // The remote identifier survives a rename, so matching handles is
        // definitive.
        if let Some(id) = v.handle.as_ref().map(|h| &h.id) {
            if let Some(a) = appeared
                .iter()
                .find(|a| a.handle.as_ref().map(|h| &h.id) == Some(id))
            {
                pairs.push((v, a));
            }
        }
    }
    if pairs.is_empty() {
        for v in &vanished {
            let sig = (v.kind, v.size, v.mtime);
            let vanished_alike = vanished
                .iter()
                .filter(|n| (n.kind, n.size, n.mtime) == sig)
                .count();
            let appeared_alike: Vec<_> = appeared
                .iter()
                .filter(|n| (n.kind, n.size, n.mtime) == sig)
                .collect();
            if vanished_alike == 1 && appeared_alike.len() == 1 {
                pairs.push((v, appeared_alike[0]));
            }
        }
    }

    pairs.sort_by_key(|(v, _)| (v.is_file(), v.path.matches('/').count(), v.path.clone()));
    pairs
        .first()
        .map(|(v, a)| (v.path.clone(), a.path.clone()))
}

/// Minimal plan for a batch of coalesced watcher records against the live
/// replicas. Renames go first to free their source paths.
pub fn plan_for_records(records: &[LocalChange], remote: &Replica, root: &Path) -> Plan {
    let mut plan = Plan::new();
    let mut planned_folders: HashSet<String> = HashSet::new();

    for record in records {
        if let LocalChange::Renamed { from, to } = record {
            if remote.contains(from) {
                plan.push(Action::MoveNode {
                    from: from.clone(),
                    to: to.clone(),
                    side: Side::Remote,
                });
            } else {
                plan_upsert(&mut plan, to, remote, root, &mut planned_folders);
            }
        }
    }
    for record in records {
        if let LocalChange::Removed { path } = record {
            if remote.contains(path) {
                plan.push(Action::DeleteNode {
                    path: path.clone(),
                    side: Side::Remote,
                });
            }
        }
    }
    for record in records {
        if let LocalChange::Upsert { path } = record {
            plan_upsert(&mut plan, path, remote, root, &mut planned_folders);
        }
    }
    plan
}

fn plan_upsert(
    plan: &mut Plan,
    path: &str,
    remote: &Replica,
    root: &Path,
    planned_folders: &mut HashSet<String>,
) {
    let full = root.join(path);
    let meta = match std::fs::symlink_metadata(&full) {
        Ok(meta) => meta,
        Err(_) => {
            debug!(path = %path, "local path disappeared before planning, skipping");
            return;
        }
    };
    if meta.file_type().is_symlink() {
        return;
    }

    if meta.is_dir() {
        plan_folder_chain(plan, path, remote, planned_folders);
        return;
    }

    match remote.get(path) {
        None => {
            if let Some(parent) = parent_of(path) {
                plan_folder_chain(plan, parent, remote, planned_folders);
            }
            plan.push(Action::UploadFile {
                path: path.to_string(),
            });
        }
        Some(node) if node.is_file() => {
            let local_mtime = super::local_scan::truncated_mtime(&meta);
            let remote_mtime = node.mtime.unwrap_or(0);
            if local_mtime > remote_mtime {
                if meta.len() == 0 {
                    // A fresh zero-byte file is usually an editor writing
                    // in two steps; the content modify event follows.
                    debug!(path = %path, "newer local file is empty, skipping upload");
                    return;
                }
                plan.push(Action::UploadFile {
                    path: path.to_string(),
                });
                plan.push(Action::SetMTime {
                    path: path.to_string(),
                    side: Side::Remote,
                    mtime: local_mtime,
                });
            } else {
                debug!(path = %path, "remote file is up to date, skipping upload");
            }
        }
        Some(_) => {
            warn!(path = %path, "local file collides with a remote folder, leaving both untouched");
        }
    }
}

fn plan_folder_chain(
    plan: &mut Plan,
    path: &str,
    remote: &Replica,
    planned_folders: &mut HashSet<String>,
) {
    let mut missing = Vec::new();
    let mut current = Some(path);
    while let Some(p) = current {
        if remote.contains(p) || planned_folders.contains(p) {
            break;
        }
        missing.push(p.to_string());
        current = parent_of(p);
    }
    for folder in missing.into_iter().rev() {
        planned_folders.insert(folder.clone());
        plan.push(Action::CreateFolder {
            path: folder,
            side: Side::Remote,
        });
    }
}

fn under_any(path: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| {
        path.len() > prefix.len()
            && path.starts_with(prefix.as_str())
            && path.as_bytes()[prefix.len()] == b'/'
    })
}
