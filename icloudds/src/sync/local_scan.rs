use std::fs;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};

use super::filter::PathFilter;
use super::replica::{Node, Replica};

/// Walk the sync root and build a local replica. Symlinks are not
/// followed; unreadable entries are skipped; the filter prunes subtrees.
pub fn scan(root: &Path, filter: &PathFilter) -> io::Result<Replica> {
    let mut replica = Replica::new();
    walk(root, root, filter, &mut replica)?;
    debug!(
        nodes = replica.count_nodes(),
        files = replica.file_count(),
        "local scan complete"
    );
    Ok(replica)
}

fn walk(
    root: &Path,
    dir: &Path,
    filter: &PathFilter,
    replica: &mut Replica,
) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if dir != root => {
            warn!(path = %dir.display(), %err, "skipping unreadable directory");
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(path = %dir.display(), %err, "skipping unreadable entry");
                continue;
            }
        };
        let full = entry.path();
        let Some(relative) = relative_posix(root, &full) else {
            continue;
        };
        if !filter.accept(&relative) {
            continue;
        }

        let meta = match fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(path = %full.display(), %err, "skipping unstatable entry");
                continue;
            }
        };
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            replica.insert(Node::folder(relative));
            walk(root, &full, filter, replica)?;
        } else if meta.is_file() {
            replica.insert(Node::file(relative, meta.len(), truncated_mtime(&meta)));
        }
    }
    Ok(())
}

/// Local mtimes are truncated to whole seconds; the remote stores second
/// resolution.
pub fn truncated_mtime(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Remote writes round subsecond mtimes up to the next whole second; the
/// uploaded node records that rounded value.
pub fn rounded_up_mtime(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64 + i64::from(d.subsec_nanos() > 0))
        .unwrap_or(0)
}

fn relative_posix(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    Some(relative.to_string_lossy().replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::replica::NodeKind;
    use filetime::FileTime;
    use tempfile::tempdir;

    #[test]
    fn scans_nested_tree_with_sizes_and_seconds() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("Docs/Sub")).unwrap();
        fs::write(root.join("Docs/a.txt"), b"0123456789").unwrap();
        fs::write(root.join("Docs/Sub/b.txt"), b"xy").unwrap();
        filetime::set_file_mtime(
            root.join("Docs/a.txt"),
            FileTime::from_unix_time(1_700_000_000, 400_000_000),
        )
        .unwrap();

        let replica = scan(root, &PathFilter::default()).unwrap();
        assert_eq!(replica.count_nodes(), 4);
        let a = replica.get("Docs/a.txt").unwrap();
        assert_eq!(a.kind, NodeKind::File);
        assert_eq!(a.size, Some(10));
        // Truncated, not rounded.
        assert_eq!(a.mtime, Some(1_700_000_000));
        assert_eq!(replica.get("Docs/Sub").unwrap().kind, NodeKind::Folder);
    }

    #[test]
    fn filter_prunes_subtrees() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("node_modules/dep")).unwrap();
        fs::write(root.join("node_modules/dep/x.js"), b"x").unwrap();
        fs::write(root.join("keep.txt"), b"k").unwrap();

        let filter = PathFilter::new(&["node_modules".into()], &[]).unwrap();
        let replica = scan(root, &filter).unwrap();
        assert!(replica.contains("keep.txt"));
        assert!(!replica.contains("node_modules"));
        assert!(!replica.contains("node_modules/dep/x.js"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_not_followed() {
        let temp = tempdir().unwrap();
        let root = temp.path();
        fs::create_dir(root.join("real")).unwrap();
        fs::write(root.join("real/file.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("link")).unwrap();

        let replica = scan(root, &PathFilter::default()).unwrap();
        assert!(replica.contains("real/file.txt"));
        assert!(!replica.contains("link"));
        assert!(!replica.contains("link/file.txt"));
    }

    #[test]
    fn rounded_up_mtime_ceils_subseconds() {
        let temp = tempdir().unwrap();
        let file = temp.path().join("f");
        fs::write(&file, b"x").unwrap();
        filetime::set_file_mtime(&file, FileTime::from_unix_time(100, 1)).unwrap();
        let meta = fs::metadata(&file).unwrap();
        assert_eq!(truncated_mtime(&meta), 100);
        assert_eq!(rounded_up_mtime(&meta), 101);

        filetime::set_file_mtime(&file, FileTime::from_unix_time(100, 0)).unwrap();
        let meta = fs::metadata(&file).unwrap();
        assert_eq!(rounded_up_mtime(&meta), 100);
    }
}
