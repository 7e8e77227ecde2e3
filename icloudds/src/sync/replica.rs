use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use icloud_core::DriveHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Folder,
    File,
}

/// One file or folder, keyed by its sync-root-relative POSIX path.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub path: String,
    pub kind: NodeKind,
    /// Files only.
    pub size: Option<u64>,
    /// Files only; UTC unix seconds.
    pub mtime: Option<i64>,
    /// Set once on remote creation or first scan, cleared with the node.
    pub handle: Option<DriveHandle>,
    /// Declared direct-child count as reported by the remote (folders).
    pub child_count: Option<u64>,
}

impl Node {
    pub fn folder(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::Folder,
            size: None,
            mtime: None,
            handle: None,
            child_count: None,
        }
    }

    pub fn file(path: impl Into<String>, size: u64, mtime: i64) -> Self {
        Self {
            path: path.into(),
            kind: NodeKind::File,
            size: Some(size),
            mtime: Some(mtime),
            handle: None,
            child_count: None,
        }
    }

    pub fn with_handle(mut self, handle: DriveHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn with_child_count(mut self, count: u64) -> Self {
        self.child_count = Some(count);
        self
    }

    pub fn parent(&self) -> Option<&str> {
        parent_of(&self.path)
    }

    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }
}

pub fn parent_of(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// Indexed tree for one side of the mirror. The index is a flat sorted map
/// from relative path to node, so parents always iterate before their
/// children and moves are key rewrites.
#[derive(Debug, Clone, Default)]
pub struct Replica {
    nodes: BTreeMap<String, Node>,
    declared_file_count: u64,
    trash_item_count: u64,
    root_handle: Option<DriveHandle>,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&Node> {
        self.nodes.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn insert(&mut self, node: Node) {
        self.nodes.insert(node.path.clone(), node);
    }

    /// Removes the node and, for folders, its whole subtree.
    pub fn remove(&mut self, path: &str) -> Option<Node> {
        for descendant in self.descendant_paths(path) {
            self.nodes.remove(&descendant);
        }
        self.nodes.remove(path)
    }

    /// Atomic rename: re-keys the node and every descendant, preserving
    /// handles and metadata.
    pub fn rename(&mut self, from: &str, to: &str) {
        let mut moved = Vec::new();
        if let Some(node) = self.nodes.remove(from) {
            moved.push((to.to_string(), node));
        }
        for descendant in self.descendant_paths(from) {
            if let Some(node) = self.nodes.remove(&descendant) {
                let suffix = &descendant[from.len()..];
                moved.push((format!("{to}{suffix}"), node));
            }
        }
        for (path, mut node) in moved {
            node.path = path.clone();
            self.nodes.insert(path, node);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    pub fn count_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn file_count(&self) -> u64 {
        self.nodes.values().filter(|n| n.is_file()).count() as u64
    }

    /// Integrity gate: does the declared remote file count match what the
    /// scan actually found?
    pub fn fold_check(&self, declared: u64) -> bool {
        self.file_count() == declared
    }

    pub fn declared_file_count(&self) -> u64 {
        self.declared_file_count
    }

    pub fn set_declared_file_count(&mut self, count: u64) {
        self.declared_file_count = count;
    }

    pub fn trash_item_count(&self) -> u64 {
        self.trash_item_count
    }

    pub fn set_trash_item_count(&mut self, count: u64) {
        self.trash_item_count = count;
    }

    pub fn root_handle(&self) -> Option<&DriveHandle> {
        self.root_handle.as_ref()
    }

    pub fn set_root_handle(&mut self, handle: DriveHandle) {
        self.root_handle = Some(handle);
    }

    /// Handle lookup that falls back to the root handle for the empty
    /// (root) path.
    pub fn handle_for(&self, path: &str) -> Option<DriveHandle> {
        if path.is_empty() {
            return self.root_handle.clone();
        }
        self.get(path).and_then(|n| n.handle.clone())
    }

    /// The node's own path followed by every descendant, in sorted order.
    pub fn subtree_paths(&self, path: &str) -> Vec<String> {
        let mut paths = Vec::new();
        if self.contains(path) {
            paths.push(path.to_string());
        }
        paths.extend(self.descendant_paths(path));
        paths
    }

    fn descendant_paths(&self, path: &str) -> Vec<String> {
        let prefix = format!("{path}/");
        self.nodes
            .range::<String, _>((Bound::Excluded(path.to_string()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Live replica slot. Candidate replicas are built privately and committed
/// with [`SharedReplica::replace`] under the write gate.
#[derive(Clone, Default)]
pub struct SharedReplica(Arc<RwLock<Replica>>);

impl SharedReplica {
    pub fn new(replica: Replica) -> Self {
        Self(Arc::new(RwLock::new(replica)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Replica> {
        self.0.read().expect("replica lock poisoned")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Replica> {
        self.0.write().expect("replica lock poisoned")
    }

    pub fn replace(&self, replica: Replica) {
        *self.write() = replica;
    }

    /// Stable snapshot for iteration outside the lock.
    pub fn snapshot(&self) -> Replica {
        self.read().clone()
    }
}
