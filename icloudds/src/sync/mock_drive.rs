//! In-memory drive used by the sync tests: a path-addressed tree behind
//! the same `DriveApi` seam the daemon runs against, with counters that
//! make concurrency and retry behavior observable.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use icloud_core::{DriveApi, DriveChild, DriveError, DriveHandle, DriveKind, RootSummary};

use super::replica::parent_of;

const ROOT_ID: &str = "mock:root";

#[derive(Debug, Clone)]
struct MockEntry {
    path: String,
    kind: DriveKind,
    size: u64,
    mtime: i64,
}

#[derive(Default)]
struct MockState {
    entries: HashMap<String, MockEntry>,
    next_id: u64,
    listed: Vec<String>,
    uploads: Vec<(String, i64)>,
    fail_mutations: usize,
}

pub struct MockDrive {
    state: Mutex<MockState>,
    declared_override: Mutex<Option<u64>>,
    trash_count: AtomicU64,
    mutations_in_flight: AtomicUsize,
    max_concurrent_mutations: AtomicUsize,
}

impl MockDrive {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            declared_override: Mutex::new(None),
            trash_count: AtomicU64::new(0),
            mutations_in_flight: AtomicUsize::new(0),
            max_concurrent_mutations: AtomicUsize::new(0),
        }
    }

    pub fn add_folder(&self, path: &str) {
        let mut state = self.lock();
        ensure_parents(&mut state, path);
        insert_entry(&mut state, path, DriveKind::Folder, 0, 0);
    }

    pub fn add_file(&self, path: &str, size: u64, mtime: i64) {
        let mut state = self.lock();
        ensure_parents(&mut state, path);
        insert_entry(&mut state, path, DriveKind::File, size, mtime);
    }

    pub fn add_app_library(&self, path: &str) {
        let mut state = self.lock();
        insert_entry(&mut state, path, DriveKind::AppLibrary, 0, 0);
    }

    pub fn remove(&self, path: &str) {
        let mut state = self.lock();
        state
            .entries
            .retain(|_, e| e.path != path && !e.path.starts_with(&format!("{path}/")));
    }

    /// Rename an entry in place, keeping its identifier, the way the real
    /// service does for server-side renames.
    pub fn relocate(&self, from: &str, to: &str) {
        let mut state = self.lock();
        let prefix = format!("{from}/");
        for entry in state.entries.values_mut() {
            if entry.path == from {
                entry.path = to.to_string();
            } else if entry.path.starts_with(&prefix) {
                entry.path = format!("{to}{}", &entry.path[from.len()..]);
            }
        }
    }

    pub fn set_declared_file_count(&self, count: u64) {
        *self
            .declared_override
            .lock()
            .expect("mock lock poisoned") = Some(count);
    }

    pub fn set_trash_item_count(&self, count: u64) {
        self.trash_count.store(count, Ordering::SeqCst);
    }

    /// Fail the next `n` mutating calls with a transient timeout.
    pub fn fail_next_mutations(&self, n: usize) {
        self.lock().fail_mutations = n;
    }

    pub fn handle(&self, path: &str) -> DriveHandle {
        if path.is_empty() {
            return DriveHandle::new(ROOT_ID, None);
        }
        let state = self.lock();
        let (id, _) = state
            .entries
            .iter()
            .find(|(_, e)| e.path == path)
            .expect("mock entry exists");
        DriveHandle::new(id.clone(), None)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().entries.values().any(|e| e.path == path)
    }

    pub fn file_at(&self, path: &str) -> Option<(u64, i64)> {
        self.lock()
            .entries
            .values()
            .find(|e| e.path == path && e.kind == DriveKind::File)
            .map(|e| (e.size, e.mtime))
    }

    pub fn listed_folder(&self, path: &str) -> bool {
        self.lock().listed.iter().any(|p| p == path)
    }

    pub fn uploads(&self) -> Vec<(String, i64)> {
        self.lock().uploads.clone()
    }

    pub fn max_concurrent_mutations(&self) -> usize {
        self.max_concurrent_mutations.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock lock poisoned")
    }

    fn file_count(&self) -> u64 {
        self.lock()
            .entries
            .values()
            .filter(|e| e.kind == DriveKind::File)
            .count() as u64
    }

    fn path_of(&self, handle: &DriveHandle) -> Result<String, DriveError> {
        if handle.id == ROOT_ID {
            return Ok(String::new());
        }
        self.lock()
            .entries
            .get(&handle.id)
            .map(|e| e.path.clone())
            .ok_or_else(|| DriveError::Io(io::Error::from(io::ErrorKind::NotFound)))
    }

    async fn begin_mutation(&self) -> Result<MutationGuard<'_>, DriveError> {
        {
            let mut state = self.lock();
            if state.fail_mutations > 0 {
                state.fail_mutations -= 1;
                return Err(DriveError::Io(io::Error::from(io::ErrorKind::TimedOut)));
            }
        }
        let current = self.mutations_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_mutations
            .fetch_max(current, Ordering::SeqCst);
        // Widen the overlap window so concurrent mutations would be seen.
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(MutationGuard { drive: self })
    }
}

impl Default for MockDrive {
    fn default() -> Self {
        Self::new()
    }
}

struct MutationGuard<'a> {
    drive: &'a MockDrive,
}

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        self.drive
            .mutations_in_flight
            .fetch_sub(1, Ordering::SeqCst);
    }
}

fn ensure_parents(state: &mut MockState, path: &str) {
    let mut prefix = String::new();
    for part in path.split('/').collect::<Vec<_>>() {
        let current = if prefix.is_empty() {
            part.to_string()
        } else {
            format!("{prefix}/{part}")
        };
        if current != path && !state.entries.values().any(|e| e.path == current) {
            insert_entry(state, &current, DriveKind::Folder, 0, 0);
        }
        prefix = current;
    }
}

fn insert_entry(state: &mut MockState, path: &str, kind: DriveKind, size: u64, mtime: i64) {
    if let Some((id, _)) = state
        .entries
        .iter()
        .find(|(_, e)| e.path == path)
        .map(|(id, e)| (id.clone(), e.clone()))
    {
        let entry = state.entries.get_mut(&id).expect("entry exists");
        entry.kind = kind;
        entry.size = size;
        entry.mtime = mtime;
        return;
    }
    state.next_id += 1;
    let id = format!("mock:{}", state.next_id);
    state.entries.insert(
        id,
        MockEntry {
            path: path.to_string(),
            kind,
            size,
            mtime,
        },
    );
}

#[async_trait]
impl DriveApi for MockDrive {
    async fn list_root(&self) -> Result<RootSummary, DriveError> {
        let declared = self
            .declared_override
            .lock()
            .expect("mock lock poisoned")
            .unwrap_or_else(|| self.file_count());
        Ok(RootSummary {
            handle: DriveHandle::new(ROOT_ID, None),
            file_count: declared,
            trash_item_count: self.trash_count.load(Ordering::SeqCst),
        })
    }

    async fn list_folder(&self, handle: &DriveHandle) -> Result<Vec<DriveChild>, DriveError> {
        let folder_path = self.path_of(handle)?;
        let mut state = self.lock();
        state.listed.push(folder_path.clone());
        let mut children: Vec<DriveChild> = state
            .entries
            .iter()
            .filter(|(_, e)| match parent_of(&e.path) {
                Some(parent) => parent == folder_path,
                None => folder_path.is_empty(),
            })
            .map(|(id, e)| DriveChild {
                name: e.path.rsplit('/').next().unwrap_or(&e.path).to_string(),
                kind: e.kind,
                size: (e.kind == DriveKind::File).then_some(e.size),
                mtime: (e.kind == DriveKind::File).then_some(e.mtime),
                handle: DriveHandle::new(id.clone(), None),
                child_count: None,
            })
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    async fn download(&self, handle: &DriveHandle, target: &Path) -> Result<(), DriveError> {
        let path = self.path_of(handle)?;
        let size = self
            .file_at(&path)
            .map(|(size, _)| size)
            .ok_or_else(|| DriveError::Io(io::Error::from(io::ErrorKind::NotFound)))?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, vec![0u8; size as usize])?;
        Ok(())
    }

    async fn upload(
        &self,
        parent: &DriveHandle,
        name: &str,
        source: &Path,
        mtime: i64,
    ) -> Result<DriveHandle, DriveError> {
        let _guard = self.begin_mutation().await?;
        let parent_path = self.path_of(parent)?;
        let size = std::fs::metadata(source)?.len();
        let path = if parent_path.is_empty() {
            name.to_string()
        } else {
            format!("{parent_path}/{name}")
        };
        let mut state = self.lock();
        insert_entry(&mut state, &path, DriveKind::File, size, mtime);
        state.uploads.push((path.clone(), mtime));
        let (id, _) = state
            .entries
            .iter()
            .find(|(_, e)| e.path == path)
            .expect("uploaded entry exists");
        Ok(DriveHandle::new(id.clone(), None))
    }

    async fn create_folder(
        &self,
        parent: &DriveHandle,
        name: &str,
    ) -> Result<DriveHandle, DriveError> {
        let _guard = self.begin_mutation().await?;
        let parent_path = self.path_of(parent)?;
        let path = if parent_path.is_empty() {
            name.to_string()
        } else {
            format!("{parent_path}/{name}")
        };
        let mut state = self.lock();
        insert_entry(&mut state, &path, DriveKind::Folder, 0, 0);
        let (id, _) = state
            .entries
            .iter()
            .find(|(_, e)| e.path == path)
            .expect("created entry exists");
        Ok(DriveHandle::new(id.clone(), None))
    }

    async fn delete(&self, handle: &DriveHandle) -> Result<(), DriveError> {
        let _guard = self.begin_mutation().await?;
        let path = self.path_of(handle)?;
        let mut state = self.lock();
        let prefix = format!("{path}/");
        state
            .entries
            .retain(|_, e| e.path != path && !e.path.starts_with(&prefix));
        self.trash_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn move_node(
        &self,
        handle: &DriveHandle,
        new_parent: &DriveHandle,
        new_name: &str,
    ) -> Result<(), DriveError> {
        let _guard = self.begin_mutation().await?;
        let from = self.path_of(handle)?;
        let parent_path = self.path_of(new_parent)?;
        let to = if parent_path.is_empty() {
            new_name.to_string()
        } else {
            format!("{parent_path}/{new_name}")
        };
        let mut state = self.lock();
        let prefix = format!("{from}/");
        for entry in state.entries.values_mut() {
            if entry.path == from {
                entry.path = to.clone();
            } else if entry.path.starts_with(&prefix) {
                entry.path = format!("{to}{}", &entry.path[from.len()..]);
            }
        }
        Ok(())
    }
}
