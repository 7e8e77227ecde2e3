use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Advisory single-instance lock. Two daemons mirroring the same account
/// into the same tree would fight each other through the watcher.
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Returns `None` when another live instance holds the lock.
    pub fn acquire(path: PathBuf) -> io::Result<Option<Self>> {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(Some(Self { path }))
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub fn default_lock_path() -> PathBuf {
    std::env::temp_dir().join("icloudds.lock")
}
