use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Paths the executor is actively mutating locally. Watcher events for
/// these paths (or anything under them) are echoes of our own writes and
/// must be discarded until the entry expires.
#[derive(Clone)]
pub struct SuppressionSet {
    entries: Arc<Mutex<HashMap<String, Instant>>>,
    window: Duration,
}

impl SuppressionSet {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            window,
        }
    }

    /// Shield a path prefix. Re-shielding extends the window.
    pub fn shield(&self, path: &str) {
        self.shield_at(path, Instant::now());
    }

    pub fn shield_at(&self, path: &str, now: Instant) {
        let mut entries = self.entries.lock().expect("suppression lock poisoned");
        entries.insert(path.to_string(), now + self.window);
    }

    pub fn is_suppressed(&self, path: &str) -> bool {
        self.is_suppressed_at(path, Instant::now())
    }

    pub fn is_suppressed_at(&self, path: &str, now: Instant) -> bool {
        let mut entries = self.entries.lock().expect("suppression lock poisoned");
        entries.retain(|_, expiry| *expiry > now);
        entries.keys().any(|prefix| {
            path == prefix
                || (path.len() > prefix.len()
                    && path.starts_with(prefix.as_str())
                    && path.as_bytes()[prefix.len()] == b'/')
        })
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("suppression lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("suppression lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shields_exact_path_and_descendants() {
        let set = SuppressionSet::new(Duration::from_secs(10));
        set.shield("Docs/a.txt");
        set.shield("Photos");
        assert!(set.is_suppressed("Docs/a.txt"));
        assert!(set.is_suppressed("Photos/2024/img.png"));
        assert!(!set.is_suppressed("Docs/a.txt.bak"));
        assert!(!set.is_suppressed("PhotosBackup/img.png"));
        assert!(!set.is_suppressed("Docs/b.txt"));
    }

    #[test]
    fn entries_expire_after_the_window() {
        let set = SuppressionSet::new(Duration::from_secs(10));
        let start = Instant::now();
        set.shield_at("Docs/a.txt", start);
        assert!(set.is_suppressed_at("Docs/a.txt", start + Duration::from_secs(9)));
        assert!(!set.is_suppressed_at("Docs/a.txt", start + Duration::from_secs(11)));
        assert!(set.is_empty());
    }

    #[test]
    fn reshielding_extends_the_window() {
        let set = SuppressionSet::new(Duration::from_secs(10));
        let start = Instant::now();
        set.shield_at("Docs/a.txt", start);
        set.shield_at("Docs/a.txt", start + Duration::from_secs(8));
        assert!(set.is_suppressed_at("Docs/a.txt", start + Duration::from_secs(15)));
    }
}
