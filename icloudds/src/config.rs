use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Validated runtime configuration, assembled in `main` from the CLI.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub directory: PathBuf,
    pub username: String,
    pub password: Option<String>,
    pub cookie_directory: PathBuf,
    pub ignore_regexes: Vec<String>,
    pub include_regexes: Vec<String>,
    pub icloud_check_period: Duration,
    pub icloud_refresh_period: Duration,
    pub debounce_period: Duration,
    pub max_workers: usize,
    pub state_dir: PathBuf,
}

/// One regex per line; `#` starts a comment, blank lines are skipped.
/// A missing file is simply an empty list.
pub fn load_regex_file(path: &Path) -> io::Result<Vec<String>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut patterns = Vec::new();
    for line in io::BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        patterns.push(trimmed.to_string());
    }
    Ok(patterns)
}

pub fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}
