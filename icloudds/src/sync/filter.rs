use regex::Regex;
use thiserror::Error;

// Patterns Apple's own client litters the tree with; always ignored.
const BUILTIN_IGNORES: [&str; 2] = [r".*\.com-apple-bird.*", r".*\.DS_Store"];

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
}

/// Include/ignore decision for relative POSIX paths, compiled once at
/// startup.
///
/// A path is ignored when any ignore pattern matches it left-anchored.
/// Otherwise it is accepted when the include list is empty or any include
/// pattern matches.
#[derive(Debug)]
pub struct PathFilter {
    ignores: Vec<Regex>,
    includes: Vec<Regex>,
}

impl PathFilter {
    pub fn new(ignores: &[String], includes: &[String]) -> Result<Self, FilterError> {
        let mut ignore_patterns: Vec<String> =
            BUILTIN_IGNORES.iter().map(|p| p.to_string()).collect();
        ignore_patterns.extend(ignores.iter().cloned());
        Ok(Self {
            ignores: compile_all(&ignore_patterns)?,
            includes: compile_all(includes)?,
        })
    }

    pub fn accept(&self, path: &str) -> bool {
        if self.ignores.iter().any(|re| re.is_match(path)) {
            return false;
        }
        if self.includes.is_empty() {
            return true;
        }
        self.includes.iter().any(|re| re.is_match(path))
    }
}

impl Default for PathFilter {
    fn default() -> Self {
        Self::new(&[], &[]).expect("builtin patterns compile")
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, FilterError> {
    patterns
        .iter()
        .map(|pattern| compile_anchored(pattern))
        .collect()
}

// Left-anchored prefix match: anchored at the start, free at the end.
fn compile_anchored(pattern: &str) -> Result<Regex, FilterError> {
    Regex::new(&format!("^(?:{pattern})")).map_err(|source| FilterError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_ignores_always_apply() {
        let filter = PathFilter::default();
        assert!(!filter.accept("Docs/.DS_Store"));
        assert!(!filter.accept("Docs/report.com-apple-bird.tmp"));
        assert!(filter.accept("Docs/report.pdf"));
    }

    #[test]
    fn ignore_patterns_are_anchored_at_start_only() {
        let filter = PathFilter::new(&["Build".into()], &[]).unwrap();
        assert!(!filter.accept("Build"));
        assert!(!filter.accept("Build/out.o"));
        // Not anchored at the end, but must match from the start.
        assert!(filter.accept("src/Build"));
    }

    #[test]
    fn empty_include_list_accepts_everything_not_ignored() {
        let filter = PathFilter::new(&[r"tmp/.*".into()], &[]).unwrap();
        assert!(filter.accept("Docs/a.txt"));
        assert!(!filter.accept("tmp/scratch.txt"));
    }

    #[test]
    fn include_list_restricts_acceptance() {
        let filter = PathFilter::new(&[], &["Docs".into(), "Photos".into()]).unwrap();
        assert!(filter.accept("Docs/a.txt"));
        assert!(filter.accept("Photos/2024/img.png"));
        assert!(!filter.accept("Music/track.mp3"));
    }

    #[test]
    fn ignore_wins_over_include() {
        let filter =
            PathFilter::new(&[r"Docs/private.*".into()], &["Docs".into()]).unwrap();
        assert!(filter.accept("Docs/a.txt"));
        assert!(!filter.accept("Docs/private/key.pem"));
    }

    #[test]
    fn decision_is_pure() {
        let filter = PathFilter::new(&["a".into()], &["b".into()]).unwrap();
        for _ in 0..3 {
            assert!(!filter.accept("a/x"));
            assert!(filter.accept("b/x"));
            assert!(!filter.accept("c/x"));
        }
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(PathFilter::new(&["(".into()], &[]).is_err());
    }
}
