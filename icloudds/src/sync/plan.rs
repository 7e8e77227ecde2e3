use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Local => write!(f, "local"),
            Side::Remote => write!(f, "remote"),
        }
    }
}

/// One reconciliation step. Remote handles are resolved at execution time
/// against the live remote replica, never stored in the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateFolder { path: String, side: Side },
    DeleteNode { path: String, side: Side },
    UploadFile { path: String },
    DownloadFile { path: String },
    MoveNode { from: String, to: String, side: Side },
    SetMTime { path: String, side: Side, mtime: i64 },
}

impl Action {
    pub fn path(&self) -> &str {
        match self {
            Action::CreateFolder { path, .. }
            | Action::DeleteNode { path, .. }
            | Action::UploadFile { path }
            | Action::DownloadFile { path }
            | Action::SetMTime { path, .. } => path,
            Action::MoveNode { to, .. } => to,
        }
    }

    pub fn side(&self) -> Side {
        match self {
            Action::CreateFolder { side, .. }
            | Action::DeleteNode { side, .. }
            | Action::MoveNode { side, .. }
            | Action::SetMTime { side, .. } => *side,
            Action::UploadFile { .. } => Side::Remote,
            Action::DownloadFile { .. } => Side::Local,
        }
    }

    /// Actions that mutate the remote zone and therefore must never run
    /// concurrently with each other.
    pub fn is_remote_mutation(&self) -> bool {
        matches!(
            self,
            Action::UploadFile { .. }
                | Action::CreateFolder {
                    side: Side::Remote,
                    ..
                }
                | Action::DeleteNode {
                    side: Side::Remote,
                    ..
                }
                | Action::MoveNode {
                    side: Side::Remote,
                    ..
                }
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::CreateFolder { path, side } => write!(f, "mkdir {side} {path}"),
            Action::DeleteNode { path, side } => write!(f, "delete {side} {path}"),
            Action::UploadFile { path } => write!(f, "upload {path}"),
            Action::DownloadFile { path } => write!(f, "download {path}"),
            Action::MoveNode { from, to, side } => write!(f, "move {side} {from} -> {to}"),
            Action::SetMTime { path, side, mtime } => {
                write!(f, "set-mtime {side} {path} {mtime}")
            }
        }
    }
}

/// Ordered action sequence. Order is meaningful: folders before their
/// contents, child deletions before parent deletions, moves before
/// creations on the same side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub actions: Vec<Action>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn extend(&mut self, other: Plan) {
        self.actions.extend(other.actions);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Action> + ExactSizeIterator {
        self.actions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_mutations_are_classified() {
        assert!(Action::UploadFile { path: "a".into() }.is_remote_mutation());
        assert!(Action::DeleteNode {
            path: "a".into(),
            side: Side::Remote
        }
        .is_remote_mutation());
        assert!(!Action::DownloadFile { path: "a".into() }.is_remote_mutation());
        assert!(!Action::DeleteNode {
            path: "a".into(),
            side: Side::Local
        }
        .is_remote_mutation());
        assert!(!Action::SetMTime {
            path: "a".into(),
            side: Side::Remote,
            mtime: 0
        }
        .is_remote_mutation());
    }
}
