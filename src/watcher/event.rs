//! Change kinds, raw notifications and the settled events handed to handlers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Kind of change a handler can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl ChangeKind {
    /// All kinds, in a fixed order.
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Created, ChangeKind::Modified, ChangeKind::Deleted];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Set of change kinds a handler listens to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChangeSet: u8 {
        const CREATED = 0b001;
        const MODIFIED = 0b010;
        const DELETED = 0b100;
    }
}

impl ChangeSet {
    /// Check membership of a single kind.
    pub fn contains_kind(&self, kind: ChangeKind) -> bool {
        self.contains(ChangeSet::from(kind))
    }

    /// Kinds in the set, in `ChangeKind::ALL` order.
    pub fn kinds(&self) -> Vec<ChangeKind> {
        ChangeKind::ALL
            .into_iter()
            .filter(|kind| self.contains_kind(*kind))
            .collect()
    }
}

impl From<ChangeKind> for ChangeSet {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Created => ChangeSet::CREATED,
            ChangeKind::Modified => ChangeSet::MODIFIED,
            ChangeKind::Deleted => ChangeSet::DELETED,
        }
    }
}

impl FromIterator<ChangeKind> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = ChangeKind>>(iter: I) -> Self {
        iter.into_iter()
            .fold(ChangeSet::empty(), |set, kind| set | ChangeSet::from(kind))
    }
}

/// A settled, deduplicated change delivered to one handler.
///
/// `root` and `pattern` describe the handler the event is delivered to,
/// so the same file change produces one `FileEvent` per matching handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEvent {
    pub kind: ChangeKind,
    /// Absolute, symlink-resolved path of the affected entry.
    pub path: PathBuf,
    /// Root of the handler receiving this event.
    pub root: PathBuf,
    /// Pattern of the handler receiving this event.
    pub pattern: Option<String>,
}

impl FileEvent {
    pub fn new(
        kind: ChangeKind,
        path: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
        pattern: Option<String>,
    ) -> Self {
        Self {
            kind,
            path: path.into(),
            root: root.into(),
            pattern,
        }
    }

    pub fn is_created(&self) -> bool {
        self.kind == ChangeKind::Created
    }

    pub fn is_modified(&self) -> bool {
        self.kind == ChangeKind::Modified
    }

    pub fn is_deleted(&self) -> bool {
        self.kind == ChangeKind::Deleted
    }

    /// Path relative to the handler root.
    pub fn relative_path(&self) -> &Path {
        self.path.strip_prefix(&self.root).unwrap_or(&self.path)
    }
}

/// An unprocessed notification from a change source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub kind: ChangeKind,
    pub path: PathBuf,
    /// When the source observed the change.
    pub at: Instant,
}

impl RawChange {
    /// Create a raw change observed now.
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self::observed_at(kind, path, Instant::now())
    }

    /// Create a raw change with an explicit observation time.
    pub fn observed_at(kind: ChangeKind, path: impl Into<PathBuf>, at: Instant) -> Self {
        Self {
            kind,
            path: path.into(),
            at,
        }
    }
}
