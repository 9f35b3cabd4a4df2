use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::WatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Change,
    Remove,
}

impl ChangeKind {
    /// Map a native notification kind; access-only events map to `None`.
    pub fn from_notify(kind: &notify::EventKind) -> Option<Self> {
        use notify::EventKind;
        match kind {
            EventKind::Create(_) => Some(ChangeKind::Add),
            EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(ChangeKind::Change),
            EventKind::Remove(_) => Some(ChangeKind::Remove),
            EventKind::Access(_) => None,
        }
    }
}

/// Which family of watched file a path belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFamily {
    Snapshot,
    Journal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub family: FileFamily,
    pub observed_at: DateTime<Utc>,
    /// Native notifications folded into this event (1 when nothing was
    /// coalesced). `path` and `kind` are those of the last one observed.
    pub coalesced: usize,
}

impl FileChangeEvent {
    pub fn new(path: PathBuf, kind: ChangeKind, family: FileFamily) -> Self {
        Self {
            path,
            kind,
            family,
            observed_at: Utc::now(),
            coalesced: 1,
        }
    }
}

/// Events published by the watcher.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Changed(FileChangeEvent),
    Error(Arc<WatchError>),
}

/// Suffix filter applied to native notifications before debouncing.
#[derive(Debug, Clone)]
pub struct WatchFilter {
    pub snapshot_suffixes: Vec<String>,
    pub journal_suffixes: Vec<String>,
}

impl Default for WatchFilter {
    fn default() -> Self {
        Self {
            snapshot_suffixes: vec![".db".to_string()],
            journal_suffixes: vec![".jsonl".to_string()],
        }
    }
}

impl WatchFilter {
    pub fn classify(&self, path: &Path) -> Option<FileFamily> {
        let name = path.file_name()?.to_str()?;
        if self.snapshot_suffixes.iter().any(|s| name.ends_with(s.as_str())) {
            Some(FileFamily::Snapshot)
        } else if self.journal_suffixes.iter().any(|s| name.ends_with(s.as_str())) {
            Some(FileFamily::Journal)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind};
    use notify::EventKind;

    #[test]
    fn classify_by_suffix() {
        let filter = WatchFilter::default();
        assert_eq!(
            filter.classify(Path::new(".beads/beads.db")),
            Some(FileFamily::Snapshot)
        );
        assert_eq!(
            filter.classify(Path::new(".beads/issues.jsonl")),
            Some(FileFamily::Journal)
        );
        assert_eq!(filter.classify(Path::new(".beads/config.yaml")), None);
        assert_eq!(filter.classify(Path::new(".beads/beads.db-journal")), None);
        assert_eq!(filter.classify(Path::new("/")), None);
    }

    #[test]
    fn classify_with_custom_suffixes() {
        let filter = WatchFilter {
            snapshot_suffixes: vec![".sqlite".to_string(), ".db-wal".to_string()],
            journal_suffixes: vec![".log".to_string()],
        };
        assert_eq!(
            filter.classify(Path::new("data.db-wal")),
            Some(FileFamily::Snapshot)
        );
        assert_eq!(filter.classify(Path::new("ops.log")), Some(FileFamily::Journal));
        assert_eq!(filter.classify(Path::new("data.db")), None);
    }

    #[test]
    fn change_kind_mapping() {
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Create(CreateKind::File)),
            Some(ChangeKind::Add)
        );
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Modify(ModifyKind::Any)),
            Some(ChangeKind::Change)
        );
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Remove(RemoveKind::File)),
            Some(ChangeKind::Remove)
        );
        assert_eq!(
            ChangeKind::from_notify(&EventKind::Access(AccessKind::Any)),
            None
        );
    }

    #[test]
    fn change_event_serialization() {
        let event = FileChangeEvent::new(
            PathBuf::from(".beads/issues.jsonl"),
            ChangeKind::Change,
            FileFamily::Journal,
        );
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["path"], ".beads/issues.jsonl");
        assert_eq!(json["kind"], "change");
        assert_eq!(json["family"], "journal");
        assert_eq!(json["coalesced"], 1);
    }
}
