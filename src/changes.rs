//! Detect which flags changed between two snapshots.
use crate::{FlagEntry, Snapshot};

/// A single flag that was added, removed or modified by a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Flag slug.
    pub key: String,
    /// `None` if the flag newly appeared.
    pub previous: Option<FlagEntry>,
    /// `None` if the flag was removed from the flag service.
    pub current: Option<FlagEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

impl ChangeRecord {
    pub fn kind(&self) -> ChangeKind {
        match (&self.previous, &self.current) {
            (None, _) => ChangeKind::Added,
            (_, None) => ChangeKind::Removed,
            (Some(_), Some(_)) => ChangeKind::Modified,
        }
    }
}

/// Compare two snapshots. Unchanged flags produce no record. Records are sorted by key.
pub fn diff(previous: &Snapshot, current: &Snapshot) -> Vec<ChangeRecord> {
    let mut changes: Vec<ChangeRecord> = current
        .flags()
        .iter()
        .filter_map(|(key, entry)| match previous.get(key) {
            Some(old) if old == entry => None,
            old => Some(ChangeRecord {
                key: key.clone(),
                previous: old.cloned(),
                current: Some(entry.clone()),
            }),
        })
        .collect();

    changes.extend(
        previous
            .flags()
            .iter()
            .filter(|(key, _)| current.get(key).is_none())
            .map(|(key, entry)| ChangeRecord {
                key: key.clone(),
                previous: Some(entry.clone()),
                current: None,
            }),
    );

    changes.sort_by(|a, b| a.key.cmp(&b.key));
    changes
}
