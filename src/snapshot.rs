use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::{
    flag::{decode_flags, FlagEntry, FlagMap},
    Result,
};

/// The full set of flag definitions known to the client at a point in time.
///
/// A `Snapshot` is never modified after construction. Every poll produces a new one that replaces
/// the previous snapshot as a whole.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    flags: FlagMap,
    captured_at: DateTime<Utc>,
}

impl Snapshot {
    /// Create a snapshot captured now.
    pub fn new(flags: FlagMap) -> Snapshot {
        Snapshot::with_captured_at(flags, Utc::now())
    }

    pub fn with_captured_at(flags: FlagMap, captured_at: DateTime<Utc>) -> Snapshot {
        Snapshot { flags, captured_at }
    }

    pub fn empty() -> Snapshot {
        Snapshot::new(HashMap::new())
    }

    /// Parse a snapshot from the flag service wire format (an object of slug to flag definition).
    ///
    /// Useful for bootstrapping from a response saved by a previous process.
    pub fn from_json(json: &str) -> Result<Snapshot> {
        Ok(Snapshot::new(decode_flags(json.as_bytes())?))
    }

    pub fn get(&self, slug: &str) -> Option<&FlagEntry> {
        self.flags.get(slug)
    }

    pub fn flags(&self) -> &FlagMap {
        &self.flags
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// When the flags in this snapshot were obtained.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

impl From<FlagMap> for Snapshot {
    fn from(flags: FlagMap) -> Snapshot {
        Snapshot::new(flags)
    }
}

impl FromIterator<FlagEntry> for Snapshot {
    fn from_iter<I: IntoIterator<Item = FlagEntry>>(iter: I) -> Snapshot {
        Snapshot::new(
            iter.into_iter()
                .map(|entry| (entry.slug.clone(), entry))
                .collect(),
        )
    }
}
