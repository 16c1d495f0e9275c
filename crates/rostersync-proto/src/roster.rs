//! Materialized roster view.

use crate::messages::{DeltaEntry, DeltaKind, RosterEntry};
use std::collections::BTreeMap;

/// Identifier → role view built from a snapshot and folded deltas.
///
/// Entries are replaced wholesale; a delta never patches a field in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    entries: BTreeMap<String, String>,
}

impl Roster {
    /// Create an empty roster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a roster from a snapshot. Later duplicates win.
    #[must_use]
    pub fn from_snapshot(snapshot: &[RosterEntry]) -> Self {
        let entries = snapshot
            .iter()
            .map(|entry| (entry.id.clone(), entry.role.clone()))
            .collect();
        Self { entries }
    }

    /// Fold one delta batch into the roster, in order.
    pub fn apply(&mut self, batch: &[DeltaEntry]) {
        for entry in batch {
            match entry.kind() {
                DeltaKind::Added | DeltaKind::Updated => {
                    self.entries.insert(entry.id.clone(), entry.role.clone());
                }
                DeltaKind::Removed => {
                    self.entries.remove(&entry.id);
                }
                DeltaKind::Unknown => {
                    tracing::debug!(
                        id = %entry.id,
                        marker = %entry.state,
                        "Ignoring delta with unknown state marker"
                    );
                }
            }
        }
    }

    /// Role of a visitor, if present.
    #[must_use]
    pub fn role(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(String::as_str)
    }

    /// Number of visitors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the roster is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries ordered by identifier.
    pub fn iter(&self) -> impl Iterator<Item = RosterEntry> + '_ {
        self.entries
            .iter()
            .map(|(id, role)| RosterEntry::new(id.clone(), role.clone()))
    }
}
