//! Moves view counters along with their articles after a renumbering run.

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::error::{RenumberError, RunPhase, RunProgress};
use crate::identifiers::IdentifierMapping;
use crate::store::{ContentStore, ViewCounter};

/// Counter values keyed by article id, captured before any id moves.
#[derive(Debug, Clone, Default)]
pub struct CounterSnapshot {
    counters: HashMap<i64, ViewCounter>,
}

impl CounterSnapshot {
    pub fn capture(store: &dyn ContentStore) -> Result<Self> {
        Ok(Self::from_counters(store.list_counters()?))
    }

    pub fn from_counters(counters: impl IntoIterator<Item = ViewCounter>) -> Self {
        Self {
            counters: counters
                .into_iter()
                .map(|counter| (counter.article_id, counter))
                .collect(),
        }
    }

    pub fn get(&self, article_id: i64) -> Option<ViewCounter> {
        self.counters.get(&article_id).copied()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }
}

/// Rekeys every counter in `mapping` from its old id to its new id.
///
/// Each destination receives the snapshot value for its old id; a destination
/// already holding that value is left alone, so re-running with the same mapping
/// and snapshot after a partial failure is safe. Counters left at old ids that
/// are no longer any article's id are removed afterwards.
///
/// Returns the number of counters whose key changed.
pub fn rekey_counters(
    store: &dyn ContentStore,
    mapping: &IdentifierMapping,
    snapshot: &CounterSnapshot,
    progress: &mut RunProgress,
) -> Result<usize, RenumberError> {
    let new_ids: HashSet<i64> = mapping.entries().iter().map(|entry| entry.new_id).collect();
    let mut rekeyed = 0usize;

    for entry in mapping.entries() {
        let expected = match snapshot.get(entry.old_id) {
            Some(counter) => counter.rekeyed(entry.new_id),
            None => {
                tracing::warn!(
                    old_id = entry.old_id,
                    new_id = entry.new_id,
                    "article had no view counter; starting a zeroed one"
                );
                ViewCounter::zeroed(entry.new_id)
            }
        };

        let current = store
            .load_counter(entry.new_id)
            .map_err(|error| {
                RenumberError::persistence(RunPhase::Rekey, Some(entry.new_id), *progress, error)
            })?;
        if current != Some(expected) {
            store.put_counter(&expected).map_err(|error| {
                RenumberError::persistence(RunPhase::Rekey, Some(entry.new_id), *progress, error)
            })?;
            tracing::debug!(old_id = entry.old_id, new_id = entry.new_id, "rekeyed view counter");
        }

        if entry.old_id != entry.new_id && snapshot.get(entry.old_id).is_some() {
            rekeyed += 1;
            progress.rekeyed_counters = rekeyed;
        }
    }

    for entry in mapping.entries() {
        if new_ids.contains(&entry.old_id) {
            continue;
        }
        store.remove_counter(entry.old_id).map_err(|error| {
            RenumberError::persistence(RunPhase::Rekey, Some(entry.old_id), *progress, error)
        })?;
    }

    Ok(rekeyed)
}
