//! Repairs for identifier spaces left dirty by interrupted runs or foreign writers.
//!
//! When a renumber journal is pending the repairs work with it: a run that
//! crashed while staging is abandoned, one that crashed while committing is
//! carried to its final ids, and fresh ids are never handed out from the
//! range the run is about to occupy.

use std::collections::HashSet;

use serde::Serialize;

use crate::error::{RenumberError, RunPhase, RunProgress};
use crate::identifiers::{IdentifierClass, MappingEntry, classify, next_free_id};
use crate::journal::JournalPhase;
use crate::lock::lock_for_run;
use crate::renumber::commit_entries;
use crate::store::{ContentItem, ContentStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixNegativeReport {
    pub fixed_count: usize,
    pub reassigned: Vec<MappingEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub cleaned_count: usize,
    pub discarded_duplicates: usize,
    pub restored: usize,
    pub restorations: Vec<MappingEntry>,
    /// Staged copies moved to their final ids to finish an interrupted commit.
    pub finished: usize,
}

/// Gives every article with a non-positive id a fresh id past the current maximum.
pub fn fix_negative_ids(
    store: &dyn ContentStore,
    staging_base: i64,
) -> Result<FixNegativeReport, RenumberError> {
    let _guard = lock_for_run(store)?;
    fix_negative_ids_locked(store, staging_base)
}

/// Empties the staging range: duplicates are discarded, sole copies restored.
///
/// A journaled run that was committing is finished instead, leaving its
/// reference rewrite and counter moves to the next `renumber`.
pub fn cleanup_temp_ids(
    store: &dyn ContentStore,
    staging_base: i64,
) -> Result<CleanupReport, RenumberError> {
    let _guard = lock_for_run(store)?;
    cleanup_temp_ids_locked(store, staging_base)
}

pub(crate) fn fix_negative_ids_locked(
    store: &dyn ContentStore,
    staging_base: i64,
) -> Result<FixNegativeReport, RenumberError> {
    let phase = RunPhase::FixNegative;
    let items = store.list_articles().map_err(|error| {
        RenumberError::persistence(phase, None, RunProgress::default(), error)
    })?;

    let mut corrupt: Vec<&ContentItem> = items
        .iter()
        .filter(|item| classify(item.id, staging_base) == IdentifierClass::Corrupt)
        .collect();
    corrupt.sort_by_key(|item| (item.created_at, item.id));

    let journal = store.load_journal().map_err(|error| {
        RenumberError::persistence(RunPhase::Journal, None, RunProgress::default(), error)
    })?;

    let mut report = FixNegativeReport::default();
    let mut next_id = next_free_id(&items, staging_base);
    if let Some(journal) = &journal {
        next_id = next_id.max(journal.max_new_id() + 1);
    }
    for item in corrupt {
        let new_id = next_id;
        if new_id >= staging_base {
            return Err(RenumberError::persistence(
                phase,
                Some(item.id),
                RunProgress::default(),
                anyhow::anyhow!("no free id below staging base {staging_base}"),
            ));
        }
        store.relabel_article(item.id, new_id).map_err(|error| {
            RenumberError::persistence(phase, Some(item.id), RunProgress::default(), error)
        })?;
        move_counter(store, item.id, new_id).map_err(|error| {
            RenumberError::persistence(phase, Some(item.id), RunProgress::default(), error)
        })?;

        tracing::debug!(old_id = item.id, new_id, "reassigned non-positive id");
        report.reassigned.push(MappingEntry {
            old_id: item.id,
            new_id,
        });
        report.fixed_count += 1;
        next_id += 1;
    }

    if report.fixed_count > 0 {
        tracing::info!(fixed = report.fixed_count, "fixed non-positive article ids");
    }
    Ok(report)
}

pub(crate) fn cleanup_temp_ids_locked(
    store: &dyn ContentStore,
    staging_base: i64,
) -> Result<CleanupReport, RenumberError> {
    let phase = RunPhase::CleanupStaging;
    let mut report = CleanupReport::default();
    let journal = store.load_journal().map_err(|error| {
        RenumberError::persistence(RunPhase::Journal, None, RunProgress::default(), error)
    })?;
    let abandon_journal = match &journal {
        Some(journal) if journal.phase == JournalPhase::Stage => true,
        Some(journal) if journal.phase == JournalPhase::Commit => {
            let mut progress = RunProgress::default();
            report.finished = commit_entries(store, journal, &mut progress)?;
            store
                .set_journal_phase(JournalPhase::Finish)
                .map_err(|error| {
                    RenumberError::persistence(RunPhase::Journal, None, progress, error)
                })?;
            tracing::info!(
                finished = report.finished,
                "finished an interrupted commit; run `renumber` to rewrite references"
            );
            false
        }
        _ => false,
    };

    let items = store.list_articles().map_err(|error| {
        RenumberError::persistence(phase, None, RunProgress::default(), error)
    })?;

    let mut live_uids: HashSet<&str> = HashSet::new();
    let mut occupied: HashSet<i64> = HashSet::new();
    let mut staged: Vec<&ContentItem> = Vec::new();
    for item in &items {
        if classify(item.id, staging_base) == IdentifierClass::Staging {
            staged.push(item);
        } else {
            live_uids.insert(item.uid.as_str());
            occupied.insert(item.id);
        }
    }
    // Rows that are not marked as staged copies own their uid; settle them first.
    staged.sort_by_key(|item| (item.staged_from.is_some(), item.id));

    let mut next_id = next_free_id(&items, staging_base);
    for item in staged {
        if live_uids.contains(item.uid.as_str()) {
            store.remove_article(item.id).map_err(|error| {
                RenumberError::persistence(phase, Some(item.id), RunProgress::default(), error)
            })?;
            store.remove_counter(item.id).map_err(|error| {
                RenumberError::persistence(phase, Some(item.id), RunProgress::default(), error)
            })?;
            tracing::debug!(id = item.id, uid = %item.uid, "discarded staged duplicate");
            report.discarded_duplicates += 1;
            continue;
        }

        let target = item
            .staged_from
            .filter(|origin| {
                classify(*origin, staging_base) == IdentifierClass::Normal
                    && !occupied.contains(origin)
            })
            .unwrap_or(next_id);
        if target >= staging_base {
            return Err(RenumberError::persistence(
                phase,
                Some(item.id),
                RunProgress::default(),
                anyhow::anyhow!("no free id below staging base {staging_base}"),
            ));
        }
        store.relabel_article(item.id, target).map_err(|error| {
            RenumberError::persistence(phase, Some(item.id), RunProgress::default(), error)
        })?;
        move_counter(store, item.id, target).map_err(|error| {
            RenumberError::persistence(phase, Some(item.id), RunProgress::default(), error)
        })?;

        tracing::debug!(
            staged_id = item.id,
            restored_id = target,
            uid = %item.uid,
            "restored staged article"
        );
        occupied.insert(target);
        live_uids.insert(item.uid.as_str());
        next_id = next_id.max(target + 1);
        report.restored += 1;
        report.restorations.push(MappingEntry {
            old_id: item.id,
            new_id: target,
        });
    }

    if abandon_journal {
        store.clear_journal().map_err(|error| {
            RenumberError::persistence(RunPhase::Journal, None, RunProgress::default(), error)
        })?;
        tracing::info!("abandoned a renumber run interrupted while staging");
    }

    report.cleaned_count = report.discarded_duplicates + report.restored + report.finished;
    if report.cleaned_count > 0 {
        tracing::info!(
            cleaned = report.cleaned_count,
            discarded = report.discarded_duplicates,
            restored = report.restored,
            finished = report.finished,
            "cleared staging range"
        );
    }
    Ok(report)
}

/// Moves a counter to `to_id`. Destinations are ids no article held, so a
/// counter already there is an orphan and gets replaced.
fn move_counter(store: &dyn ContentStore, from_id: i64, to_id: i64) -> anyhow::Result<()> {
    let Some(counter) = store.load_counter(from_id)? else {
        return Ok(());
    };
    if let Some(orphan) = store.load_counter(to_id)? {
        tracing::warn!(
            from_id,
            to_id,
            orphan_views = orphan.view_count,
            "replacing orphaned view counter at destination"
        );
    }
    store.put_counter(&counter.rekeyed(to_id))?;
    store.remove_counter(from_id)?;
    Ok(())
}
