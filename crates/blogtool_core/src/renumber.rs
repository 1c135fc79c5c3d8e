//! Two-phase renumbering of article ids.
//!
//! A run reorders every article by `(created_at, id)` and gives it the id
//! `index + 1`. Writes are never batched in a transaction, so each step is
//! laid out to leave a recoverable store if the process dies between writes:
//!
//! 0. journal: persist the mapping, planned body rewrites, and counter snapshot;
//! 1. stage: insert a copy of each article at `staging_base + index`;
//! 2. commit: remove every original, then relabel each copy to its final id;
//! 3. rewrite `/post/<id>` references in bodies through the old-to-new mapping;
//! 4. move view counters to the new ids and drop the journal;
//! 5. ask the rendering layer to drop cached pages.
//!
//! Every step checks the store before writing, so a run that finds a journal
//! left behind simply continues it. [`crate::recovery::cleanup_temp_ids`]
//! settles the staging range instead when an operator prefers that.

use std::collections::HashSet;

use serde::Serialize;
use similar::TextDiff;

use crate::counters::{CounterSnapshot, rekey_counters};
use crate::error::{PreconditionViolation, RenumberError, RunPhase, RunProgress};
use crate::identifiers::{DEFAULT_STAGING_BASE, IdentifierMapping, report_for};
use crate::journal::{JournalEntry, JournalPhase, PlannedBody, RunJournal};
use crate::lock::lock_for_run;
use crate::recovery::{
    CleanupReport, FixNegativeReport, cleanup_temp_ids_locked, fix_negative_ids_locked,
};
use crate::references::{rewrite, verify_rewrite};
use crate::revalidate::PageInvalidator;
use crate::store::{ContentItem, ContentStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenumberOptions {
    pub staging_base: i64,
}

impl Default for RenumberOptions {
    fn default() -> Self {
        Self {
            staging_base: DEFAULT_STAGING_BASE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenumberReport {
    pub total_articles: usize,
    pub updated_references: usize,
    pub custom_path_articles: usize,
    pub updated_bodies: usize,
    pub rekeyed_counters: usize,
    pub pages_invalidated: bool,
    /// The run finished one that had been interrupted.
    pub resumed: bool,
    pub mapping: IdentifierMapping,
}

/// What a run would do, computed without writing anything.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenumberPlan {
    pub staging_base: i64,
    pub total_articles: usize,
    pub custom_path_articles: usize,
    pub changed_ids: usize,
    pub updated_references: usize,
    pub mapping: IdentifierMapping,
    pub body_edits: Vec<BodyEdit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyEdit {
    pub old_id: i64,
    pub new_id: i64,
    pub title: String,
    pub replaced: usize,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairRenumberReport {
    pub fixed: FixNegativeReport,
    pub cleaned: CleanupReport,
    pub renumbered: RenumberReport,
}

struct PreparedRun {
    ordered: Vec<ContentItem>,
    mapping: IdentifierMapping,
    custom_path_articles: usize,
}

/// Renumbers every article to `1..=N` in creation order, or finishes a run
/// that was interrupted.
///
/// A fresh run refuses to start unless the identifier space is clean; see
/// [`crate::recovery`] for the repairs.
pub fn renumber(
    store: &dyn ContentStore,
    invalidator: &dyn PageInvalidator,
    options: RenumberOptions,
) -> Result<RenumberReport, RenumberError> {
    let _guard = lock_for_run(store)?;
    renumber_locked(store, invalidator, options)
}

/// Repairs non-positive ids and the staging range, then renumbers, all under one lock hold.
pub fn repair_and_renumber(
    store: &dyn ContentStore,
    invalidator: &dyn PageInvalidator,
    options: RenumberOptions,
) -> Result<RepairRenumberReport, RenumberError> {
    let _guard = lock_for_run(store)?;
    let fixed = fix_negative_ids_locked(store, options.staging_base)?;
    let cleaned = cleanup_temp_ids_locked(store, options.staging_base)?;
    let renumbered = renumber_locked(store, invalidator, options)?;
    Ok(RepairRenumberReport {
        fixed,
        cleaned,
        renumbered,
    })
}

pub fn plan_renumber(
    store: &dyn ContentStore,
    options: RenumberOptions,
) -> Result<RenumberPlan, RenumberError> {
    if let Some(journal) = load_journal(store)? {
        return Err(RenumberError::PreconditionFailed {
            violation: PreconditionViolation::InterruptedRun {
                phase: journal.phase,
            },
        });
    }
    let prepared = prepare(store, options)?;

    let mut body_edits = Vec::new();
    let mut updated_references = 0usize;
    for item in &prepared.ordered {
        let Some(planned) = planned_body(item, &prepared.mapping) else {
            continue;
        };
        updated_references += planned.replaced;
        body_edits.push(BodyEdit {
            old_id: item.id,
            new_id: prepared.mapping.get(item.id).unwrap_or(item.id),
            title: item.title.clone(),
            replaced: planned.replaced,
            before: planned.before,
            after: planned.after,
        });
    }

    Ok(RenumberPlan {
        staging_base: options.staging_base,
        total_articles: prepared.ordered.len(),
        custom_path_articles: prepared.custom_path_articles,
        changed_ids: prepared.mapping.changed_count(),
        updated_references,
        mapping: prepared.mapping,
        body_edits,
    })
}

/// Unified diff of one planned body edit.
pub fn render_body_diff(edit: &BodyEdit) -> String {
    let old_header = format!("post/{} (before)", edit.old_id);
    let new_header = format!("post/{} (after)", edit.new_id);
    let diff = TextDiff::from_lines(&edit.before, &edit.after);
    diff.unified_diff()
        .context_radius(1)
        .header(&old_header, &new_header)
        .to_string()
}

fn planned_body(item: &ContentItem, mapping: &IdentifierMapping) -> Option<PlannedBody> {
    let outcome = rewrite(&item.body, mapping);
    if !outcome.changed() {
        return None;
    }
    Some(PlannedBody {
        before: item.body.clone(),
        after: outcome.body,
        replaced: outcome.replaced,
    })
}

fn load_journal(store: &dyn ContentStore) -> Result<Option<RunJournal>, RenumberError> {
    store.load_journal().map_err(|error| {
        RenumberError::persistence(RunPhase::Journal, None, RunProgress::default(), error)
    })
}

fn prepare(store: &dyn ContentStore, options: RenumberOptions) -> Result<PreparedRun, RenumberError> {
    let items = store.list_articles().map_err(|error| {
        RenumberError::persistence(RunPhase::Load, None, RunProgress::default(), error)
    })?;

    let space = report_for(&items, options.staging_base);
    if !space.is_clean() {
        return Err(RenumberError::PreconditionFailed {
            violation: PreconditionViolation::DirtyIdentifierSpace {
                corrupt: space.corrupt_count,
                staging: space.staging_count,
            },
        });
    }
    let fits = i64::try_from(items.len())
        .ok()
        .and_then(|total| options.staging_base.checked_add(total))
        .is_some();
    if !fits {
        return Err(RenumberError::PreconditionFailed {
            violation: PreconditionViolation::StagingRangeOverflow {
                total: items.len(),
                staging_base: options.staging_base,
            },
        });
    }

    let mut ordered = items;
    ordered.sort_by_key(|item| (item.created_at, item.id));
    let mapping = IdentifierMapping::from_pairs(
        ordered
            .iter()
            .zip(1i64..)
            .map(|(item, new_id)| (item.id, new_id)),
    );

    Ok(PreparedRun {
        custom_path_articles: space.custom_path_count,
        ordered,
        mapping,
    })
}

fn journal_for(prepared: &PreparedRun, staging_base: i64, snapshot: &CounterSnapshot) -> RunJournal {
    let entries = prepared
        .ordered
        .iter()
        .zip(staging_base..)
        .zip(1i64..)
        .map(|((item, staged_id), new_id)| JournalEntry {
            uid: item.uid.clone(),
            old_id: item.id,
            staged_id,
            new_id,
            body: planned_body(item, &prepared.mapping),
            counter: snapshot.get(item.id),
        })
        .collect();
    RunJournal {
        staging_base,
        phase: JournalPhase::Stage,
        started_at: chrono::Utc::now(),
        entries,
    }
}

fn renumber_locked(
    store: &dyn ContentStore,
    invalidator: &dyn PageInvalidator,
    options: RenumberOptions,
) -> Result<RenumberReport, RenumberError> {
    if let Some(journal) = load_journal(store)? {
        tracing::warn!(
            phase = journal.phase.as_str(),
            started_at = %journal.started_at,
            articles = journal.entries.len(),
            "resuming interrupted renumber run"
        );
        let custom_path_articles = journaled_custom_paths(store, &journal)?;
        return drive(store, invalidator, journal, custom_path_articles, true);
    }

    let prepared = prepare(store, options)?;
    let snapshot = CounterSnapshot::capture(store).map_err(|error| {
        RenumberError::persistence(RunPhase::Load, None, RunProgress::default(), error)
    })?;
    let journal = journal_for(&prepared, options.staging_base, &snapshot);
    store.save_journal(&journal).map_err(|error| {
        RenumberError::persistence(RunPhase::Journal, None, RunProgress::default(), error)
    })?;
    tracing::debug!(
        articles = journal.entries.len(),
        counters = snapshot.len(),
        "journaled renumber run"
    );
    drive(
        store,
        invalidator,
        journal,
        prepared.custom_path_articles,
        false,
    )
}

fn journaled_custom_paths(
    store: &dyn ContentStore,
    journal: &RunJournal,
) -> Result<usize, RenumberError> {
    let items = store.list_articles().map_err(|error| {
        RenumberError::persistence(RunPhase::Load, None, RunProgress::default(), error)
    })?;
    let with_paths: HashSet<&str> = items
        .iter()
        .filter(|item| item.has_custom_path())
        .map(|item| item.uid.as_str())
        .collect();
    Ok(journal
        .entries
        .iter()
        .filter(|entry| with_paths.contains(entry.uid.as_str()))
        .count())
}

fn drive(
    store: &dyn ContentStore,
    invalidator: &dyn PageInvalidator,
    mut journal: RunJournal,
    custom_path_articles: usize,
    resumed: bool,
) -> Result<RenumberReport, RenumberError> {
    let mut progress = RunProgress::default();

    if journal.phase == JournalPhase::Stage {
        tracing::info!(
            articles = journal.entries.len(),
            staging_base = journal.staging_base,
            "renumber: stage phase"
        );
        stage_entries(store, &journal, &mut progress)?;
        advance(store, &mut journal, JournalPhase::Commit, progress)?;
    }
    if journal.phase == JournalPhase::Commit {
        tracing::info!(articles = journal.entries.len(), "renumber: commit phase");
        commit_entries(store, &journal, &mut progress)?;
        advance(store, &mut journal, JournalPhase::Finish, progress)?;
    }

    let mapping = journal.mapping();
    tracing::info!("renumber: rewriting references");
    rewrite_bodies(store, &journal, &mapping, &mut progress)?;

    let snapshot = journal.snapshot();
    tracing::info!(counters = snapshot.len(), "renumber: rekeying view counters");
    rekey_counters(store, &mapping, &snapshot, &mut progress)?;
    store.clear_journal().map_err(|error| {
        RenumberError::persistence(RunPhase::Journal, None, progress, error)
    })?;

    let pages_invalidated = match invalidator.invalidate_all() {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(
                error = %format!("{error:#}"),
                "page invalidation failed; rendered pages may be stale"
            );
            false
        }
    };

    tracing::info!(
        articles = journal.entries.len(),
        updated_references = progress.updated_references,
        updated_bodies = progress.updated_bodies,
        rekeyed_counters = progress.rekeyed_counters,
        resumed,
        "renumber complete"
    );
    Ok(RenumberReport {
        total_articles: journal.entries.len(),
        updated_references: progress.updated_references,
        custom_path_articles,
        updated_bodies: progress.updated_bodies,
        rekeyed_counters: progress.rekeyed_counters,
        pages_invalidated,
        resumed,
        mapping,
    })
}

fn advance(
    store: &dyn ContentStore,
    journal: &mut RunJournal,
    phase: JournalPhase,
    progress: RunProgress,
) -> Result<(), RenumberError> {
    store
        .set_journal_phase(phase)
        .map_err(|error| RenumberError::persistence(RunPhase::Journal, None, progress, error))?;
    journal.phase = phase;
    Ok(())
}

/// Writes each missing staged copy. Copies already in their slot are kept.
fn stage_entries(
    store: &dyn ContentStore,
    journal: &RunJournal,
    progress: &mut RunProgress,
) -> Result<(), RenumberError> {
    for entry in &journal.entries {
        let failed = |progress: RunProgress, error: anyhow::Error| {
            RenumberError::persistence(RunPhase::Stage, Some(entry.old_id), progress, error)
        };

        let slot = store
            .load_article(entry.staged_id)
            .map_err(|error| failed(*progress, error))?;
        match slot {
            Some(row) if row.uid == entry.uid => {}
            Some(row) => {
                return Err(failed(
                    *progress,
                    anyhow::anyhow!(
                        "staging slot {} holds another article ({})",
                        entry.staged_id,
                        row.uid
                    ),
                ));
            }
            None => {
                let source = store
                    .load_article(entry.old_id)
                    .map_err(|error| failed(*progress, error))?;
                if !source.is_some_and(|row| row.uid == entry.uid) {
                    return Err(failed(
                        *progress,
                        anyhow::anyhow!("article {} is no longer at id {}", entry.uid, entry.old_id),
                    ));
                }
                store
                    .stage_copy(entry.old_id, entry.staged_id)
                    .map_err(|error| failed(*progress, error))?;
                tracing::debug!(id = entry.old_id, staged_id = entry.staged_id, "staged article");
            }
        }
        progress.staged += 1;
    }
    Ok(())
}

/// Removes every original that still has its staged copy, then relabels each
/// staged copy to its final id. Entries already committed are skipped.
///
/// Returns how many copies were relabeled by this call.
pub(crate) fn commit_entries(
    store: &dyn ContentStore,
    journal: &RunJournal,
    progress: &mut RunProgress,
) -> Result<usize, RenumberError> {
    for entry in &journal.entries {
        let failed = |progress: RunProgress, error: anyhow::Error| {
            RenumberError::persistence(RunPhase::Commit, Some(entry.old_id), progress, error)
        };

        let staged = store
            .load_article(entry.staged_id)
            .map_err(|error| failed(*progress, error))?;
        if !staged.is_some_and(|row| row.uid == entry.uid) {
            // Relabeled already, which only happens once every original is gone.
            continue;
        }
        let original = store
            .load_article(entry.old_id)
            .map_err(|error| failed(*progress, error))?;
        if !original.is_some_and(|row| row.uid == entry.uid && row.staged_from.is_none()) {
            continue;
        }
        let removed = store
            .remove_article(entry.old_id)
            .map_err(|error| failed(*progress, error))?;
        if !removed {
            return Err(failed(
                *progress,
                anyhow::anyhow!("article {} disappeared before commit", entry.old_id),
            ));
        }
    }

    let mut relabeled = 0usize;
    for entry in &journal.entries {
        let failed = |progress: RunProgress, error: anyhow::Error| {
            RenumberError::persistence(RunPhase::Commit, Some(entry.old_id), progress, error)
        };

        let staged = store
            .load_article(entry.staged_id)
            .map_err(|error| failed(*progress, error))?;
        if staged.is_some_and(|row| row.uid == entry.uid) {
            store
                .relabel_article(entry.staged_id, entry.new_id)
                .map_err(|error| failed(*progress, error))?;
            relabeled += 1;
            tracing::debug!(old_id = entry.old_id, new_id = entry.new_id, "committed article id");
        } else {
            let settled = store
                .load_article(entry.new_id)
                .map_err(|error| failed(*progress, error))?;
            if !settled.is_some_and(|row| row.uid == entry.uid) {
                return Err(failed(
                    *progress,
                    anyhow::anyhow!(
                        "article {} is neither staged at {} nor committed at {}",
                        entry.uid,
                        entry.staged_id,
                        entry.new_id
                    ),
                ));
            }
        }
        progress.committed += 1;
    }
    Ok(relabeled)
}

/// Writes each planned body unless it is already in place. A body edited
/// since the run started is left alone with a warning.
fn rewrite_bodies(
    store: &dyn ContentStore,
    journal: &RunJournal,
    mapping: &IdentifierMapping,
    progress: &mut RunProgress,
) -> Result<(), RenumberError> {
    for entry in &journal.entries {
        let Some(planned) = &entry.body else {
            continue;
        };
        let current = store.load_article(entry.new_id).map_err(|error| {
            RenumberError::persistence(RunPhase::Rewrite, Some(entry.new_id), *progress, error)
        })?;
        let Some(current) = current.filter(|row| row.uid == entry.uid) else {
            return Err(RenumberError::rewrite(
                entry.new_id,
                *progress,
                anyhow::anyhow!("article {} is not at id {}", entry.uid, entry.new_id),
            ));
        };

        if current.body == planned.before {
            verify_rewrite(&planned.before, &planned.after, mapping)
                .map_err(|error| RenumberError::rewrite(entry.new_id, *progress, error))?;
            store
                .update_body(entry.new_id, &planned.after)
                .map_err(|error| RenumberError::rewrite(entry.new_id, *progress, error))?;
            tracing::debug!(id = entry.new_id, replaced = planned.replaced, "rewrote references");
        } else if current.body != planned.after {
            tracing::warn!(
                id = entry.new_id,
                "body changed since the run started; leaving its references for review"
            );
            continue;
        }
        progress.updated_references += planned.replaced;
        progress.updated_bodies += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use anyhow::{Result, bail};
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::tempdir;

    use super::{
        RenumberOptions, plan_renumber, render_body_diff, renumber, repair_and_renumber,
    };
    use crate::error::{PreconditionViolation, RenumberError, RunPhase};
    use crate::identifiers::inspect;
    use crate::journal::{JournalPhase, RunJournal};
    use crate::recovery::{cleanup_temp_ids, fix_negative_ids};
    use crate::revalidate::{NoopInvalidator, PageInvalidator};
    use crate::store::{
        ContentItem, ContentStore, NewArticle, SqliteStore, ViewCounter, resolve_post,
    };

    fn open_store(temp: &tempfile::TempDir) -> SqliteStore {
        SqliteStore::open(&temp.path().join("blog.db")).expect("open store")
    }

    fn add(store: &SqliteStore, id: i64, title: &str, body: &str, minutes: i64) -> ContentItem {
        add_with_path(store, id, title, body, None, minutes)
    }

    fn add_with_path(
        store: &SqliteStore,
        id: i64,
        title: &str,
        body: &str,
        custom_path: Option<&str>,
        minutes: i64,
    ) -> ContentItem {
        let created_at =
            Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes);
        store
            .create_article(&NewArticle {
                title: title.to_string(),
                body: body.to_string(),
                custom_path: custom_path.map(str::to_string),
                created_at: Some(created_at),
                id: Some(id),
            })
            .expect("create article")
    }

    /// Seeds the X(10), Y(2), Z(30) corpus where Y links to X.
    fn seed_xyz(store: &SqliteStore) {
        add(store, 10, "X", "first post", 0);
        add(store, 2, "Y", "read /post/10 first", 1);
        add(store, 30, "Z", "see /post/2 and /post/30#end", 2);
        store.record_view(10, true).expect("view x");
        store.record_view(10, false).expect("view x again");
        store.record_view(30, true).expect("view z");
    }

    fn body_of(store: &SqliteStore, id: i64) -> String {
        store.load_article(id).expect("load").expect("article").body
    }

    struct CountingInvalidator {
        calls: Cell<usize>,
        fail: bool,
    }

    impl PageInvalidator for CountingInvalidator {
        fn invalidate_all(&self) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                bail!("revalidation endpoint unreachable");
            }
            Ok(())
        }
    }

    /// Delegates to a real store and fails the Nth write.
    struct CrashingStore<'a> {
        inner: &'a SqliteStore,
        crash_at: usize,
        writes: Cell<usize>,
    }

    impl<'a> CrashingStore<'a> {
        fn new(inner: &'a SqliteStore, crash_at: usize) -> Self {
            Self {
                inner,
                crash_at,
                writes: Cell::new(0),
            }
        }

        fn write(&self) -> Result<()> {
            let count = self.writes.get() + 1;
            self.writes.set(count);
            if count == self.crash_at {
                bail!("simulated crash at write {count}");
            }
            Ok(())
        }
    }

    impl ContentStore for CrashingStore<'_> {
        fn list_articles(&self) -> Result<Vec<ContentItem>> {
            self.inner.list_articles()
        }
        fn load_article(&self, id: i64) -> Result<Option<ContentItem>> {
            self.inner.load_article(id)
        }
        fn find_by_custom_path(&self, path: &str) -> Result<Option<ContentItem>> {
            self.inner.find_by_custom_path(path)
        }
        fn stage_copy(&self, source_id: i64, staged_id: i64) -> Result<()> {
            self.write()?;
            self.inner.stage_copy(source_id, staged_id)
        }
        fn relabel_article(&self, from_id: i64, to_id: i64) -> Result<()> {
            self.write()?;
            self.inner.relabel_article(from_id, to_id)
        }
        fn remove_article(&self, id: i64) -> Result<bool> {
            self.write()?;
            self.inner.remove_article(id)
        }
        fn update_body(&self, id: i64, body: &str) -> Result<()> {
            self.write()?;
            self.inner.update_body(id, body)
        }
        fn load_counter(&self, article_id: i64) -> Result<Option<ViewCounter>> {
            self.inner.load_counter(article_id)
        }
        fn list_counters(&self) -> Result<Vec<ViewCounter>> {
            self.inner.list_counters()
        }
        fn put_counter(&self, counter: &ViewCounter) -> Result<()> {
            self.write()?;
            self.inner.put_counter(counter)
        }
        fn remove_counter(&self, article_id: i64) -> Result<bool> {
            self.write()?;
            self.inner.remove_counter(article_id)
        }
        fn load_journal(&self) -> Result<Option<RunJournal>> {
            self.inner.load_journal()
        }
        fn save_journal(&self, journal: &RunJournal) -> Result<()> {
            self.inner.save_journal(journal)
        }
        fn set_journal_phase(&self, phase: JournalPhase) -> Result<()> {
            self.inner.set_journal_phase(phase)
        }
        fn clear_journal(&self) -> Result<()> {
            self.inner.clear_journal()
        }
        fn lock_path(&self) -> Option<std::path::PathBuf> {
            self.inner.lock_path()
        }
    }

    fn uids_by_id(store: &SqliteStore) -> Vec<String> {
        store
            .list_articles()
            .expect("list")
            .into_iter()
            .map(|item| item.uid)
            .collect()
    }

    fn journal_phase(store: &SqliteStore) -> Option<JournalPhase> {
        store
            .load_journal()
            .expect("load journal")
            .map(|journal| journal.phase)
    }

    #[test]
    fn renumbers_in_creation_order_and_rewrites_references() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        seed_xyz(&store);

        let report =
            renumber(&store, &NoopInvalidator, RenumberOptions::default()).expect("renumber");
        assert_eq!(report.total_articles, 3);
        assert_eq!(report.updated_references, 2);
        assert_eq!(report.updated_bodies, 2);
        assert_eq!(report.custom_path_articles, 0);
        assert!(report.pages_invalidated);
        assert_eq!(report.mapping.get(10), Some(1));
        assert_eq!(report.mapping.get(2), Some(2));
        assert_eq!(report.mapping.get(30), Some(3));

        let titles: Vec<(i64, String)> = store
            .list_articles()
            .expect("list")
            .into_iter()
            .map(|item| (item.id, item.title))
            .collect();
        assert_eq!(
            titles,
            vec![
                (1, "X".to_string()),
                (2, "Y".to_string()),
                (3, "Z".to_string())
            ]
        );
        assert_eq!(body_of(&store, 2), "read /post/1 first");
        assert_eq!(body_of(&store, 3), "see /post/2 and /post/3#end");
        assert!(inspect(&store, 50_000).expect("inspect").is_dense);
    }

    #[test]
    fn view_counters_follow_their_articles() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        seed_xyz(&store);

        let report =
            renumber(&store, &NoopInvalidator, RenumberOptions::default()).expect("renumber");
        assert_eq!(report.rekeyed_counters, 2);

        let x = store.load_counter(1).expect("counter").expect("x counter");
        assert_eq!((x.view_count, x.visitor_count), (2, 1));
        let y = store.load_counter(2).expect("counter").expect("y counter");
        assert_eq!((y.view_count, y.visitor_count), (0, 0));
        let z = store.load_counter(3).expect("counter").expect("z counter");
        assert_eq!((z.view_count, z.visitor_count), (1, 1));
        assert!(store.load_counter(10).expect("counter").is_none());
        assert!(store.load_counter(30).expect("counter").is_none());
    }

    #[test]
    fn custom_paths_resolve_before_and_after() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        add(&store, 8, "Old", "", 0);
        let about = add_with_path(&store, 40, "About", "", Some("about"), 1);

        let before = resolve_post(&store, "about").expect("resolve").expect("found");
        assert_eq!(before.uid, about.uid);

        let report =
            renumber(&store, &NoopInvalidator, RenumberOptions::default()).expect("renumber");
        assert_eq!(report.custom_path_articles, 1);

        let after = resolve_post(&store, "about").expect("resolve").expect("found");
        assert_eq!(after.uid, about.uid);
        assert_eq!(after.id, 2);
    }

    #[test]
    fn renumber_is_stable_on_a_dense_corpus() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        add(&store, 1, "A", "/post/2", 0);
        add(&store, 2, "B", "/post/1", 1);

        let report =
            renumber(&store, &NoopInvalidator, RenumberOptions::default()).expect("renumber");
        assert_eq!(report.mapping.changed_count(), 0);
        assert_eq!(report.updated_references, 0);
        assert_eq!(body_of(&store, 1), "/post/2");

        let again =
            renumber(&store, &NoopInvalidator, RenumberOptions::default()).expect("second run");
        assert_eq!(again.total_articles, 2);
        assert_eq!(again.rekeyed_counters, 0);
    }

    #[test]
    fn creation_ties_break_on_current_id() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        add(&store, 9, "Later id", "", 0);
        add(&store, 4, "Earlier id", "", 0);

        renumber(&store, &NoopInvalidator, RenumberOptions::default()).expect("renumber");
        assert_eq!(store.load_article(1).expect("load").expect("one").title, "Earlier id");
        assert_eq!(store.load_article(2).expect("load").expect("two").title, "Later id");
    }

    #[test]
    fn dirty_space_is_refused_until_repaired() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        add(&store, 50_000, "Stuck A", "", 0);
        add(&store, 50_001, "Stuck B", "/post/50000", 1);
        add(&store, -1, "Negative", "", 2);

        let error = renumber(&store, &NoopInvalidator, RenumberOptions::default())
            .expect_err("dirty space must be refused");
        assert!(error.is_precondition());
        assert!(error.to_string().contains("cleanup-temp-ids"));
        assert_eq!(store.list_articles().expect("list").len(), 3);

        assert_eq!(fix_negative_ids(&store, 50_000).expect("fix").fixed_count, 1);
        assert_eq!(cleanup_temp_ids(&store, 50_000).expect("cleanup").cleaned_count, 2);
        let report =
            renumber(&store, &NoopInvalidator, RenumberOptions::default()).expect("renumber");
        assert_eq!(report.total_articles, 3);
        assert!(inspect(&store, 50_000).expect("inspect").is_dense);
    }

    #[test]
    fn repair_and_renumber_handles_dirty_space_in_one_call() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        add(&store, -3, "Negative", "", 0);
        add(&store, 50_002, "Stuck", "", 1);
        add(&store, 12, "Normal", "", 2);

        let report = repair_and_renumber(&store, &NoopInvalidator, RenumberOptions::default())
            .expect("repair and renumber");
        assert_eq!(report.fixed.fixed_count, 1);
        assert_eq!(report.cleaned.cleaned_count, 1);
        assert_eq!(report.renumbered.total_articles, 3);
        let titles: Vec<String> = store
            .list_articles()
            .expect("list")
            .into_iter()
            .map(|item| item.title)
            .collect();
        assert_eq!(titles, vec!["Negative", "Stuck", "Normal"]);
    }

    #[test]
    fn dry_run_plans_without_writing() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        seed_xyz(&store);
        let before = store.list_articles().expect("list");
        let counters_before = store.list_counters().expect("counters");

        let plan = plan_renumber(&store, RenumberOptions::default()).expect("plan");
        assert_eq!(plan.total_articles, 3);
        assert_eq!(plan.changed_ids, 2);
        assert_eq!(plan.updated_references, 2);
        assert_eq!(plan.body_edits.len(), 2);
        assert_eq!(plan.body_edits[0].old_id, 2);
        assert_eq!(plan.body_edits[0].after, "read /post/1 first");

        let diff = render_body_diff(&plan.body_edits[0]);
        assert!(diff.contains("-read /post/10 first"));
        assert!(diff.contains("+read /post/1 first"));

        assert_eq!(store.list_articles().expect("list"), before);
        assert_eq!(store.list_counters().expect("counters"), counters_before);
    }

    #[test]
    fn invalidation_failure_does_not_fail_the_run() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        seed_xyz(&store);
        let invalidator = CountingInvalidator {
            calls: Cell::new(0),
            fail: true,
        };

        let report = renumber(&store, &invalidator, RenumberOptions::default()).expect("renumber");
        assert!(!report.pages_invalidated);
        assert_eq!(invalidator.calls.get(), 1);
        assert_eq!(body_of(&store, 2), "read /post/1 first");
    }

    #[test]
    fn invalidation_runs_once_after_success() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        add(&store, 5, "Only", "", 0);
        let invalidator = CountingInvalidator {
            calls: Cell::new(0),
            fail: false,
        };

        let report = renumber(&store, &invalidator, RenumberOptions::default()).expect("renumber");
        assert!(report.pages_invalidated);
        assert_eq!(invalidator.calls.get(), 1);
    }

    #[test]
    fn crash_during_commit_is_finished_by_cleanup() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        seed_xyz(&store);
        let uids = uids_by_id(&store);

        // Writes 1-3 stage the copies, write 4 removes X's original, write 5 crashes.
        let crashing = CrashingStore::new(&store, 5);
        let invalidator = CountingInvalidator {
            calls: Cell::new(0),
            fail: false,
        };
        let error = renumber(&crashing, &invalidator, RenumberOptions::default())
            .expect_err("simulated crash");
        match &error {
            RenumberError::PersistenceFailure {
                phase, id, progress, ..
            } => {
                assert_eq!(*phase, RunPhase::Commit);
                assert_eq!(*id, Some(2));
                assert_eq!(progress.staged, 3);
                assert_eq!(progress.committed, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(invalidator.calls.get(), 0);
        assert_eq!(journal_phase(&store), Some(JournalPhase::Commit));

        let damage = inspect(&store, 50_000).expect("inspect");
        assert_eq!(damage.staging_count, 3);
        assert_eq!(damage.normal_count, 2);
        assert_eq!(damage.interrupted_run, Some(JournalPhase::Commit));

        let cleanup = cleanup_temp_ids(&store, 50_000).expect("cleanup");
        assert_eq!(cleanup.finished, 3);
        assert_eq!(cleanup.discarded_duplicates, 0);
        assert_eq!(cleanup.restored, 0);
        assert_eq!(cleanup.cleaned_count, 3);
        assert_eq!(journal_phase(&store), Some(JournalPhase::Finish));
        assert_eq!(body_of(&store, 1), "first post");

        let report =
            renumber(&store, &NoopInvalidator, RenumberOptions::default()).expect("resume");
        assert!(report.resumed);
        assert_eq!(report.total_articles, 3);
        assert_eq!(report.updated_references, 2);
        // Listed by id: Y(2), X(10), Z(30) before; X, Y, Z after.
        assert_eq!(
            uids_by_id(&store),
            vec![uids[1].clone(), uids[0].clone(), uids[2].clone()]
        );
        assert_eq!(body_of(&store, 2), "read /post/1 first");
        assert_eq!(body_of(&store, 3), "see /post/2 and /post/3#end");
        let x = store.load_counter(1).expect("counter").expect("x counter");
        assert_eq!(x.view_count, 2);
        assert_eq!(journal_phase(&store), None);
        assert!(inspect(&store, 50_000).expect("inspect").is_dense);
    }

    #[test]
    fn rerun_after_commit_crash_resumes_directly() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        seed_xyz(&store);
        let uids = uids_by_id(&store);

        let crashing = CrashingStore::new(&store, 5);
        renumber(&crashing, &NoopInvalidator, RenumberOptions::default())
            .expect_err("simulated crash");

        let report =
            renumber(&store, &NoopInvalidator, RenumberOptions::default()).expect("resume");
        assert!(report.resumed);
        assert_eq!(report.mapping.get(10), Some(1));
        assert_eq!(report.rekeyed_counters, 2);
        assert_eq!(
            uids_by_id(&store),
            vec![uids[1].clone(), uids[0].clone(), uids[2].clone()]
        );
        assert_eq!(body_of(&store, 2), "read /post/1 first");
        assert!(inspect(&store, 50_000).expect("inspect").is_clean());
    }

    #[test]
    fn crash_while_rewriting_bodies_resumes_from_the_journal() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        seed_xyz(&store);

        // Writes 1-9 stage and commit; write 10 is Y's body update.
        let crashing = CrashingStore::new(&store, 10);
        let invalidator = CountingInvalidator {
            calls: Cell::new(0),
            fail: false,
        };
        let error = renumber(&crashing, &invalidator, RenumberOptions::default())
            .expect_err("simulated crash");
        match &error {
            RenumberError::ReferenceRewriteFailure { id, progress, .. } => {
                assert_eq!(*id, 2);
                assert_eq!(progress.committed, 3);
                assert_eq!(progress.updated_references, 0);
                assert_eq!(progress.updated_bodies, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(invalidator.calls.get(), 0);

        // Ids are final but bodies and counters still point at the old ids.
        assert_eq!(body_of(&store, 2), "read /post/10 first");
        assert!(store.load_counter(1).expect("counter").is_none());
        assert_eq!(journal_phase(&store), Some(JournalPhase::Finish));

        let plan_error = plan_renumber(&store, RenumberOptions::default())
            .expect_err("plan refuses while a run is pending");
        assert!(matches!(
            plan_error,
            RenumberError::PreconditionFailed {
                violation: PreconditionViolation::InterruptedRun {
                    phase: JournalPhase::Finish
                }
            }
        ));

        let report = renumber(&store, &invalidator, RenumberOptions::default()).expect("resume");
        assert!(report.resumed);
        assert_eq!(report.updated_references, 2);
        assert_eq!(report.updated_bodies, 2);
        assert_eq!(invalidator.calls.get(), 1);
        assert_eq!(body_of(&store, 2), "read /post/1 first");
        assert_eq!(body_of(&store, 3), "see /post/2 and /post/3#end");
        let x = store.load_counter(1).expect("counter").expect("x counter");
        assert_eq!((x.view_count, x.visitor_count), (2, 1));
        assert!(store.load_counter(10).expect("counter").is_none());
        assert_eq!(journal_phase(&store), None);
    }

    #[test]
    fn crash_while_rekeying_counters_resumes_from_the_snapshot() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        seed_xyz(&store);

        // Writes 10-11 rewrite Y and Z; write 12 moves X's counter to id 1.
        let crashing = CrashingStore::new(&store, 12);
        let invalidator = CountingInvalidator {
            calls: Cell::new(0),
            fail: false,
        };
        let error = renumber(&crashing, &invalidator, RenumberOptions::default())
            .expect_err("simulated crash");
        match &error {
            RenumberError::PersistenceFailure {
                phase, id, progress, ..
            } => {
                assert_eq!(*phase, RunPhase::Rekey);
                assert_eq!(*id, Some(1));
                assert_eq!(progress.updated_bodies, 2);
                assert_eq!(progress.updated_references, 2);
                assert_eq!(progress.rekeyed_counters, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(invalidator.calls.get(), 0);
        assert_eq!(body_of(&store, 2), "read /post/1 first");

        let report = renumber(&store, &invalidator, RenumberOptions::default()).expect("resume");
        assert!(report.resumed);
        assert_eq!(report.rekeyed_counters, 2);
        assert_eq!(body_of(&store, 2), "read /post/1 first");
        let x = store.load_counter(1).expect("counter").expect("x counter");
        assert_eq!((x.view_count, x.visitor_count), (2, 1));
        let z = store.load_counter(3).expect("counter").expect("z counter");
        assert_eq!(z.view_count, 1);
        assert!(store.load_counter(30).expect("counter").is_none());
        assert_eq!(journal_phase(&store), None);
    }

    #[test]
    fn resume_leaves_bodies_edited_since_the_crash_alone() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        seed_xyz(&store);

        let crashing = CrashingStore::new(&store, 10);
        renumber(&crashing, &NoopInvalidator, RenumberOptions::default())
            .expect_err("simulated crash");
        store
            .update_body(2, "rewritten by hand")
            .expect("edit body");

        let report =
            renumber(&store, &NoopInvalidator, RenumberOptions::default()).expect("resume");
        assert_eq!(report.updated_bodies, 1);
        assert_eq!(body_of(&store, 2), "rewritten by hand");
        assert_eq!(body_of(&store, 3), "see /post/2 and /post/3#end");
    }

    #[test]
    fn articles_cannot_be_created_while_a_run_is_pending() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        seed_xyz(&store);

        let crashing = CrashingStore::new(&store, 10);
        renumber(&crashing, &NoopInvalidator, RenumberOptions::default())
            .expect_err("simulated crash");
        let error = store
            .create_article(&NewArticle {
                title: "Late".to_string(),
                body: String::new(),
                custom_path: None,
                created_at: None,
                id: None,
            })
            .expect_err("create refused");
        assert!(error.to_string().contains("interrupted renumber run"));

        renumber(&store, &NoopInvalidator, RenumberOptions::default()).expect("resume");
        add(&store, 4, "Late", "", 10);
    }

    #[test]
    fn crash_during_stage_leaves_only_duplicates() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        seed_xyz(&store);

        let crashing = CrashingStore::new(&store, 2);
        let error = renumber(&crashing, &NoopInvalidator, RenumberOptions::default())
            .expect_err("simulated crash");
        assert_eq!(error.progress().staged, 1);
        assert_eq!(journal_phase(&store), Some(JournalPhase::Stage));

        let cleanup = cleanup_temp_ids(&store, 50_000).expect("cleanup");
        assert_eq!(cleanup.discarded_duplicates, 1);
        assert_eq!(cleanup.restored, 0);
        assert_eq!(cleanup.finished, 0);
        assert_eq!(body_of(&store, 2), "read /post/10 first");
        assert_eq!(journal_phase(&store), None);
        assert!(inspect(&store, 50_000).expect("inspect").is_clean());

        let report =
            renumber(&store, &NoopInvalidator, RenumberOptions::default()).expect("renumber");
        assert!(!report.resumed);
    }

    #[test]
    fn rerun_after_stage_crash_reuses_staged_copies() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        seed_xyz(&store);

        let crashing = CrashingStore::new(&store, 2);
        renumber(&crashing, &NoopInvalidator, RenumberOptions::default())
            .expect_err("simulated crash");

        let report =
            renumber(&store, &NoopInvalidator, RenumberOptions::default()).expect("resume");
        assert!(report.resumed);
        assert_eq!(report.total_articles, 3);
        assert_eq!(body_of(&store, 2), "read /post/1 first");
        assert!(inspect(&store, 50_000).expect("inspect").is_dense);
    }
}
