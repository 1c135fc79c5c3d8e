use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use uuid::Uuid;

use crate::journal::{JournalEntry, JournalPhase, PlannedBody, RunJournal};
use crate::lock::run_lock;
use crate::migrate::{migrate_connection, open_connection};
use crate::references::parse_post_id;

const ARTICLE_COLUMNS: &str =
    "id, uid, title, custom_path, body, created_at_ms, updated_at_ms, staged_from";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    pub id: i64,
    pub uid: String,
    pub title: String,
    pub custom_path: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub staged_from: Option<i64>,
}

impl ContentItem {
    pub fn has_custom_path(&self) -> bool {
        self.custom_path
            .as_deref()
            .is_some_and(|path| !path.trim().is_empty())
    }

    pub fn summary(&self) -> ArticleSummary {
        ArticleSummary {
            id: self.id,
            title: self.title.clone(),
            custom_path: self.custom_path.clone(),
            created_at: self.created_at,
        }
    }
}

/// The public listing row: enough to compute identifier statistics client side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleSummary {
    pub id: i64,
    pub title: String,
    pub custom_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewCounter {
    pub article_id: i64,
    pub view_count: i64,
    pub visitor_count: i64,
}

impl ViewCounter {
    pub fn zeroed(article_id: i64) -> Self {
        Self {
            article_id,
            view_count: 0,
            visitor_count: 0,
        }
    }

    pub fn rekeyed(self, article_id: i64) -> Self {
        Self { article_id, ..self }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewArticle {
    pub title: String,
    pub body: String,
    pub custom_path: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    /// Explicit public id; `None` assigns one past the current maximum.
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCounts {
    pub articles: usize,
    pub staged_copies: usize,
    pub counters: usize,
}

/// Per-item persistence used by the renumbering engine and the recovery tools.
///
/// Every article and counter method is a single independent write or read;
/// implementations must not assume a transaction spans more than one call. The
/// run journal is bookkeeping and is replaced as a whole.
pub trait ContentStore {
    /// All rows, staging copies included, ordered by id.
    fn list_articles(&self) -> Result<Vec<ContentItem>>;
    fn load_article(&self, id: i64) -> Result<Option<ContentItem>>;
    /// Resolves a custom path, preferring a row that is not a staging copy.
    fn find_by_custom_path(&self, path: &str) -> Result<Option<ContentItem>>;
    /// Inserts a duplicate of `source_id` at `staged_id`, recording `source_id` as its origin.
    fn stage_copy(&self, source_id: i64, staged_id: i64) -> Result<()>;
    /// Moves the row at `from_id` to `to_id` and clears its staging origin.
    fn relabel_article(&self, from_id: i64, to_id: i64) -> Result<()>;
    fn remove_article(&self, id: i64) -> Result<bool>;
    fn update_body(&self, id: i64, body: &str) -> Result<()>;

    fn load_counter(&self, article_id: i64) -> Result<Option<ViewCounter>>;
    fn list_counters(&self) -> Result<Vec<ViewCounter>>;
    /// Inserts or overwrites the counter keyed by `counter.article_id`.
    fn put_counter(&self, counter: &ViewCounter) -> Result<()>;
    fn remove_counter(&self, article_id: i64) -> Result<bool>;

    /// The journal of an in-flight or interrupted run.
    fn load_journal(&self) -> Result<Option<RunJournal>>;
    /// Replaces any existing journal with `journal`.
    fn save_journal(&self, journal: &RunJournal) -> Result<()>;
    fn set_journal_phase(&self, phase: JournalPhase) -> Result<()>;
    fn clear_journal(&self) -> Result<()>;

    /// File locked for the duration of a run so separate processes serialize;
    /// `None` when the store has no filesystem presence.
    fn lock_path(&self) -> Option<PathBuf> {
        None
    }
}

/// Resolves a `/post/<segment>` target the way readers do: numeric segments by id,
/// anything else by custom path.
pub fn resolve_post(store: &dyn ContentStore, segment: &str) -> Result<Option<ContentItem>> {
    let segment = segment.trim().trim_matches('/');
    if segment.is_empty() {
        return Ok(None);
    }
    match parse_post_id(segment) {
        Some(id) => store.load_article(id),
        None => store.find_by_custom_path(segment),
    }
}

pub struct SqliteStore {
    connection: Connection,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Opens the content database, applying pending migrations.
    pub fn open(db_path: &Path) -> Result<Self> {
        let connection = open_connection(db_path)?;
        migrate_connection(&connection)?;
        Ok(Self {
            connection,
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Creates an article and its zeroed view counter.
    pub fn create_article(&self, article: &NewArticle) -> Result<ContentItem> {
        let _guard = run_lock(self)?;
        self.refuse_during_interrupted_run()?;
        let title = article.title.trim();
        if title.is_empty() {
            bail!("article title cannot be empty");
        }
        let custom_path = normalize_custom_path(article.custom_path.as_deref());
        if let Some(path) = custom_path
            .as_deref()
            .filter(|path| parse_post_id(path).is_some())
        {
            bail!("custom path `{path}` is all digits and would be read as an article id");
        }
        let now = Utc::now();
        let created_at = article.created_at.unwrap_or(now);
        let id = match article.id {
            Some(id) => id,
            None => self.next_normal_id()?,
        };
        let uid = Uuid::new_v4().to_string();

        self.connection
            .execute(
                "INSERT INTO articles (id, uid, title, custom_path, body, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    uid,
                    title,
                    custom_path,
                    article.body,
                    created_at.timestamp_millis(),
                    now.timestamp_millis(),
                ],
            )
            .with_context(|| format!("failed to insert article {id}"))?;
        self.put_counter(&ViewCounter::zeroed(id))?;

        self.load_article(id)?
            .ok_or_else(|| anyhow::anyhow!("article {id} vanished after insert"))
    }

    /// Deletes an article together with its view counter.
    pub fn delete_article(&self, id: i64) -> Result<bool> {
        let _guard = run_lock(self)?;
        self.refuse_during_interrupted_run()?;
        let removed = self.remove_article(id)?;
        if removed {
            self.remove_counter(id)?;
        }
        Ok(removed)
    }

    pub fn record_view(&self, article_id: i64, new_visitor: bool) -> Result<ViewCounter> {
        if self.load_article(article_id)?.is_none() {
            bail!("article not found: {article_id}");
        }
        self.connection
            .execute(
                "INSERT INTO article_views (article_id, view_count, visitor_count)
                 VALUES (?1, 1, ?2)
                 ON CONFLICT(article_id) DO UPDATE SET
                   view_count = view_count + 1,
                   visitor_count = visitor_count + excluded.visitor_count",
                params![article_id, i64::from(new_visitor)],
            )
            .with_context(|| format!("failed to record view for article {article_id}"))?;
        self.load_counter(article_id)?
            .ok_or_else(|| anyhow::anyhow!("view counter for {article_id} vanished"))
    }

    pub fn list_summaries(&self) -> Result<Vec<ArticleSummary>> {
        Ok(self
            .list_articles()?
            .iter()
            .map(ContentItem::summary)
            .collect())
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        Ok(StoreCounts {
            articles: count_query(&self.connection, "SELECT COUNT(*) FROM articles")?,
            staged_copies: count_query(
                &self.connection,
                "SELECT COUNT(*) FROM articles WHERE staged_from IS NOT NULL",
            )?,
            counters: count_query(&self.connection, "SELECT COUNT(*) FROM article_views")?,
        })
    }

    /// Ids are in flux until an interrupted run is finished.
    fn refuse_during_interrupted_run(&self) -> Result<()> {
        if let Some(journal) = self.load_journal()? {
            bail!(
                "an interrupted renumber run (phase {}) is pending; run `blogtool renumber` to finish it first",
                journal.phase.as_str()
            );
        }
        Ok(())
    }

    fn next_normal_id(&self) -> Result<i64> {
        let max: i64 = self
            .connection
            .query_row(
                "SELECT COALESCE(MAX(id), 0) FROM articles WHERE id > 0 AND staged_from IS NULL",
                [],
                |row| row.get(0),
            )
            .context("failed to read maximum article id")?;
        Ok(max + 1)
    }

    fn query_articles(&self, sql: &str, param: &dyn rusqlite::ToSql) -> Result<Vec<ContentItem>> {
        let mut statement = self
            .connection
            .prepare(sql)
            .context("failed to prepare article query")?;
        let rows = statement
            .query_map([param], read_raw_article)
            .context("failed to run article query")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode article row")?.into_item()?);
        }
        Ok(out)
    }
}

impl ContentStore for SqliteStore {
    fn list_articles(&self) -> Result<Vec<ContentItem>> {
        let mut statement = self
            .connection
            .prepare(&format!(
                "SELECT {ARTICLE_COLUMNS} FROM articles ORDER BY id ASC"
            ))
            .context("failed to prepare article listing")?;
        let rows = statement
            .query_map([], read_raw_article)
            .context("failed to run article listing")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode article row")?.into_item()?);
        }
        Ok(out)
    }

    fn load_article(&self, id: i64) -> Result<Option<ContentItem>> {
        let raw = self
            .connection
            .query_row(
                &format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?1"),
                [id],
                read_raw_article,
            )
            .optional()
            .with_context(|| format!("failed to load article {id}"))?;
        raw.map(RawArticle::into_item).transpose()
    }

    fn find_by_custom_path(&self, path: &str) -> Result<Option<ContentItem>> {
        let Some(path) = normalize_custom_path(Some(path)) else {
            return Ok(None);
        };
        let mut found = self.query_articles(
            &format!(
                "SELECT {ARTICLE_COLUMNS} FROM articles
                 WHERE custom_path = ?1
                 ORDER BY (staged_from IS NOT NULL) ASC, id ASC
                 LIMIT 1"
            ),
            &path,
        )?;
        Ok(found.pop())
    }

    fn stage_copy(&self, source_id: i64, staged_id: i64) -> Result<()> {
        let inserted = self
            .connection
            .execute(
                "INSERT INTO articles (id, uid, title, custom_path, body, created_at_ms, updated_at_ms, staged_from)
                 SELECT ?2, uid, title, custom_path, body, created_at_ms, ?3, id
                 FROM articles WHERE id = ?1",
                params![source_id, staged_id, Utc::now().timestamp_millis()],
            )
            .with_context(|| format!("failed to stage article {source_id} at {staged_id}"))?;
        if inserted != 1 {
            bail!("cannot stage article {source_id}: no such article");
        }
        Ok(())
    }

    fn relabel_article(&self, from_id: i64, to_id: i64) -> Result<()> {
        let updated = self
            .connection
            .execute(
                "UPDATE articles SET id = ?2, staged_from = NULL, updated_at_ms = ?3 WHERE id = ?1",
                params![from_id, to_id, Utc::now().timestamp_millis()],
            )
            .with_context(|| format!("failed to relabel article {from_id} as {to_id}"))?;
        if updated != 1 {
            bail!("cannot relabel article {from_id}: no such article");
        }
        Ok(())
    }

    fn remove_article(&self, id: i64) -> Result<bool> {
        let deleted = self
            .connection
            .execute("DELETE FROM articles WHERE id = ?1", [id])
            .with_context(|| format!("failed to delete article {id}"))?;
        Ok(deleted > 0)
    }

    fn update_body(&self, id: i64, body: &str) -> Result<()> {
        let updated = self
            .connection
            .execute(
                "UPDATE articles SET body = ?2, updated_at_ms = ?3 WHERE id = ?1",
                params![id, body, Utc::now().timestamp_millis()],
            )
            .with_context(|| format!("failed to update body of article {id}"))?;
        if updated != 1 {
            bail!("cannot update body of article {id}: no such article");
        }
        Ok(())
    }

    fn load_counter(&self, article_id: i64) -> Result<Option<ViewCounter>> {
        self.connection
            .query_row(
                "SELECT article_id, view_count, visitor_count FROM article_views WHERE article_id = ?1",
                [article_id],
                read_counter,
            )
            .optional()
            .with_context(|| format!("failed to load view counter {article_id}"))
    }

    fn list_counters(&self) -> Result<Vec<ViewCounter>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT article_id, view_count, visitor_count FROM article_views ORDER BY article_id ASC",
            )
            .context("failed to prepare view counter listing")?;
        let rows = statement
            .query_map([], read_counter)
            .context("failed to run view counter listing")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode view counter row")?);
        }
        Ok(out)
    }

    fn put_counter(&self, counter: &ViewCounter) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO article_views (article_id, view_count, visitor_count)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(article_id) DO UPDATE SET
                   view_count = excluded.view_count,
                   visitor_count = excluded.visitor_count",
                params![
                    counter.article_id,
                    counter.view_count,
                    counter.visitor_count
                ],
            )
            .with_context(|| format!("failed to write view counter {}", counter.article_id))?;
        Ok(())
    }

    fn remove_counter(&self, article_id: i64) -> Result<bool> {
        let deleted = self
            .connection
            .execute(
                "DELETE FROM article_views WHERE article_id = ?1",
                [article_id],
            )
            .with_context(|| format!("failed to delete view counter {article_id}"))?;
        Ok(deleted > 0)
    }

    fn load_journal(&self) -> Result<Option<RunJournal>> {
        let header = self
            .connection
            .query_row(
                "SELECT staging_base, phase, started_at_ms FROM renumber_runs WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .context("failed to load renumber journal")?;
        let Some((staging_base, phase, started_at_ms)) = header else {
            return Ok(None);
        };
        let phase = JournalPhase::parse(&phase)
            .ok_or_else(|| anyhow::anyhow!("renumber journal has unknown phase `{phase}`"))?;

        let mut statement = self
            .connection
            .prepare(
                "SELECT uid, old_id, staged_id, new_id, body_before, body_after, replaced, view_count, visitor_count
                 FROM renumber_run_entries ORDER BY position ASC",
            )
            .context("failed to prepare journal entry query")?;
        let rows = statement
            .query_map([], read_raw_journal_entry)
            .context("failed to read journal entries")?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("failed to decode journal entry")?.into_entry()?);
        }

        Ok(Some(RunJournal {
            staging_base,
            phase,
            started_at: timestamp_from_millis(started_at_ms)
                .context("renumber journal has an invalid start time")?,
            entries,
        }))
    }

    fn save_journal(&self, journal: &RunJournal) -> Result<()> {
        let transaction = self
            .connection
            .unchecked_transaction()
            .context("failed to begin journal write")?;
        transaction
            .execute("DELETE FROM renumber_run_entries", [])
            .context("failed to clear old journal entries")?;
        transaction
            .execute(
                "INSERT OR REPLACE INTO renumber_runs (id, staging_base, phase, started_at_ms)
                 VALUES (1, ?1, ?2, ?3)",
                params![
                    journal.staging_base,
                    journal.phase.as_str(),
                    journal.started_at.timestamp_millis()
                ],
            )
            .context("failed to write journal header")?;
        {
            let mut insert = transaction
                .prepare(
                    "INSERT INTO renumber_run_entries
                     (position, uid, old_id, staged_id, new_id, body_before, body_after, replaced, view_count, visitor_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )
                .context("failed to prepare journal entry insert")?;
            for (position, entry) in journal.entries.iter().enumerate() {
                let replaced = entry.body.as_ref().map_or(0, |body| body.replaced);
                insert
                    .execute(params![
                        i64::try_from(position).context("journal too large")?,
                        entry.uid,
                        entry.old_id,
                        entry.staged_id,
                        entry.new_id,
                        entry.body.as_ref().map(|body| body.before.as_str()),
                        entry.body.as_ref().map(|body| body.after.as_str()),
                        i64::try_from(replaced).context("replacement count out of range")?,
                        entry.counter.map(|counter| counter.view_count),
                        entry.counter.map(|counter| counter.visitor_count),
                    ])
                    .with_context(|| format!("failed to journal article {}", entry.old_id))?;
            }
        }
        transaction
            .commit()
            .context("failed to commit renumber journal")
    }

    fn set_journal_phase(&self, phase: JournalPhase) -> Result<()> {
        let updated = self
            .connection
            .execute(
                "UPDATE renumber_runs SET phase = ?1 WHERE id = 1",
                [phase.as_str()],
            )
            .context("failed to update journal phase")?;
        if updated != 1 {
            bail!("no renumber journal to advance");
        }
        Ok(())
    }

    fn clear_journal(&self) -> Result<()> {
        let transaction = self
            .connection
            .unchecked_transaction()
            .context("failed to begin journal clear")?;
        transaction
            .execute_batch("DELETE FROM renumber_run_entries; DELETE FROM renumber_runs;")
            .context("failed to clear renumber journal")?;
        transaction
            .commit()
            .context("failed to commit journal clear")
    }

    fn lock_path(&self) -> Option<PathBuf> {
        Some(self.db_path.with_extension("lock"))
    }
}

struct RawArticle {
    id: i64,
    uid: String,
    title: String,
    custom_path: Option<String>,
    body: String,
    created_at_ms: i64,
    updated_at_ms: i64,
    staged_from: Option<i64>,
}

impl RawArticle {
    fn into_item(self) -> Result<ContentItem> {
        Ok(ContentItem {
            created_at: timestamp_from_millis(self.created_at_ms)
                .with_context(|| format!("article {} has an invalid created_at", self.id))?,
            updated_at: timestamp_from_millis(self.updated_at_ms)
                .with_context(|| format!("article {} has an invalid updated_at", self.id))?,
            id: self.id,
            uid: self.uid,
            title: self.title,
            custom_path: self.custom_path,
            body: self.body,
            staged_from: self.staged_from,
        })
    }
}

fn read_raw_article(row: &Row<'_>) -> rusqlite::Result<RawArticle> {
    Ok(RawArticle {
        id: row.get(0)?,
        uid: row.get(1)?,
        title: row.get(2)?,
        custom_path: row.get(3)?,
        body: row.get(4)?,
        created_at_ms: row.get(5)?,
        updated_at_ms: row.get(6)?,
        staged_from: row.get(7)?,
    })
}

struct RawJournalEntry {
    uid: String,
    old_id: i64,
    staged_id: i64,
    new_id: i64,
    body_before: Option<String>,
    body_after: Option<String>,
    replaced: i64,
    view_count: Option<i64>,
    visitor_count: Option<i64>,
}

impl RawJournalEntry {
    fn into_entry(self) -> Result<JournalEntry> {
        let body = match (self.body_before, self.body_after) {
            (Some(before), Some(after)) => Some(PlannedBody {
                before,
                after,
                replaced: usize::try_from(self.replaced)
                    .context("journal replacement count out of range")?,
            }),
            _ => None,
        };
        let counter = match (self.view_count, self.visitor_count) {
            (Some(view_count), Some(visitor_count)) => Some(ViewCounter {
                article_id: self.old_id,
                view_count,
                visitor_count,
            }),
            _ => None,
        };
        Ok(JournalEntry {
            uid: self.uid,
            old_id: self.old_id,
            staged_id: self.staged_id,
            new_id: self.new_id,
            body,
            counter,
        })
    }
}

fn read_raw_journal_entry(row: &Row<'_>) -> rusqlite::Result<RawJournalEntry> {
    Ok(RawJournalEntry {
        uid: row.get(0)?,
        old_id: row.get(1)?,
        staged_id: row.get(2)?,
        new_id: row.get(3)?,
        body_before: row.get(4)?,
        body_after: row.get(5)?,
        replaced: row.get(6)?,
        view_count: row.get(7)?,
        visitor_count: row.get(8)?,
    })
}

fn read_counter(row: &Row<'_>) -> rusqlite::Result<ViewCounter> {
    Ok(ViewCounter {
        article_id: row.get(0)?,
        view_count: row.get(1)?,
        visitor_count: row.get(2)?,
    })
}

fn timestamp_from_millis(value: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(value)
        .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {value}"))
}

fn normalize_custom_path(value: Option<&str>) -> Option<String> {
    value
        .map(|path| path.trim().trim_matches('/'))
        .filter(|path| !path.is_empty())
        .map(str::to_string)
}

fn count_query(connection: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed query: {sql}"))?;
    usize::try_from(count).context("count does not fit into usize")
}
