//! Identifier space classification and the per-run old-to-new id mapping.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::journal::JournalPhase;
use crate::store::{ArticleSummary, ContentItem, ContentStore};

/// First id of the staging band. Must stay above any plausible article count.
pub const DEFAULT_STAGING_BASE: i64 = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IdentifierClass {
    Normal,
    /// Non-positive ids left behind by an interrupted run or a foreign tool.
    Corrupt,
    Staging,
}

pub fn classify(id: i64, staging_base: i64) -> IdentifierClass {
    if id <= 0 {
        IdentifierClass::Corrupt
    } else if id >= staging_base {
        IdentifierClass::Staging
    } else {
        IdentifierClass::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingEntry {
    pub old_id: i64,
    pub new_id: i64,
}

/// `old id -> new id` for every article touched by one run. Lookups are O(1);
/// iteration follows assignment order.
#[derive(Debug, Clone, Default)]
pub struct IdentifierMapping {
    entries: Vec<MappingEntry>,
    lookup: HashMap<i64, i64>,
}

impl IdentifierMapping {
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (i64, i64)>,
    {
        let mut mapping = Self::default();
        for (old_id, new_id) in pairs {
            mapping.insert(old_id, new_id);
        }
        mapping
    }

    fn insert(&mut self, old_id: i64, new_id: i64) {
        if self.lookup.insert(old_id, new_id).is_none() {
            self.entries.push(MappingEntry { old_id, new_id });
        } else if let Some(entry) = self.entries.iter_mut().find(|e| e.old_id == old_id) {
            entry.new_id = new_id;
        }
    }

    pub fn get(&self, old_id: i64) -> Option<i64> {
        self.lookup.get(&old_id).copied()
    }

    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    /// Number of entries whose id actually changes.
    pub fn changed_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.old_id != entry.new_id)
            .count()
    }
}

impl Serialize for IdentifierMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlaggedItem {
    pub id: i64,
    pub uid: String,
    pub title: String,
    pub custom_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub staged_from: Option<i64>,
}

impl From<&ContentItem> for FlaggedItem {
    fn from(item: &ContentItem) -> Self {
        Self {
            id: item.id,
            uid: item.uid.clone(),
            title: item.title.clone(),
            custom_path: item.custom_path.clone(),
            created_at: item.created_at,
            staged_from: item.staged_from,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifierSpaceReport {
    pub staging_base: i64,
    pub total: usize,
    pub normal_count: usize,
    pub corrupt_count: usize,
    pub staging_count: usize,
    pub custom_path_count: usize,
    /// Ids are exactly `1..=total`.
    pub is_dense: bool,
    pub corrupt_items: Vec<FlaggedItem>,
    pub staging_items: Vec<FlaggedItem>,
    /// Phase of a run that stopped before finishing, if any.
    pub interrupted_run: Option<JournalPhase>,
}

impl IdentifierSpaceReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt_count == 0 && self.staging_count == 0
    }
}

/// Reads the whole store and classifies every id. No side effects.
pub fn inspect(store: &dyn ContentStore, staging_base: i64) -> Result<IdentifierSpaceReport> {
    let items = store.list_articles()?;
    let mut report = report_for(&items, staging_base);
    report.interrupted_run = store.load_journal()?.map(|journal| journal.phase);
    Ok(report)
}

pub fn report_for(items: &[ContentItem], staging_base: i64) -> IdentifierSpaceReport {
    let mut normal_ids = Vec::with_capacity(items.len());
    let mut corrupt_items = Vec::new();
    let mut staging_items = Vec::new();

    for item in items {
        match classify(item.id, staging_base) {
            IdentifierClass::Normal => normal_ids.push(item.id),
            IdentifierClass::Corrupt => corrupt_items.push(FlaggedItem::from(item)),
            IdentifierClass::Staging => staging_items.push(FlaggedItem::from(item)),
        }
    }
    normal_ids.sort_unstable();
    let is_dense = corrupt_items.is_empty()
        && staging_items.is_empty()
        && normal_ids
            .iter()
            .enumerate()
            .all(|(index, id)| i64::try_from(index + 1).is_ok_and(|expected| expected == *id));

    IdentifierSpaceReport {
        staging_base,
        total: items.len(),
        normal_count: normal_ids.len(),
        corrupt_count: corrupt_items.len(),
        staging_count: staging_items.len(),
        custom_path_count: items.iter().filter(|item| item.has_custom_path()).count(),
        is_dense,
        corrupt_items,
        staging_items,
        interrupted_run: None,
    }
}

/// Operator statistics derived from the public listing alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingStats {
    pub total: usize,
    pub negative: usize,
    pub staging: usize,
    pub custom_path: usize,
}

impl ListingStats {
    pub fn from_summaries(summaries: &[ArticleSummary], staging_base: i64) -> Self {
        Self {
            total: summaries.len(),
            negative: summaries.iter().filter(|s| s.id < 0).count(),
            staging: summaries.iter().filter(|s| s.id >= staging_base).count(),
            custom_path: summaries
                .iter()
                .filter(|s| s.custom_path.as_deref().is_some_and(|p| !p.trim().is_empty()))
                .count(),
        }
    }
}

/// One past the largest normal id in `items`, or 1 when there is none.
pub fn next_free_id(items: &[ContentItem], staging_base: i64) -> i64 {
    items
        .iter()
        .filter(|item| classify(item.id, staging_base) == IdentifierClass::Normal)
        .map(|item| item.id)
        .max()
        .unwrap_or(0)
        + 1
}
