//! Durable record of a renumbering run, written before the first id moves.
//!
//! The journal holds everything a run needs after its originals are gone: the
//! old-to-new mapping keyed by `uid`, the planned body rewrites, and the counter
//! snapshot. It is cleared when the run completes; a journal still present on
//! the next run means the previous one was interrupted and is resumed.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::counters::CounterSnapshot;
use crate::identifiers::IdentifierMapping;
use crate::store::ViewCounter;

/// How far an interrupted run got. Each phase only starts once the previous
/// one has been fully written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JournalPhase {
    /// Copies are being written into the staging range; originals are untouched.
    Stage,
    /// Originals are being removed and copies relabeled to their final ids.
    Commit,
    /// Every article holds its final id; bodies and counters may lag behind.
    Finish,
}

impl JournalPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stage => "stage",
            Self::Commit => "commit",
            Self::Finish => "finish",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stage" => Some(Self::Stage),
            "commit" => Some(Self::Commit),
            "finish" => Some(Self::Finish),
            _ => None,
        }
    }
}

/// A body rewrite computed before the run started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedBody {
    pub before: String,
    pub after: String,
    pub replaced: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub uid: String,
    pub old_id: i64,
    pub staged_id: i64,
    pub new_id: i64,
    pub body: Option<PlannedBody>,
    /// Counter keyed by `old_id` when the run started.
    pub counter: Option<ViewCounter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJournal {
    pub staging_base: i64,
    pub phase: JournalPhase,
    pub started_at: DateTime<Utc>,
    /// In assignment order.
    pub entries: Vec<JournalEntry>,
}

impl RunJournal {
    pub fn mapping(&self) -> IdentifierMapping {
        IdentifierMapping::from_pairs(
            self.entries
                .iter()
                .map(|entry| (entry.old_id, entry.new_id)),
        )
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot::from_counters(self.entries.iter().filter_map(|entry| entry.counter))
    }

    /// Highest id the run assigns; ids above it stay free for the run.
    pub fn max_new_id(&self) -> i64 {
        self.entries
            .iter()
            .map(|entry| entry.new_id)
            .max()
            .unwrap_or(0)
    }
}
