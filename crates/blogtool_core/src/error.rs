use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::journal::JournalPhase;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Which step of a run or repair was executing when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunPhase {
    Lock,
    Load,
    Journal,
    Stage,
    Commit,
    Rewrite,
    Rekey,
    FixNegative,
    CleanupStaging,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lock => "run lock",
            Self::Load => "load",
            Self::Journal => "journal",
            Self::Stage => "stage",
            Self::Commit => "commit",
            Self::Rewrite => "rewrite",
            Self::Rekey => "rekey",
            Self::FixNegative => "fix-negative-ids",
            Self::CleanupStaging => "cleanup-temp-ids",
        };
        f.write_str(name)
    }
}

/// Work persisted before a run stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    pub staged: usize,
    pub committed: usize,
    pub updated_references: usize,
    pub updated_bodies: usize,
    pub rekeyed_counters: usize,
}

impl fmt::Display for RunProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "staged {}, committed {}, rewrote {} references in {} bodies, rekeyed {} counters",
            self.staged,
            self.committed,
            self.updated_references,
            self.updated_bodies,
            self.rekeyed_counters
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum PreconditionViolation {
    /// Non-normal ids are present and must be repaired first.
    DirtyIdentifierSpace { corrupt: usize, staging: usize },
    /// `staging_base + total` does not fit in an id.
    StagingRangeOverflow { total: usize, staging_base: i64 },
    /// A previous run stopped part way; only resuming it is allowed.
    InterruptedRun { phase: JournalPhase },
}

impl fmt::Display for PreconditionViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirtyIdentifierSpace { corrupt, staging } => write!(
                f,
                "{corrupt} article(s) with non-positive ids and {staging} in the staging range; \
                 run `fix-negative-ids` and `cleanup-temp-ids` first"
            ),
            Self::StagingRangeOverflow {
                total,
                staging_base,
            } => write!(
                f,
                "staging base {staging_base} leaves no room for {total} staged copies; lower renumber.staging_base"
            ),
            Self::InterruptedRun { phase } => write!(
                f,
                "an interrupted run stopped in its {} phase; run `renumber` to finish it",
                phase.as_str()
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum RenumberError {
    #[error("precondition failed: {violation}")]
    PreconditionFailed { violation: PreconditionViolation },
    #[error("{phase} failed{} ({progress})", describe_article(.id))]
    PersistenceFailure {
        phase: RunPhase,
        id: Option<i64>,
        progress: RunProgress,
        #[source]
        source: BoxError,
    },
    #[error("reference rewrite failed in article {id} ({progress})")]
    ReferenceRewriteFailure {
        id: i64,
        progress: RunProgress,
        #[source]
        source: BoxError,
    },
}

impl RenumberError {
    pub fn persistence(
        phase: RunPhase,
        id: Option<i64>,
        progress: RunProgress,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::PersistenceFailure {
            phase,
            id,
            progress,
            source: source.into(),
        }
    }

    pub fn rewrite(id: i64, progress: RunProgress, source: impl Into<BoxError>) -> Self {
        Self::ReferenceRewriteFailure {
            id,
            progress,
            source: source.into(),
        }
    }

    /// Partial counts recorded before the failure; zero for precondition failures.
    pub fn progress(&self) -> RunProgress {
        match self {
            Self::PreconditionFailed { .. } => RunProgress::default(),
            Self::PersistenceFailure { progress, .. }
            | Self::ReferenceRewriteFailure { progress, .. } => *progress,
        }
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }
}

fn describe_article(id: &Option<i64>) -> String {
    match id {
        Some(id) => format!(" at article {id}"),
        None => String::new(),
    }
}
