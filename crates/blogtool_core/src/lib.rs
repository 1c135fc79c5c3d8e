//! Article storage, identifier renumbering, and reference repair for the blog.

pub mod config;
pub mod counters;
pub mod error;
pub mod identifiers;
pub mod journal;
pub mod lock;
pub mod migrate;
pub mod recovery;
pub mod references;
pub mod renumber;
pub mod revalidate;
pub mod runtime;
pub mod store;

pub use error::{PreconditionViolation, RenumberError, RunPhase, RunProgress};
pub use renumber::{RenumberOptions, RenumberReport, plan_renumber, renumber, repair_and_renumber};
