//! Shared commit, graph and replay types for rekishi.
//!
//! This crate has **no internal rekishi dependencies**. It is the leaf crate the
//! kernel and server build on.
//!
//! # Key Types
//!
//! |------------------------|-----------------------------------------------|
//! | Type                   | Purpose                                       |
//! |------------------------|-----------------------------------------------|
//! | [`Commit`]             | Immutable commit snapshot from a provider     |
//! | [`DiffStats`]          | Aggregate line counts (+ derived ratios)      |
//! | [`Branch`]             | Branch tip, upstream and ahead/behind         |
//! | [`SignificantCommit`]  | Commit retained in an overview, with a role   |
//! | [`CommitRelation`]     | Merge base linking the anchor to a branch     |
//! | [`RepositoryOverview`] | The condensed structural graph                |
//! | [`ReplaySession`]      | Observable state of one playback              |
//! | [`SessionId`]          | Which replay session                          |
//! |------------------------|-----------------------------------------------|

pub mod commit;
pub mod graph;
pub mod ids;
pub mod replay;

pub use commit::{Branch, Commit, DiffStats};
pub use graph::{
    BranchSummary, CommitRelation, CommitRole, RelationKind, RepositoryOverview,
    SignificantCommit,
};
pub use ids::SessionId;
pub use replay::{ReplayOptions, ReplaySession, ReplayState};

/// Current time as Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
