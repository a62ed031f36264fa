//! Significant-commit graph types.
//!
//! A `RepositoryOverview` is the condensed structural view of a repository:
//! branch heads, the merge bases where branches leave the anchor timeline, and
//! the first commit on each branch after divergence.

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::commit::Commit;

/// Why a commit was retained in the overview.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum CommitRole {
    #[strum(serialize = "branch_head", serialize = "head")]
    BranchHead,
    #[strum(serialize = "merge_base", serialize = "base")]
    MergeBase,
    Both,
}

impl CommitRole {
    /// Combine two roles observed for the same commit.
    ///
    /// Monotonic: `BranchHead + MergeBase = Both` in either order, `Both`
    /// absorbs everything, and a role never downgrades.
    pub fn merge(self, other: CommitRole) -> CommitRole {
        match (self, other) {
            (a, b) if a == b => a,
            _ => CommitRole::Both,
        }
    }

    pub fn is_head(&self) -> bool {
        matches!(self, CommitRole::BranchHead | CommitRole::Both)
    }

    pub fn is_merge_base(&self) -> bool {
        matches!(self, CommitRole::MergeBase | CommitRole::Both)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommitRole::BranchHead => "branch_head",
            CommitRole::MergeBase => "merge_base",
            CommitRole::Both => "both",
        }
    }
}

impl std::fmt::Display for CommitRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A commit retained in the overview, with its role and branch membership.
///
/// Only mutated while the graph is being built, and then only through
/// [`SignificantCommit::absorb`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignificantCommit {
    pub commit: Commit,
    pub role: CommitRole,
    /// Branches this commit was recorded for, in first-seen order.
    pub branches: Vec<String>,
    /// Interior commit of the anchor window: present for timeline context,
    /// not because it heads a branch.
    #[serde(default)]
    pub timeline_context: bool,
}

impl SignificantCommit {
    pub fn new(commit: Commit, role: CommitRole, branch: impl Into<String>) -> Self {
        Self {
            commit,
            role,
            branches: vec![branch.into()],
            timeline_context: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.commit.id
    }

    /// Merge another observation of the same commit into this one.
    pub fn absorb(&mut self, role: CommitRole, branch: &str) {
        self.role = self.role.merge(role);
        if !self.branches.iter().any(|b| b == branch) {
            self.branches.push(branch.to_string());
        }
    }

    /// A real branch tip (not just an anchor-window context commit).
    pub fn is_tip(&self) -> bool {
        self.role.is_head() && !self.timeline_context
    }
}

/// Kind of cross-branch relation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    MergeBase,
}

/// Links a commit to the pair of branches it relates.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitRelation {
    pub commit_id: String,
    /// Always the anchor branch.
    pub branch_a: String,
    pub branch_b: String,
    pub kind: RelationKind,
}

impl CommitRelation {
    pub fn merge_base(commit_id: impl Into<String>, anchor: &str, branch: &str) -> Self {
        Self {
            commit_id: commit_id.into(),
            branch_a: anchor.to_string(),
            branch_b: branch.to_string(),
            kind: RelationKind::MergeBase,
        }
    }
}

/// One branch as it appears in the overview, in display order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSummary {
    pub name: String,
    pub tip: String,
    pub is_remote: bool,
    pub is_anchor: bool,
    /// Merge base with the anchor, if the histories are related.
    pub merge_base: Option<String>,
    /// Timestamp of the merge base (Unix seconds), used for ordering.
    pub merge_base_time: Option<i64>,
    /// First commit on this branch after it left the anchor.
    pub first_after_divergence: Option<String>,
    /// Commits on this branch not on the anchor.
    pub ahead: Option<usize>,
    /// Commits on the anchor not on this branch.
    pub behind: Option<usize>,
}

/// The condensed structural view of a repository.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryOverview {
    pub repo: String,
    pub anchor: Option<String>,
    pub branches: Vec<BranchSummary>,
    /// Newest-first by timestamp, ties broken by id.
    pub commits: Vec<SignificantCommit>,
    pub relations: Vec<CommitRelation>,
}

impl RepositoryOverview {
    pub fn commit(&self, id: &str) -> Option<&SignificantCommit> {
        self.commits.iter().find(|c| c.commit.id == id)
    }

    pub fn branch(&self, name: &str) -> Option<&BranchSummary> {
        self.branches.iter().find(|b| b.name == name)
    }

    pub fn branch_order(&self) -> Vec<&str> {
        self.branches.iter().map(|b| b.name.as_str()).collect()
    }
}
