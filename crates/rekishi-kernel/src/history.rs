//! The history provider seam.
//!
//! Everything rekishi knows about a repository comes through
//! [`HistoryProvider`]. [`crate::git_history::GitHistory`] implements it on
//! libgit2; `MemoryHistory` (feature `test-mock`) implements it in memory.

use async_trait::async_trait;
use thiserror::Error;

use rekishi_types::{Branch, Commit, DiffStats};

/// Errors from a history provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HistoryError {
    /// Repository, branch or commit does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Network or I/O fault during fetch or lookup. May succeed on retry.
    #[error("transient provider fault: {0}")]
    Transient(String),
}

impl HistoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, HistoryError::NotFound(_))
    }
}

impl From<git2::Error> for HistoryError {
    fn from(e: git2::Error) -> Self {
        match e.code() {
            git2::ErrorCode::NotFound => HistoryError::NotFound(e.message().to_string()),
            git2::ErrorCode::InvalidSpec | git2::ErrorCode::Ambiguous => {
                HistoryError::InvalidArgument(e.message().to_string())
            }
            _ => HistoryError::Transient(e.message().to_string()),
        }
    }
}

pub type HistoryResult<T> = Result<T, HistoryError>;

/// Read access to a set of repositories, addressed by repository id.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Local branches, plus remote-tracking branches when `include_remote`.
    async fn list_branches(&self, repo: &str, include_remote: bool) -> HistoryResult<Vec<Branch>>;

    /// Branches (local and remote) whose short name matches any glob pattern.
    async fn list_branches_matching(
        &self,
        repo: &str,
        patterns: &[String],
    ) -> HistoryResult<Vec<Branch>>;

    async fn get_branch(&self, repo: &str, name: &str) -> HistoryResult<Branch>;

    /// Commits reachable from the branch tip, tip-first, at most `limit`.
    async fn commits_for_branch(
        &self,
        repo: &str,
        name: &str,
        limit: Option<usize>,
    ) -> HistoryResult<Vec<Commit>>;

    async fn lookup_commit(&self, repo: &str, id: &str) -> HistoryResult<Commit>;

    /// Every commit on any local branch, oldest-first, within the inclusive
    /// date bounds (Unix seconds). Each commit carries its branch membership.
    async fn commits_chronological(
        &self,
        repo: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> HistoryResult<Vec<Commit>>;

    async fn diff_stats(&self, repo: &str, id: &str) -> HistoryResult<DiffStats>;

    /// Most recent common ancestor, or None for disjoint histories.
    async fn merge_base(&self, repo: &str, a: &str, b: &str) -> HistoryResult<Option<String>>;

    /// Oldest commit reachable from `tip` but not from `base`, walking no
    /// further than `base`. None when `tip` is already contained in `base`.
    async fn first_commit_after(
        &self,
        repo: &str,
        tip: &str,
        base: &str,
    ) -> HistoryResult<Option<String>>;

    /// `(ahead, behind)`: commits reachable from `a` but not `b`, and the reverse.
    async fn divergence(&self, repo: &str, a: &str, b: &str) -> HistoryResult<(usize, usize)>;

    /// Update remote-tracking refs. Returns whether any ref changed.
    async fn fetch_updates(&self, repo: &str) -> HistoryResult<bool>;

    /// The branch a monitor should follow: HEAD's upstream if configured,
    /// otherwise HEAD's branch.
    async fn default_branch(&self, repo: &str) -> HistoryResult<String>;
}

/// Reject blank identifiers before they reach a provider.
pub fn require_non_blank(kind: &str, value: &str) -> HistoryResult<()> {
    if value.trim().is_empty() {
        return Err(HistoryError::InvalidArgument(format!("{kind} must not be blank")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git2_error_mapping() {
        let not_found = git2::Error::new(
            git2::ErrorCode::NotFound,
            git2::ErrorClass::Reference,
            "no such ref",
        );
        assert_eq!(
            HistoryError::from(not_found),
            HistoryError::NotFound("no such ref".into())
        );

        let net = git2::Error::new(git2::ErrorCode::GenericError, git2::ErrorClass::Net, "timeout");
        assert!(matches!(HistoryError::from(net), HistoryError::Transient(_)));
    }

    #[test]
    fn test_require_non_blank() {
        assert!(require_non_blank("repository id", "rekishi").is_ok());
        let err = require_non_blank("repository id", "  ").unwrap_err();
        assert_eq!(
            err,
            HistoryError::InvalidArgument("repository id must not be blank".into())
        );
    }
}
