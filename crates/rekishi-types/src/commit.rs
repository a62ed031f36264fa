//! Commits, diff statistics and branches as reported by a history provider.
//!
//! These are immutable snapshots: once a provider hands one out, nothing in
//! rekishi mutates it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Aggregate line counts for a single commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    /// Lines added.
    pub additions: u32,
    /// Lines removed.
    pub deletions: u32,
    /// Files touched.
    pub files_changed: u32,
}

impl DiffStats {
    pub fn new(additions: u32, deletions: u32, files_changed: u32) -> Self {
        Self {
            additions,
            deletions,
            files_changed,
        }
    }

    /// `additions - deletions`.
    pub fn net_change(&self) -> i64 {
        i64::from(self.additions) - i64::from(self.deletions)
    }

    /// `additions + deletions`.
    pub fn total_changes(&self) -> u64 {
        u64::from(self.additions) + u64::from(self.deletions)
    }

    /// Ratio in `[-1.0, 1.0]`: positive for growth, negative for shrinkage.
    /// Zero when nothing changed.
    pub fn color_indicator(&self) -> f64 {
        let total = self.total_changes();
        if total == 0 {
            return 0.0;
        }
        self.net_change() as f64 / total as f64
    }
}

/// A single commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Full commit id (hex).
    pub id: String,
    /// Short (7-char) commit id.
    pub short_id: String,
    pub author_name: String,
    pub author_email: String,
    /// Commit timestamp (Unix seconds).
    pub timestamp: i64,
    pub message: String,
    /// Parent commit ids, first parent first.
    pub parents: Vec<String>,
    /// Aggregate diff stats, if the provider computed them.
    pub stats: Option<DiffStats>,
    /// Names of the branches this commit is known to be reachable from.
    #[serde(default)]
    pub branches: BTreeSet<String>,
}

impl Commit {
    /// First line of the commit message.
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// Case-insensitive exact match against the branch-membership set.
    pub fn on_branch(&self, name: &str) -> bool {
        self.branches.iter().any(|b| b.eq_ignore_ascii_case(name))
    }

    /// Copy of this commit carrying the given stats.
    pub fn with_stats(mut self, stats: DiffStats) -> Self {
        self.stats = Some(stats);
        self
    }
}

/// A local or remote-tracking branch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Short name (`main`, `origin/main`).
    pub name: String,
    /// Full ref name (`refs/heads/main`, `refs/remotes/origin/main`).
    pub full_name: String,
    /// Commit id at the tip.
    pub tip: String,
    pub is_remote: bool,
    /// Upstream short name, if one is configured.
    pub upstream: Option<String>,
    /// Commits ahead of upstream (None without an upstream).
    pub ahead: Option<usize>,
    /// Commits behind upstream (None without an upstream).
    pub behind: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(branches: &[&str]) -> Commit {
        Commit {
            id: "a".repeat(40),
            short_id: "aaaaaaa".into(),
            author_name: "Test User".into(),
            author_email: "test@example.com".into(),
            timestamp: 1_700_000_000,
            message: "first line\n\nbody".into(),
            parents: vec![],
            stats: None,
            branches: branches.iter().map(|b| b.to_string()).collect(),
        }
    }

    #[test]
    fn test_diff_stats_derived_values() {
        let stats = DiffStats::new(30, 10, 4);
        assert_eq!(stats.net_change(), 20);
        assert_eq!(stats.total_changes(), 40);
        assert!((stats.color_indicator() - 0.5).abs() < f64::EPSILON);

        let shrink = DiffStats::new(0, 8, 1);
        assert_eq!(shrink.net_change(), -8);
        assert!((shrink.color_indicator() + 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_color_indicator_zero_when_empty() {
        assert_eq!(DiffStats::default().color_indicator(), 0.0);
    }

    #[test]
    fn test_summary_takes_first_line() {
        assert_eq!(commit(&[]).summary(), "first line");
    }

    #[test]
    fn test_on_branch_is_case_insensitive_exact() {
        let c = commit(&["Feature/Login", "main"]);
        assert!(c.on_branch("feature/login"));
        assert!(c.on_branch("MAIN"));
        assert!(!c.on_branch("feature"));
        assert!(!c.on_branch("mai"));
    }

    #[test]
    fn test_json_roundtrip() {
        let c = commit(&["main"]).with_stats(DiffStats::new(1, 2, 3));
        let json = serde_json::to_string(&c).unwrap();
        let parsed: Commit = serde_json::from_str(&json).unwrap();
        assert_eq!(c, parsed);
    }
}
