//! Significant-commit graph builder.
//!
//! Reduces a repository's history to the commits a structural view needs:
//!
//! - the anchor branch's recent timeline (tip + `anchor_window` context commits)
//! - every other branch's tip
//! - the merge base where each branch left the anchor
//! - the first commit on each branch after it left the anchor
//!
//! One commit may serve several purposes; roles combine through
//! [`CommitRole::merge`], so the result does not depend on visiting order.
//!
//! # Failure policy
//!
//! Unknown candidate names are dropped, as is a branch whose tip cannot be
//! looked up. A merge-base, divergence or walk failure for one branch only
//! loses that branch's relationship; the rest of the overview is still built.

use std::sync::Arc;

use indexmap::IndexMap;

use rekishi_types::{
    Branch, BranchSummary, Commit, CommitRelation, CommitRole, RepositoryOverview,
    SignificantCommit,
};

use crate::config::GraphConfig;
use crate::history::{HistoryProvider, HistoryResult, require_non_blank};

/// Preferred anchor names, in priority order. Each tier accepts the local
/// name or its `origin/` remote-tracking twin.
const ANCHOR_PREFERENCE: [[&str; 2]; 2] = [["main", "origin/main"], ["master", "origin/master"]];

/// Choose the anchor branch: `main`/`origin/main`, else `master`/`origin/master`,
/// else the first candidate.
pub fn select_anchor<S: AsRef<str>>(candidates: &[S]) -> Option<&str> {
    for tier in ANCHOR_PREFERENCE {
        for preferred in tier {
            if let Some(found) = candidates.iter().find(|c| c.as_ref() == preferred) {
                return Some(found.as_ref());
            }
        }
    }
    candidates.first().map(|c| c.as_ref())
}

/// Display order: anchor first, then ascending by merge-base time, branches
/// without a merge base last. Stable, so ties keep input order.
pub fn order_branches(branches: &mut [BranchSummary]) {
    branches.sort_by_key(|b| (!b.is_anchor, b.merge_base_time.is_none(), b.merge_base_time));
}

/// Significant commits keyed by id, in first-seen order.
#[derive(Default)]
struct CommitSet {
    commits: IndexMap<String, SignificantCommit>,
}

impl CommitSet {
    /// Add a commit, or merge the role and branch into the existing entry.
    fn upsert(&mut self, commit: Commit, role: CommitRole, branch: &str) -> &mut SignificantCommit {
        self.commits
            .entry(commit.id.clone())
            .and_modify(|existing| existing.absorb(role, branch))
            .or_insert_with(|| SignificantCommit::new(commit, role, branch))
    }

    fn get(&self, id: &str) -> Option<&SignificantCommit> {
        self.commits.get(id)
    }

    /// Newest-first, ties broken by id.
    fn into_sorted(self) -> Vec<SignificantCommit> {
        let mut commits: Vec<SignificantCommit> = self.commits.into_values().collect();
        commits.sort_by(|a, b| {
            b.commit
                .timestamp
                .cmp(&a.commit.timestamp)
                .then_with(|| a.commit.id.cmp(&b.commit.id))
        });
        commits
    }
}

/// Builds [`RepositoryOverview`]s from a [`HistoryProvider`].
pub struct GraphBuilder {
    provider: Arc<dyn HistoryProvider>,
    config: GraphConfig,
}

impl GraphBuilder {
    pub fn new(provider: Arc<dyn HistoryProvider>, config: GraphConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Overview of the branches matching any glob pattern, capped at
    /// `max_branches`. Anchor-eligible branches are kept ahead of the cap.
    pub async fn overview_matching(
        &self,
        repo: &str,
        patterns: &[String],
        include_remote: bool,
    ) -> HistoryResult<RepositoryOverview> {
        let matched = self.provider.list_branches_matching(repo, patterns).await?;
        let mut names: Vec<String> = matched
            .into_iter()
            .filter(|b| include_remote || !b.is_remote)
            .map(|b| b.name)
            .collect();

        let is_preferred = |n: &String| ANCHOR_PREFERENCE.iter().flatten().any(|p| *p == n.as_str());
        names.sort_by_key(|n| !is_preferred(n));
        if names.len() > self.config.max_branches {
            tracing::debug!(
                repo = %repo,
                matched = names.len(),
                cap = self.config.max_branches,
                "capping candidate branches"
            );
            names.truncate(self.config.max_branches);
        }

        self.overview(repo, &names).await
    }

    /// Overview of the given candidate branches.
    pub async fn overview(
        &self,
        repo: &str,
        candidates: &[String],
    ) -> HistoryResult<RepositoryOverview> {
        require_non_blank("repository id", repo)?;

        // One listing validates the repository and resolves every candidate
        let known = self.provider.list_branches(repo, true).await?;
        let mut branches: Vec<Branch> = Vec::new();
        for name in candidates {
            if branches.iter().any(|b| &b.name == name) {
                continue;
            }
            match known.iter().find(|b| &b.name == name) {
                Some(branch) => branches.push(branch.clone()),
                None => tracing::debug!(repo = %repo, branch = %name, "dropping unknown branch"),
            }
        }

        let names: Vec<&str> = branches.iter().map(|b| b.name.as_str()).collect();
        let anchor = select_anchor(&names)
            .and_then(|name| branches.iter().find(|b| b.name == name))
            .cloned();
        let Some(anchor) = anchor else {
            return Ok(RepositoryOverview {
                repo: repo.to_string(),
                ..Default::default()
            });
        };

        let mut set = CommitSet::default();
        self.add_anchor_timeline(repo, &anchor, &mut set).await?;

        let mut relations = Vec::new();
        let mut summaries = vec![BranchSummary {
            name: anchor.name.clone(),
            tip: anchor.tip.clone(),
            is_remote: anchor.is_remote,
            is_anchor: true,
            merge_base: None,
            merge_base_time: None,
            first_after_divergence: None,
            ahead: Some(0),
            behind: Some(0),
        }];

        for branch in branches.iter().filter(|b| b.name != anchor.name) {
            if let Some(summary) = self
                .add_branch(repo, &anchor, branch, &mut set, &mut relations)
                .await
            {
                summaries.push(summary);
            }
        }

        order_branches(&mut summaries);

        let overview = RepositoryOverview {
            repo: repo.to_string(),
            anchor: Some(anchor.name.clone()),
            branches: summaries,
            commits: set.into_sorted(),
            relations,
        };
        tracing::info!(
            repo = %repo,
            anchor = %anchor.name,
            branches = overview.branches.len(),
            commits = overview.commits.len(),
            relations = overview.relations.len(),
            "built repository overview"
        );
        Ok(overview)
    }

    /// Anchor history, newest-first, capped at `anchor_window`. Only the tip
    /// is a real head; the rest is timeline context.
    async fn add_anchor_timeline(
        &self,
        repo: &str,
        anchor: &Branch,
        set: &mut CommitSet,
    ) -> HistoryResult<()> {
        let window = self
            .provider
            .commits_for_branch(repo, &anchor.name, Some(self.config.anchor_window))
            .await?;
        for commit in window {
            let is_tip = commit.id == anchor.tip;
            let entry = set.upsert(commit, CommitRole::BranchHead, &anchor.name);
            entry.timeline_context = !is_tip;
        }
        Ok(())
    }

    async fn add_branch(
        &self,
        repo: &str,
        anchor: &Branch,
        branch: &Branch,
        set: &mut CommitSet,
        relations: &mut Vec<CommitRelation>,
    ) -> Option<BranchSummary> {
        let mut summary = BranchSummary {
            name: branch.name.clone(),
            tip: branch.tip.clone(),
            is_remote: branch.is_remote,
            is_anchor: false,
            merge_base: None,
            merge_base_time: None,
            first_after_divergence: None,
            ahead: None,
            behind: None,
        };

        let tip = match self.commit(repo, &branch.tip, set).await {
            Ok(commit) => commit,
            Err(e) => {
                tracing::warn!(repo = %repo, branch = %branch.name, error = %e, "tip lookup failed, dropping branch");
                return None;
            }
        };
        let entry = set.upsert(tip, CommitRole::BranchHead, &branch.name);
        entry.timeline_context = false;

        let merge_base = match self.provider.merge_base(repo, &anchor.tip, &branch.tip).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                tracing::debug!(repo = %repo, branch = %branch.name, "no shared history with anchor");
                return Some(summary);
            }
            Err(e) => {
                tracing::warn!(
                    repo = %repo,
                    branch = %branch.name,
                    error = %e,
                    "merge-base lookup failed, treating as unrelated"
                );
                return Some(summary);
            }
        };

        let base_commit = match self.commit(repo, &merge_base, set).await {
            Ok(commit) => commit,
            Err(e) => {
                tracing::warn!(repo = %repo, commit = %merge_base, error = %e, "merge-base commit lookup failed");
                return Some(summary);
            }
        };
        summary.merge_base_time = Some(base_commit.timestamp);
        summary.merge_base = Some(merge_base.clone());
        set.upsert(base_commit, CommitRole::MergeBase, &anchor.name);
        relations.push(CommitRelation::merge_base(&merge_base, &anchor.name, &branch.name));

        match self.first_after_divergence(repo, branch, &merge_base, set).await {
            Ok(Some(first)) => {
                summary.first_after_divergence = Some(first.id.clone());
                set.upsert(first, CommitRole::MergeBase, &branch.name);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(repo = %repo, branch = %branch.name, error = %e, "branch walk failed");
            }
        }

        match self.provider.divergence(repo, &branch.tip, &anchor.tip).await {
            Ok((ahead, behind)) => {
                summary.ahead = Some(ahead);
                summary.behind = Some(behind);
            }
            Err(e) => {
                tracing::warn!(repo = %repo, branch = %branch.name, error = %e, "divergence lookup failed");
            }
        }

        Some(summary)
    }

    /// First commit on the branch after it left the merge base. The provider
    /// walks only `merge_base..tip`.
    async fn first_after_divergence(
        &self,
        repo: &str,
        branch: &Branch,
        merge_base: &str,
        set: &CommitSet,
    ) -> HistoryResult<Option<Commit>> {
        let first = self
            .provider
            .first_commit_after(repo, &branch.tip, merge_base)
            .await?;
        match first {
            Some(id) => self.commit(repo, &id, set).await.map(Some),
            None => Ok(None),
        }
    }

    /// A commit already in the set, or one looked up from the provider.
    async fn commit(&self, repo: &str, id: &str, set: &CommitSet) -> HistoryResult<Commit> {
        match set.get(id) {
            Some(existing) => Ok(existing.commit.clone()),
            None => self.provider.lookup_commit(repo, id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryHistory;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn summary(name: &str, anchor: bool, time: Option<i64>) -> BranchSummary {
        BranchSummary {
            name: name.into(),
            tip: String::new(),
            is_remote: false,
            is_anchor: anchor,
            merge_base: time.map(|t| t.to_string()),
            merge_base_time: time,
            first_after_divergence: None,
            ahead: None,
            behind: None,
        }
    }

    /// main: m1..m10, feature: f1..f3 branching at m7.
    fn main_and_feature() -> Arc<MemoryHistory> {
        let history = MemoryHistory::new();
        history.add_repo("r");
        for i in 1..=7 {
            history.commit("r", "main", &format!("m{i}"), i * 100);
        }
        history.branch("r", "feature", "main");
        for i in 8..=10 {
            history.commit("r", "main", &format!("m{i}"), i * 100);
        }
        for i in 1..=3 {
            history.commit("r", "feature", &format!("f{i}"), 1_000 + i * 100);
        }
        Arc::new(history)
    }

    fn builder(history: Arc<MemoryHistory>) -> GraphBuilder {
        GraphBuilder::new(history, GraphConfig::default())
    }

    #[test]
    fn test_select_anchor_preference() {
        assert_eq!(select_anchor(&["dev", "master", "main"]), Some("main"));
        assert_eq!(select_anchor(&["dev", "origin/main", "master"]), Some("origin/main"));
        assert_eq!(select_anchor(&["dev", "origin/master"]), Some("origin/master"));
        assert_eq!(select_anchor(&["dev", "master", "origin/master"]), Some("master"));
        assert_eq!(select_anchor(&["dev", "trunk"]), Some("dev"));
        assert_eq!(select_anchor::<&str>(&[]), None);
    }

    #[test]
    fn test_order_branches() {
        let mut branches = vec![
            summary("orphan", false, None),
            summary("late", false, Some(300)),
            summary("main", true, None),
            summary("early", false, Some(100)),
            summary("tie-a", false, Some(200)),
            summary("tie-b", false, Some(200)),
        ];
        order_branches(&mut branches);
        let order: Vec<&str> = branches.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(order, vec!["main", "early", "tie-a", "tie-b", "late", "orphan"]);
    }

    #[tokio::test]
    async fn test_main_and_feature_example() {
        let overview = builder(main_and_feature())
            .overview("r", &names(&["main", "feature"]))
            .await
            .unwrap();

        assert_eq!(overview.anchor.as_deref(), Some("main"));
        assert_eq!(overview.branch_order(), vec!["main", "feature"]);

        let m10 = overview.commit("m10").unwrap();
        assert_eq!(m10.role, CommitRole::BranchHead);
        assert!(m10.is_tip());

        let m7 = overview.commit("m7").unwrap();
        assert!(m7.role.is_merge_base());
        assert!(!m7.is_tip());
        assert!(m7.branches.contains(&"main".to_string()));

        let f1 = overview.commit("f1").unwrap();
        assert_eq!(f1.role, CommitRole::MergeBase);

        let f3 = overview.commit("f3").unwrap();
        assert_eq!(f3.role, CommitRole::BranchHead);
        assert!(f3.is_tip());
        assert!(overview.commit("f2").is_none());

        assert_eq!(
            overview.relations,
            vec![CommitRelation::merge_base("m7", "main", "feature")]
        );

        let feature = overview.branch("feature").unwrap();
        assert_eq!(feature.merge_base.as_deref(), Some("m7"));
        assert_eq!(feature.first_after_divergence.as_deref(), Some("f1"));
        assert_eq!((feature.ahead, feature.behind), (Some(3), Some(3)));
    }

    #[tokio::test]
    async fn test_anchor_window_is_capped() {
        let history = main_and_feature();
        let builder = GraphBuilder::new(
            history,
            GraphConfig {
                anchor_window: 2,
                ..GraphConfig::default()
            },
        );
        let overview = builder.overview("r", &names(&["main"])).await.unwrap();
        let ids: Vec<&str> = overview.commits.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["m10", "m9"]);
        assert!(overview.commit("m9").unwrap().timeline_context);
    }

    #[tokio::test]
    async fn test_deterministic() {
        let history = main_and_feature();
        history.branch("r", "hotfix", "main");
        history.commit("r", "hotfix", "h1", 2_000);
        let builder = builder(history);
        let candidates = names(&["hotfix", "feature", "main"]);

        let a = builder.overview("r", &candidates).await.unwrap();
        let b = builder.overview("r", &candidates).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.branch_order(), vec!["main", "feature", "hotfix"]);
    }

    #[tokio::test]
    async fn test_unknown_candidates_dropped() {
        let overview = builder(main_and_feature())
            .overview("r", &names(&["ghost", "feature", "main", "feature"]))
            .await
            .unwrap();
        assert_eq!(overview.branch_order(), vec!["main", "feature"]);
    }

    #[tokio::test]
    async fn test_unknown_repo_is_error() {
        let err = builder(main_and_feature())
            .overview("nope", &names(&["main"]))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_no_candidates_gives_empty_overview() {
        let overview = builder(main_and_feature())
            .overview("r", &names(&["ghost"]))
            .await
            .unwrap();
        assert!(overview.anchor.is_none());
        assert!(overview.commits.is_empty());
    }

    #[tokio::test]
    async fn test_disjoint_branch_sorts_last_without_relation() {
        let history = main_and_feature();
        history.commit("r", "orphan", "o1", 50);
        let overview = builder(history)
            .overview("r", &names(&["orphan", "feature", "main"]))
            .await
            .unwrap();

        assert_eq!(overview.branch_order(), vec!["main", "feature", "orphan"]);
        assert_eq!(overview.relations.len(), 1);
        assert_eq!(overview.commit("o1").unwrap().role, CommitRole::BranchHead);
        assert!(overview.branch("orphan").unwrap().merge_base.is_none());
    }

    #[tokio::test]
    async fn test_merge_base_failure_isolated_to_pair() {
        let history = main_and_feature();
        history.branch("r", "other", "main");
        history.commit("r", "other", "x1", 3_000);
        history.fail_merge_base_for("r", "x1");

        let overview = builder(history)
            .overview("r", &names(&["main", "other", "feature"]))
            .await
            .unwrap();
        assert_eq!(overview.branch_order(), vec!["main", "feature", "other"]);
        assert_eq!(
            overview.relations,
            vec![CommitRelation::merge_base("m7", "main", "feature")]
        );
        assert!(overview.commit("x1").is_some());
    }

    #[tokio::test]
    async fn test_tip_lookup_failure_drops_only_that_branch() {
        let history = main_and_feature();
        history.branch("r", "broken", "main");
        history.commit("r", "broken", "b1", 3_000);
        history.fail_lookup("r", "b1");

        let overview = builder(history)
            .overview("r", &names(&["main", "broken", "feature"]))
            .await
            .unwrap();
        assert_eq!(overview.branch_order(), vec!["main", "feature"]);
        assert!(overview.commit("b1").is_none());
        assert_eq!(overview.relations.len(), 1);
    }

    #[tokio::test]
    async fn test_divergence_walk_stops_at_merge_base() {
        let history = MemoryHistory::new();
        for i in 1..=500 {
            history.commit("r", "main", &format!("m{i}"), i);
        }
        history.branch("r", "feature", "main");
        history.commit("r", "feature", "f1", 1_000);
        let history = Arc::new(history);

        let builder = GraphBuilder::new(
            history.clone(),
            GraphConfig {
                anchor_window: 10,
                ..GraphConfig::default()
            },
        );
        let overview = builder.overview("r", &names(&["main", "feature"])).await.unwrap();
        let feature = overview.branch("feature").unwrap();
        assert_eq!(feature.merge_base.as_deref(), Some("m500"));
        assert_eq!(feature.first_after_divergence.as_deref(), Some("f1"));
        // only the anchor window was loaded as full commits
        assert_eq!(history.commits_loaded(), 10);
    }

    #[tokio::test]
    async fn test_branch_tip_on_anchor_becomes_both() {
        // "release" points at m7 with no commits of its own
        let history = main_and_feature();
        history.branch_at("r", "release", "m7");
        let overview = builder(history)
            .overview("r", &names(&["main", "release"]))
            .await
            .unwrap();

        let m7 = overview.commit("m7").unwrap();
        assert_eq!(m7.role, CommitRole::Both);
        assert!(m7.is_tip());
        assert!(overview.branch("release").unwrap().first_after_divergence.is_none());
    }

    #[tokio::test]
    async fn test_single_commit_branch_tip_is_both() {
        let history = main_and_feature();
        history.branch("r", "tiny", "main");
        history.commit("r", "tiny", "t1", 5_000);
        let overview = builder(history)
            .overview("r", &names(&["main", "tiny"]))
            .await
            .unwrap();
        let t1 = overview.commit("t1").unwrap();
        assert_eq!(t1.role, CommitRole::Both);
        assert_eq!(overview.branch("tiny").unwrap().merge_base.as_deref(), Some("m10"));
    }

    #[tokio::test]
    async fn test_overview_matching_caps_and_keeps_anchor() {
        let history = main_and_feature();
        for name in ["a", "b", "c"] {
            history.branch("r", name, "main");
        }
        let builder = GraphBuilder::new(
            history,
            GraphConfig {
                max_branches: 2,
                ..GraphConfig::default()
            },
        );
        let overview = builder
            .overview_matching("r", &names(&["*"]), false)
            .await
            .unwrap();
        assert_eq!(overview.anchor.as_deref(), Some("main"));
        assert_eq!(overview.branches.len(), 2);
    }
}
