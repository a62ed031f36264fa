//! In-memory [`HistoryProvider`] for tests.
//!
//! Commits are identified by caller-chosen ids and chained onto branch tips,
//! so a test can lay out a topology in a few lines:
//!
//! ```ignore
//! let history = MemoryHistory::new();
//! history.add_repo("r");
//! history.commit("r", "main", "m1", 100);
//! history.branch("r", "feature", "main");
//! history.commit("r", "feature", "f1", 200);
//! ```
//!
//! Faults can be injected per repository, per merge-base pair and per commit.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use globset::{Glob, GlobSetBuilder};
use parking_lot::Mutex;

use rekishi_types::{Branch, Commit, DiffStats};

use crate::history::{HistoryError, HistoryProvider, HistoryResult};

#[derive(Default)]
struct MemoryRepo {
    /// Commit plus insertion sequence (tie-breaker for equal timestamps).
    commits: HashMap<String, (Commit, usize)>,
    branches: BTreeMap<String, String>,
    remote_branches: BTreeMap<String, String>,
    default_branch: Option<String>,
    /// Set by [`MemoryHistory::push`], cleared by a fetch.
    pending_fetch: bool,
    failure: Option<HistoryError>,
    fetch_failure: Option<HistoryError>,
    merge_base_failures: HashSet<String>,
    stats_failures: HashSet<String>,
    lookup_failures: HashSet<String>,
    stats_delay: Option<Duration>,
}

impl MemoryRepo {
    fn ancestors(&self, tip: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([tip.to_string()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if let Some((commit, _)) = self.commits.get(&id) {
                queue.extend(commit.parents.iter().cloned());
            }
        }
        seen
    }

    /// Newest-first, later insertion first on equal timestamps.
    fn sorted_desc(&self, ids: impl IntoIterator<Item = String>) -> Vec<Commit> {
        let mut commits: Vec<&(Commit, usize)> =
            ids.into_iter().filter_map(|id| self.commits.get(&id)).collect();
        commits.sort_by(|a, b| (b.0.timestamp, b.1).cmp(&(a.0.timestamp, a.1)));
        commits.into_iter().map(|(c, _)| c.clone()).collect()
    }

    fn branch_model(&self, name: &str, tip: &str, is_remote: bool) -> Branch {
        let full_name = if is_remote {
            format!("refs/remotes/{name}")
        } else {
            format!("refs/heads/{name}")
        };
        Branch {
            name: name.to_string(),
            full_name,
            tip: tip.to_string(),
            is_remote,
            upstream: None,
            ahead: None,
            behind: None,
        }
    }

    fn all_branches(&self) -> Vec<Branch> {
        let local = self.branches.iter().map(|(n, t)| self.branch_model(n, t, false));
        let remote = self
            .remote_branches
            .iter()
            .map(|(n, t)| self.branch_model(n, t, true));
        local.chain(remote).collect()
    }

    fn tip_of(&self, name: &str) -> HistoryResult<&String> {
        self.branches
            .get(name)
            .or_else(|| self.remote_branches.get(name))
            .ok_or_else(|| HistoryError::NotFound(format!("branch {name}")))
    }

    fn commit(&self, id: &str) -> HistoryResult<&Commit> {
        self.commits
            .get(id)
            .map(|(c, _)| c)
            .ok_or_else(|| HistoryError::NotFound(format!("commit {id}")))
    }
}

/// Thread-safe in-memory history for any number of repositories.
#[derive(Default)]
pub struct MemoryHistory {
    repos: Mutex<HashMap<String, MemoryRepo>>,
    seq: Mutex<usize>,
    /// Commits handed out by `commits_for_branch`.
    loaded: AtomicUsize,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_repo(&self, repo: &str) {
        self.repos.lock().entry(repo.to_string()).or_default();
    }

    pub fn remove_repo(&self, repo: &str) {
        self.repos.lock().remove(repo);
    }

    fn with_repo<T>(&self, repo: &str, f: impl FnOnce(&mut MemoryRepo) -> T) -> T {
        let mut repos = self.repos.lock();
        f(repos.entry(repo.to_string()).or_default())
    }

    /// Append a commit on top of `branch` (creating the branch, as a root
    /// commit, if it does not exist). Returns the id.
    pub fn commit(&self, repo: &str, branch: &str, id: &str, timestamp: i64) -> String {
        self.commit_with_stats(repo, branch, id, timestamp, DiffStats::new(1, 0, 1))
    }

    pub fn commit_with_stats(
        &self,
        repo: &str,
        branch: &str,
        id: &str,
        timestamp: i64,
        stats: DiffStats,
    ) -> String {
        let seq = {
            let mut seq = self.seq.lock();
            *seq += 1;
            *seq
        };
        self.with_repo(repo, |r| {
            let parents = r.branches.get(branch).cloned().into_iter().collect();
            let commit = Commit {
                id: id.to_string(),
                short_id: id.chars().take(7).collect(),
                author_name: "Test User".into(),
                author_email: "test@example.com".into(),
                timestamp,
                message: format!("commit {id}"),
                parents,
                stats: Some(stats),
                branches: Default::default(),
            };
            r.commits.insert(id.to_string(), (commit, seq));
            r.branches.insert(branch.to_string(), id.to_string());
        });
        id.to_string()
    }

    /// Create `name` at the current tip of `from`.
    pub fn branch(&self, repo: &str, name: &str, from: &str) {
        self.with_repo(repo, |r| {
            if let Some(tip) = r.branches.get(from).cloned() {
                r.branches.insert(name.to_string(), tip);
            }
        });
    }

    /// Create (or move) `name` to point at a commit.
    pub fn branch_at(&self, repo: &str, name: &str, commit: &str) {
        self.with_repo(repo, |r| {
            r.branches.insert(name.to_string(), commit.to_string());
        });
    }

    /// Mirror a local branch as a remote-tracking branch.
    pub fn track_remote(&self, repo: &str, remote_name: &str, local: &str) {
        self.with_repo(repo, |r| {
            if let Some(tip) = r.branches.get(local).cloned() {
                r.remote_branches.insert(remote_name.to_string(), tip);
            }
        });
    }

    /// Simulate an upstream push: commit and flag the next fetch as changed.
    pub fn push(&self, repo: &str, branch: &str, id: &str, timestamp: i64) -> String {
        let id = self.commit(repo, branch, id, timestamp);
        self.with_repo(repo, |r| r.pending_fetch = true);
        id
    }

    pub fn set_default_branch(&self, repo: &str, branch: &str) {
        self.with_repo(repo, |r| r.default_branch = Some(branch.to_string()));
    }

    /// Every call against `repo` fails with `error` until cleared.
    pub fn fail_repo(&self, repo: &str, error: Option<HistoryError>) {
        self.with_repo(repo, |r| r.failure = error);
    }

    /// Only `fetch_updates` fails with `error` until cleared.
    pub fn fail_fetch(&self, repo: &str, error: Option<HistoryError>) {
        self.with_repo(repo, |r| r.fetch_failure = error);
    }

    /// `merge_base` fails whenever `commit` is one side of the pair.
    pub fn fail_merge_base_for(&self, repo: &str, commit: &str) {
        self.with_repo(repo, |r| {
            r.merge_base_failures.insert(commit.to_string());
        });
    }

    /// `diff_stats` fails for `commit`.
    pub fn fail_diff_stats(&self, repo: &str, commit: &str) {
        self.with_repo(repo, |r| {
            r.stats_failures.insert(commit.to_string());
        });
    }

    /// `lookup_commit` fails for `commit`.
    pub fn fail_lookup(&self, repo: &str, commit: &str) {
        self.with_repo(repo, |r| {
            r.lookup_failures.insert(commit.to_string());
        });
    }

    /// Every `diff_stats` call sleeps for `delay` first.
    pub fn delay_diff_stats(&self, repo: &str, delay: Duration) {
        self.with_repo(repo, |r| r.stats_delay = Some(delay));
    }

    /// Total commits returned by `commits_for_branch` so far.
    pub fn commits_loaded(&self) -> usize {
        self.loaded.load(Ordering::Relaxed)
    }

    /// Strip stored stats from a commit, as a provider that skips them would.
    pub fn clear_stats(&self, repo: &str, commit: &str) {
        self.with_repo(repo, |r| {
            if let Some((c, _)) = r.commits.get_mut(commit) {
                c.stats = None;
            }
        });
    }

    /// Run `f` against a known, non-failing repository.
    fn read<T>(&self, repo: &str, f: impl FnOnce(&mut MemoryRepo) -> HistoryResult<T>) -> HistoryResult<T> {
        let mut repos = self.repos.lock();
        let r = repos
            .get_mut(repo)
            .ok_or_else(|| HistoryError::NotFound(format!("repository {repo}")))?;
        if let Some(err) = &r.failure {
            return Err(err.clone());
        }
        f(r)
    }
}

#[async_trait]
impl HistoryProvider for MemoryHistory {
    async fn list_branches(&self, repo: &str, include_remote: bool) -> HistoryResult<Vec<Branch>> {
        self.read(repo, |r| {
            Ok(r.all_branches()
                .into_iter()
                .filter(|b| include_remote || !b.is_remote)
                .collect())
        })
    }

    async fn list_branches_matching(
        &self,
        repo: &str,
        patterns: &[String],
    ) -> HistoryResult<Vec<Branch>> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| HistoryError::InvalidArgument(format!("{pattern}: {e}")))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| HistoryError::InvalidArgument(e.to_string()))?;
        self.read(repo, |r| {
            Ok(r.all_branches()
                .into_iter()
                .filter(|b| set.is_match(&b.name))
                .collect())
        })
    }

    async fn get_branch(&self, repo: &str, name: &str) -> HistoryResult<Branch> {
        self.read(repo, |r| {
            if let Some(tip) = r.branches.get(name) {
                return Ok(r.branch_model(name, tip, false));
            }
            let tip = r.tip_of(name)?;
            Ok(r.branch_model(name, tip, true))
        })
    }

    async fn commits_for_branch(
        &self,
        repo: &str,
        name: &str,
        limit: Option<usize>,
    ) -> HistoryResult<Vec<Commit>> {
        self.read(repo, |r| {
            let tip = r.tip_of(name)?.clone();
            let mut commits = r.sorted_desc(r.ancestors(&tip));
            if let Some(limit) = limit {
                commits.truncate(limit);
            }
            self.loaded.fetch_add(commits.len(), Ordering::Relaxed);
            Ok(commits)
        })
    }

    async fn lookup_commit(&self, repo: &str, id: &str) -> HistoryResult<Commit> {
        self.read(repo, |r| {
            if r.lookup_failures.contains(id) {
                return Err(HistoryError::Transient(format!("lookup failed for {id}")));
            }
            r.commit(id).cloned()
        })
    }

    async fn commits_chronological(
        &self,
        repo: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> HistoryResult<Vec<Commit>> {
        self.read(repo, |r| {
            let mut membership: HashMap<String, Vec<String>> = HashMap::new();
            for (name, tip) in &r.branches {
                for id in r.ancestors(tip) {
                    membership.entry(id).or_default().push(name.clone());
                }
            }
            let mut commits = r.sorted_desc(membership.keys().cloned());
            commits.reverse();
            Ok(commits
                .into_iter()
                .filter(|c| start.is_none_or(|s| c.timestamp >= s))
                .filter(|c| end.is_none_or(|e| c.timestamp <= e))
                .map(|mut c| {
                    if let Some(names) = membership.remove(&c.id) {
                        c.branches = names.into_iter().collect();
                    }
                    c
                })
                .collect())
        })
    }

    async fn diff_stats(&self, repo: &str, id: &str) -> HistoryResult<DiffStats> {
        let delay = self.read(repo, |r| Ok(r.stats_delay))?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.read(repo, |r| {
            if r.stats_failures.contains(id) {
                return Err(HistoryError::Transient(format!("diff failed for {id}")));
            }
            Ok(r.commit(id)?.stats.unwrap_or_default())
        })
    }

    async fn merge_base(&self, repo: &str, a: &str, b: &str) -> HistoryResult<Option<String>> {
        self.read(repo, |r| {
            if r.merge_base_failures.contains(a) || r.merge_base_failures.contains(b) {
                return Err(HistoryError::Transient(format!("merge-base {a}..{b}")));
            }
            r.commit(a)?;
            r.commit(b)?;
            let left = r.ancestors(a);
            let common = r.ancestors(b).into_iter().filter(|id| left.contains(id));
            Ok(r.sorted_desc(common).into_iter().next().map(|c| c.id))
        })
    }

    async fn first_commit_after(
        &self,
        repo: &str,
        tip: &str,
        base: &str,
    ) -> HistoryResult<Option<String>> {
        self.read(repo, |r| {
            r.commit(tip)?;
            r.commit(base)?;
            let contained = r.ancestors(base);
            let own = r.ancestors(tip).into_iter().filter(|id| !contained.contains(id));
            Ok(r.sorted_desc(own).pop().map(|c| c.id))
        })
    }

    async fn divergence(&self, repo: &str, a: &str, b: &str) -> HistoryResult<(usize, usize)> {
        self.read(repo, |r| {
            r.commit(a)?;
            r.commit(b)?;
            let left = r.ancestors(a);
            let right = r.ancestors(b);
            Ok((left.difference(&right).count(), right.difference(&left).count()))
        })
    }

    async fn fetch_updates(&self, repo: &str) -> HistoryResult<bool> {
        self.read(repo, |r| {
            if let Some(err) = &r.fetch_failure {
                return Err(err.clone());
            }
            Ok(std::mem::take(&mut r.pending_fetch))
        })
    }

    async fn default_branch(&self, repo: &str) -> HistoryResult<String> {
        self.read(repo, |r| {
            if let Some(name) = &r.default_branch {
                return Ok(name.clone());
            }
            if r.branches.contains_key("main") {
                return Ok("main".into());
            }
            r.branches
                .keys()
                .next()
                .cloned()
                .ok_or_else(|| HistoryError::NotFound("no branches".into()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_linear_history() {
        let h = MemoryHistory::new();
        h.commit("r", "main", "a", 1);
        h.commit("r", "main", "b", 2);
        h.commit("r", "main", "c", 3);

        let ids: Vec<String> = h
            .commits_for_branch("r", "main", None)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        let chrono = h.commits_chronological("r", Some(2), None).await.unwrap();
        assert_eq!(chrono.len(), 2);
        assert_eq!(chrono[0].id, "b");
        assert!(chrono[0].on_branch("main"));
    }

    #[tokio::test]
    async fn test_merge_base_and_divergence() {
        let h = MemoryHistory::new();
        h.commit("r", "main", "a", 1);
        h.branch("r", "topic", "main");
        h.commit("r", "main", "b", 2);
        h.commit("r", "topic", "t", 3);

        assert_eq!(h.merge_base("r", "b", "t").await.unwrap().as_deref(), Some("a"));
        assert_eq!(h.divergence("r", "t", "b").await.unwrap(), (1, 1));
        assert_eq!(h.first_commit_after("r", "t", "a").await.unwrap().as_deref(), Some("t"));
        assert_eq!(h.first_commit_after("r", "a", "b").await.unwrap(), None);

        h.commit("r", "lonely", "z", 4);
        assert_eq!(h.merge_base("r", "b", "z").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fetch_flag_and_failures() {
        let h = MemoryHistory::new();
        h.commit("r", "main", "a", 1);
        assert!(!h.fetch_updates("r").await.unwrap());
        h.push("r", "main", "b", 2);
        assert!(h.fetch_updates("r").await.unwrap());
        assert!(!h.fetch_updates("r").await.unwrap());

        h.fail_repo("r", Some(HistoryError::Transient("down".into())));
        assert!(h.lookup_commit("r", "a").await.is_err());
        h.fail_repo("r", None);
        assert!(h.lookup_commit("r", "a").await.is_ok());

        assert!(h.lookup_commit("missing", "a").await.unwrap_err().is_not_found());
    }
}
