//! History provider backed by libgit2.
//!
//! Repositories are registered by id → path. All git2 operations run in
//! `tokio::task::spawn_blocking`; libgit2
//! does synchronous file I/O and locking.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use git2::{BranchType, Oid, Repository, Sort};
use globset::{Glob, GlobSetBuilder};

use rekishi_types::{Branch, Commit, DiffStats};

use crate::history::{HistoryError, HistoryProvider, HistoryResult, require_non_blank};

/// Thin wrapper around a git2 `Repository`.
pub struct GitRepo {
    repo: Mutex<Repository>,
    root: PathBuf,
}

impl GitRepo {
    /// Open an existing git repository at `path`.
    pub fn open(path: impl Into<PathBuf>) -> HistoryResult<Self> {
        let root: PathBuf = path.into();
        let repo = Repository::open(&root)?;
        Ok(Self {
            repo: Mutex::new(repo),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ========================================================================
    // Branches
    // ========================================================================

    pub fn list_branches(&self, include_remote: bool) -> HistoryResult<Vec<Branch>> {
        let repo = self.lock()?;
        let filter = if include_remote { None } else { Some(BranchType::Local) };

        let mut branches = Vec::new();
        for entry in repo.branches(filter)? {
            let (branch, kind) = entry?;
            if let Some(model) = branch_model(&repo, &branch, kind)? {
                branches.push(model);
            }
        }
        // Local first, then by name, independent of libgit2 iteration order
        branches.sort_by(|a, b| (a.is_remote, &a.name).cmp(&(b.is_remote, &b.name)));
        Ok(branches)
    }

    /// Find a branch by short name, preferring local over remote-tracking.
    pub fn find_branch(&self, name: &str) -> HistoryResult<Branch> {
        let repo = self.lock()?;
        for kind in [BranchType::Local, BranchType::Remote] {
            if let Ok(branch) = repo.find_branch(name, kind) {
                if let Some(model) = branch_model(&repo, &branch, kind)? {
                    return Ok(model);
                }
            }
        }
        Err(HistoryError::NotFound(format!("branch '{}'", name)))
    }

    /// HEAD's upstream if configured, else HEAD's branch.
    pub fn default_branch(&self) -> HistoryResult<String> {
        let repo = self.lock()?;
        let head = repo.head()?;
        if !head.is_branch() {
            return Err(HistoryError::InvalidArgument("HEAD is detached".into()));
        }
        let name = head
            .shorthand()
            .ok_or_else(|| HistoryError::InvalidArgument("HEAD name is not UTF-8".into()))?
            .to_string();
        let local = repo.find_branch(&name, BranchType::Local)?;
        match local.upstream() {
            Ok(upstream) => Ok(upstream.name()?.unwrap_or(name.as_str()).to_string()),
            Err(_) => Ok(name),
        }
    }

    // ========================================================================
    // Commits
    // ========================================================================

    /// Commits reachable from `tip`, tip-first.
    pub fn walk(&self, tip: &str, limit: Option<usize>) -> HistoryResult<Vec<Commit>> {
        let repo = self.lock()?;
        let oid = parse_oid(tip)?;

        let mut revwalk = repo.revwalk()?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
        revwalk.push(oid)?;

        let mut commits = Vec::new();
        for oid in revwalk {
            if limit.is_some_and(|n| commits.len() >= n) {
                break;
            }
            let commit = repo.find_commit(oid?)?;
            commits.push(commit_model(&commit, None));
        }
        Ok(commits)
    }

    pub fn lookup(&self, id: &str) -> HistoryResult<Commit> {
        let repo = self.lock()?;
        let commit = repo.find_commit(parse_oid(id)?)?;
        let stats = stats_for(&repo, &commit)?;
        Ok(commit_model(&commit, Some(stats)))
    }

    /// Every commit on a local branch, oldest-first, parents before children.
    pub fn chronological(&self, start: Option<i64>, end: Option<i64>) -> HistoryResult<Vec<Commit>> {
        let repo = self.lock()?;

        let mut tips: BTreeMap<String, Oid> = BTreeMap::new();
        for entry in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = entry?;
            if let (Some(name), Some(oid)) = (branch.name()?, branch.get().target()) {
                tips.insert(name.to_string(), oid);
            }
        }

        // Branch membership: which tips reach each commit
        let mut membership: HashMap<Oid, BTreeSet<String>> = HashMap::new();
        for (name, tip) in &tips {
            let mut revwalk = repo.revwalk()?;
            revwalk.push(*tip)?;
            for oid in revwalk {
                membership.entry(oid?).or_default().insert(name.clone());
            }
        }

        let mut revwalk = repo.revwalk()?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME | Sort::REVERSE)?;
        for tip in tips.values() {
            revwalk.push(*tip)?;
        }

        let mut commits = Vec::new();
        for oid in revwalk {
            let oid = oid?;
            let commit = repo.find_commit(oid)?;
            let time = commit.time().seconds();
            if start.is_some_and(|s| time < s) || end.is_some_and(|e| time > e) {
                continue;
            }
            let mut model = commit_model(&commit, None);
            model.branches = membership.remove(&oid).unwrap_or_default();
            commits.push(model);
        }
        Ok(commits)
    }

    pub fn diff_stats(&self, id: &str) -> HistoryResult<DiffStats> {
        let repo = self.lock()?;
        let commit = repo.find_commit(parse_oid(id)?)?;
        stats_for(&repo, &commit)
    }

    // ========================================================================
    // Graph primitives
    // ========================================================================

    pub fn merge_base(&self, a: &str, b: &str) -> HistoryResult<Option<String>> {
        let repo = self.lock()?;
        match repo.merge_base(parse_oid(a)?, parse_oid(b)?) {
            Ok(oid) => Ok(Some(oid.to_string())),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Last commit of the `base..tip` walk. Only ids are visited.
    pub fn first_after(&self, tip: &str, base: &str) -> HistoryResult<Option<String>> {
        let repo = self.lock()?;
        let mut revwalk = repo.revwalk()?;
        revwalk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
        revwalk.push(parse_oid(tip)?)?;
        revwalk.hide(parse_oid(base)?)?;

        let mut last = None;
        for oid in revwalk {
            last = Some(oid?);
        }
        Ok(last.map(|oid| oid.to_string()))
    }

    pub fn divergence(&self, a: &str, b: &str) -> HistoryResult<(usize, usize)> {
        let repo = self.lock()?;
        Ok(repo.graph_ahead_behind(parse_oid(a)?, parse_oid(b)?)?)
    }

    // ========================================================================
    // Remote
    // ========================================================================

    /// Fetch every configured remote. Returns whether any remote-tracking ref
    /// moved, appeared or disappeared.
    pub fn fetch(&self) -> HistoryResult<bool> {
        let repo = self.lock()?;
        let remotes = repo.remotes()?;
        if remotes.is_empty() {
            return Ok(false);
        }

        let before = remote_refs(&repo)?;
        for name in remotes.iter().flatten() {
            let mut remote = repo.find_remote(name)?;
            remote.fetch(&[] as &[&str], None, None)?;
        }
        let after = remote_refs(&repo)?;
        Ok(before != after)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn lock(&self) -> HistoryResult<std::sync::MutexGuard<'_, Repository>> {
        self.repo
            .lock()
            .map_err(|_| HistoryError::Transient("failed to acquire repository lock".into()))
    }
}

fn parse_oid(id: &str) -> HistoryResult<Oid> {
    Oid::from_str(id).map_err(|_| HistoryError::InvalidArgument(format!("bad commit id '{}'", id)))
}

fn branch_model(
    repo: &Repository,
    branch: &git2::Branch<'_>,
    kind: BranchType,
) -> HistoryResult<Option<Branch>> {
    let Some(name) = branch.name()? else {
        return Ok(None);
    };
    // origin/HEAD is a symbolic alias, not a branch
    if kind == BranchType::Remote && name.ends_with("/HEAD") {
        return Ok(None);
    }
    let reference = branch.get();
    let Some(tip) = reference.target() else {
        return Ok(None);
    };
    let full_name = reference.name().unwrap_or(name).to_string();

    let (upstream, ahead, behind) = match branch.upstream() {
        Ok(up) => {
            let up_name = up.name()?.map(str::to_string);
            match up.get().target() {
                Some(up_tip) => {
                    let (ahead, behind) = repo.graph_ahead_behind(tip, up_tip)?;
                    (up_name, Some(ahead), Some(behind))
                }
                None => (up_name, None, None),
            }
        }
        Err(_) => (None, None, None),
    };

    Ok(Some(Branch {
        name: name.to_string(),
        full_name,
        tip: tip.to_string(),
        is_remote: kind == BranchType::Remote,
        upstream,
        ahead,
        behind,
    }))
}

fn commit_model(commit: &git2::Commit<'_>, stats: Option<DiffStats>) -> Commit {
    let id = commit.id().to_string();
    let author = commit.author();
    Commit {
        short_id: id[..7].to_string(),
        id,
        author_name: author.name().unwrap_or("").to_string(),
        author_email: author.email().unwrap_or("").to_string(),
        timestamp: commit.time().seconds(),
        message: commit.message().unwrap_or("").to_string(),
        parents: commit.parent_ids().map(|p| p.to_string()).collect(),
        stats,
        branches: BTreeSet::new(),
    }
}

/// Stats against the first parent (or the empty tree for a root commit).
fn stats_for(repo: &Repository, commit: &git2::Commit<'_>) -> HistoryResult<DiffStats> {
    let tree = commit.tree()?;
    let parent_tree = match commit.parent(0) {
        Ok(parent) => Some(parent.tree()?),
        Err(_) => None,
    };
    let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
    let stats = diff.stats()?;
    Ok(DiffStats::new(
        stats.insertions() as u32,
        stats.deletions() as u32,
        stats.files_changed() as u32,
    ))
}

fn remote_refs(repo: &Repository) -> HistoryResult<BTreeMap<String, Oid>> {
    let mut refs = BTreeMap::new();
    for reference in repo.references_glob("refs/remotes/*")? {
        let reference = reference?;
        if let (Some(name), Some(oid)) = (reference.name(), reference.target()) {
            refs.insert(name.to_string(), oid);
        }
    }
    Ok(refs)
}

// ============================================================================
// GitHistory
// ============================================================================

/// [`HistoryProvider`] over registered on-disk repositories.
#[derive(Default)]
pub struct GitHistory {
    repos: DashMap<String, Arc<GitRepo>>,
}

impl GitHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repository under `id`. Re-registering replaces the path.
    pub fn register_repo(&self, id: &str, path: impl Into<PathBuf>) -> HistoryResult<()> {
        require_non_blank("repository id", id)?;
        let repo = GitRepo::open(path)?;
        tracing::info!(repo = %id, path = %repo.root().display(), "registered repository");
        self.repos.insert(id.to_string(), Arc::new(repo));
        Ok(())
    }

    fn repo(&self, id: &str) -> HistoryResult<Arc<GitRepo>> {
        require_non_blank("repository id", id)?;
        self.repos
            .get(id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| HistoryError::NotFound(format!("repository '{}'", id)))
    }

    /// Run `f` against a repository on the blocking pool.
    async fn blocking<T, F>(&self, id: &str, f: F) -> HistoryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&GitRepo) -> HistoryResult<T> + Send + 'static,
    {
        let repo = self.repo(id)?;
        tokio::task::spawn_blocking(move || f(&repo))
            .await
            .map_err(|e| HistoryError::Transient(format!("spawn_blocking: {}", e)))?
    }
}

#[async_trait]
impl HistoryProvider for GitHistory {
    async fn list_branches(&self, repo: &str, include_remote: bool) -> HistoryResult<Vec<Branch>> {
        self.blocking(repo, move |r| r.list_branches(include_remote)).await
    }

    async fn list_branches_matching(
        &self,
        repo: &str,
        patterns: &[String],
    ) -> HistoryResult<Vec<Branch>> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                HistoryError::InvalidArgument(format!("bad pattern '{}': {}", pattern, e))
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| HistoryError::InvalidArgument(e.to_string()))?;

        let branches = self.list_branches(repo, true).await?;
        Ok(branches.into_iter().filter(|b| set.is_match(&b.name)).collect())
    }

    async fn get_branch(&self, repo: &str, name: &str) -> HistoryResult<Branch> {
        require_non_blank("branch name", name)?;
        let name = name.to_string();
        self.blocking(repo, move |r| r.find_branch(&name)).await
    }

    async fn commits_for_branch(
        &self,
        repo: &str,
        name: &str,
        limit: Option<usize>,
    ) -> HistoryResult<Vec<Commit>> {
        let branch = self.get_branch(repo, name).await?;
        let name = branch.name.clone();
        self.blocking(repo, move |r| {
            let mut commits = r.walk(&branch.tip, limit)?;
            for commit in &mut commits {
                commit.branches.insert(name.clone());
            }
            Ok(commits)
        })
        .await
    }

    async fn lookup_commit(&self, repo: &str, id: &str) -> HistoryResult<Commit> {
        let id = id.to_string();
        self.blocking(repo, move |r| r.lookup(&id)).await
    }

    async fn commits_chronological(
        &self,
        repo: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> HistoryResult<Vec<Commit>> {
        self.blocking(repo, move |r| r.chronological(start, end)).await
    }

    async fn diff_stats(&self, repo: &str, id: &str) -> HistoryResult<DiffStats> {
        let id = id.to_string();
        self.blocking(repo, move |r| r.diff_stats(&id)).await
    }

    async fn merge_base(&self, repo: &str, a: &str, b: &str) -> HistoryResult<Option<String>> {
        let (a, b) = (a.to_string(), b.to_string());
        self.blocking(repo, move |r| r.merge_base(&a, &b)).await
    }

    async fn first_commit_after(
        &self,
        repo: &str,
        tip: &str,
        base: &str,
    ) -> HistoryResult<Option<String>> {
        let (tip, base) = (tip.to_string(), base.to_string());
        self.blocking(repo, move |r| r.first_after(&tip, &base)).await
    }

    async fn divergence(&self, repo: &str, a: &str, b: &str) -> HistoryResult<(usize, usize)> {
        let (a, b) = (a.to_string(), b.to_string());
        self.blocking(repo, move |r| r.divergence(&a, &b)).await
    }

    async fn fetch_updates(&self, repo: &str) -> HistoryResult<bool> {
        self.blocking(repo, |r| r.fetch()).await
    }

    async fn default_branch(&self, repo: &str) -> HistoryResult<String> {
        self.blocking(repo, |r| r.default_branch()).await
    }
}

// ============================================================================
// Tests
// ============================================================================
