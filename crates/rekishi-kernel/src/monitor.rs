//! Change monitor: polls watched repositories and publishes new commits.
//!
//! Each watched repository follows one branch and keeps a watermark, the tip
//! id seen on the previous observation. An observation fetches, lists the
//! branch tip-first, and publishes everything above the watermark as one
//! `RepoFlow::NewCommits` batch.
//!
//! The first observation only records the watermark. So does an observation
//! whose watermark has vanished from the listing (rewritten history, or more
//! than `max_new_commits` arrivals); that one also logs a warning.
//!
//! The poll loop runs while at least one repository is watched. Repositories
//! are polled concurrently; a per-repository `tokio::sync::Mutex` keeps two
//! observations of the same repository from overlapping.

use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::MonitorConfig;
use crate::flows::{RepoFlow, SharedRepoFlowBus};
use crate::history::{HistoryError, HistoryProvider, HistoryResult, require_non_blank};
use crate::store::Store;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("repository not watched: {0}")]
    NotWatched(String),

    #[error(transparent)]
    History(#[from] HistoryError),
}

pub type MonitorResult<T> = Result<T, MonitorError>;

/// State for one watched repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEntry {
    pub repo: String,
    pub branch: String,
    /// Tip id at the previous observation.
    pub watermark: Option<String>,
}

/// Watch map handed to the monitor.
pub type WatchStore = Store<String, Arc<Mutex<WatchEntry>>>;

/// What one observation did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Fetch reported nothing new, or the tip equals the watermark.
    Unchanged,
    /// First observation: watermark recorded, nothing emitted.
    Baseline(String),
    /// This many commits were published.
    NewCommits(usize),
    /// Watermark not found in the listing; re-baselined at this tip.
    Reset(String),
}

struct Poller {
    provider: Arc<dyn HistoryProvider>,
    bus: SharedRepoFlowBus,
    config: MonitorConfig,
}

impl Poller {
    async fn observe(&self, entry: &Mutex<WatchEntry>) -> HistoryResult<PollOutcome> {
        let mut entry = entry.lock().await;

        let changed = self.provider.fetch_updates(&entry.repo).await?;
        if !changed && entry.watermark.is_some() {
            return Ok(PollOutcome::Unchanged);
        }

        let commits = self
            .provider
            .commits_for_branch(&entry.repo, &entry.branch, Some(self.config.max_new_commits))
            .await?;
        let Some(tip) = commits.first().map(|c| c.id.clone()) else {
            return Ok(PollOutcome::Unchanged);
        };

        let outcome = match entry.watermark.as_deref() {
            Some(mark) if mark == tip => return Ok(PollOutcome::Unchanged),
            None => PollOutcome::Baseline(tip.clone()),
            Some(mark) => match commits.iter().position(|c| c.id == mark) {
                Some(count) => {
                    let fresh = commits[..count].to_vec();
                    tracing::info!(
                        repo = %entry.repo,
                        branch = %entry.branch,
                        count,
                        tip = %tip,
                        "new commits"
                    );
                    self.bus.publish(RepoFlow::NewCommits {
                        repo: entry.repo.clone(),
                        branch: entry.branch.clone(),
                        commits: fresh,
                    });
                    PollOutcome::NewCommits(count)
                }
                None => {
                    tracing::warn!(
                        repo = %entry.repo,
                        branch = %entry.branch,
                        watermark = %mark,
                        scanned = commits.len(),
                        "watermark not in recent history, re-baselining"
                    );
                    PollOutcome::Reset(tip.clone())
                }
            },
        };

        if matches!(outcome, PollOutcome::Baseline(_) | PollOutcome::Reset(_)) {
            tracing::debug!(repo = %entry.repo, branch = %entry.branch, tip = %tip, "baseline");
            self.bus.publish(RepoFlow::Baseline {
                repo: entry.repo.clone(),
                branch: entry.branch.clone(),
                tip: tip.clone(),
            });
        }
        entry.watermark = Some(tip);
        Ok(outcome)
    }

    /// One pass over every watched repository. Faults stay per repository.
    async fn poll_all(&self, watches: &WatchStore) {
        let entries = watches.entries();
        let polls = entries.iter().map(|(repo, entry)| async move {
            (repo, self.observe(entry).await)
        });
        for (repo, result) in join_all(polls).await {
            if let Err(e) = result {
                tracing::warn!(repo = %repo, error = %e, "poll failed");
            }
        }
    }

    async fn run(self: Arc<Self>, watches: WatchStore, cancel: CancellationToken) {
        let period = self.config.poll_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.config.poll_interval_ms, "change monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.poll_all(&watches) => {}
            }
        }
        tracing::info!("change monitor stopped");
    }
}

/// Watches repositories for upstream commits.
pub struct ChangeMonitor {
    poller: Arc<Poller>,
    watches: WatchStore,
    task: parking_lot::Mutex<Option<CancellationToken>>,
}

impl ChangeMonitor {
    pub fn new(
        provider: Arc<dyn HistoryProvider>,
        bus: SharedRepoFlowBus,
        config: MonitorConfig,
        watches: WatchStore,
    ) -> Self {
        Self {
            poller: Arc::new(Poller {
                provider,
                bus,
                config,
            }),
            watches,
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Follow `branch` (default: the provider's default branch) in `repo`.
    /// The first observation runs immediately and only sets the baseline.
    pub async fn watch(&self, repo: &str, branch: Option<&str>) -> MonitorResult<WatchEntry> {
        require_non_blank("repository id", repo)?;
        let provider = &self.poller.provider;
        let branch = match branch {
            Some(name) => provider.get_branch(repo, name).await?.name,
            None => provider.default_branch(repo).await?,
        };

        if let Some(existing) = self.watches.get(&repo.to_string()) {
            let current = existing.lock().await.clone();
            if current.branch == branch {
                return Ok(current);
            }
        }

        let entry = Arc::new(Mutex::new(WatchEntry {
            repo: repo.to_string(),
            branch: branch.clone(),
            watermark: None,
        }));
        self.watches.insert(repo.to_string(), Arc::clone(&entry));
        tracing::info!(repo = %repo, branch = %branch, "watching repository");

        if let Err(e) = self.poller.observe(&entry).await {
            tracing::warn!(repo = %repo, error = %e, "initial observation failed");
        }
        self.ensure_running();
        let snapshot = entry.lock().await.clone();
        Ok(snapshot)
    }

    /// Stop watching; the watermark goes with the entry.
    pub fn unwatch(&self, repo: &str) -> MonitorResult<()> {
        if self.watches.remove(&repo.to_string()).is_none() {
            return Err(MonitorError::NotWatched(repo.to_string()));
        }
        tracing::info!(repo = %repo, "unwatched repository");
        self.stop_if_idle();
        Ok(())
    }

    /// Observe one repository now, outside the poll schedule.
    pub async fn poll_now(&self, repo: &str) -> MonitorResult<PollOutcome> {
        let entry = self
            .watches
            .get(&repo.to_string())
            .ok_or_else(|| MonitorError::NotWatched(repo.to_string()))?;
        Ok(self.poller.observe(&entry).await?)
    }

    pub async fn watermark(&self, repo: &str) -> Option<String> {
        let entry = self.watches.get(&repo.to_string())?;
        let watermark = entry.lock().await.watermark.clone();
        watermark
    }

    /// Watched repository ids, sorted.
    pub fn watched(&self) -> Vec<String> {
        let mut repos = self.watches.keys();
        repos.sort();
        repos
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Stop the poll loop. Watches are kept; the next `watch` restarts it.
    pub fn shutdown(&self) {
        if let Some(cancel) = self.task.lock().take() {
            cancel.cancel();
        }
    }

    fn ensure_running(&self) {
        let mut task = self.task.lock();
        if task.is_some() || self.watches.is_empty() {
            return;
        }
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&self.poller).run(self.watches.clone(), cancel.clone()));
        *task = Some(cancel);
    }

    fn stop_if_idle(&self) {
        let mut task = self.task.lock();
        if self.watches.is_empty() {
            if let Some(cancel) = task.take() {
                cancel.cancel();
            }
        }
    }
}

impl Drop for ChangeMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
