//! Replay engine: chronological playback of a repository's history.
//!
//! Each session owns a snapshot of its commits, one producer task and its own
//! [`FlowBus`]. The bus holds every commit of the session plus control
//! events, so a slow subscriber is not overrun by its own session or by any
//! other. Any number of subscribers see the same order.
//!
//! ```text
//! Idle ──play──▶ Playing ◀──resume── Paused
//!                  │    ──pause──▶
//!                  ├──exhausted──▶ Completed
//!                  └──stop/fault─▶ Cancelled
//! ```
//!
//! Every state transition and every emission happens under the session lock,
//! so the first terminal transition wins and nothing is published after it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use rekishi_types::{Commit, ReplayOptions, ReplaySession, ReplayState, SessionId, now_millis};

use crate::flows::{FlowBus, ReplayFlow, Subscription};
use crate::history::{HistoryError, HistoryProvider};
use crate::store::Store;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    History(#[from] HistoryError),
}

pub type ReplayResult<T> = Result<T, ReplayError>;

/// Session map handed to the engine.
pub type SessionStore = Store<SessionId, Arc<ReplayHandle>>;

fn validate_speed(speed: f64) -> ReplayResult<()> {
    if speed.is_finite() && speed > 0.0 {
        Ok(())
    } else {
        Err(ReplayError::InvalidArgument(format!(
            "speed must be a finite number > 0, got {speed}"
        )))
    }
}

/// Bus slots beyond the commit count, for `Started`, pause/resume, speed
/// changes and the terminal event.
const CONTROL_HEADROOM: usize = 64;

/// Buffer size for a session of `total` commits, never below `floor`.
fn session_capacity(floor: usize, total: usize) -> usize {
    floor.max(total.saturating_add(CONTROL_HEADROOM))
}

/// Wait between two emissions at `speed` commits per second.
pub fn emission_delay(speed: f64) -> Duration {
    Duration::from_millis((1000.0 / speed).round() as u64)
}

/// Live state of one session.
pub struct ReplayHandle {
    session: Mutex<ReplaySession>,
    commits: Vec<Commit>,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
    bus: FlowBus<ReplayFlow>,
}

impl ReplayHandle {
    fn new(session: ReplaySession, commits: Vec<Commit>, floor: usize) -> Self {
        let bus = FlowBus::new(session_capacity(floor, commits.len()));
        Self {
            session: Mutex::new(session),
            commits,
            paused: watch::Sender::new(false),
            cancel: CancellationToken::new(),
            bus,
        }
    }

    pub fn snapshot(&self) -> ReplaySession {
        self.session.lock().clone()
    }

    fn delay(&self) -> Duration {
        emission_delay(self.session.lock().options.speed)
    }

    /// Move to a terminal state and publish `event`, unless another
    /// transition got there first.
    fn finish(
        &self,
        state: ReplayState,
        event: impl FnOnce(&ReplaySession) -> ReplayFlow,
    ) -> bool {
        let mut session = self.session.lock();
        if session.state.is_terminal() {
            return false;
        }
        session.state = state;
        session.completed_at = Some(now_millis());
        self.bus.publish(event(&session));
        drop(session);
        self.cancel.cancel();
        true
    }
}

/// Creates and controls replay sessions.
pub struct ReplayEngine {
    provider: Arc<dyn HistoryProvider>,
    /// Minimum per-session bus capacity.
    flow_capacity: usize,
    sessions: SessionStore,
}

impl ReplayEngine {
    pub fn new(
        provider: Arc<dyn HistoryProvider>,
        flow_capacity: usize,
        sessions: SessionStore,
    ) -> Self {
        Self {
            provider,
            flow_capacity,
            sessions,
        }
    }

    /// Resolve the commit list and register an `Idle` session.
    pub async fn create(&self, repo: &str, options: ReplayOptions) -> ReplayResult<ReplaySession> {
        if repo.trim().is_empty() {
            return Err(ReplayError::InvalidArgument("repository id must not be blank".into()));
        }
        validate_speed(options.speed)?;
        if let (Some(start), Some(end)) = (options.start_date, options.end_date) {
            if start > end {
                return Err(ReplayError::InvalidArgument(format!(
                    "start date {start} is after end date {end}"
                )));
            }
        }

        let mut commits = self
            .provider
            .commits_chronological(repo, options.start_date, options.end_date)
            .await?;
        if let Some(branch) = options.branch.as_deref().filter(|b| !b.trim().is_empty()) {
            commits.retain(|c| c.on_branch(branch));
        }

        let session = ReplaySession::new(repo, options, commits.len());
        tracing::info!(
            session = %session.id,
            repo = %repo,
            total = session.total,
            speed = session.options.speed,
            "replay session created"
        );
        let handle = ReplayHandle::new(session.clone(), commits, self.flow_capacity);
        self.sessions.insert(session.id, Arc::new(handle));
        Ok(session)
    }

    /// Start the producer for an `Idle` session. Any other state is a no-op.
    pub fn play(&self, id: SessionId) -> ReplayResult<ReplaySession> {
        let handle = self.handle(id)?;
        {
            let mut session = handle.session.lock();
            if session.state != ReplayState::Idle {
                return Ok(session.clone());
            }
            session.state = ReplayState::Playing;
            session.started_at = Some(now_millis());
            handle.bus.publish(ReplayFlow::Started {
                session: id,
                total: session.total,
            });
        }

        tokio::spawn(run_session(Arc::clone(&handle), Arc::clone(&self.provider)));
        Ok(handle.snapshot())
    }

    /// `create` followed by `play`.
    pub async fn start(&self, repo: &str, options: ReplayOptions) -> ReplayResult<ReplaySession> {
        let session = self.create(repo, options).await?;
        self.play(session.id)
    }

    pub fn pause(&self, id: SessionId) -> ReplayResult<ReplaySession> {
        let handle = self.handle(id)?;
        let mut session = handle.session.lock();
        if session.state == ReplayState::Playing {
            session.state = ReplayState::Paused;
            handle.paused.send_replace(true);
            handle.bus.publish(ReplayFlow::Paused {
                session: id,
                index: session.current_index,
            });
            tracing::debug!(session = %id, index = session.current_index, "replay paused");
        }
        Ok(session.clone())
    }

    pub fn resume(&self, id: SessionId) -> ReplayResult<ReplaySession> {
        let handle = self.handle(id)?;
        let mut session = handle.session.lock();
        if session.state == ReplayState::Paused {
            session.state = ReplayState::Playing;
            handle.paused.send_replace(false);
            handle.bus.publish(ReplayFlow::Resumed {
                session: id,
                index: session.current_index,
            });
            tracing::debug!(session = %id, index = session.current_index, "replay resumed");
        }
        Ok(session.clone())
    }

    /// Change the rate for subsequent waits. A wait already in progress keeps
    /// its original length.
    pub fn set_speed(&self, id: SessionId, speed: f64) -> ReplayResult<ReplaySession> {
        validate_speed(speed)?;
        let handle = self.handle(id)?;
        let mut session = handle.session.lock();
        if !session.state.is_terminal() {
            session.options.speed = speed;
            handle.bus.publish(ReplayFlow::SpeedChanged { session: id, speed });
        }
        Ok(session.clone())
    }

    /// Cancel a session. Unknown and already-finished sessions are fine.
    pub fn stop(&self, id: SessionId) -> Option<ReplaySession> {
        let handle = self.sessions.get(&id)?;
        let stopped = handle.finish(ReplayState::Cancelled, |s| ReplayFlow::Cancelled {
            session: id,
            emitted: s.current_index,
        });
        if stopped {
            tracing::info!(session = %id, "replay stopped");
        }
        Some(handle.snapshot())
    }

    pub fn status(&self, id: SessionId) -> ReplayResult<ReplaySession> {
        Ok(self.handle(id)?.snapshot())
    }

    /// Every known session, oldest first.
    pub fn list(&self) -> Vec<ReplaySession> {
        let mut sessions: Vec<ReplaySession> = self
            .sessions
            .entries()
            .into_iter()
            .map(|(_, h)| h.snapshot())
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Drop a finished session from the store.
    pub fn forget(&self, id: SessionId) -> ReplayResult<ReplaySession> {
        let handle = self.handle(id)?;
        let session = handle.snapshot();
        if !session.state.is_terminal() {
            return Err(ReplayError::InvalidArgument(format!(
                "session {id} is still {}",
                session.state
            )));
        }
        self.sessions.remove(&id);
        Ok(session)
    }

    /// Events of one session, from now on.
    pub fn subscribe(&self, id: SessionId) -> ReplayResult<Subscription<ReplayFlow>> {
        Ok(self.handle(id)?.bus.subscribe(&ReplayFlow::pattern_for(id)))
    }

    fn handle(&self, id: SessionId) -> ReplayResult<Arc<ReplayHandle>> {
        self.sessions.get(&id).ok_or(ReplayError::SessionNotFound(id))
    }
}

/// Block while paused. False when cancelled first.
async fn wait_while_paused(handle: &ReplayHandle) -> bool {
    let mut paused = handle.paused.subscribe();
    let resumed = async move { paused.wait_for(|p| !*p).await.is_ok() };
    tokio::select! {
        ok = resumed => ok,
        _ = handle.cancel.cancelled() => false,
    }
}

async fn with_stats(
    provider: &dyn HistoryProvider,
    repo: &str,
    commit: &Commit,
) -> Result<Commit, HistoryError> {
    if commit.stats.is_some() {
        return Ok(commit.clone());
    }
    let stats = provider.diff_stats(repo, &commit.id).await?;
    Ok(commit.clone().with_stats(stats))
}

async fn run_session(handle: Arc<ReplayHandle>, provider: Arc<dyn HistoryProvider>) {
    let (id, repo, enrich) = {
        let session = handle.session.lock();
        (session.id, session.repo.clone(), session.options.with_stats)
    };
    let total = handle.commits.len();

    for (index, commit) in handle.commits.iter().enumerate() {
        if !wait_while_paused(&handle).await {
            return;
        }

        let commit = if enrich {
            match with_stats(provider.as_ref(), &repo, commit).await {
                Ok(commit) => commit,
                Err(e) => {
                    tracing::warn!(session = %id, commit = %commit.id, error = %e, "replay emission failed");
                    handle.finish(ReplayState::Cancelled, |_| ReplayFlow::Failed {
                        session: id,
                        error: e.to_string(),
                    });
                    return;
                }
            }
        } else {
            commit.clone()
        };

        // A pause can land while stats are fetched; it must not be followed
        // by this commit until resumed.
        loop {
            {
                let mut session = handle.session.lock();
                if session.state.is_terminal() {
                    return;
                }
                if session.state != ReplayState::Paused {
                    handle.bus.publish(ReplayFlow::Commit {
                        session: id,
                        index,
                        total,
                        commit,
                    });
                    session.current_index = index + 1;
                    break;
                }
            }
            if !wait_while_paused(&handle).await {
                return;
            }
        }

        if index + 1 < total {
            let delay = handle.delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = handle.cancel.cancelled() => return,
            }
        }
    }

    if handle.finish(ReplayState::Completed, |s| ReplayFlow::Completed {
        session: id,
        emitted: s.current_index,
    }) {
        tracing::info!(session = %id, emitted = total, "replay completed");
    }
}
