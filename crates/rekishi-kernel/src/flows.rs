//! FlowBus pub/sub system for replay and repository events.
//!
//! The FlowBus provides a typed publish/subscribe mechanism. Subscribers use
//! NATS-style subject patterns to filter events of interest, so a key (a
//! session or a repository) is just a subject prefix.
//!
//! # Subjects
//!
//! - `replay.<session-hex>.<event>`: one replay session
//! - `repo.<repo-token>.<event>`: one watched repository
//!
//! # Pattern Matching
//!
//! Patterns use dot-separated tokens with wildcards:
//! - `*` matches exactly one token: `replay.*.commit` matches every session's commits
//! - `>` matches one or more tokens (only at end): `replay.<id>.>` matches everything for a session
//! - Exact match: `repo.rekishi.commits` only matches that subject
//!
//! # Example
//!
//! ```ignore
//! let bus = FlowBus::<ReplayFlow>::new(1024);
//! let mut sub = bus.subscribe(&ReplayFlow::pattern_for(session_id));
//!
//! while let Ok(msg) = sub.recv().await {
//!     if msg.is_terminal() {
//!         break;
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use rekishi_types::{Commit, SessionId};

// ============================================================================
// Pattern Matching
// ============================================================================

/// Check if a subject matches a pattern.
///
/// Patterns use NATS-style wildcards:
/// - `*` matches exactly one token
/// - `>` matches one or more tokens (only at end)
pub fn matches_pattern(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_tokens.len() && si < subject_tokens.len() {
        match pattern_tokens[pi] {
            ">" => {
                // `>` must be at the end and matches one or more remaining tokens
                return pi == pattern_tokens.len() - 1 && si < subject_tokens.len();
            }
            "*" => {
                pi += 1;
                si += 1;
            }
            token => {
                if token != subject_tokens[si] {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
    }

    // Both must be exhausted for a match (unless pattern ends with `>`)
    pi == pattern_tokens.len() && si == subject_tokens.len()
}

/// Make an arbitrary key safe to use as one subject token.
///
/// Separators and wildcards become `_`. The payload always carries the real
/// key, so consumers can disambiguate the rare collision.
pub fn subject_token(key: &str) -> String {
    if key.is_empty() {
        return "_".to_string();
    }
    key.chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' => '_',
            c => c,
        })
        .collect()
}

// ============================================================================
// Flow Message Types
// ============================================================================

/// Trait for payloads that know their subject.
pub trait HasSubject {
    /// Get the subject string for this payload.
    fn subject(&self) -> String;

    /// Whether this payload ends the logical stream for its key.
    fn is_terminal(&self) -> bool {
        false
    }
}

/// A message published to the flow bus.
#[derive(Clone, Debug)]
pub struct FlowMessage<T> {
    /// The subject (derived from payload).
    pub subject: String,
    /// The payload data.
    pub payload: T,
    /// When this message was created.
    pub timestamp: Instant,
}

impl<T: HasSubject> FlowMessage<T> {
    /// Create a new flow message.
    pub fn new(payload: T) -> Self {
        let subject = payload.subject();
        Self {
            subject,
            payload,
            timestamp: Instant::now(),
        }
    }

    /// Whether the payload is a terminal event.
    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }
}

// ============================================================================
// Replay Flow Events
// ============================================================================

/// Events emitted by a replay session.
///
/// `Completed`, `Cancelled` and `Failed` are terminal: exactly one of them is
/// published per session and nothing follows it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReplayFlow {
    /// The run loop started.
    Started { session: SessionId, total: usize },

    /// One commit, in chronological order.
    Commit {
        session: SessionId,
        /// Zero-based position in the session.
        index: usize,
        total: usize,
        commit: Commit,
    },

    Paused { session: SessionId, index: usize },

    Resumed { session: SessionId, index: usize },

    SpeedChanged { session: SessionId, speed: f64 },

    /// Every commit was emitted.
    Completed { session: SessionId, emitted: usize },

    /// Stopped by a caller.
    Cancelled { session: SessionId, emitted: usize },

    /// Emission fault. Not retried.
    Failed { session: SessionId, error: String },
}

impl ReplayFlow {
    /// Short event name, the last subject token.
    pub fn event(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Commit { .. } => "commit",
            Self::Paused { .. } => "paused",
            Self::Resumed { .. } => "resumed",
            Self::SpeedChanged { .. } => "speed",
            Self::Completed { .. } => "completed",
            Self::Cancelled { .. } => "cancelled",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn session(&self) -> SessionId {
        match self {
            Self::Started { session, .. }
            | Self::Commit { session, .. }
            | Self::Paused { session, .. }
            | Self::Resumed { session, .. }
            | Self::SpeedChanged { session, .. }
            | Self::Completed { session, .. }
            | Self::Cancelled { session, .. }
            | Self::Failed { session, .. } => *session,
        }
    }

    /// The commit carried by a `Commit` event.
    pub fn commit(&self) -> Option<&Commit> {
        match self {
            Self::Commit { commit, .. } => Some(commit),
            _ => None,
        }
    }

    /// Pattern matching every event of one session.
    pub fn pattern_for(session: SessionId) -> String {
        format!("replay.{}.>", session.to_hex())
    }
}

impl HasSubject for ReplayFlow {
    fn subject(&self) -> String {
        format!("replay.{}.{}", self.session().to_hex(), self.event())
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Cancelled { .. } | Self::Failed { .. }
        )
    }
}

// ============================================================================
// Repository Flow Events
// ============================================================================

/// Events emitted by the change monitor for a watched repository.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RepoFlow {
    /// Commits that appeared since the last observation, tip-first.
    /// Reverse for chronological order.
    NewCommits {
        repo: String,
        branch: String,
        commits: Vec<Commit>,
    },

    /// First observation (or a reset after rewritten history) recorded a
    /// watermark without emitting history.
    Baseline {
        repo: String,
        branch: String,
        tip: String,
    },
}

impl RepoFlow {
    pub fn event(&self) -> &'static str {
        match self {
            Self::NewCommits { .. } => "commits",
            Self::Baseline { .. } => "baseline",
        }
    }

    pub fn repo(&self) -> &str {
        match self {
            Self::NewCommits { repo, .. } | Self::Baseline { repo, .. } => repo,
        }
    }

    /// Pattern matching every event of one repository.
    pub fn pattern_for(repo: &str) -> String {
        format!("repo.{}.>", subject_token(repo))
    }
}

impl HasSubject for RepoFlow {
    fn subject(&self) -> String {
        format!("repo.{}.{}", subject_token(self.repo()), self.event())
    }
}

// ============================================================================
// FlowBus
// ============================================================================

/// Type-parameterized pub/sub bus for a specific flow domain.
///
/// Uses a broadcast channel internally for multi-subscriber delivery: every
/// subscriber has its own cursor, sees messages in publish order, and only
/// sees messages published after it subscribed.
#[derive(Debug)]
pub struct FlowBus<T: Clone + Send + 'static> {
    tx: broadcast::Sender<FlowMessage<T>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> FlowBus<T> {
    /// Create a new flow bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone + Send + HasSubject + 'static> FlowBus<T> {
    /// Publish a payload to the bus.
    ///
    /// Returns the number of subscribers that received the message. Zero
    /// subscribers is not an error.
    pub fn publish(&self, payload: T) -> usize {
        let msg = FlowMessage::new(payload);
        self.tx.send(msg).unwrap_or(0)
    }

    /// Subscribe to messages matching a pattern.
    pub fn subscribe(&self, pattern: &str) -> Subscription<T> {
        Subscription {
            pattern: pattern.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone + Send + 'static> Clone for FlowBus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            capacity: self.capacity,
        }
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Why a subscription yielded no message.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum FlowRecvError {
    /// The subscriber fell behind and `0` messages were overwritten. The
    /// subscription resumes at the oldest message still buffered.
    #[error("subscriber lagged, {0} messages lost")]
    Lagged(u64),

    /// Every publisher is gone.
    #[error("flow bus closed")]
    Closed,

    /// Nothing buffered right now (`try_recv` only).
    #[error("no message available")]
    Empty,
}

/// A subscription to a FlowBus with pattern filtering.
pub struct Subscription<T: Clone> {
    pattern: String,
    rx: broadcast::Receiver<FlowMessage<T>>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Receive the next matching message, waiting if necessary.
    ///
    /// A lag is reported once as `Err(Lagged)`; the next call continues with
    /// the oldest message still buffered.
    pub async fn recv(&mut self) -> Result<FlowMessage<T>, FlowRecvError> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Ok(msg);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(FlowRecvError::Closed),
                Err(broadcast::error::RecvError::Lagged(n)) => return Err(self.lagged(n)),
            }
        }
    }

    /// Try to receive the next matching message without blocking.
    pub fn try_recv(&mut self) -> Result<FlowMessage<T>, FlowRecvError> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    if matches_pattern(&self.pattern, &msg.subject) {
                        return Ok(msg);
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return Err(FlowRecvError::Empty),
                Err(broadcast::error::TryRecvError::Closed) => return Err(FlowRecvError::Closed),
                Err(broadcast::error::TryRecvError::Lagged(n)) => return Err(self.lagged(n)),
            }
        }
    }

    fn lagged(&self, n: u64) -> FlowRecvError {
        tracing::warn!(
            pattern = %self.pattern,
            lagged = n,
            "Flow subscription lagged behind"
        );
        FlowRecvError::Lagged(n)
    }
}

impl<T: Clone + Send + HasSubject + 'static> Subscription<T> {
    /// Turn the subscription into a stream that ends after the first terminal
    /// payload (which is still yielded), after a lag (yielded as the error) or
    /// when the bus closes.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, FlowRecvError>> + Send {
        stream::unfold(Some(self), |state| async move {
            let mut sub = state?;
            match sub.recv().await {
                Ok(msg) => {
                    let next = if msg.is_terminal() { None } else { Some(sub) };
                    Some((Ok(msg.payload), next))
                }
                Err(FlowRecvError::Closed) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl<T: Clone> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Shared FlowBus Handle
// ============================================================================

/// Thread-safe handle to a RepoFlow bus.
pub type SharedRepoFlowBus = Arc<FlowBus<RepoFlow>>;

pub fn shared_repo_flow_bus(capacity: usize) -> SharedRepoFlowBus {
    Arc::new(FlowBus::new(capacity))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn commit(id: &str) -> Commit {
        Commit {
            id: id.into(),
            short_id: id.into(),
            author_name: "Test User".into(),
            author_email: "test@example.com".into(),
            timestamp: 0,
            message: id.into(),
            parents: vec![],
            stats: None,
            branches: Default::default(),
        }
    }

    #[test]
    fn test_pattern_matching_exact() {
        assert!(matches_pattern("repo.a.commits", "repo.a.commits"));
        assert!(!matches_pattern("repo.a.commits", "repo.a.baseline"));
        assert!(!matches_pattern("repo.a.commits", "repo.a.commits.extra"));
    }

    #[test]
    fn test_pattern_matching_wildcards() {
        assert!(matches_pattern("replay.*.commit", "replay.abc.commit"));
        assert!(!matches_pattern("replay.*.commit", "replay.abc.completed"));
        assert!(matches_pattern("replay.abc.>", "replay.abc.commit"));
        assert!(matches_pattern("replay.abc.>", "replay.abc.completed"));
        assert!(!matches_pattern("replay.abc.>", "replay.def.commit"));
        assert!(!matches_pattern("replay.abc.>", "replay.abc"));
    }

    #[test]
    fn test_subject_token_sanitizes() {
        assert_eq!(subject_token("my.repo"), "my_repo");
        assert_eq!(subject_token("a*b>c"), "a_b_c");
        assert_eq!(subject_token(""), "_");
        assert_eq!(subject_token("plain-name"), "plain-name");
    }

    #[test]
    fn test_replay_subjects() {
        let session = SessionId::new();
        let flow = ReplayFlow::Commit {
            session,
            index: 0,
            total: 1,
            commit: commit("c1"),
        };
        assert_eq!(flow.subject(), format!("replay.{}.commit", session.to_hex()));
        assert!(matches_pattern(&ReplayFlow::pattern_for(session), &flow.subject()));
        assert!(!flow.is_terminal());
        assert!(ReplayFlow::Completed { session, emitted: 1 }.is_terminal());
        assert!(ReplayFlow::Cancelled { session, emitted: 0 }.is_terminal());
        assert!(ReplayFlow::Failed { session, error: "x".into() }.is_terminal());
    }

    #[test]
    fn test_repo_subjects() {
        let flow = RepoFlow::NewCommits {
            repo: "my.repo".into(),
            branch: "main".into(),
            commits: vec![],
        };
        assert_eq!(flow.subject(), "repo.my_repo.commits");
        assert!(matches_pattern(&RepoFlow::pattern_for("my.repo"), &flow.subject()));
    }

    #[tokio::test]
    async fn test_subscriptions_are_keyed() {
        let bus: FlowBus<ReplayFlow> = FlowBus::new(16);
        let a = SessionId::new();
        let b = SessionId::new();
        let mut sub_a = bus.subscribe(&ReplayFlow::pattern_for(a));

        bus.publish(ReplayFlow::Started { session: b, total: 1 });
        bus.publish(ReplayFlow::Started { session: a, total: 2 });

        let msg = sub_a.try_recv().expect("should have message");
        assert_eq!(msg.payload, ReplayFlow::Started { session: a, total: 2 });
        assert_eq!(sub_a.try_recv().unwrap_err(), FlowRecvError::Empty);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_messages() {
        let bus = shared_repo_flow_bus(16);
        bus.publish(RepoFlow::Baseline {
            repo: "r".into(),
            branch: "main".into(),
            tip: "t1".into(),
        });

        let mut sub = bus.subscribe("repo.>");
        assert!(sub.try_recv().is_err());
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_into_stream_ends_after_terminal() {
        let bus: FlowBus<ReplayFlow> = FlowBus::new(16);
        let session = SessionId::new();
        let stream = bus.subscribe(&ReplayFlow::pattern_for(session)).into_stream();

        bus.publish(ReplayFlow::Commit {
            session,
            index: 0,
            total: 1,
            commit: commit("c1"),
        });
        bus.publish(ReplayFlow::Completed { session, emitted: 1 });
        bus.publish(ReplayFlow::Started { session, total: 9 });

        let events: Vec<ReplayFlow> = stream.map(Result::unwrap).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event(), "commit");
        assert_eq!(events[1].event(), "completed");
    }

    #[test]
    fn test_payloads_serialize_as_tagged_json() {
        let flow = RepoFlow::Baseline {
            repo: "r".into(),
            branch: "main".into(),
            tip: "t1".into(),
        };
        let json = serde_json::to_value(&flow).unwrap();
        assert_eq!(json["Baseline"]["tip"], "t1");
        let back: RepoFlow = serde_json::from_value(json).unwrap();
        assert_eq!(back, flow);
    }

    #[test]
    fn test_publish_without_subscribers_is_not_an_error() {
        let bus: FlowBus<ReplayFlow> = FlowBus::new(4);
        assert_eq!(bus.capacity(), 4);
        assert_eq!(
            bus.publish(ReplayFlow::Started { session: SessionId::new(), total: 0 }),
            0
        );
    }

    fn started(session: SessionId, total: usize) -> ReplayFlow {
        ReplayFlow::Started { session, total }
    }

    #[tokio::test]
    async fn test_lag_is_reported_then_resumes() {
        let bus: FlowBus<ReplayFlow> = FlowBus::new(2);
        let session = SessionId::new();
        let mut sub = bus.subscribe(&ReplayFlow::pattern_for(session));
        for total in 0..5 {
            bus.publish(started(session, total));
        }

        assert_eq!(sub.recv().await.unwrap_err(), FlowRecvError::Lagged(3));
        assert_eq!(sub.recv().await.unwrap().payload, started(session, 3));
        assert_eq!(sub.try_recv().unwrap().payload, started(session, 4));
        assert_eq!(sub.try_recv().unwrap_err(), FlowRecvError::Empty);
    }

    #[tokio::test]
    async fn test_into_stream_ends_with_lag_error() {
        let bus: FlowBus<ReplayFlow> = FlowBus::new(2);
        let session = SessionId::new();
        let stream = bus.subscribe(&ReplayFlow::pattern_for(session)).into_stream();
        for total in 0..4 {
            bus.publish(started(session, total));
        }
        drop(bus);

        let items: Vec<Result<ReplayFlow, FlowRecvError>> = stream.collect().await;
        assert_eq!(items, vec![Err(FlowRecvError::Lagged(2))]);
    }
}
