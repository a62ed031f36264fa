//! Replay session metadata.
//!
//! A `ReplaySession` is the observable state of one playback. Runtime
//! machinery (cancellation, pause signalling, current speed) lives in the
//! kernel; this is the snapshot callers see.

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::SessionId;

/// Lifecycle of a replay session.
///
/// `Idle → Playing → {Paused ⇄ Playing} → {Completed | Cancelled}`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum ReplayState {
    #[default]
    Idle,
    #[strum(serialize = "playing", serialize = "running")]
    Playing,
    Paused,
    #[strum(serialize = "completed", serialize = "done")]
    Completed,
    #[strum(serialize = "cancelled", serialize = "stopped")]
    Cancelled,
}

impl ReplayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayState::Idle => "idle",
            ReplayState::Playing => "playing",
            ReplayState::Paused => "paused",
            ReplayState::Completed => "completed",
            ReplayState::Cancelled => "cancelled",
        }
    }

    /// No further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplayState::Completed | ReplayState::Cancelled)
    }

    /// The run loop owns this session (playing or paused).
    pub fn is_active(&self) -> bool {
        matches!(self, ReplayState::Playing | ReplayState::Paused)
    }
}

impl std::fmt::Display for ReplayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Caller-supplied playback options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplayOptions {
    /// Commits per second. Must be finite and > 0.
    pub speed: f64,
    /// Only commits at or after this time (Unix seconds).
    pub start_date: Option<i64>,
    /// Only commits at or before this time (Unix seconds).
    pub end_date: Option<i64>,
    /// Only commits on this branch (case-insensitive exact match).
    pub branch: Option<String>,
    /// Look up diff stats for commits that arrive without them.
    #[serde(default)]
    pub with_stats: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            speed: 1.0,
            start_date: None,
            end_date: None,
            branch: None,
            with_stats: false,
        }
    }
}

impl ReplayOptions {
    pub fn with_speed(speed: f64) -> Self {
        Self {
            speed,
            ..Self::default()
        }
    }
}

/// Snapshot of a replay session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplaySession {
    pub id: SessionId,
    pub repo: String,
    pub state: ReplayState,
    pub options: ReplayOptions,
    /// Number of commits the session will emit.
    pub total: usize,
    /// Number of commits emitted so far.
    pub current_index: usize,
    /// When the run loop started (Unix millis).
    pub started_at: Option<u64>,
    /// When the session reached a terminal state (Unix millis).
    pub completed_at: Option<u64>,
}

impl ReplaySession {
    pub fn new(repo: impl Into<String>, options: ReplayOptions, total: usize) -> Self {
        Self {
            id: SessionId::new(),
            repo: repo.into(),
            state: ReplayState::Idle,
            options,
            total,
            current_index: 0,
            started_at: None,
            completed_at: None,
        }
    }

    /// Fraction of commits emitted, in `[0.0, 1.0]`.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return if self.state == ReplayState::Completed { 1.0 } else { 0.0 };
        }
        self.current_index as f64 / self.total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_state_flags() {
        assert!(ReplayState::Completed.is_terminal());
        assert!(ReplayState::Cancelled.is_terminal());
        assert!(!ReplayState::Paused.is_terminal());
        assert!(ReplayState::Paused.is_active());
        assert!(ReplayState::Playing.is_active());
        assert!(!ReplayState::Idle.is_active());
    }

    #[test]
    fn test_state_parse_aliases() {
        assert_eq!(ReplayState::from_str("DONE").unwrap(), ReplayState::Completed);
        assert_eq!(ReplayState::from_str("stopped").unwrap(), ReplayState::Cancelled);
        assert_eq!(ReplayState::from_str("running").unwrap(), ReplayState::Playing);
        assert!(ReplayState::from_str("rewinding").is_err());
    }

    #[test]
    fn test_new_session_is_idle() {
        let s = ReplaySession::new("repo", ReplayOptions::default(), 3);
        assert_eq!(s.state, ReplayState::Idle);
        assert_eq!(s.current_index, 0);
        assert!(s.started_at.is_none());
        assert!(s.completed_at.is_none());
        assert_eq!(s.progress(), 0.0);
    }

    #[test]
    fn test_progress() {
        let mut s = ReplaySession::new("repo", ReplayOptions::default(), 4);
        s.current_index = 1;
        assert!((s.progress() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_json_roundtrip() {
        let s = ReplaySession::new("repo", ReplayOptions::with_speed(2.5), 10);
        let json = serde_json::to_string(&s).unwrap();
        let parsed: ReplaySession = serde_json::from_str(&json).unwrap();
        assert_eq!(s, parsed);
        assert!(json.contains("\"state\":\"idle\""));
    }
}
