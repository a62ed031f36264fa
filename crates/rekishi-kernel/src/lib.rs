//! # rekishi-kernel
//!
//! Git history exploration: condensed branch graphs, timed replay of commit
//! history, and polling for upstream changes.
//!
//! - [`GraphBuilder`] reduces a repository to its significant commits
//! - [`ReplayEngine`] plays commits back in chronological order at a set rate
//! - [`ChangeMonitor`] watches repositories and publishes new commits
//!
//! All three read repositories through [`HistoryProvider`] and publish on a
//! [`FlowBus`]. Session and watch state lives in injected [`Store`]s.

pub mod config;
pub mod flows;
pub mod git_history;
pub mod graph;
pub mod history;
pub mod monitor;
pub mod replay;
pub mod store;

#[cfg(any(test, feature = "test-mock"))]
pub mod testing;

pub use config::{ConfigError, GraphConfig, MonitorConfig, RekishiConfig, ReplayConfig};
pub use flows::{
    FlowBus, FlowMessage, FlowRecvError, HasSubject, RepoFlow, ReplayFlow, SharedRepoFlowBus,
    Subscription, matches_pattern, shared_repo_flow_bus, subject_token,
};
pub use git_history::{GitHistory, GitRepo};
pub use graph::{GraphBuilder, order_branches, select_anchor};
pub use history::{HistoryError, HistoryProvider, HistoryResult};
pub use monitor::{ChangeMonitor, MonitorError, MonitorResult, PollOutcome, WatchEntry, WatchStore};
pub use replay::{ReplayEngine, ReplayError, ReplayHandle, ReplayResult, SessionStore};
pub use store::Store;
