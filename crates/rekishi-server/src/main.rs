//! rekishi binary
//!
//! Condensed branch graphs, timed history replay and upstream watching for
//! local git repositories. Results go to stdout as JSON; logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! # Significant-commit graph of every local branch
//! rekishi overview ~/src/project
//! rekishi overview ~/src/project --branch 'feature/*' --branch main --remote
//!
//! # Replay history at 5 commits/s, one JSON event per line
//! rekishi replay ~/src/project --speed 5 --branch main --stats
//!
//! # Print upstream commits as they arrive
//! rekishi watch ~/src/a ~/src/b
//! ```

use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use rekishi_kernel::{
    ChangeMonitor, FlowRecvError, GitHistory, GraphBuilder, RekishiConfig, RepoFlow, ReplayEngine,
    Store, shared_repo_flow_bus,
};
use rekishi_types::ReplayOptions;

#[derive(Parser, Debug)]
#[command(name = "rekishi")]
#[command(about = "Explore, replay and watch git history")]
struct Args {
    /// RON config file (missing file = defaults)
    #[arg(long, global = true, default_value = "rekishi.ron")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the significant-commit graph as JSON
    Overview {
        path: PathBuf,

        /// Branch glob pattern, repeatable (default: every branch)
        #[arg(short, long = "branch")]
        branches: Vec<String>,

        /// Include remote-tracking branches
        #[arg(long)]
        remote: bool,
    },

    /// Replay commits oldest-first, one JSON event per line
    Replay {
        path: PathBuf,

        /// Commits per second (default from config)
        #[arg(long)]
        speed: Option<f64>,

        /// Only commits on this branch
        #[arg(long)]
        branch: Option<String>,

        /// Only commits at or after this time (Unix seconds)
        #[arg(long)]
        since: Option<i64>,

        /// Only commits at or before this time (Unix seconds)
        #[arg(long)]
        until: Option<i64>,

        /// Attach diff stats to every commit
        #[arg(long)]
        stats: bool,
    },

    /// Print new upstream commits until interrupted
    Watch {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Branch to follow (default: HEAD's upstream, else HEAD)
        #[arg(long)]
        branch: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = RekishiConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    match args.command {
        Command::Overview {
            path,
            branches,
            remote,
        } => overview(&config, &path, branches, remote).await,
        Command::Replay {
            path,
            speed,
            branch,
            since,
            until,
            stats,
        } => {
            let options = ReplayOptions {
                speed: speed.unwrap_or(config.replay.default_speed),
                start_date: since,
                end_date: until,
                branch,
                with_stats: stats,
            };
            replay(&config, &path, options).await
        }
        Command::Watch { paths, branch } => watch(&config, &paths, branch.as_deref()).await,
    }
}

/// Register `path` under its directory name.
fn register(history: &GitHistory, path: &Path) -> Result<String> {
    let root = path
        .canonicalize()
        .with_context(|| format!("resolving {}", path.display()))?;
    let id = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.display().to_string());
    history.register_repo(&id, &root)?;
    Ok(id)
}

async fn overview(
    config: &RekishiConfig,
    path: &Path,
    mut patterns: Vec<String>,
    include_remote: bool,
) -> Result<()> {
    let history = Arc::new(GitHistory::new());
    let repo = register(&history, path)?;
    if patterns.is_empty() {
        patterns.push("*".into());
    }

    let builder = GraphBuilder::new(history, config.graph.clone());
    let overview = builder
        .overview_matching(&repo, &patterns, include_remote)
        .await?;
    println!("{}", serde_json::to_string_pretty(&overview)?);
    Ok(())
}

async fn replay(config: &RekishiConfig, path: &Path, options: ReplayOptions) -> Result<()> {
    let history = Arc::new(GitHistory::new());
    let repo = register(&history, path)?;
    let engine = ReplayEngine::new(history, config.flow_capacity, Store::new());

    let session = engine.create(&repo, options).await?;
    let mut events = pin!(engine.subscribe(session.id)?.into_stream());
    engine.play(session.id)?;

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(event)) => println!("{}", serde_json::to_string(&event)?),
                Some(Err(e)) => {
                    engine.stop(session.id);
                    return Err(e).context("replay output fell behind");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(session = %session.id, "interrupted, stopping replay");
                engine.stop(session.id);
            }
        }
    }
    Ok(())
}

async fn watch(config: &RekishiConfig, paths: &[PathBuf], branch: Option<&str>) -> Result<()> {
    let history = Arc::new(GitHistory::new());
    let bus = shared_repo_flow_bus(config.flow_capacity);
    let monitor = ChangeMonitor::new(
        history.clone(),
        Arc::clone(&bus),
        config.monitor.clone(),
        Store::new(),
    );

    let mut sub = bus.subscribe("repo.>");
    for path in paths {
        let repo = register(&history, path)?;
        let entry = monitor.watch(&repo, branch).await?;
        tracing::info!(
            repo = %entry.repo,
            branch = %entry.branch,
            tip = entry.watermark.as_deref().unwrap_or("-"),
            "watching"
        );
    }

    loop {
        tokio::select! {
            msg = sub.recv() => match msg {
                Ok(msg) => {
                    if let RepoFlow::NewCommits { .. } = &msg.payload {
                        println!("{}", serde_json::to_string(&msg.payload)?);
                    }
                }
                Err(FlowRecvError::Lagged(n)) => {
                    tracing::warn!(lost = n, "watch output fell behind, some batches were skipped");
                }
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    monitor.shutdown();
    Ok(())
}
