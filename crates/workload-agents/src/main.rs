use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use coordination::events::EventBus;
use coordination::git::GitRunner;
use coordination::ownership::{OwnershipVerdict, RepoOwnershipGuard};
use coordination::CoordinationError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use workload_agents::{
    AgentsConfig, BusTransport, InboundEvent, Listener, WorkloadManager, WorktreeController,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file (fields it omits fall back to TEAM_AGENT_* env vars)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the clone path
    #[arg(long, global = true)]
    clone: Option<PathBuf>,

    /// Override the environment tag
    #[arg(long, global = true)]
    env: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read inbound events as JSON lines on stdin, write workload events as
    /// JSON lines on stdout
    Serve,
    /// Validate repository ownership and print the verdict
    CheckOwnership {
        /// Validate the local copy without pulling first
        #[arg(long, default_value_t = false)]
        no_pull: bool,

        /// Report the current claim without validating or writing anything
        #[arg(long, default_value_t = false)]
        inspect: bool,
    },
    /// List worktrees registered in the clone
    Worktrees,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => AgentsConfig::from_file(path)?,
        None => AgentsConfig::default(),
    };
    if let Some(clone) = args.clone {
        config.clone_path = clone;
    }
    if let Some(env) = args.env {
        config.env = env;
    }
    config.validate()?;

    match args.command {
        Command::Serve => serve(config).await,
        Command::CheckOwnership { no_pull, inspect } => {
            check_ownership(config, !no_pull, inspect).await
        }
        Command::Worktrees => list_worktrees(config).await,
    }
}

async fn serve(config: AgentsConfig) -> Result<()> {
    let bus = EventBus::new().shared();
    let outbound = bus.subscribe();
    let agents = config.agents.clone();

    let manager = WorkloadManager::builder(config)
        .transport(Arc::new(BusTransport::new(Arc::clone(&bus))))
        .build()
        .await
        .context("Failed to start workload manager")?;

    let verdict = manager.refresh_ownership().await;
    info!(?verdict, "Initial ownership check");

    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel::<InboundEvent>(64);

    let writer = tokio::spawn(write_events(outbound, cancel.clone()));
    let listener = tokio::spawn(Listener::new(agents).run(manager.clone(), rx, cancel.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match serde_json::from_str::<InboundEvent>(&line) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed inbound event: {e}"),
                },
                None => break,
            },
        }
    }

    manager.shutdown().await;
    cancel.cancel();
    drop(tx);
    let _ = listener.await;
    let _ = writer.await;
    Ok(())
}

async fn write_events(
    mut events: broadcast::Receiver<coordination::WorkloadEvent>,
    cancel: CancellationToken,
) {
    let mut stdout = tokio::io::stdout();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(mut line) => {
                    line.push('\n');
                    if stdout.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                Err(e) => warn!("Failed to encode workload event: {e}"),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Event writer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn check_ownership(config: AgentsConfig, pull: bool, inspect: bool) -> Result<()> {
    let git = GitRunner::new()
        .with_timeout(config.git_timeout())
        .with_retry(config.retry_policy());
    let guard = RepoOwnershipGuard::new(config.identity(), &config.clone_path, git);

    if inspect {
        let claim = guard
            .inspect()
            .await
            .map_err(|e| anyhow!(e.with_suggestion()))?;
        println!("{}", serde_json::to_string_pretty(&claim)?);
        return Ok(());
    }

    let verdict = guard.check(pull).await;
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    if let OwnershipVerdict::Locked { reason } = verdict {
        eprintln!("{}", CoordinationError::locked(reason).with_suggestion());
        std::process::exit(2);
    }
    Ok(())
}

async fn list_worktrees(config: AgentsConfig) -> Result<()> {
    let git = GitRunner::new().with_timeout(config.git_timeout());
    let controller = WorktreeController::new(
        &config.clone_path,
        config.resolved_worktree_base(),
        git,
    );
    let worktrees = controller
        .list()
        .await
        .map_err(|e| anyhow!(e.with_suggestion()))?;
    for info in worktrees {
        println!(
            "{}\t{}\t{}",
            info.path.display(),
            info.branch.as_deref().unwrap_or("(detached)"),
            info.head.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
