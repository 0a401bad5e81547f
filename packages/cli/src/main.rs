use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use krepis_jobs::{LockManager, OrderedLock, RecordingSink, ThreadHandle, VictimPolicy};
use tracing::info;

/// Krepis lock scenario runner
/// Drives real threads into lock cycles and shows how they are resolved
#[derive(Parser)]
#[command(name = "krepis-locks")]
#[command(about = "Krepis ordered lock scenarios", long_about = None)]
struct Cli {
    /// Victim selection when a cycle is found
    #[arg(long, value_enum, default_value_t = Policy::OtherThanRequester, global = true)]
    policy: Policy,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Policy {
    OtherThanRequester,
    Requester,
}

impl From<Policy> for VictimPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::OtherThanRequester => VictimPolicy::OtherThanRequester,
            Policy::Requester => VictimPolicy::Requester,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Two threads take two locks in opposite order
    Abba,
    /// N threads each hold one lock and want their neighbour's
    Ring {
        #[arg(short, long, default_value_t = 3)]
        threads: usize,
    },
    /// Victim holds its lock at a nesting depth that must survive suspension
    Reentrant {
        #[arg(short, long, default_value_t = 4)]
        depth: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let sink = Arc::new(RecordingSink::new());
    let manager = LockManager::builder()
        .victim_policy(cli.policy.into())
        .report_deadlocks(true)
        .diagnostic_sink(sink.clone())
        .build();

    let started = Instant::now();
    match cli.command {
        Commands::Abba => ring(&manager, 2, 1)?,
        Commands::Ring { threads } => {
            if threads < 2 {
                bail!("a ring needs at least 2 threads, got {}", threads);
            }
            ring(&manager, threads, 1)?
        }
        Commands::Reentrant { depth } => {
            if depth == 0 {
                bail!("depth must be at least 1");
            }
            ring(&manager, 2, depth)?
        }
    }

    for report in sink.deadlocks() {
        info!("{}", report);
    }
    info!(
        elapsed = ?started.elapsed(),
        deadlocks = sink.deadlocks().len(),
        clean = manager.is_empty(),
        "scenario finished"
    );

    if !manager.is_empty() {
        bail!("lock manager still tracks threads after the scenario");
    }
    Ok(())
}

/// Thread `i` takes lock `i` `depth` times, then lock `i + 1`
fn ring(manager: &LockManager, threads: usize, depth: u32) -> Result<()> {
    let locks: Vec<OrderedLock> = (0..threads).map(|_| manager.new_lock()).collect();
    let barrier = Arc::new(Barrier::new(threads));

    let workers: Vec<_> = (0..threads)
        .map(|i| {
            let own = locks[i].clone();
            let next = locks[(i + 1) % threads].clone();
            let barrier = barrier.clone();
            thread::Builder::new()
                .name(format!("ring-{}", i))
                .spawn(move || -> Result<()> {
                    let me = ThreadHandle::current();
                    for _ in 0..depth {
                        own.acquire(Duration::MAX)?;
                    }
                    barrier.wait();
                    info!(thread = %me, holds = %own.rule(), wants = %next.rule(), "blocking");

                    next.acquire(Duration::MAX)?;
                    if own.depth() != depth {
                        bail!("{} resumed {} at depth {}, expected {}", me, own.rule(), own.depth(), depth);
                    }
                    info!(thread = %me, "got both locks");

                    next.release()?;
                    for _ in 0..depth {
                        own.release()?;
                    }
                    Ok(())
                })
                .context("spawning ring worker")
        })
        .collect::<Result<_>>()?;

    for worker in workers {
        match worker.join() {
            Ok(result) => result?,
            Err(_) => bail!("ring worker panicked"),
        }
    }
    Ok(())
}
