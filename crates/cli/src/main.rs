//! Spoolman CLI - operator and maintenance commands for the spool.

mod runner;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spoolman_core::{Command, Grade, JobId, PeerName};
use spoolman_execution::{AdmissionController, XqtWorker};
use spoolman_storage::{is_pid_alive, LockOutcome, Spool, SpoolConfig, SpoolRequest};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::runner::ProcessRunner;

const DEFAULT_CONFIG: &str = "/etc/spoolman/spoolman.toml";

#[derive(Parser)]
#[command(name = "spoolman")]
#[command(about = "Store-and-forward spool, lock and job queue", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Spool directory, overriding the configuration
    #[arg(long, global = true)]
    spool: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a batch of transfers for a peer
    Submit {
        /// Destination peer
        peer: PeerName,
        /// Priority grade
        #[arg(long, default_value = "N")]
        grade: Grade,
        /// Submitting user (defaults to $USER)
        #[arg(long)]
        user: Option<String>,
        /// Send a local file: LOCAL:REMOTE
        #[arg(long = "send", value_name = "LOCAL:REMOTE")]
        sends: Vec<String>,
        /// Fetch a remote file: REMOTE:LOCAL
        #[arg(long = "receive", value_name = "REMOTE:LOCAL")]
        receives: Vec<String>,
        /// Copy sent files into the spool now instead of reading them at send time
        #[arg(long)]
        copy: bool,
    },
    /// List queued jobs
    Queue {
        /// Only this peer
        peer: Option<PeerName>,
    },
    /// Cancel a job
    Cancel {
        /// Job identifier
        id: JobId,
        /// Requesting user (defaults to $USER)
        #[arg(long)]
        user: Option<String>,
    },
    /// Reset a job's age
    Renew {
        /// Job identifier
        id: JobId,
        /// Requesting user (defaults to $USER)
        #[arg(long)]
        user: Option<String>,
    },
    /// Show last-contact status
    Status {
        /// Only this peer
        peer: Option<PeerName>,
    },
    /// Run queued execute requests once
    Xqt,
    /// Empty the execution working directory
    PurgeXqt,
    /// List held session locks
    Locks,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.spool)?;
    let spool = Spool::open(&config)
        .await
        .with_context(|| format!("opening spool {}", config.spool_dir.display()))?;

    match cli.command {
        Commands::Submit {
            peer,
            grade,
            user,
            sends,
            receives,
            copy,
        } => {
            let user = user.unwrap_or_else(current_user);
            let mut requests = Vec::new();
            for spec in &sends {
                let (local, remote) = split_pair(spec)?;
                let request = SpoolRequest::new(Command::send(local, remote, &user));
                requests.push(if copy { request.with_file(local) } else { request });
            }
            for spec in &receives {
                let (remote, local) = split_pair(spec)?;
                requests.push(SpoolRequest::new(Command::receive(remote, local, &user)));
            }
            let id = spool.writer().submit(&peer, grade, requests).await?;
            println!("{id}");
        }
        Commands::Queue { peer } => {
            let peers = match peer {
                Some(peer) => vec![peer],
                None => spool.layout().peers().await?,
            };
            let registry = spool.registry();
            for peer in peers {
                for job in registry.list(&peer).await? {
                    for (_, command) in &job.commands {
                        println!(
                            "{}  {}  {}  {:?}  {} -> {}",
                            job.id,
                            job.queued_at.format("%Y-%m-%d %H:%M:%S"),
                            job.submitter,
                            command.kind,
                            command.from,
                            command.to,
                        );
                    }
                }
            }
        }
        Commands::Cancel { id, user } => {
            let user = user.unwrap_or_else(current_user);
            let job = spool.registry().cancel(&id, &user, &spool.authorizer()).await?;
            println!("cancelled {} ({} commands)", job.id, job.commands.len());
        }
        Commands::Renew { id, user } => {
            let user = user.unwrap_or_else(current_user);
            let at = spool.registry().renew(&id, &user, &spool.authorizer()).await?;
            println!("renewed {id} at {}", at.format("%Y-%m-%d %H:%M:%S"));
        }
        Commands::Status { peer } => {
            let ledger = spool.status();
            let records = match peer {
                Some(peer) => match ledger.read(&peer).await? {
                    Some(status) => vec![(peer, status)],
                    None => {
                        println!("{peer}: never contacted");
                        Vec::new()
                    }
                },
                None => ledger.read_all().await?,
            };
            let now = chrono::Utc::now();
            for (peer, status) in records {
                let retry = &spool.config().retry;
                let due = if status.retry_due(retry, now) {
                    "due".to_string()
                } else {
                    match status.next_attempt(retry) {
                        Some(at) => format!("after {}", at.format("%Y-%m-%d %H:%M:%S")),
                        None => "retries exhausted".to_string(),
                    }
                };
                println!(
                    "{peer}: {} at {} ({} retries, {due})",
                    status.kind,
                    status.last.format("%Y-%m-%d %H:%M:%S"),
                    status.retries,
                );
            }
        }
        Commands::Xqt => {
            let admission = AdmissionController::new(spool.layout().clone(), config.max_xqts);
            let worker = XqtWorker::new(spool.layout().clone(), admission);
            let runner = ProcessRunner::new(config.allowed_commands.clone(), spool.layout().output_dir());
            let report = worker.run_once(&runner).await?;
            for (name, outcome) in &report.executed {
                println!("{name}: {outcome:?}");
            }
        }
        Commands::PurgeXqt => {
            let admission = AdmissionController::new(spool.layout().clone(), config.max_xqts);
            match admission.lock_directory().await? {
                LockOutcome::Acquired(lock) => {
                    let removed = lock.unlock_and_purge().await?;
                    info!(removed, "purged execution directory");
                }
                LockOutcome::Contended => info!("execution directory in use, not purging"),
            }
        }
        Commands::Locks => {
            for (peer, record) in spool.system_lock().held().await? {
                match record {
                    Some(record) => println!(
                        "{peer}: pid {} since {}{}",
                        record.pid,
                        record.acquired_at.format("%Y-%m-%d %H:%M:%S"),
                        if is_pid_alive(record.pid) { "" } else { " (stale)" },
                    ),
                    None => println!("{peer}: holder unknown"),
                }
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>, spool: Option<PathBuf>) -> Result<SpoolConfig> {
    let mut config = match path {
        Some(path) => SpoolConfig::from_file(path)?,
        None if std::path::Path::new(DEFAULT_CONFIG).exists() => {
            SpoolConfig::from_file(std::path::Path::new(DEFAULT_CONFIG))?
        }
        None => SpoolConfig::default(),
    };
    if let Some(spool) = spool {
        config.spool_dir = spool;
    }
    Ok(config)
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

fn split_pair(spec: &str) -> Result<(&str, &str)> {
    spec.split_once(':')
        .filter(|(a, b)| !a.is_empty() && !b.is_empty())
        .with_context(|| format!("expected FROM:TO, got {spec:?}"))
}
