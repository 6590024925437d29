//! opguard command line.
//!
//! Operates on a file lock store shared by every process pointed at the same
//! directory.
//!
//! ```text
//! opguard status                          JSON snapshot (locks, circuits, pressure)
//! opguard locks list                      one line per lock record
//! opguard locks release KEY --holder ID   release on behalf of a holder
//! opguard exec --key KEY -- CMD ARGS...   run CMD while holding KEY
//! ```
//!
//! `exec` renews its lease while CMD runs and kills CMD if the lease is lost.
//! With `--retry` it retries deferred and failed attempts under the
//! `[retry]` config section.
//!
//! # Exit Codes
//! - 0: success
//! - 1: command failed or internal error
//! - 3: lock held by another process
//! - 75: deferred (circuit open or resource exhaustion)
//! - 130: interrupted

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use opguard::config::{load_config, GuardConfig};
use opguard::error::{Classify, FailureKind, GuardError};
use opguard::lifecycle::{Cancellation, Shutdown};
use opguard::locks::{FileLockStore, LockRequest};
use opguard::observability::{logging, metrics};
use opguard::resilience::{retry, RetryError, RetryPolicy};
use opguard::{OperationGuard, SystemClock};

const EXIT_FAILURE: u8 = 1;
const EXIT_LOCK_HELD: u8 = 3;
const EXIT_DEFERRED: u8 = 75;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "opguard")]
#[command(about = "Run side-effecting operations under a shared lease lock", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Lock store directory, overrides `locks.store_dir`
    #[arg(long, global = true)]
    store_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a JSON snapshot of locks, circuits and pressure
    Status,
    /// Inspect or release locks
    Locks {
        #[command(subcommand)]
        command: LockCommands,
    },
    /// Run a command while holding a lock
    Exec(ExecArgs),
}

#[derive(Subcommand)]
enum LockCommands {
    /// List every lock record
    List,
    /// Release a lock held by HOLDER
    Release {
        key: String,
        #[arg(long)]
        holder: String,
    },
}

#[derive(Args)]
struct ExecArgs {
    /// Lock key identifying the logical operation
    #[arg(long)]
    key: String,

    /// Lease TTL in seconds, defaults to `locks.default_ttl_secs`
    #[arg(long)]
    ttl: Option<u64>,

    /// Dependency name used for the circuit breaker
    #[arg(long, default_value = "default")]
    dependency: String,

    /// Operation type recorded with the lock, defaults to the command name
    #[arg(long)]
    operation: Option<String>,

    /// Subject recorded with the lock
    #[arg(long)]
    subject: Option<String>,

    /// Retry deferred and transient failures using the `[retry]` settings
    #[arg(long)]
    retry: bool,

    #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
    command: Vec<String>,
}

/// Failure of the external command run by `exec`.
#[derive(Debug, Error)]
enum CommandError {
    #[error("failed to start command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("command exited with {}", .0.map(|c| format!("status {c}")).unwrap_or_else(|| "a signal".to_string()))]
    Exited(Option<i32>),
}

impl Classify for CommandError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            CommandError::Spawn(e) => e.failure_kind(),
            CommandError::Exited(_) => FailureKind::Transient,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {e}");
                return ExitCode::from(EXIT_FAILURE);
            }
        },
        None => GuardConfig::default(),
    };
    if let Some(dir) = &cli.store_dir {
        config.locks.store_dir = dir.clone();
    }

    logging::init(&config.observability.log_level);

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    match run(cli.command, &config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(command: Commands, config: &GuardConfig) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let store = Arc::new(FileLockStore::from_config(&config.locks));
    let guard = OperationGuard::from_config(config, store, SystemClock::shared());

    match command {
        Commands::Status => {
            let snapshot = guard.snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Locks {
            command: LockCommands::List,
        } => {
            let locks = guard.locks().list().await?;
            if locks.is_empty() {
                println!("No locks in {}", config.locks.store_dir);
            }
            for status in locks {
                println!("{status}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Locks {
            command: LockCommands::Release { key, holder },
        } => {
            let cancel = Cancellation::after(Duration::from_secs(10));
            if guard.locks().release(&key, &holder, &cancel).await? {
                println!("Released {key}");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("{key} is not held by {holder}");
                Ok(ExitCode::from(EXIT_FAILURE))
            }
        }
        Commands::Exec(args) => exec(&guard, config, args).await,
    }
}

async fn exec(
    guard: &OperationGuard,
    config: &GuardConfig,
    args: ExecArgs,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let shutdown = Shutdown::new();
    let cancel = shutdown.token();
    // Pressure reported by failed attempts decays between retries.
    let decay = guard.monitor().spawn_decay_loop(shutdown.token());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, cancelling");
            shutdown.trigger();
        }
    });

    let program = args.command[0].clone();
    let mut request = LockRequest::new(&args.key, args.operation.unwrap_or_else(|| program.clone()));
    if let Some(subject) = args.subject {
        request = request.with_subject(subject);
    }
    let ttl = args
        .ttl
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.locks.default_ttl());

    let policy = if args.retry {
        RetryPolicy::from_config(&config.retry)
    } else {
        RetryPolicy::no_retry()
    };
    let command_args = &args.command[1..];
    let dependency = args.dependency.as_str();
    let result = retry(&policy, &cancel, |attempt| {
        if attempt > 1 {
            tracing::info!(attempt, lock_key = %request.lock_key, "Retrying command");
        }
        let request = request.clone();
        let cancel = cancel.clone();
        let program = program.clone();
        let command_args = command_args.to_vec();
        async move {
            guard
                .run_exclusive(&request, ttl, dependency, &cancel, || async {
                    let status = tokio::process::Command::new(&program)
                        .args(&command_args)
                        .kill_on_drop(true)
                        .status()
                        .await?;
                    if status.success() {
                        Ok::<(), CommandError>(())
                    } else {
                        Err(CommandError::Exited(status.code()))
                    }
                })
                .await
        }
    })
    .await;
    decay.abort();

    let err = match result {
        Ok(()) => return Ok(ExitCode::SUCCESS),
        Err(RetryError::Cancelled { .. }) => GuardError::Cancelled,
        Err(RetryError::Stopped(last)) => last,
        Err(RetryError::Exhausted { attempts, last }) => {
            if attempts > 1 {
                eprintln!("Gave up after {attempts} attempts");
            }
            last
        }
    };

    eprintln!("{err}");
    if let Some(message) = err.user_message() {
        eprintln!("{message}");
    }
    let code = match err {
        GuardError::LockHeld { .. } => ExitCode::from(EXIT_LOCK_HELD),
        GuardError::CircuitOpen { .. } | GuardError::ResourceExhausted { .. } => ExitCode::from(EXIT_DEFERRED),
        GuardError::Cancelled => ExitCode::from(EXIT_INTERRUPTED),
        GuardError::LeaseLost { .. } | GuardError::Store(_) | GuardError::Operation(_) => {
            ExitCode::from(EXIT_FAILURE)
        }
    };
    Ok(code)
}
