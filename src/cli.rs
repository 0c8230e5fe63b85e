//! # Worker Command Line
//!
//! Launch contract for worker processes. Every flag has a `MAPWEAVE_*`
//! environment fallback so pools can be started by a process supervisor
//! without templating command lines.
//!
//! User binaries that register their own jobs parse [`WorkerArgs`] themselves
//! and pass their registry to [`run_worker`]:
//!
//! ```rust,no_run
//! use clap::Parser;
//! use mapweave::cli::{init_logging, run_worker, WorkerArgs};
//! use mapweave::Registry;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), mapweave::EngineError> {
//!   let args = WorkerArgs::parse();
//!   init_logging(&args.log_level);
//!   let mut registry = Registry::with_builtins();
//!   // registry.register_job(...);
//!   run_worker(args, registry).await.map(|_| ())
//! }
//! ```

use crate::config::{WorkerConfig, DEFAULT_PRODUCER_PORT};
use crate::error::EngineError;
use crate::registry::Registry;
use crate::worker::{Worker, WorkerReport};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Worker process for mapweave jobs.
///
/// Connects to a producer, registers for a job, serves the partition it is
/// assigned, and exits.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "mapweave-worker", version, about, long_about = None)]
pub struct WorkerArgs {
  /// Registered job definition to run
  #[arg(short = 'j', long, env = "MAPWEAVE_JOB")]
  pub job: String,

  /// Expected source kind; the assignment must name the same kind
  #[arg(short = 's', long, env = "MAPWEAVE_SOURCE")]
  pub source: Option<String>,

  /// Producer address
  #[arg(
    short = 'p',
    long,
    env = "MAPWEAVE_PRODUCER",
    default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PRODUCER_PORT))
  )]
  pub producer: SocketAddr,

  /// Expected worker-pool size; checked against the assignment
  #[arg(short = 'w', long, env = "MAPWEAVE_WORKERS", value_parser = parse_positive_usize)]
  pub workers: Option<usize>,

  /// This worker's ordinal within the pool (diagnostic only)
  #[arg(long, env = "MAPWEAVE_ORDINAL")]
  pub ordinal: Option<usize>,

  /// Worker identifier (random when omitted)
  #[arg(long, env = "MAPWEAVE_WORKER_ID")]
  pub worker_id: Option<String>,

  /// Heartbeat interval in milliseconds
  #[arg(long, env = "MAPWEAVE_HEARTBEAT_MS", default_value_t = 2000, value_parser = parse_positive_u64)]
  pub heartbeat_ms: u64,

  /// Connection retries while the producer is not yet listening
  #[arg(long, env = "MAPWEAVE_CONNECT_RETRIES", default_value_t = 20)]
  pub connect_retries: usize,

  /// Log filter, e.g. `info` or `mapweave=debug` (`RUST_LOG` takes precedence)
  #[arg(long, env = "MAPWEAVE_LOG", default_value = "info")]
  pub log_level: String,
}

impl WorkerArgs {
  /// Builds the worker configuration described by these arguments.
  #[must_use]
  pub fn to_config(&self) -> WorkerConfig {
    let mut config = WorkerConfig::new(self.producer, self.job.clone())
      .with_heartbeat_interval(Duration::from_millis(self.heartbeat_ms));
    config.retry = config.retry.with_max_retries(self.connect_retries);
    if let Some(worker_id) = &self.worker_id {
      config = config.with_worker_id(worker_id.clone());
    }
    if let Some(kind) = &self.source {
      config = config.with_source_kind(kind.clone());
    }
    if let Some(workers) = self.workers {
      config = config.with_pool_size(workers);
    }
    if let Some(ordinal) = self.ordinal {
      config = config.with_ordinal(ordinal);
    }
    config
  }
}

/// Installs a `tracing` subscriber writing to stderr.
///
/// `RUST_LOG` wins over `default_filter`. Calling this twice is harmless.
pub fn init_logging(default_filter: &str) {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(default_filter))
    .unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .try_init();
}

/// Runs one worker with `registry`.
///
/// # Errors
///
/// See [`Worker::run`].
pub async fn run_worker(args: WorkerArgs, registry: Registry) -> Result<WorkerReport, EngineError> {
  Worker::new(args.to_config(), Arc::new(registry)).run().await
}

fn parse_positive_usize(s: &str) -> Result<usize, String> {
  match s.parse::<usize>() {
    Ok(0) => Err("must be at least 1".to_string()),
    Ok(n) => Ok(n),
    Err(e) => Err(e.to_string()),
  }
}

fn parse_positive_u64(s: &str) -> Result<u64, String> {
  match s.parse::<u64>() {
    Ok(0) => Err("must be at least 1".to_string()),
    Ok(n) => Ok(n),
    Err(e) => Err(e.to_string()),
  }
}
