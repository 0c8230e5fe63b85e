//! Sum of squares over a SQLite table.
//!
//! Fills `examples(id, value)` with `value = 0..rows`, runs the built-in
//! `square_sum` job over the `value` column and prints the answer.
//!
//! By default the workers run in this process. With `--external-workers`, start
//! them yourself from the same directory so they open the same database file:
//!
//! ```text
//! mapweave-worker --job square_sum --source sql --producer 127.0.0.1:7070 --workers 4
//! ```

use clap::Parser;
use mapweave::cli::init_logging;
use mapweave::job::builtin;
use mapweave::{CoordinatorConfig, Job, Producer, Registry, SqlConfig, Worker, WorkerConfig};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "squared_sum_sql", about = "Distributed sum of squares over SQLite")]
struct Args {
  /// Rows to insert
  #[arg(long, default_value_t = 100_000)]
  rows: i64,

  /// Number of workers
  #[arg(short = 'w', long, default_value_t = 4)]
  workers: usize,

  /// Address the producer listens on
  #[arg(long, default_value = "127.0.0.1:7070")]
  listen: SocketAddr,

  /// SQLite database file, created and removed by this example
  #[arg(long, default_value = "exampledb")]
  database: PathBuf,

  /// Do not start workers in-process
  #[arg(long)]
  external_workers: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
  let args = Args::parse();
  init_logging("info");

  let url = format!("sqlite://{}?mode=rwc", args.database.display());
  init_database(&url, args.rows)?;

  let source = SqlConfig::new(url, "examples", vec!["value".to_string()]).into_spec();
  let job = Job::new(Arc::new(builtin::square_sum()), args.workers, source)?;

  let local_workers = if args.external_workers {
    None
  } else {
    Some(spawn_local_workers(args.listen, args.workers))
  };

  let producer = Producer::new(
    CoordinatorConfig::default()
      .with_bind_address(args.listen)
      .with_registration_timeout(Duration::from_secs(120)),
  );
  let answer = producer.map(&job);

  if let Some(handle) = local_workers {
    if handle.join().is_err() {
      error!("Local worker thread panicked");
    }
  }
  remove_database(&args.database);

  println!("Answer: {}", answer?);
  Ok(())
}

fn init_database(url: &str, rows: i64) -> Result<(), sqlx::Error> {
  println!("Initialize database");
  let runtime = tokio::runtime::Runtime::new()?;
  runtime.block_on(async {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
      .max_connections(1)
      .connect(url)
      .await?;
    sqlx::query("CREATE TABLE IF NOT EXISTS examples (id INTEGER, value INTEGER, PRIMARY KEY(id))")
      .execute(&pool)
      .await?;

    let mut tx = pool.begin().await?;
    for i in 0..rows {
      sqlx::query("INSERT INTO examples (id, value) VALUES (?, ?)")
        .bind(i)
        .bind(i)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    pool.close().await;
    Ok::<_, sqlx::Error>(())
  })?;
  println!("Database initialized.");
  Ok(())
}

fn remove_database(path: &Path) {
  println!("Remove database");
  match std::fs::remove_file(path) {
    Ok(()) => println!("Database removed."),
    Err(e) => error!(path = %path.display(), error = %e, "Could not remove database"),
  }
}

/// Runs the worker pool on its own thread and runtime; the producer blocks
/// this one.
fn spawn_local_workers(producer: SocketAddr, workers: usize) -> std::thread::JoinHandle<()> {
  std::thread::spawn(move || {
    let runtime = match tokio::runtime::Runtime::new() {
      Ok(runtime) => runtime,
      Err(e) => {
        error!(error = %e, "Could not start worker runtime");
        return;
      }
    };
    runtime.block_on(async move {
      let registry = Arc::new(Registry::with_builtins());
      let mut handles = Vec::with_capacity(workers);
      for ordinal in 0..workers {
        let config = WorkerConfig::new(producer, builtin::SQUARE_SUM)
          .with_source_kind("sql")
          .with_pool_size(workers)
          .with_ordinal(ordinal);
        let worker = Worker::new(config, Arc::clone(&registry));
        handles.push(tokio::spawn(async move { worker.run().await }));
      }
      for handle in handles {
        match handle.await {
          Ok(Ok(report)) => info!(partition = %report.partition, records = report.records_read, "Worker done"),
          Ok(Err(e)) => error!(error = %e, "Worker failed"),
          Err(e) => error!(error = %e, "Worker task panicked"),
        }
      }
    });
  })
}
