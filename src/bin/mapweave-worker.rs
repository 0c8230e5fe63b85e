//! Generic mapweave worker: built-in jobs and source kinds only.

use clap::Parser;
use mapweave::cli::{init_logging, run_worker, WorkerArgs};
use mapweave::Registry;
use std::process::ExitCode;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
  let args = WorkerArgs::parse();
  init_logging(&args.log_level);

  match run_worker(args, Registry::with_builtins()).await {
    Ok(report) => {
      println!(
        "partition {}: {} records read, {} values sent",
        report.partition, report.records_read, report.values_sent
      );
      ExitCode::SUCCESS
    }
    Err(e) => {
      error!(kind = e.kind(), "{e}");
      ExitCode::FAILURE
    }
  }
}
