//! Tests for worker argument parsing.

use crate::cli::WorkerArgs;
use clap::Parser;
use std::time::Duration;

#[test]
fn test_worker_args_defaults() {
  let args = WorkerArgs::try_parse_from(["mapweave-worker", "--job", "square_sum"]).unwrap();
  assert_eq!(args.job, "square_sum");
  assert_eq!(args.producer.to_string(), "127.0.0.1:7070");
  assert_eq!(args.heartbeat_ms, 2000);
  assert_eq!(args.connect_retries, 20);
  assert!(args.source.is_none());
  assert!(args.workers.is_none());
}

#[test]
fn test_worker_args_to_config() {
  let args = WorkerArgs::try_parse_from([
    "mapweave-worker",
    "-j",
    "collect",
    "-s",
    "jsonl",
    "-p",
    "10.0.0.5:9000",
    "-w",
    "4",
    "--ordinal",
    "2",
    "--worker-id",
    "w-2",
    "--heartbeat-ms",
    "250",
    "--connect-retries",
    "3",
  ])
  .unwrap();

  let config = args.to_config();
  assert_eq!(config.job, "collect");
  assert_eq!(config.worker_id, "w-2");
  assert_eq!(config.producer_address.to_string(), "10.0.0.5:9000");
  assert_eq!(config.source_kind.as_deref(), Some("jsonl"));
  assert_eq!(config.pool_size, Some(4));
  assert_eq!(config.ordinal, Some(2));
  assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
  assert_eq!(config.retry.max_retries, 3);
}

#[test]
fn test_worker_args_random_worker_id() {
  let args = WorkerArgs::try_parse_from(["mapweave-worker", "--job", "count"]).unwrap();
  let a = args.to_config();
  let b = args.to_config();
  assert!(a.worker_id.starts_with("worker-"));
  assert_ne!(a.worker_id, b.worker_id);
}

#[test]
fn test_worker_args_require_job() {
  assert!(WorkerArgs::try_parse_from(["mapweave-worker"]).is_err());
}

#[test]
fn test_worker_args_reject_zero_pool() {
  let result = WorkerArgs::try_parse_from(["mapweave-worker", "--job", "count", "--workers", "0"]);
  assert!(result.is_err());
}
