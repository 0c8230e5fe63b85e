//! Full runs with real workers over loopback TCP.

mod common;

use common::{coordinator_config, worker_config};
use mapweave::job::builtin;
use mapweave::{
  Coordinator, CoordinatorConfig, EngineError, Job, JobDefinition, JsonLinesPartitioner, Producer,
  RangePartitioner, Record, Registry, SourceSpec, SqlConfig, Worker, WorkerConfig, WorkerReport,
};
use serde_json::json;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

fn spawn_workers(configs: Vec<WorkerConfig>) -> Vec<JoinHandle<Result<WorkerReport, EngineError>>> {
  let registry = Arc::new(Registry::with_builtins());
  configs
    .into_iter()
    .map(|config| {
      let worker = Worker::new(config, Arc::clone(&registry));
      tokio::spawn(async move { worker.run().await })
    })
    .collect()
}

async fn run_job(
  job: Job,
  config: CoordinatorConfig,
  worker: impl Fn(SocketAddr, usize) -> WorkerConfig,
) -> (Result<Record, EngineError>, Vec<Result<WorkerReport, EngineError>>) {
  let coordinator = Coordinator::bind(config).await.unwrap();
  let addr = coordinator.local_addr();
  let handles = spawn_workers(
    (0..job.worker_count())
      .map(|ordinal| worker(addr, ordinal))
      .collect(),
  );
  let result = coordinator.run(&job).await;
  let mut reports = Vec::new();
  for handle in handles {
    reports.push(handle.await.unwrap());
  }
  (result, reports)
}

fn square_sum_job(workers: usize, source: SourceSpec) -> Job {
  Job::new(Arc::new(builtin::square_sum()), workers, source).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_square_sum_is_independent_of_worker_count() {
  let m: i64 = 1000;
  let expected = json!(m * (m - 1) * (2 * m - 1) / 6);
  assert_eq!(expected, json!(332_833_500));

  for workers in [1usize, 2, 4, 7] {
    let job = square_sum_job(workers, RangePartitioner::spec(0, m));
    let (result, reports) = run_job(job, coordinator_config(), |addr, ordinal| {
      worker_config(addr, builtin::SQUARE_SUM)
        .with_ordinal(ordinal)
        .with_pool_size(workers)
    })
    .await;

    assert_eq!(result.unwrap(), expected, "workers = {workers}");

    let reports: Vec<WorkerReport> = reports.into_iter().map(Result::unwrap).collect();
    let mut partitions: Vec<usize> = reports.iter().map(|r| r.partition.index()).collect();
    partitions.sort_unstable();
    assert_eq!(partitions, (0..workers).collect::<Vec<_>>());
    let read: u64 = reports.iter().map(|r| r.records_read).sum();
    assert_eq!(read, m as u64);
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_collect_concatenates_in_partition_order() {
  let job = Job::new(Arc::new(builtin::collect()), 3, RangePartitioner::spec(0, 9)).unwrap();
  let (result, _) = run_job(job, coordinator_config(), |addr, _| {
    worker_config(addr, builtin::COLLECT)
  })
  .await;
  assert_eq!(result.unwrap(), json!([0, 3, 6, 1, 4, 7, 2, 5, 8]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sql_source_end_to_end() {
  let dir = tempfile::tempdir().unwrap();
  let url = format!("sqlite://{}?mode=rwc", dir.path().join("squares.db").display());
  let pool = sqlx::sqlite::SqlitePoolOptions::new()
    .max_connections(1)
    .connect(&url)
    .await
    .unwrap();
  sqlx::query("CREATE TABLE examples (id INTEGER PRIMARY KEY, value INTEGER)")
    .execute(&pool)
    .await
    .unwrap();
  for value in 0..100i64 {
    sqlx::query("INSERT INTO examples (value) VALUES (?)")
      .bind(value)
      .execute(&pool)
      .await
      .unwrap();
  }
  pool.close().await;

  let source = SqlConfig::new(url, "examples", vec!["value".to_string()]).into_spec();
  let job = square_sum_job(3, source);
  let (result, _) = run_job(job, coordinator_config(), |addr, _| {
    worker_config(addr, builtin::SQUARE_SUM).with_source_kind("sql")
  })
  .await;
  assert_eq!(result.unwrap(), json!(99 * 100 * 199 / 6));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_jsonl_count_end_to_end() {
  let mut file = tempfile::NamedTempFile::new().unwrap();
  for i in 0..25 {
    writeln!(file, "{}", json!({ "n": i })).unwrap();
  }
  file.flush().unwrap();

  let job = Job::new(
    Arc::new(builtin::count()),
    4,
    JsonLinesPartitioner::spec(file.path()),
  )
  .unwrap();
  let (result, _) = run_job(job, coordinator_config(), |addr, _| {
    worker_config(addr, builtin::COUNT)
  })
  .await;
  assert_eq!(result.unwrap(), json!(25));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_malformed_source_fails_with_partition_read() {
  let mut file = tempfile::NamedTempFile::new().unwrap();
  writeln!(file, "1\n2\n{{broken\n4").unwrap();
  file.flush().unwrap();

  let job = Job::new(
    Arc::new(builtin::collect()),
    2,
    JsonLinesPartitioner::spec(file.path()),
  )
  .unwrap();
  let (result, reports) = run_job(job, coordinator_config(), |addr, _| {
    worker_config(addr, builtin::COLLECT)
  })
  .await;

  assert!(matches!(
    result.unwrap_err(),
    EngineError::PartitionRead { partition: 0, .. }
  ));
  assert!(reports
    .iter()
    .any(|r| matches!(r, Err(EngineError::PartitionRead { partition: 0, .. }))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transform_failure_fails_job() {
  let mut file = tempfile::NamedTempFile::new().unwrap();
  writeln!(file, "{}", json!({ "not": "an integer" })).unwrap();
  file.flush().unwrap();

  let job = square_sum_job(1, JsonLinesPartitioner::spec(file.path()));
  let (result, reports) = run_job(job, coordinator_config(), |addr, _| {
    worker_config(addr, builtin::SQUARE_SUM)
  })
  .await;

  assert!(matches!(
    result.unwrap_err(),
    EngineError::Transform { partition: 0, .. }
  ));
  assert!(matches!(reports[0], Err(EngineError::Transform { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeats_outlast_a_slow_transform() {
  let heartbeat_timeout = Duration::from_millis(200);
  let definition = JobDefinition::new(
    "slow_count",
    |record| {
      std::thread::sleep(Duration::from_millis(20));
      Ok(vec![record])
    },
    |values| Ok(json!(values.len())),
  );
  let mut registry = Registry::with_builtins();
  let definition = registry.register_job(definition);
  let registry = Arc::new(registry);

  let config = coordinator_config().with_heartbeat_timeout(heartbeat_timeout);
  let coordinator = Coordinator::bind(config).await.unwrap();
  let addr = coordinator.local_addr();
  let job = Job::new(definition, 2, RangePartitioner::spec(0, 40)).unwrap();

  let handles: Vec<_> = (0..2)
    .map(|_| {
      let config = worker_config(addr, "slow_count").with_heartbeat_interval(Duration::from_millis(30));
      let worker = Worker::new(config, Arc::clone(&registry));
      tokio::spawn(async move { worker.run().await })
    })
    .collect();

  let started = Instant::now();
  let result = coordinator.run(&job).await;
  assert!(started.elapsed() > heartbeat_timeout * 2);
  assert_eq!(result.unwrap(), json!(40));
  for handle in handles {
    assert_eq!(handle.await.unwrap().unwrap().records_read, 20);
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pinned_source_kind_mismatch_is_configuration_error() {
  let job = square_sum_job(1, RangePartitioner::spec(0, 10));
  let (result, reports) = run_job(job, coordinator_config(), |addr, _| {
    worker_config(addr, builtin::SQUARE_SUM).with_source_kind("jsonl")
  })
  .await;

  assert!(matches!(result.unwrap_err(), EngineError::Configuration(_)));
  assert!(matches!(reports[0], Err(EngineError::Configuration(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_size_mismatch_is_configuration_error() {
  let job = square_sum_job(2, RangePartitioner::spec(0, 10));
  let (result, _) = run_job(job, coordinator_config(), |addr, _| {
    worker_config(addr, builtin::SQUARE_SUM).with_pool_size(3)
  })
  .await;
  assert!(matches!(result.unwrap_err(), EngineError::Configuration(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_for_another_job_is_rejected() {
  let config = coordinator_config().with_registration_timeout(Duration::from_millis(500));
  let coordinator = Coordinator::bind(config).await.unwrap();
  let addr = coordinator.local_addr();
  let job = square_sum_job(1, RangePartitioner::spec(0, 10));

  let handles = spawn_workers(vec![worker_config(addr, builtin::COUNT)]);
  let result = coordinator.run(&job).await;

  assert!(matches!(
    result.unwrap_err(),
    EngineError::RegistrationTimeout { registered: 0, .. }
  ));
  for handle in handles {
    assert!(matches!(handle.await.unwrap(), Err(EngineError::Rejected(_))));
  }
}

#[tokio::test]
async fn test_unknown_job_fails_before_connecting() {
  let config = WorkerConfig::new(SocketAddr::from(([127, 0, 0, 1], 9)), "no_such_job");
  let err = Worker::new(config, Arc::new(Registry::with_builtins()))
    .run()
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::Configuration(_)));
  assert!(err.to_string().contains("no_such_job"));
}

#[test]
fn test_blocking_map() {
  let port = std::net::TcpListener::bind("127.0.0.1:0")
    .unwrap()
    .local_addr()
    .unwrap()
    .port();
  let addr = SocketAddr::from(([127, 0, 0, 1], port));

  let workers = std::thread::spawn(move || {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async move {
      let handles = spawn_workers(
        (0..2)
          .map(|_| worker_config(addr, builtin::SQUARE_SUM))
          .collect(),
      );
      for handle in handles {
        handle.await.unwrap().unwrap();
      }
    });
  });

  let producer = Producer::new(coordinator_config().with_bind_address(addr));
  let job = square_sum_job(2, RangePartitioner::spec(1, 11));
  assert_eq!(producer.map(&job).unwrap(), json!(385));
  workers.join().unwrap();
}
