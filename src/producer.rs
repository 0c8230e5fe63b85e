//! # Producer
//!
//! Entry point of a distributed job. The producer binds the coordinator,
//! waits for the worker pool, and returns the combined value.
//!
//! ```rust,no_run
//! use mapweave::{job::builtin, CoordinatorConfig, Job, Producer, RangePartitioner};
//! use std::sync::Arc;
//!
//! let job = Job::new(Arc::new(builtin::square_sum()), 4, RangePartitioner::spec(0, 1000))?;
//! let total = Producer::new(CoordinatorConfig::default()).map(&job)?;
//! println!("{total}");
//! # Ok::<(), mapweave::EngineError>(())
//! ```

use crate::config::CoordinatorConfig;
use crate::coordinator::Coordinator;
use crate::error::EngineError;
use crate::job::Job;
use crate::source::Record;
use crate::transport::ConnectionError;
use std::time::Instant;
use tracing::info;

/// Runs jobs against a pool of externally launched workers.
#[derive(Debug, Clone, Default)]
pub struct Producer {
  config: CoordinatorConfig,
}

impl Producer {
  /// Creates a producer with the given coordinator configuration.
  #[must_use]
  pub fn new(config: CoordinatorConfig) -> Self {
    Self { config }
  }

  /// Coordinator configuration used for each run.
  #[must_use]
  pub fn config(&self) -> &CoordinatorConfig {
    &self.config
  }

  /// Runs `job` on the current tokio runtime.
  ///
  /// # Errors
  ///
  /// Any [`EngineError`] raised while binding, coordinating, or combining.
  pub async fn map_async(&self, job: &Job) -> Result<Record, EngineError> {
    let started = Instant::now();
    let coordinator = Coordinator::bind(self.config.clone()).await?;
    info!(
      job = job.name(),
      workers = job.worker_count(),
      address = %coordinator.local_addr(),
      "Starting job"
    );
    let result = coordinator.run(job).await;
    if result.is_ok() {
      info!(job = job.name(), elapsed = ?started.elapsed(), "Job finished");
    }
    result
  }

  /// Runs `job` to completion, blocking the calling thread.
  ///
  /// Builds a dedicated multi-threaded runtime; must not be called from
  /// inside another tokio runtime (use [`map_async`](Self::map_async) there).
  ///
  /// # Errors
  ///
  /// See [`map_async`](Self::map_async).
  pub fn map(&self, job: &Job) -> Result<Record, EngineError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
      .enable_all()
      .build()
      .map_err(ConnectionError::Io)?;
    runtime.block_on(self.map_async(job))
  }
}
