//! # Error Taxonomy
//!
//! Every caller-visible failure of a job is an [`EngineError`]. A job either
//! succeeds with a value or fails with exactly one of these kinds; partial
//! results are never surfaced.
//!
//! Lower layers keep their own error types ([`ProtocolError`],
//! [`ConnectionError`], [`SourceError`], [`JobError`]) and convert into
//! [`EngineError`] at the coordinator and worker boundaries.
//!
//! [`ProtocolError`]: crate::protocol::ProtocolError
//! [`ConnectionError`]: crate::transport::ConnectionError

use crate::protocol::ProtocolError;
use crate::transport::ConnectionError;
use std::time::Duration;

/// Error raised while opening or iterating a data source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
  /// Underlying file I/O failed.
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  /// The relational store rejected the connection or query.
  #[error("Database error: {0}")]
  Database(#[from] sqlx::Error),

  /// A record could not be decoded.
  #[error("Malformed record at position {position}: {message}")]
  Malformed {
    /// Position of the offending record within the source.
    position: u64,
    /// Decoder message.
    message: String,
  },
}

/// Error raised by user-supplied transform or combine functions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct JobError(pub String);

impl JobError {
  /// Creates a job error from any displayable message.
  pub fn new(message: impl Into<String>) -> Self {
    Self(message.into())
  }
}

/// Job-level error returned to the caller of `map` and by worker runtimes.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// Bad partition count, unknown job or source kind, malformed specification.
  #[error("Configuration error: {0}")]
  Configuration(String),

  /// Fewer than the requested number of workers registered in time.
  #[error("Registration timeout: {registered} of {expected} workers registered within {timeout:?}")]
  RegistrationTimeout {
    /// Workers registered when the timeout fired.
    registered: usize,
    /// Workers the job asked for.
    expected: usize,
    /// Configured registration timeout.
    timeout: Duration,
  },

  /// A worker stopped sending heartbeats or dropped its connection before reporting.
  #[error("Worker {worker_id} (partition {partition}) unresponsive: {reason}")]
  WorkerUnresponsive {
    /// Identifier the worker registered with.
    worker_id: String,
    /// Partition the worker was assigned.
    partition: usize,
    /// What was observed.
    reason: String,
  },

  /// A worker failed to open or iterate its data source.
  #[error("Partition {partition} read failed: {message}")]
  PartitionRead {
    /// Partition whose source failed.
    partition: usize,
    /// Worker-side error description.
    message: String,
  },

  /// The transform function failed on a worker.
  #[error("Transform failed on partition {partition}: {message}")]
  Transform {
    /// Partition being transformed.
    partition: usize,
    /// Worker-side error description.
    message: String,
  },

  /// The collected partitions do not match the job at combine time.
  #[error("Aggregation error: {0}")]
  Aggregation(String),

  /// The combine function failed.
  #[error("Combine failed: {0}")]
  Combine(#[source] JobError),

  /// The job did not finish within its overall deadline.
  #[error("Job timed out after {0:?}")]
  JobTimeout(Duration),

  /// The coordinator refused this worker's registration.
  #[error("Registration rejected: {0}")]
  Rejected(String),

  /// The coordinator aborted the job this worker belonged to.
  #[error("Job aborted by coordinator: {0}")]
  Aborted(String),

  /// Wire protocol violation.
  #[error("Protocol error: {0}")]
  Protocol(#[from] ProtocolError),

  /// Network failure.
  #[error("Transport error: {0}")]
  Transport(#[from] ConnectionError),
}

impl EngineError {
  /// Short, stable name of the error kind, used in logs.
  #[must_use]
  pub fn kind(&self) -> &'static str {
    match self {
      EngineError::Configuration(_) => "configuration",
      EngineError::RegistrationTimeout { .. } => "registration_timeout",
      EngineError::WorkerUnresponsive { .. } => "worker_unresponsive",
      EngineError::PartitionRead { .. } => "partition_read",
      EngineError::Transform { .. } => "transform",
      EngineError::Aggregation(_) => "aggregation",
      EngineError::Combine(_) => "combine",
      EngineError::JobTimeout(_) => "job_timeout",
      EngineError::Rejected(_) => "rejected",
      EngineError::Aborted(_) => "aborted",
      EngineError::Protocol(_) => "protocol",
      EngineError::Transport(_) => "transport",
    }
  }
}
