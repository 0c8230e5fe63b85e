//! # Jobs
//!
//! A [`JobDefinition`] names a transform and a combine function. A [`Job`]
//! binds a definition to a worker count and a source specification for one
//! run.
//!
//! The transform runs on workers, once per record, and may emit any number of
//! values. It must not rely on shared mutable state because partitions are
//! transformed concurrently in separate processes. The combine runs exactly
//! once, on the coordinator, over the concatenation of every partition's
//! output in ascending partition order.

use crate::error::{EngineError, JobError};
use crate::source::{Record, SourceSpec};
use std::fmt;
use std::sync::Arc;

/// Per-record transform: one record in, zero or more values out.
pub type TransformFn = Arc<dyn Fn(Record) -> Result<Vec<Record>, JobError> + Send + Sync>;

/// Cross-record combine over the ordered concatenation of all partitions.
pub type CombineFn = Arc<dyn Fn(Vec<Record>) -> Result<Record, JobError> + Send + Sync>;

/// Named pair of transform and combine functions.
#[derive(Clone)]
pub struct JobDefinition {
  name: String,
  transform: TransformFn,
  combine: CombineFn,
}

impl JobDefinition {
  /// Creates a job definition.
  pub fn new<T, C>(name: impl Into<String>, transform: T, combine: C) -> Self
  where
    T: Fn(Record) -> Result<Vec<Record>, JobError> + Send + Sync + 'static,
    C: Fn(Vec<Record>) -> Result<Record, JobError> + Send + Sync + 'static,
  {
    Self {
      name: name.into(),
      transform: Arc::new(transform),
      combine: Arc::new(combine),
    }
  }

  /// Name used to look the definition up on workers.
  #[must_use]
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Applies the transform to one record.
  ///
  /// # Errors
  ///
  /// Propagates the transform's own error.
  pub fn transform(&self, record: Record) -> Result<Vec<Record>, JobError> {
    (self.transform)(record)
  }

  /// Applies the combine to the ordered partition outputs.
  ///
  /// # Errors
  ///
  /// Propagates the combine's own error.
  pub fn combine(&self, values: Vec<Record>) -> Result<Record, JobError> {
    (self.combine)(values)
  }
}

impl fmt::Debug for JobDefinition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobDefinition")
      .field("name", &self.name)
      .finish_non_exhaustive()
  }
}

/// One immutable run of a job definition.
#[derive(Debug, Clone)]
pub struct Job {
  definition: Arc<JobDefinition>,
  worker_count: usize,
  source: SourceSpec,
}

impl Job {
  /// Creates a job.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::Configuration`] when `worker_count == 0`.
  pub fn new(
    definition: Arc<JobDefinition>,
    worker_count: usize,
    source: SourceSpec,
  ) -> Result<Self, EngineError> {
    if worker_count == 0 {
      return Err(EngineError::Configuration(
        "worker count must be greater than zero".to_string(),
      ));
    }
    Ok(Self {
      definition,
      worker_count,
      source,
    })
  }

  /// The job definition.
  #[must_use]
  pub fn definition(&self) -> &JobDefinition {
    &self.definition
  }

  /// Name of the job definition.
  #[must_use]
  pub fn name(&self) -> &str {
    self.definition.name()
  }

  /// Number of workers, and therefore partitions.
  #[must_use]
  pub fn worker_count(&self) -> usize {
    self.worker_count
  }

  /// Source specification sent to every worker.
  #[must_use]
  pub fn source(&self) -> &SourceSpec {
    &self.source
  }
}

/// Job definitions that ship with the engine.
pub mod builtin {
  use super::JobDefinition;
  use crate::error::JobError;
  use crate::source::Record;
  use serde_json::Value;

  /// Name of [`square_sum`].
  pub const SQUARE_SUM: &str = "square_sum";
  /// Name of [`collect`].
  pub const COLLECT: &str = "collect";
  /// Name of [`count`].
  pub const COUNT: &str = "count";

  /// Squares every integer record and sums the squares.
  ///
  /// Sums use 128-bit integers and the result is emitted as a number when it
  /// fits in `i64`/`u64`, otherwise as a decimal string.
  #[must_use]
  pub fn square_sum() -> JobDefinition {
    JobDefinition::new(
      SQUARE_SUM,
      |record| {
        let value = as_integer(&record)?;
        let square = value
          .checked_mul(value)
          .ok_or_else(|| JobError::new(format!("square of {value} overflowed")))?;
        Ok(vec![i128_to_json(square)])
      },
      |values| {
        let mut total: i128 = 0;
        for value in &values {
          total = total
            .checked_add(as_integer(value)?)
            .ok_or_else(|| JobError::new("square sum overflowed"))?;
        }
        Ok(i128_to_json(total))
      },
    )
  }

  /// Emits every record unchanged and combines them into one array.
  #[must_use]
  pub fn collect() -> JobDefinition {
    JobDefinition::new(
      COLLECT,
      |record| Ok(vec![record]),
      |values| Ok(Value::Array(values)),
    )
  }

  /// Counts records.
  #[must_use]
  pub fn count() -> JobDefinition {
    JobDefinition::new(
      COUNT,
      |_| Ok(vec![Value::from(1u64)]),
      |values| Ok(Value::from(values.len() as u64)),
    )
  }

  fn as_integer(record: &Record) -> Result<i128, JobError> {
    match record {
      Value::Number(n) => n
        .as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
        .ok_or_else(|| JobError::new(format!("expected an integer, got {n}"))),
      Value::String(s) => s
        .parse::<i128>()
        .map_err(|_| JobError::new(format!("expected an integer, got {s:?}"))),
      other => Err(JobError::new(format!("expected an integer, got {other}"))),
    }
  }

  fn i128_to_json(value: i128) -> Value {
    if let Ok(v) = i64::try_from(value) {
      Value::from(v)
    } else if let Ok(v) = u64::try_from(value) {
      Value::from(v)
    } else {
      Value::String(value.to_string())
    }
  }
}
