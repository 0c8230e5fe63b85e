//! # Data Sources
//!
//! A [`DataSource`] is a lazy, finite, forward-only view over one partition of
//! some external data. A [`DataSourcePartitioner`] turns an opaque
//! [`SourceSpec`] plus a [`Partition`] into that view.
//!
//! Every worker builds its own source from the specification it receives in
//! its assignment, so partitioners must be pure functions of
//! `(spec, partition)`. Resources named by a specification (file paths,
//! `localhost` endpoints, SQLite files) are resolved on the worker's host.
//!
//! ## Built-in kinds
//!
//! | kind    | config                                   | position of a record |
//! |---------|------------------------------------------|----------------------|
//! | `range` | `{ "start": i64, "end": i64 }`           | `value - start`      |
//! | `jsonl` | `{ "path": "..." }`                      | line number          |
//! | `sql`   | `{ "url", "table", "columns", ... }`     | key column value     |

pub mod jsonl;
pub mod range;
pub mod sql;

pub use jsonl::{JsonLinesConfig, JsonLinesPartitioner};
pub use range::{RangeConfig, RangePartitioner};
pub use sql::{SqlConfig, SqlPartitioner};

use crate::error::{EngineError, SourceError};
use crate::partition::Partition;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A single record read from a source or produced by a transform.
pub type Record = serde_json::Value;

/// Stream of records produced by a [`DataSource`].
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<Record, SourceError>> + Send>>;

/// Opaque, per-kind source configuration passed verbatim to every worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
  /// Name of the partitioner that understands `config`.
  pub kind: String,
  /// Kind-specific configuration.
  pub config: serde_json::Value,
}

impl SourceSpec {
  /// Creates a specification for the given kind.
  pub fn new(kind: impl Into<String>, config: serde_json::Value) -> Self {
    Self {
      kind: kind.into(),
      config,
    }
  }

  /// Decodes `config` into a typed configuration.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::Configuration`] when the value does not match `T`.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
    serde_json::from_value(self.config.clone()).map_err(|e| {
      EngineError::Configuration(format!("invalid `{}` source config: {}", self.kind, e))
    })
  }

  fn expect_kind(&self, kind: &str) -> Result<(), EngineError> {
    if self.kind == kind {
      Ok(())
    } else {
      Err(EngineError::Configuration(format!(
        "source kind `{}` handed to `{}` partitioner",
        self.kind, kind
      )))
    }
  }
}

/// A readable slice of external data.
pub trait DataSource: Send + Sync {
  /// Partition this source is scoped to.
  fn partition(&self) -> Partition;

  /// Opens the underlying resource and streams its records.
  ///
  /// Each call re-issues the read. The resource is released when the stream
  /// finishes, fails, or is dropped.
  fn records(&self) -> RecordStream;
}

/// Builds the [`DataSource`] for one partition of a source specification.
pub trait DataSourcePartitioner: Send + Sync {
  /// Source kind this partitioner handles; matched against [`SourceSpec::kind`].
  fn kind(&self) -> &str;

  /// Builds the source for `partition`.
  ///
  /// Across `index ∈ [0, total)` the built sources must cover every record
  /// exactly once.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::Configuration`] for a spec of another kind, an
  /// undecodable config, or an invalid partition.
  fn build(
    &self,
    spec: &SourceSpec,
    partition: Partition,
  ) -> Result<Box<dyn DataSource>, EngineError>;
}

/// Shared precondition checks for partitioners.
pub(crate) fn check_build(
  spec: &SourceSpec,
  kind: &str,
  partition: Partition,
) -> Result<(), EngineError> {
  spec.expect_kind(kind)?;
  partition.validate()
}
