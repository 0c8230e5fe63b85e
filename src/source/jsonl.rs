//! JSON-lines file source.
//!
//! Each non-blank line is one JSON record. Line numbers are positions, so a
//! blank line still consumes a position and the split stays stable if the
//! file is edited only by appending.

use super::{check_build, DataSource, DataSourcePartitioner, Record, RecordStream, SourceSpec};
use crate::error::{EngineError, SourceError};
use crate::partition::Partition;
use async_stream::try_stream;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Configuration of the `jsonl` source kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonLinesConfig {
  /// File to read, resolved on the worker's host.
  pub path: PathBuf,
}

/// Partitioner for the `jsonl` kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLinesPartitioner;

impl JsonLinesPartitioner {
  /// Kind name under which this partitioner registers.
  pub const KIND: &'static str = "jsonl";

  /// Builds a `jsonl` source specification.
  pub fn spec(path: impl Into<PathBuf>) -> SourceSpec {
    let config = JsonLinesConfig { path: path.into() };
    SourceSpec::new(
      Self::KIND,
      serde_json::to_value(config).unwrap_or(serde_json::Value::Null),
    )
  }
}

impl DataSourcePartitioner for JsonLinesPartitioner {
  fn kind(&self) -> &str {
    Self::KIND
  }

  fn build(
    &self,
    spec: &SourceSpec,
    partition: Partition,
  ) -> Result<Box<dyn DataSource>, EngineError> {
    check_build(spec, Self::KIND, partition)?;
    let config: JsonLinesConfig = spec.decode()?;
    Ok(Box::new(JsonLinesSource { config, partition }))
  }
}

struct JsonLinesSource {
  config: JsonLinesConfig,
  partition: Partition,
}

impl DataSource for JsonLinesSource {
  fn partition(&self) -> Partition {
    self.partition
  }

  fn records(&self) -> RecordStream {
    Box::pin(read_lines(self.config.path.clone(), self.partition))
  }
}

fn read_lines(
  path: PathBuf,
  partition: Partition,
) -> impl Stream<Item = Result<Record, SourceError>> + Send {
  try_stream! {
    let file = tokio::fs::File::open(&path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut position: u64 = 0;

    while let Some(line) = lines.next_line().await? {
      if partition.owns(position) && !line.trim().is_empty() {
        let record: Record = serde_json::from_str(&line).map_err(|e| SourceError::Malformed {
          position,
          message: e.to_string(),
        })?;
        yield record;
      }
      position += 1;
    }
  }
}
