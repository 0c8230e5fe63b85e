//! Integer range source, mostly used for tests and demos.

use super::{check_build, DataSource, DataSourcePartitioner, RecordStream, SourceSpec};
use crate::error::EngineError;
use crate::partition::Partition;
use serde::{Deserialize, Serialize};

/// Configuration of the `range` source kind: integers in `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeConfig {
  /// First value, inclusive.
  pub start: i64,
  /// Last value, exclusive.
  pub end: i64,
}

/// Partitioner for the `range` kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct RangePartitioner;

impl RangePartitioner {
  /// Kind name under which this partitioner registers.
  pub const KIND: &'static str = "range";

  /// Builds a `range` source specification.
  #[must_use]
  pub fn spec(start: i64, end: i64) -> SourceSpec {
    SourceSpec::new(
      Self::KIND,
      serde_json::json!({ "start": start, "end": end }),
    )
  }
}

impl DataSourcePartitioner for RangePartitioner {
  fn kind(&self) -> &str {
    Self::KIND
  }

  fn build(
    &self,
    spec: &SourceSpec,
    partition: Partition,
  ) -> Result<Box<dyn DataSource>, EngineError> {
    check_build(spec, Self::KIND, partition)?;
    let config: RangeConfig = spec.decode()?;
    Ok(Box::new(RangeSource { config, partition }))
  }
}

struct RangeSource {
  config: RangeConfig,
  partition: Partition,
}

impl DataSource for RangeSource {
  fn partition(&self) -> Partition {
    self.partition
  }

  fn records(&self) -> RecordStream {
    let RangeConfig { start, end } = self.config;
    // value - start is the position, so stepping by `total` from
    // `start + index` visits exactly the owned positions
    let values = (start..end)
      .skip(self.partition.index())
      .step_by(self.partition.total())
      .map(|v| Ok(serde_json::Value::from(v)));
    Box::pin(futures::stream::iter(values))
  }
}
