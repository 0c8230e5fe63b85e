//! SQLite-backed table source.
//!
//! Rows are assigned to partitions by their integer key column (`rowid` by
//! default): a row with key `k` belongs to partition `((k % N) + N) % N`.
//! A NULL key counts as `0`, so such rows land in partition 0.
//! The rule is evaluated inside the query, so every worker reads only its own
//! rows and no coordination beyond the specification is needed.
//!
//! A connection pool is opened when iteration starts and closed when it ends.
//! SQLite URLs name a file on the worker's host; workers on other hosts need
//! their own copy or an absolute path on shared storage.

use super::{check_build, DataSource, DataSourcePartitioner, Record, RecordStream, SourceSpec};
use crate::error::{EngineError, SourceError};
use crate::partition::Partition;
use async_stream::try_stream;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row};
use tracing::debug;

/// Configuration of the `sql` source kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlConfig {
  /// Connection URL, e.g. `sqlite://exampledb`.
  pub url: String,
  /// Table to read.
  pub table: String,
  /// Columns to select; `["*"]` selects every column.
  pub columns: Vec<String>,
  /// Integer column used by the assignment rule.
  #[serde(default = "default_key_column")]
  pub key_column: String,
}

fn default_key_column() -> String {
  "rowid".to_string()
}

impl SqlConfig {
  /// Creates a configuration keyed on `rowid`.
  pub fn new(url: impl Into<String>, table: impl Into<String>, columns: Vec<String>) -> Self {
    Self {
      url: url.into(),
      table: table.into(),
      columns,
      key_column: default_key_column(),
    }
  }

  /// Uses another integer column as the partitioning key.
  #[must_use]
  pub fn with_key_column(mut self, key_column: impl Into<String>) -> Self {
    self.key_column = key_column.into();
    self
  }

  /// Wraps this configuration into a `sql` source specification.
  #[must_use]
  pub fn into_spec(self) -> SourceSpec {
    SourceSpec::new(
      SqlPartitioner::KIND,
      serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
    )
  }

  fn validate(&self) -> Result<(), EngineError> {
    if self.url.is_empty() {
      return Err(EngineError::Configuration(
        "sql source requires a connection url".to_string(),
      ));
    }
    check_identifier(&self.table)?;
    check_identifier(&self.key_column)?;
    if self.columns.is_empty() {
      return Err(EngineError::Configuration(
        "sql source requires at least one column".to_string(),
      ));
    }
    if !(self.columns.len() == 1 && self.columns[0] == "*") {
      for column in &self.columns {
        check_identifier(column)?;
      }
    }
    Ok(())
  }

  /// Query selecting exactly the rows of `partition`.
  fn partition_query(&self, partition: Partition) -> String {
    let total = partition.total();
    let index = partition.index();
    let key = &self.key_column;
    format!(
      "SELECT {columns} FROM {table} WHERE ((COALESCE({key}, 0) % {total}) + {total}) % {total} = {index} ORDER BY {key}",
      columns = self.columns.join(", "),
      table = self.table,
    )
  }
}

fn check_identifier(name: &str) -> Result<(), EngineError> {
  let valid = !name.is_empty()
    && !name.starts_with(|c: char| c.is_ascii_digit())
    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
  if valid {
    Ok(())
  } else {
    Err(EngineError::Configuration(format!(
      "invalid sql identifier `{name}`"
    )))
  }
}

/// Partitioner for the `sql` kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlPartitioner;

impl SqlPartitioner {
  /// Kind name under which this partitioner registers.
  pub const KIND: &'static str = "sql";
}

impl DataSourcePartitioner for SqlPartitioner {
  fn kind(&self) -> &str {
    Self::KIND
  }

  fn build(
    &self,
    spec: &SourceSpec,
    partition: Partition,
  ) -> Result<Box<dyn DataSource>, EngineError> {
    check_build(spec, Self::KIND, partition)?;
    let config: SqlConfig = spec.decode()?;
    config.validate()?;
    let query = config.partition_query(partition);
    Ok(Box::new(SqlSource {
      url: config.url,
      query,
      partition,
    }))
  }
}

struct SqlSource {
  url: String,
  query: String,
  partition: Partition,
}

impl DataSource for SqlSource {
  fn partition(&self) -> Partition {
    self.partition
  }

  fn records(&self) -> RecordStream {
    Box::pin(fetch_rows(self.url.clone(), self.query.clone()))
  }
}

fn fetch_rows(url: String, query: String) -> impl Stream<Item = Result<Record, SourceError>> + Send {
  try_stream! {
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect(&url)
      .await?;
    debug!(query = %query, "Reading partition");

    {
      let mut rows = sqlx::query(&query).fetch(&pool);
      while let Some(row) = rows.try_next().await? {
        yield row_to_record(&row);
      }
    }

    pool.close().await;
  }
}

/// Single-column rows become the bare value, wider rows a JSON object.
fn row_to_record(row: &SqliteRow) -> Record {
  let columns = row.columns();
  if columns.len() == 1 {
    return column_value(row, 0);
  }
  let mut fields = serde_json::Map::with_capacity(columns.len());
  for (idx, column) in columns.iter().enumerate() {
    fields.insert(column.name().to_string(), column_value(row, idx));
  }
  serde_json::Value::Object(fields)
}

fn column_value(row: &SqliteRow, idx: usize) -> Record {
  row
    .try_get::<i64, _>(idx)
    .ok()
    .map(|v| serde_json::Value::Number(v.into()))
    .or_else(|| {
      row
        .try_get::<f64, _>(idx)
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(serde_json::Value::Number)
    })
    .or_else(|| {
      row
        .try_get::<String, _>(idx)
        .ok()
        .map(serde_json::Value::String)
    })
    .or_else(|| {
      row
        .try_get::<Vec<u8>, _>(idx)
        .ok()
        .map(|v| serde_json::Value::String(BASE64.encode(v)))
    })
    .unwrap_or(serde_json::Value::Null)
}
