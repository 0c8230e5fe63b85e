//! Tests for the built-in source kinds: every split must be disjoint and
//! exhaustive.

use crate::error::{EngineError, SourceError};
use crate::partition::Partition;
use crate::source::{
  DataSourcePartitioner, JsonLinesPartitioner, RangePartitioner, Record, SourceSpec, SqlConfig,
  SqlPartitioner,
};
use futures::TryStreamExt;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::io::Write;

async fn read_partition(
  partitioner: &dyn DataSourcePartitioner,
  spec: &SourceSpec,
  partition: Partition,
) -> Result<Vec<Record>, SourceError> {
  let source = partitioner.build(spec, partition).unwrap();
  source.records().try_collect().await
}

async fn read_all_partitions(
  partitioner: &dyn DataSourcePartitioner,
  spec: &SourceSpec,
  total: usize,
) -> Vec<Vec<Record>> {
  let mut parts = Vec::new();
  for partition in Partition::all(total).unwrap() {
    parts.push(read_partition(partitioner, spec, partition).await.unwrap());
  }
  parts
}

fn sorted_i64(parts: &[Vec<Record>]) -> Vec<i64> {
  let mut values: Vec<i64> = parts
    .iter()
    .flatten()
    .map(|v| v.as_i64().unwrap())
    .collect();
  values.sort_unstable();
  values
}

#[tokio::test]
async fn test_range_partition_contents() {
  let spec = RangePartitioner::spec(10, 20);
  let parts = read_all_partitions(&RangePartitioner, &spec, 3).await;
  assert_eq!(parts[0], vec![json!(10), json!(13), json!(16), json!(19)]);
  assert_eq!(parts[1], vec![json!(11), json!(14), json!(17)]);
  assert_eq!(parts[2], vec![json!(12), json!(15), json!(18)]);
}

#[tokio::test]
async fn test_range_more_partitions_than_records() {
  let spec = RangePartitioner::spec(0, 2);
  let parts = read_all_partitions(&RangePartitioner, &spec, 5).await;
  assert_eq!(sorted_i64(&parts), vec![0, 1]);
  assert!(parts[2..].iter().all(Vec::is_empty));
}

#[tokio::test]
async fn test_range_rejects_bad_config() {
  let spec = SourceSpec::new(RangePartitioner::KIND, json!({ "start": "zero" }));
  let err = RangePartitioner
    .build(&spec, Partition::new(0, 1).unwrap())
    .err()
    .unwrap();
  assert!(matches!(err, EngineError::Configuration(_)));
}

#[tokio::test]
async fn test_records_can_be_reissued() {
  let source = RangePartitioner
    .build(&RangePartitioner::spec(0, 6), Partition::new(1, 2).unwrap())
    .unwrap();
  let first: Vec<Record> = source.records().try_collect().await.unwrap();
  let second: Vec<Record> = source.records().try_collect().await.unwrap();
  assert_eq!(first, vec![json!(1), json!(3), json!(5)]);
  assert_eq!(first, second);
}

proptest! {
  #[test]
  fn prop_range_split_is_disjoint_and_exhaustive(
    start in -500i64..500,
    len in 0i64..400,
    total in 1usize..12,
  ) {
    let spec = RangePartitioner::spec(start, start + len);
    let parts = futures::executor::block_on(read_all_partitions(&RangePartitioner, &spec, total));
    let expected: Vec<i64> = (start..start + len).collect();
    prop_assert_eq!(sorted_i64(&parts), expected);
  }
}

fn write_jsonl(lines: &[&str]) -> tempfile::NamedTempFile {
  let mut file = tempfile::NamedTempFile::new().unwrap();
  for line in lines {
    writeln!(file, "{line}").unwrap();
  }
  file.flush().unwrap();
  file
}

#[tokio::test]
async fn test_jsonl_split_by_line_number() {
  let file = write_jsonl(&[
    r#"{"id": 0}"#,
    r#"{"id": 1}"#,
    "",
    r#"{"id": 3}"#,
    r#"{"id": 4}"#,
  ]);
  let spec = JsonLinesPartitioner::spec(file.path());
  let parts = read_all_partitions(&JsonLinesPartitioner, &spec, 2).await;

  assert_eq!(parts[0], vec![json!({"id": 0}), json!({"id": 4})]);
  assert_eq!(parts[1], vec![json!({"id": 1}), json!({"id": 3})]);
}

#[tokio::test]
async fn test_jsonl_malformed_line_is_reported_with_position() {
  let file = write_jsonl(&["1", "2", "{not json", "4"]);
  let spec = JsonLinesPartitioner::spec(file.path());

  let err = read_partition(&JsonLinesPartitioner, &spec, Partition::new(0, 2).unwrap())
    .await
    .unwrap_err();
  assert!(matches!(err, SourceError::Malformed { position: 2, .. }));

  // the other partition never touches the bad line
  let odd = read_partition(&JsonLinesPartitioner, &spec, Partition::new(1, 2).unwrap())
    .await
    .unwrap();
  assert_eq!(odd, vec![json!(2), json!(4)]);
}

#[tokio::test]
async fn test_jsonl_missing_file_is_io_error() {
  let dir = tempfile::tempdir().unwrap();
  let spec = JsonLinesPartitioner::spec(dir.path().join("absent.jsonl"));
  let err = read_partition(&JsonLinesPartitioner, &spec, Partition::new(0, 1).unwrap())
    .await
    .unwrap_err();
  assert!(matches!(err, SourceError::Io(_)));
}

async fn create_sqlite(rows: i64) -> (tempfile::TempDir, String) {
  let dir = tempfile::tempdir().unwrap();
  let url = format!("sqlite://{}?mode=rwc", dir.path().join("source.db").display());
  let pool = sqlx::sqlite::SqlitePoolOptions::new()
    .max_connections(1)
    .connect(&url)
    .await
    .unwrap();
  sqlx::query("CREATE TABLE examples (id INTEGER PRIMARY KEY, value INTEGER, label TEXT)")
    .execute(&pool)
    .await
    .unwrap();
  for i in 0..rows {
    sqlx::query("INSERT INTO examples (id, value, label) VALUES (?, ?, ?)")
      .bind(i + 1)
      .bind(i)
      .bind(format!("row-{i}"))
      .execute(&pool)
      .await
      .unwrap();
  }
  pool.close().await;
  (dir, url)
}

#[tokio::test]
async fn test_sql_split_is_disjoint_and_exhaustive() {
  let (_dir, url) = create_sqlite(50).await;
  let spec = SqlConfig::new(url, "examples", vec!["value".to_string()]).into_spec();

  for total in [1, 3, 4, 7] {
    let parts = read_all_partitions(&SqlPartitioner, &spec, total).await;
    assert_eq!(sorted_i64(&parts), (0..50).collect::<Vec<_>>(), "total = {total}");
  }
}

#[tokio::test]
async fn test_sql_multi_column_rows_are_objects() {
  let (_dir, url) = create_sqlite(4).await;
  let spec = SqlConfig::new(url, "examples", vec!["id".to_string(), "label".to_string()])
    .with_key_column("id")
    .into_spec();

  let rows = read_partition(&SqlPartitioner, &spec, Partition::new(0, 2).unwrap())
    .await
    .unwrap();
  assert_eq!(
    rows,
    vec![
      json!({"id": 2, "label": "row-1"}),
      json!({"id": 4, "label": "row-3"}),
    ]
  );
}

#[tokio::test]
async fn test_sql_null_keys_are_read_exactly_once() {
  let dir = tempfile::tempdir().unwrap();
  let url = format!("sqlite://{}?mode=rwc", dir.path().join("nulls.db").display());
  let pool = sqlx::sqlite::SqlitePoolOptions::new()
    .max_connections(1)
    .connect(&url)
    .await
    .unwrap();
  sqlx::query("CREATE TABLE t (k INTEGER, value INTEGER)")
    .execute(&pool)
    .await
    .unwrap();
  sqlx::query("INSERT INTO t (k, value) VALUES (1, 10), (NULL, 20), (2, 30), (NULL, 40), (-3, 50)")
    .execute(&pool)
    .await
    .unwrap();
  pool.close().await;

  let spec = SqlConfig::new(url, "t", vec!["value".to_string()])
    .with_key_column("k")
    .into_spec();
  for total in [1, 2, 3] {
    let parts = read_all_partitions(&SqlPartitioner, &spec, total).await;
    assert_eq!(sorted_i64(&parts), vec![10, 20, 30, 40, 50], "total = {total}");
  }

  let first = read_partition(&SqlPartitioner, &spec, Partition::new(0, 2).unwrap())
    .await
    .unwrap();
  assert!(first.contains(&json!(20)));
  assert!(first.contains(&json!(40)));
}

#[tokio::test]
async fn test_sql_missing_table_is_database_error() {
  let (_dir, url) = create_sqlite(1).await;
  let spec = SqlConfig::new(url, "nope", vec!["value".to_string()]).into_spec();
  let err = read_partition(&SqlPartitioner, &spec, Partition::new(0, 1).unwrap())
    .await
    .unwrap_err();
  assert!(matches!(err, SourceError::Database(_)));
}

#[test]
fn test_sql_rejects_unsafe_identifiers() {
  let spec = SqlConfig::new("sqlite://db", "examples; DROP TABLE x", vec!["value".to_string()])
    .into_spec();
  let err = SqlPartitioner
    .build(&spec, Partition::new(0, 1).unwrap())
    .err()
    .unwrap();
  assert!(matches!(err, EngineError::Configuration(_)));
}

#[test]
fn test_sql_key_column_defaults_to_rowid() {
  let spec = SourceSpec::new(
    SqlPartitioner::KIND,
    json!({ "url": "sqlite://db", "table": "examples", "columns": ["value"] }),
  );
  let config: SqlConfig = spec.decode().unwrap();
  assert_eq!(config.key_column, "rowid");
  assert_eq!(Value::from(config.columns), json!(["value"]));
}
