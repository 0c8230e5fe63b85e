//! # mapweave
//!
//! Distributed map/combine over partitioned data sources.
//!
//! A producer splits a job into a per-record **transform** stage, run by a
//! pool of independently launched worker processes, and a cross-record
//! **combine** stage, run once on the producer over every partition's output
//! in ascending partition order.
//!
//! ```text
//!  Producer::map(job)
//!    └─ Coordinator ── TCP ──┬── Worker 0: partition 0/N ── DataSource ── transform
//!                            ├── Worker 1: partition 1/N ── ...
//!                            └── Worker N-1
//!    combine(concat(out_0, out_1, ..., out_N-1))
//! ```
//!
//! ## Key Pieces
//!
//! - [`Producer`] / [`Coordinator`]: registration, partition assignment,
//!   collection, liveness, and the final combine
//! - [`Worker`]: the single-shot worker runtime
//! - [`DataSourcePartitioner`]: turns a [`SourceSpec`] into one partition's
//!   record stream (`range`, `jsonl` and `sql` ship built in)
//! - [`Registry`]: jobs and source kinds by name, shared by producer and workers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mapweave::{job::builtin, CoordinatorConfig, Job, Producer, RangePartitioner};
//! use std::sync::Arc;
//!
//! // Start 4 workers elsewhere:
//! //   mapweave-worker --job square_sum --producer 127.0.0.1:7070
//! let job = Job::new(Arc::new(builtin::square_sum()), 4, RangePartitioner::spec(0, 1000))?;
//! let total = Producer::new(CoordinatorConfig::default()).map(&job)?;
//! assert_eq!(total, 332_833_500);
//! # Ok::<(), mapweave::EngineError>(())
//! ```
//!
//! Failures are fail-fast: a job either returns a value or exactly one
//! [`EngineError`]; partial results are never surfaced.

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Worker command line and logging setup.
pub mod cli;
/// Coordinator and worker configuration.
pub mod config;
/// Producer-side job orchestration.
pub mod coordinator;
/// Error taxonomy.
pub mod error;
/// Job definitions and built-in jobs.
pub mod job;
/// Partition identity and assignment rule.
pub mod partition;
/// Blocking and async job entry points.
pub mod producer;
/// Coordinator-worker wire protocol.
pub mod protocol;
/// Job and source-kind registry.
pub mod registry;
/// Data sources and partitioners.
pub mod source;
/// Framed TCP transport.
pub mod transport;
/// Worker runtime.
pub mod worker;

pub use config::{CoordinatorConfig, WorkerConfig};
pub use coordinator::{Coordinator, JobState};
pub use error::{EngineError, JobError, SourceError};
pub use job::{Job, JobDefinition};
pub use partition::Partition;
pub use producer::Producer;
pub use registry::Registry;
pub use source::{
  DataSource, DataSourcePartitioner, JsonLinesPartitioner, RangePartitioner, Record, SourceSpec,
  SqlConfig, SqlPartitioner,
};
pub use worker::{Worker, WorkerReport};

#[cfg(test)]
mod cli_test;
#[cfg(test)]
mod source_test;
