//! # Plugin Registry
//!
//! Maps string identifiers to job definitions and source partitioners. A
//! registry is populated once at process start, on the producer and on every
//! worker, and then shared read-only. Workers look up the job and source kind
//! named in their launch arguments and assignment; no code is loaded by path.

use crate::error::EngineError;
use crate::job::{builtin, JobDefinition};
use crate::source::{DataSourcePartitioner, JsonLinesPartitioner, RangePartitioner, SqlPartitioner};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Registry of job definitions and source partitioners.
#[derive(Default)]
pub struct Registry {
  jobs: HashMap<String, Arc<JobDefinition>>,
  partitioners: HashMap<String, Arc<dyn DataSourcePartitioner>>,
}

impl Registry {
  /// Creates an empty registry.
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates a registry with the `range`, `jsonl` and `sql` source kinds.
  #[must_use]
  pub fn with_builtin_sources() -> Self {
    let mut registry = Self::new();
    registry.register_partitioner(RangePartitioner);
    registry.register_partitioner(JsonLinesPartitioner);
    registry.register_partitioner(SqlPartitioner);
    registry
  }

  /// Creates a registry with the built-in sources and the built-in jobs.
  #[must_use]
  pub fn with_builtins() -> Self {
    let mut registry = Self::with_builtin_sources();
    registry.register_job(builtin::square_sum());
    registry.register_job(builtin::collect());
    registry.register_job(builtin::count());
    registry
  }

  /// Registers a job definition under its own name, replacing any previous one.
  pub fn register_job(&mut self, definition: JobDefinition) -> Arc<JobDefinition> {
    let definition = Arc::new(definition);
    debug!(job = definition.name(), "Registered job definition");
    self
      .jobs
      .insert(definition.name().to_string(), Arc::clone(&definition));
    definition
  }

  /// Registers a partitioner under its kind, replacing any previous one.
  pub fn register_partitioner<P>(&mut self, partitioner: P)
  where
    P: DataSourcePartitioner + 'static,
  {
    let kind = partitioner.kind().to_string();
    debug!(kind = %kind, "Registered source partitioner");
    self.partitioners.insert(kind, Arc::new(partitioner));
  }

  /// Looks up a job definition by name.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::Configuration`] for an unknown name.
  pub fn job(&self, name: &str) -> Result<Arc<JobDefinition>, EngineError> {
    self.jobs.get(name).cloned().ok_or_else(|| {
      EngineError::Configuration(format!(
        "unknown job `{}` (registered: {})",
        name,
        sorted(self.jobs.keys()).join(", ")
      ))
    })
  }

  /// Looks up a partitioner by source kind.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::Configuration`] for an unknown kind.
  pub fn partitioner(&self, kind: &str) -> Result<Arc<dyn DataSourcePartitioner>, EngineError> {
    self.partitioners.get(kind).cloned().ok_or_else(|| {
      EngineError::Configuration(format!(
        "unknown source kind `{}` (registered: {})",
        kind,
        sorted(self.partitioners.keys()).join(", ")
      ))
    })
  }

  /// Names of all registered jobs, sorted.
  #[must_use]
  pub fn job_names(&self) -> Vec<String> {
    sorted(self.jobs.keys())
  }

  /// Names of all registered source kinds, sorted.
  #[must_use]
  pub fn source_kinds(&self) -> Vec<String> {
    sorted(self.partitioners.keys())
  }
}

fn sorted<'a>(names: impl Iterator<Item = &'a String>) -> Vec<String> {
  let mut names: Vec<String> = names.cloned().collect();
  names.sort();
  names
}
