//! Partition identity and the shared row-assignment rule.
//!
//! A partition is `(index, total)`. Every worker resolves its slice of the
//! source independently from the source specification and its partition, so
//! the assignment rule has to be a pure function of a record's position:
//! position `p` belongs to partition `p % total`. For a fixed `total` this is
//! total, disjoint and exhaustive.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One slice of a partitioned source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
  index: usize,
  total: usize,
}

impl Partition {
  /// Creates a partition, validating `total > 0` and `index < total`.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::Configuration`] when either bound is violated.
  pub fn new(index: usize, total: usize) -> Result<Self, EngineError> {
    if total == 0 {
      return Err(EngineError::Configuration(
        "partition total must be greater than zero".to_string(),
      ));
    }
    if index >= total {
      return Err(EngineError::Configuration(format!(
        "partition index {index} out of range for {total} partitions"
      )));
    }
    Ok(Self { index, total })
  }

  /// Enumerates every partition of a `total`-way split, in index order.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::Configuration`] when `total == 0`.
  pub fn all(total: usize) -> Result<Vec<Self>, EngineError> {
    (0..total.max(1))
      .map(|index| Self::new(index, total))
      .collect()
  }

  /// Zero-based index of this partition.
  #[must_use]
  pub fn index(&self) -> usize {
    self.index
  }

  /// Number of partitions in the split.
  #[must_use]
  pub fn total(&self) -> usize {
    self.total
  }

  /// Returns `true` if the record at `position` belongs to this partition.
  #[must_use]
  pub fn owns(&self, position: u64) -> bool {
    position % self.total as u64 == self.index as u64
  }

  /// Checks that a deserialized partition still satisfies its bounds.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::Configuration`] for an out-of-range pair.
  pub fn validate(&self) -> Result<(), EngineError> {
    Self::new(self.index, self.total).map(|_| ())
  }
}

impl fmt::Display for Partition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.index, self.total)
  }
}
