//! Coordinator-side bookkeeping of registered workers.

use crate::error::EngineError;
use crate::protocol::RegisterPayload;
use crate::source::Record;
use crate::transport::MessageWriter;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Identifier of an accepted connection, unique within one coordinator run.
pub type ConnectionId = u64;

/// Lifecycle of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
  /// Registered, no partition yet.
  Connected,
  /// Partition sent, no heartbeat seen since.
  Assigned,
  /// Heartbeating while it reads and transforms.
  Running,
  /// Result collected.
  Done,
  /// Reported an error or went silent.
  Failed,
}

/// Coordinator's view of one worker.
#[derive(Debug)]
pub struct WorkerHandle {
  /// Identifier the worker registered with.
  pub id: String,
  /// Peer address of the worker's connection.
  pub address: SocketAddr,
  /// Partition assigned at dispatch.
  pub partition: Option<usize>,
  /// Current status.
  pub status: WorkerStatus,
  pub(crate) connection: ConnectionId,
  pub(crate) last_seen: Instant,
  pub(crate) result: Option<Vec<Record>>,
  pub(crate) writer: MessageWriter,
}

impl WorkerHandle {
  /// Whether the worker owes the coordinator a result.
  #[must_use]
  pub fn is_outstanding(&self) -> bool {
    matches!(self.status, WorkerStatus::Assigned | WorkerStatus::Running)
  }
}

/// Outcome of offering a RESULT to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Collected {
  /// First result for the partition; stored.
  Accepted {
    /// Partition the result was attributed to.
    partition: usize,
  },
  /// The partition already reported; ignored.
  Duplicate {
    /// Partition that had already reported.
    partition: usize,
  },
  /// The connection never registered or was never dispatched; ignored.
  Unattributed,
  /// The message named a different partition than the one assigned; ignored.
  Mismatched {
    /// Partition assigned over this connection.
    assigned: usize,
    /// Partition named by the message.
    claimed: usize,
  },
}

/// Registered workers in registration order.
///
/// Registration order is partition order: after dispatch, the handle at
/// position `i` owns partition `i`.
#[derive(Debug, Default)]
pub(crate) struct WorkerTable {
  handles: Vec<WorkerHandle>,
}

impl WorkerTable {
  pub(crate) fn len(&self) -> usize {
    self.handles.len()
  }

  pub(crate) fn contains(&self, connection: ConnectionId) -> bool {
    self.position(connection).is_some()
  }

  pub(crate) fn get(&self, connection: ConnectionId) -> Option<&WorkerHandle> {
    self.position(connection).map(|pos| &self.handles[pos])
  }

  pub(crate) fn get_mut(&mut self, connection: ConnectionId) -> Option<&mut WorkerHandle> {
    self.position(connection).map(move |pos| &mut self.handles[pos])
  }

  pub(crate) fn iter(&self) -> impl Iterator<Item = &WorkerHandle> {
    self.handles.iter()
  }

  pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerHandle> {
    self.handles.iter_mut()
  }

  /// Appends a registration; returns its registration position.
  pub(crate) fn register(
    &mut self,
    connection: ConnectionId,
    address: SocketAddr,
    writer: MessageWriter,
    payload: RegisterPayload,
  ) -> usize {
    self.handles.push(WorkerHandle {
      id: payload.worker_id,
      address,
      partition: None,
      status: WorkerStatus::Connected,
      connection,
      last_seen: Instant::now(),
      result: None,
      writer,
    });
    self.handles.len() - 1
  }

  /// Drops a registration that was never dispatched.
  pub(crate) fn withdraw(&mut self, connection: ConnectionId) -> Option<WorkerHandle> {
    let pos = self.position(connection)?;
    if self.handles[pos].partition.is_some() {
      return None;
    }
    Some(self.handles.remove(pos))
  }

  /// Records liveness; the first heartbeat after assignment marks the worker running.
  pub(crate) fn touch(&mut self, connection: ConnectionId, now: Instant) {
    if let Some(handle) = self.get_mut(connection) {
      handle.last_seen = now;
      if handle.status == WorkerStatus::Assigned {
        handle.status = WorkerStatus::Running;
      }
    }
  }

  /// Stores a result, attributing it by the connection's assignment.
  pub(crate) fn collect(
    &mut self,
    connection: ConnectionId,
    claimed: Option<usize>,
    values: Vec<Record>,
  ) -> Collected {
    let Some(handle) = self.get_mut(connection) else {
      return Collected::Unattributed;
    };
    let Some(assigned) = handle.partition else {
      return Collected::Unattributed;
    };
    if let Some(claimed) = claimed {
      if claimed != assigned {
        return Collected::Mismatched { assigned, claimed };
      }
    }
    if handle.status == WorkerStatus::Done {
      return Collected::Duplicate {
        partition: assigned,
      };
    }
    handle.result = Some(values);
    handle.status = WorkerStatus::Done;
    handle.last_seen = Instant::now();
    Collected::Accepted {
      partition: assigned,
    }
  }

  pub(crate) fn done_count(&self) -> usize {
    self
      .handles
      .iter()
      .filter(|h| h.status == WorkerStatus::Done)
      .count()
  }

  /// First outstanding worker silent for longer than `timeout`.
  pub(crate) fn overdue(&self, now: Instant, timeout: Duration) -> Option<(&WorkerHandle, Duration)> {
    self
      .handles
      .iter()
      .filter(|h| h.is_outstanding())
      .map(|h| (h, now.saturating_duration_since(h.last_seen)))
      .find(|(_, silent)| *silent > timeout)
  }

  /// Concatenates stored results in ascending partition order.
  ///
  /// Fails unless partitions `0..total` each have exactly one stored result.
  pub(crate) fn take_ordered_values(&mut self, total: usize) -> Result<Vec<Record>, EngineError> {
    let mut slots: Vec<Option<Vec<Record>>> = (0..total).map(|_| None).collect();
    for handle in &mut self.handles {
      let (Some(index), Some(values)) = (handle.partition, handle.result.take()) else {
        continue;
      };
      let slot = slots.get_mut(index).ok_or_else(|| {
        EngineError::Aggregation(format!("result for partition {index} of a {total}-way job"))
      })?;
      if slot.is_some() {
        return Err(EngineError::Aggregation(format!(
          "partition {index} collected twice"
        )));
      }
      *slot = Some(values);
    }

    let mut ordered = Vec::new();
    for (index, slot) in slots.into_iter().enumerate() {
      match slot {
        Some(values) => ordered.extend(values),
        None => {
          return Err(EngineError::Aggregation(format!(
            "partition {index} missing at combine time"
          )))
        }
      }
    }
    Ok(ordered)
  }

  fn position(&self, connection: ConnectionId) -> Option<usize> {
    self.handles.iter().position(|h| h.connection == connection)
  }
}
