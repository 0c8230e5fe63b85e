//! # Worker Runtime
//!
//! A worker is a standalone process serving exactly one partition of one job:
//!
//! 1. connect to the producer (retrying until it listens) and send `Register`;
//! 2. wait for `Assign`, then check it against the launch arguments;
//! 3. build the partition's [`DataSource`](crate::source::DataSource) and run
//!    the transform over it, heartbeating meanwhile;
//! 4. send the buffered output as a single `Result`, or an `Error`, and exit.
//!
//! Every failure after registration is reported to the coordinator before it
//! is returned to the caller.

use crate::config::WorkerConfig;
use crate::error::EngineError;
use crate::job::JobDefinition;
use crate::partition::Partition;
use crate::protocol::{
  AssignPayload, ErrorKind, ErrorPayload, HeartbeatPayload, Message, MessageType, RegisterPayload,
  ResultPayload,
};
use crate::registry::Registry;
use crate::source::{DataSource, Record};
use crate::transport::{connect_with_retry, ConnectionError, MessageReader, MessageWriter};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Records transformed between cooperative yields.
const YIELD_EVERY: u64 = 1024;
/// Longest stretch of transform work between cooperative yields.
const YIELD_AFTER: Duration = Duration::from_millis(10);

/// Summary of a successful worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
  /// Identifier the worker registered with.
  pub worker_id: String,
  /// Partition the worker served.
  pub partition: Partition,
  /// Records read from the partition.
  pub records_read: u64,
  /// Values sent in the `Result` message.
  pub values_sent: usize,
}

/// Single-shot worker.
pub struct Worker {
  config: WorkerConfig,
  registry: Arc<Registry>,
}

impl Worker {
  /// Creates a worker that resolves jobs and sources through `registry`.
  pub fn new(config: WorkerConfig, registry: Arc<Registry>) -> Self {
    Self { config, registry }
  }

  /// Worker configuration.
  #[must_use]
  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  /// Runs the worker to completion.
  ///
  /// The job named in the configuration is resolved before connecting, so an
  /// unknown name fails without touching the network.
  ///
  /// # Errors
  ///
  /// - [`EngineError::Configuration`] for an unknown job or source kind, or an
  ///   assignment that does not match the launch arguments.
  /// - [`EngineError::Rejected`] / [`EngineError::Aborted`] when the
  ///   coordinator refuses or abandons the job.
  /// - [`EngineError::PartitionRead`] / [`EngineError::Transform`] for local
  ///   failures, after they were reported.
  /// - [`EngineError::Transport`] when the producer is unreachable.
  pub async fn run(&self) -> Result<WorkerReport, EngineError> {
    let definition = self.registry.job(&self.config.job)?;
    if let Some(kind) = &self.config.source_kind {
      self.registry.partitioner(kind)?;
    }

    info!(
      worker_id = %self.config.worker_id,
      job = definition.name(),
      producer = %self.config.producer_address,
      ordinal = ?self.config.ordinal,
      "Worker starting"
    );
    let connection = connect_with_retry(self.config.producer_address, &self.config.retry).await?;
    let (mut reader, writer) = connection.into_split()?;

    let outcome = self.session(&definition, &mut reader, &writer).await;
    writer.close().await;

    match &outcome {
      Ok(report) => info!(
        worker_id = %report.worker_id,
        partition = %report.partition,
        records_read = report.records_read,
        values_sent = report.values_sent,
        "Worker finished"
      ),
      Err(e) => error!(worker_id = %self.config.worker_id, kind = e.kind(), error = %e, "Worker failed"),
    }
    outcome
  }

  async fn session(
    &self,
    definition: &JobDefinition,
    reader: &mut MessageReader,
    writer: &MessageWriter,
  ) -> Result<WorkerReport, EngineError> {
    let register = RegisterPayload {
      worker_id: self.config.worker_id.clone(),
      job: definition.name().to_string(),
      ordinal: self.config.ordinal,
      pool_size: self.config.pool_size,
    };
    writer
      .send(&Message::encode(MessageType::Register, self.worker_id(), &register)?)
      .await?;
    debug!(worker_id = %self.config.worker_id, "Registered, waiting for assignment");

    let assignment = self.await_assignment(reader).await?;
    let partition = assignment.partition;
    info!(
      worker_id = %self.config.worker_id,
      partition = %partition,
      source = %assignment.source.kind,
      "Received assignment"
    );

    let source = match self.prepare(definition, &assignment) {
      Ok(source) => source,
      Err(e) => {
        self.report_failure(writer, partition, &e).await;
        return Err(e);
      }
    };

    let records_read = Arc::new(AtomicU64::new(0));
    let (stop_heartbeats, stopped) = oneshot::channel();
    let heartbeats = tokio::spawn(send_heartbeats(
      writer.clone(),
      self.config.worker_id.clone(),
      partition.index(),
      self.config.heartbeat_interval,
      Arc::clone(&records_read),
      stopped,
    ));
    // A freshly spawned task sits in this thread's unstealable LIFO slot.
    tokio::task::yield_now().await;

    let outcome = tokio::select! {
      biased;
      outcome = transform_partition(definition, source.as_ref(), &records_read) => outcome,
      cancelled = watch_for_abort(reader) => Err(cancelled),
    };

    let _ = stop_heartbeats.send(());
    let _ = heartbeats.await;

    let values = match outcome {
      Ok(values) => values,
      Err(e) => {
        self.report_failure(writer, partition, &e).await;
        return Err(e);
      }
    };

    let records_read = records_read.load(Ordering::Relaxed);
    let values_sent = values.len();
    let result = ResultPayload {
      records_read,
      values,
    };
    let message =
      Message::encode(MessageType::Result, self.worker_id(), &result)?.with_partition(partition.index());
    writer.send(&message).await?;

    Ok(WorkerReport {
      worker_id: self.config.worker_id.clone(),
      partition,
      records_read,
      values_sent,
    })
  }

  async fn await_assignment(&self, reader: &mut MessageReader) -> Result<AssignPayload, EngineError> {
    match tokio::time::timeout(self.config.assignment_timeout, receive_assignment(reader)).await {
      Ok(outcome) => outcome,
      Err(_) => Err(ConnectionError::Timeout.into()),
    }
  }

  /// Checks the assignment against the launch arguments and builds its source.
  fn prepare(
    &self,
    definition: &JobDefinition,
    assignment: &AssignPayload,
  ) -> Result<Box<dyn DataSource>, EngineError> {
    let partition = assignment.partition;
    partition.validate()?;
    if assignment.job != definition.name() {
      return Err(EngineError::Configuration(format!(
        "assigned job `{}` but launched for `{}`",
        assignment.job,
        definition.name()
      )));
    }
    if let Some(kind) = &self.config.source_kind {
      if *kind != assignment.source.kind {
        return Err(EngineError::Configuration(format!(
          "assigned source kind `{}` but launched for `{}`",
          assignment.source.kind, kind
        )));
      }
    }
    if let Some(pool_size) = self.config.pool_size {
      if pool_size != partition.total() {
        return Err(EngineError::Configuration(format!(
          "assigned partition {partition} but launched for a pool of {pool_size}"
        )));
      }
    }
    self
      .registry
      .partitioner(&assignment.source.kind)?
      .build(&assignment.source, partition)
  }

  async fn report_failure(&self, writer: &MessageWriter, partition: Partition, cause: &EngineError) {
    let kind = match cause {
      EngineError::PartitionRead { .. } => ErrorKind::PartitionRead,
      EngineError::Transform { .. } => ErrorKind::Transform,
      EngineError::Aborted(_) | EngineError::Rejected(_) | EngineError::Transport(_) => return,
      _ => ErrorKind::Configuration,
    };
    let payload = ErrorPayload::new(kind, cause.to_string());
    let sent = match Message::encode(MessageType::Error, self.worker_id(), &payload) {
      Ok(message) => writer.send(&message.with_partition(partition.index())).await,
      Err(e) => Err(e.into()),
    };
    if let Err(e) = sent {
      warn!(worker_id = %self.config.worker_id, error = %e, "Could not report failure to coordinator");
    }
  }

  fn worker_id(&self) -> &str {
    &self.config.worker_id
  }
}

async fn receive_assignment(reader: &mut MessageReader) -> Result<AssignPayload, EngineError> {
  loop {
    let Some(message) = reader.receive().await? else {
      return Err(ConnectionError::Closed.into());
    };
    match message.message_type {
      MessageType::Assign => return Ok(message.decode(MessageType::Assign)?),
      MessageType::Error => return Err(coordinator_error(&message)),
      other => warn!(message_type = ?other, "Ignoring message while waiting for assignment"),
    }
  }
}

/// Reads the partition to the end, applying the transform to each record.
async fn transform_partition(
  definition: &JobDefinition,
  source: &dyn DataSource,
  records_read: &AtomicU64,
) -> Result<Vec<Record>, EngineError> {
  let partition = source.partition().index();
  let mut records = source.records();
  let mut values = Vec::new();
  let mut last_yield = Instant::now();
  while let Some(item) = records.next().await {
    let record = item.map_err(|e| EngineError::PartitionRead {
      partition,
      message: e.to_string(),
    })?;
    let read = records_read.fetch_add(1, Ordering::Relaxed) + 1;
    let output = definition
      .transform(record)
      .map_err(|e| EngineError::Transform {
        partition,
        message: e.to_string(),
      })?;
    values.extend(output);
    if read % YIELD_EVERY == 0 || last_yield.elapsed() >= YIELD_AFTER {
      tokio::task::yield_now().await;
      last_yield = Instant::now();
    }
  }
  Ok(values)
}

/// Resolves when the coordinator aborts the job or drops the connection.
async fn watch_for_abort(reader: &mut MessageReader) -> EngineError {
  loop {
    match reader.receive().await {
      Ok(Some(message)) if message.message_type == MessageType::Error => {
        return coordinator_error(&message)
      }
      Ok(Some(message)) => {
        debug!(message_type = ?message.message_type, "Ignoring message while running")
      }
      Ok(None) => return ConnectionError::Closed.into(),
      Err(e) => return e.into(),
    }
  }
}

async fn send_heartbeats(
  writer: MessageWriter,
  worker_id: String,
  partition: usize,
  every: Duration,
  records_read: Arc<AtomicU64>,
  mut stop: oneshot::Receiver<()>,
) {
  let mut ticker = tokio::time::interval(every);
  loop {
    tokio::select! {
      _ = &mut stop => return,
      _ = ticker.tick() => {}
    }
    let payload = HeartbeatPayload {
      records_read: records_read.load(Ordering::Relaxed),
    };
    let message = match Message::encode(MessageType::Heartbeat, worker_id.as_str(), &payload) {
      Ok(message) => message.with_partition(partition),
      Err(e) => {
        warn!(error = %e, "Could not encode heartbeat");
        return;
      }
    };
    if let Err(e) = writer.send(&message).await {
      debug!(error = %e, "Stopping heartbeats");
      return;
    }
  }
}

/// Maps an `Error` sent by the coordinator to the matching engine error.
fn coordinator_error(message: &Message) -> EngineError {
  match message.decode::<ErrorPayload>(MessageType::Error) {
    Ok(ErrorPayload {
      kind: ErrorKind::Rejected,
      message,
    }) => EngineError::Rejected(message),
    Ok(ErrorPayload {
      kind: ErrorKind::Aborted,
      message,
    }) => EngineError::Aborted(message),
    Ok(ErrorPayload { message, .. }) => EngineError::Configuration(message),
    Err(e) => e.into(),
  }
}
