//! # Coordinator
//!
//! Producer-side orchestration of one job:
//!
//! ```text
//! WaitingForWorkers -> Dispatching -> Collecting -> Combining -> Done
//!          \________________\_____________\______________\____> Failed
//! ```
//!
//! Each accepted connection is served by its own task. Connection tasks never
//! touch job state; they forward [`Event`]s over a channel to the run loop,
//! which is the single owner of the worker table. Partitions are assigned in
//! registration order and results are attributed through the connection that
//! received the assignment, never by arrival order.
//!
//! The coordinator is fail-fast: any worker error, lost connection, or missed
//! heartbeat fails the whole job and no partition is reassigned.

mod table;

pub use table::{ConnectionId, WorkerHandle, WorkerStatus};

use crate::config::CoordinatorConfig;
use crate::error::EngineError;
use crate::job::Job;
use crate::partition::Partition;
use crate::protocol::{
  AssignPayload, ErrorKind, ErrorPayload, Message, MessageType, RegisterPayload, ResultPayload,
  COORDINATOR,
};
use crate::source::Record;
use crate::transport::{Connection, ConnectionError, MessageWriter};
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use table::{Collected, WorkerTable};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 1024;
const ABORT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
  /// Accepting registrations.
  WaitingForWorkers,
  /// Sending assignments.
  Dispatching,
  /// Waiting for one result per partition.
  Collecting,
  /// Running the combine function.
  Combining,
  /// Finished with a value.
  Done,
  /// Finished with an error.
  Failed,
}

impl fmt::Display for JobState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      JobState::WaitingForWorkers => "waiting_for_workers",
      JobState::Dispatching => "dispatching",
      JobState::Collecting => "collecting",
      JobState::Combining => "combining",
      JobState::Done => "done",
      JobState::Failed => "failed",
    };
    f.write_str(name)
  }
}

/// What connection tasks report to the run loop.
#[derive(Debug)]
enum Event {
  Connected {
    connection: ConnectionId,
    address: SocketAddr,
    writer: MessageWriter,
  },
  Inbound {
    connection: ConnectionId,
    message: Message,
  },
  Closed {
    connection: ConnectionId,
    reason: String,
  },
}

/// A bound coordinator, ready to run one job.
pub struct Coordinator {
  config: CoordinatorConfig,
  listener: TcpListener,
  local_addr: SocketAddr,
}

impl Coordinator {
  /// Binds the listen socket.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::Transport`] if the address cannot be bound.
  pub async fn bind(config: CoordinatorConfig) -> Result<Self, EngineError> {
    let listener = TcpListener::bind(config.bind_address)
      .await
      .map_err(ConnectionError::Io)?;
    let local_addr = listener.local_addr().map_err(ConnectionError::Io)?;
    info!(address = %local_addr, "Coordinator listening");
    Ok(Self {
      config,
      listener,
      local_addr,
    })
  }

  /// Address workers should connect to.
  #[must_use]
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Runs `job` to completion and returns the combined value.
  ///
  /// All connections are closed and buffered results dropped before this
  /// returns, whatever the outcome.
  ///
  /// # Errors
  ///
  /// Any [`EngineError`]; no partial result is ever returned.
  pub async fn run(self, job: &Job) -> Result<Record, EngineError> {
    let Coordinator {
      config, listener, ..
    } = self;
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);
    let acceptor = tokio::spawn(accept_loop(listener, events_tx));

    let mut run = JobRun::new(job, config);
    let outcome = match run.config.job_timeout {
      Some(limit) => match timeout(limit, run.drive(&mut events_rx)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(EngineError::JobTimeout(limit)),
      },
      None => run.drive(&mut events_rx).await,
    };

    match &outcome {
      Ok(_) => run.transition(JobState::Done),
      Err(e) => {
        run.transition(JobState::Failed);
        error!(job = job.name(), kind = e.kind(), error = %e, "Job failed");
        run.abort_workers(e).await;
      }
    }

    run.release().await;
    acceptor.abort();
    outcome
  }
}

/// Accepts connections until aborted; dropping the task aborts every
/// connection task it spawned.
async fn accept_loop(listener: TcpListener, events: mpsc::Sender<Event>) {
  let mut connections = JoinSet::new();
  let mut next_id: ConnectionId = 0;
  loop {
    tokio::select! {
      accepted = listener.accept() => match accepted {
        Ok((stream, address)) => {
          let connection = next_id;
          next_id += 1;
          debug!(peer = %address, connection, "Accepted worker connection");
          connections.spawn(serve_connection(connection, stream, address, events.clone()));
        }
        Err(e) => warn!(error = %e, "Error accepting worker connection"),
      },
      Some(_) = connections.join_next(), if !connections.is_empty() => {}
    }
  }
}

async fn serve_connection(
  connection: ConnectionId,
  stream: TcpStream,
  address: SocketAddr,
  events: mpsc::Sender<Event>,
) {
  let _ = stream.set_nodelay(true);
  let (mut reader, writer) = match Connection::from_stream(stream, address).into_split() {
    Ok(halves) => halves,
    Err(e) => {
      warn!(peer = %address, error = %e, "Could not split worker connection");
      return;
    }
  };
  let connected = Event::Connected {
    connection,
    address,
    writer,
  };
  if events.send(connected).await.is_err() {
    return;
  }

  let reason = loop {
    match reader.receive().await {
      Ok(Some(message)) => {
        if events
          .send(Event::Inbound {
            connection,
            message,
          })
          .await
          .is_err()
        {
          return;
        }
      }
      Ok(None) => break "connection closed by worker".to_string(),
      Err(e) => break e.to_string(),
    }
  };
  let _ = events.send(Event::Closed { connection, reason }).await;
}

/// State of one job run, owned by the run loop.
struct JobRun<'a> {
  job: &'a Job,
  config: CoordinatorConfig,
  state: JobState,
  table: WorkerTable,
  /// Connected but not (yet) registered.
  pending: HashMap<ConnectionId, (SocketAddr, MessageWriter)>,
}

impl<'a> JobRun<'a> {
  fn new(job: &'a Job, config: CoordinatorConfig) -> Self {
    Self {
      job,
      config,
      state: JobState::WaitingForWorkers,
      table: WorkerTable::default(),
      pending: HashMap::new(),
    }
  }

  fn transition(&mut self, next: JobState) {
    info!(job = self.job.name(), from = %self.state, to = %next, "Job state changed");
    self.state = next;
  }

  async fn drive(&mut self, events: &mut mpsc::Receiver<Event>) -> Result<Record, EngineError> {
    info!(
      job = self.job.name(),
      workers = self.job.worker_count(),
      source = %self.job.source().kind,
      "Waiting for workers"
    );
    self.wait_for_workers(events).await?;

    self.transition(JobState::Dispatching);
    self.dispatch().await?;

    self.transition(JobState::Collecting);
    self.collect(events).await?;

    self.transition(JobState::Combining);
    self.combine()
  }

  async fn wait_for_workers(&mut self, events: &mut mpsc::Receiver<Event>) -> Result<(), EngineError> {
    let expected = self.job.worker_count();
    let deadline = Instant::now() + self.config.registration_timeout;
    while self.table.len() < expected {
      let event = match timeout_at(deadline, events.recv()).await {
        Ok(Some(event)) => event,
        Ok(None) => return Err(ConnectionError::Closed.into()),
        Err(_) => {
          return Err(EngineError::RegistrationTimeout {
            registered: self.table.len(),
            expected,
            timeout: self.config.registration_timeout,
          })
        }
      };
      self.handle_event(event).await?;
    }
    Ok(())
  }

  async fn dispatch(&mut self) -> Result<(), EngineError> {
    let total = self.job.worker_count();
    let job_name = self.job.name().to_string();
    let source = self.job.source().clone();

    for (index, handle) in self.table.iter_mut().enumerate() {
      let payload = AssignPayload {
        job: job_name.clone(),
        partition: Partition::new(index, total)?,
        source: source.clone(),
      };
      let message = Message::encode(MessageType::Assign, COORDINATOR, &payload)?.with_partition(index);
      handle
        .writer
        .send(&message)
        .await
        .map_err(|e| EngineError::WorkerUnresponsive {
          worker_id: handle.id.clone(),
          partition: index,
          reason: format!("assignment could not be delivered: {e}"),
        })?;

      handle.partition = Some(index);
      handle.status = WorkerStatus::Assigned;
      handle.last_seen = Instant::now();
      info!(
        worker_id = %handle.id,
        peer = %handle.address,
        partition = index,
        total,
        "Assigned partition"
      );
    }
    Ok(())
  }

  async fn collect(&mut self, events: &mut mpsc::Receiver<Event>) -> Result<(), EngineError> {
    let expected = self.job.worker_count();
    let mut liveness = tokio::time::interval(self.config.check_interval);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while self.table.done_count() < expected {
      tokio::select! {
        event = events.recv() => match event {
          Some(event) => self.handle_event(event).await?,
          None => return Err(ConnectionError::Closed.into()),
        },
        _ = liveness.tick() => self.check_liveness()?,
      }
    }
    Ok(())
  }

  fn combine(&mut self) -> Result<Record, EngineError> {
    let values = self.table.take_ordered_values(self.job.worker_count())?;
    debug!(job = self.job.name(), values = values.len(), "Combining partition outputs");
    self
      .job
      .definition()
      .combine(values)
      .map_err(EngineError::Combine)
  }

  fn check_liveness(&self) -> Result<(), EngineError> {
    match self.table.overdue(Instant::now(), self.config.heartbeat_timeout) {
      Some((handle, silent)) => Err(EngineError::WorkerUnresponsive {
        worker_id: handle.id.clone(),
        partition: handle.partition.unwrap_or_default(),
        reason: format!("no heartbeat for {silent:?}"),
      }),
      None => Ok(()),
    }
  }

  async fn handle_event(&mut self, event: Event) -> Result<(), EngineError> {
    match event {
      Event::Connected {
        connection,
        address,
        writer,
      } => {
        self.pending.insert(connection, (address, writer));
        Ok(())
      }
      Event::Inbound {
        connection,
        message,
      } => self.handle_message(connection, message).await,
      Event::Closed { connection, reason } => self.handle_closed(connection, reason),
    }
  }

  async fn handle_message(
    &mut self,
    connection: ConnectionId,
    message: Message,
  ) -> Result<(), EngineError> {
    match message.message_type {
      MessageType::Register => {
        self.handle_register(connection, &message).await;
        Ok(())
      }
      MessageType::Heartbeat => {
        self.table.touch(connection, Instant::now());
        Ok(())
      }
      MessageType::Result => self.handle_result(connection, &message),
      MessageType::Error => self.handle_worker_error(connection, &message),
      MessageType::Assign => {
        warn!(connection, "Ignoring ASSIGN sent to the coordinator");
        Ok(())
      }
    }
  }

  async fn handle_register(&mut self, connection: ConnectionId, message: &Message) {
    if self.table.contains(connection) {
      warn!(connection, "Ignoring repeated REGISTER");
      return;
    }
    let Some((address, writer)) = self.pending.remove(&connection) else {
      warn!(connection, "REGISTER from an unknown connection");
      return;
    };

    let payload: RegisterPayload = match message.decode(MessageType::Register) {
      Ok(payload) => payload,
      Err(e) => {
        reject(&writer, format!("malformed registration: {e}")).await;
        return;
      }
    };
    if payload.job != self.job.name() {
      warn!(
        worker_id = %payload.worker_id,
        job = %payload.job,
        expected = self.job.name(),
        "Rejecting worker for another job"
      );
      reject(
        &writer,
        format!("producer runs job `{}`, not `{}`", self.job.name(), payload.job),
      )
      .await;
      return;
    }
    if self.state != JobState::WaitingForWorkers || self.table.len() >= self.job.worker_count() {
      warn!(worker_id = %payload.worker_id, "Rejecting worker: pool is full");
      reject(&writer, "worker pool is full").await;
      return;
    }
    if let Some(pool_size) = payload.pool_size {
      if pool_size != self.job.worker_count() {
        warn!(
          worker_id = %payload.worker_id,
          launched_for = pool_size,
          workers = self.job.worker_count(),
          "Worker launched for a different pool size"
        );
      }
    }

    let worker_id = payload.worker_id.clone();
    let ordinal = payload.ordinal;
    let position = self.table.register(connection, address, writer, payload);
    info!(
      worker_id = %worker_id,
      peer = %address,
      ?ordinal,
      registered = position + 1,
      expected = self.job.worker_count(),
      "Worker registered"
    );
  }

  fn handle_result(&mut self, connection: ConnectionId, message: &Message) -> Result<(), EngineError> {
    match self.table.get(connection) {
      None => {
        warn!(connection, "Ignoring RESULT from an unregistered connection");
        return Ok(());
      }
      Some(handle) if handle.status == WorkerStatus::Done => {
        debug!(partition = ?handle.partition, "Ignoring duplicate RESULT for a collected partition");
        return Ok(());
      }
      Some(_) => {}
    }
    let payload: ResultPayload = message.decode(MessageType::Result)?;
    let records_read = payload.records_read;
    let value_count = payload.values.len();

    match self
      .table
      .collect(connection, message.partition_index, payload.values)
    {
      Collected::Accepted { partition } => info!(
        partition,
        records_read,
        values = value_count,
        done = self.table.done_count(),
        total = self.job.worker_count(),
        "Partition collected"
      ),
      Collected::Duplicate { partition } => {
        debug!(partition, "Ignoring duplicate RESULT for a collected partition")
      }
      Collected::Unattributed => warn!(connection, "Ignoring RESULT before assignment"),
      Collected::Mismatched { assigned, claimed } => warn!(
        assigned,
        claimed, "Ignoring RESULT naming a partition other than the assigned one"
      ),
    }
    Ok(())
  }

  fn handle_worker_error(
    &mut self,
    connection: ConnectionId,
    message: &Message,
  ) -> Result<(), EngineError> {
    let Some(handle) = self.table.get_mut(connection) else {
      warn!(connection, "Ignoring ERROR from an unregistered connection");
      return Ok(());
    };
    if handle.status == WorkerStatus::Done {
      debug!(partition = ?handle.partition, "Ignoring ERROR for a collected partition");
      return Ok(());
    }
    let payload: ErrorPayload = message
      .decode(MessageType::Error)
      .unwrap_or_else(|e| ErrorPayload::new(ErrorKind::Configuration, format!("unreadable error report: {e}")));
    handle.status = WorkerStatus::Failed;

    let worker_id = handle.id.clone();
    let partition = handle.partition;
    warn!(
      worker_id = %worker_id,
      ?partition,
      kind = ?payload.kind,
      message = %payload.message,
      "Worker reported an error"
    );

    Err(match (payload.kind, partition) {
      (ErrorKind::PartitionRead, Some(partition)) => EngineError::PartitionRead {
        partition,
        message: payload.message,
      },
      (ErrorKind::Transform, Some(partition)) => EngineError::Transform {
        partition,
        message: payload.message,
      },
      _ => EngineError::Configuration(format!("worker {worker_id}: {}", payload.message)),
    })
  }

  fn handle_closed(&mut self, connection: ConnectionId, reason: String) -> Result<(), EngineError> {
    if self.pending.remove(&connection).is_some() {
      debug!(connection, %reason, "Unregistered connection closed");
      return Ok(());
    }
    let Some((status, worker_id, partition)) = self
      .table
      .get(connection)
      .map(|h| (h.status, h.id.clone(), h.partition))
    else {
      return Ok(());
    };
    match status {
      WorkerStatus::Connected => {
        self.table.withdraw(connection);
        info!(worker_id = %worker_id, %reason, "Worker withdrew before assignment");
        Ok(())
      }
      WorkerStatus::Assigned | WorkerStatus::Running => Err(EngineError::WorkerUnresponsive {
        worker_id,
        partition: partition.unwrap_or_default(),
        reason: format!("connection lost: {reason}"),
      }),
      WorkerStatus::Done | WorkerStatus::Failed => {
        debug!(worker_id = %worker_id, "Worker disconnected");
        Ok(())
      }
    }
  }

  /// Tells every connected worker that the job is over.
  async fn abort_workers(&self, cause: &EngineError) {
    let payload = ErrorPayload::new(ErrorKind::Aborted, cause.to_string());
    let Ok(message) = Message::encode(MessageType::Error, COORDINATOR, &payload) else {
      return;
    };
    let sends = self
      .table
      .iter()
      .filter(|h| h.status != WorkerStatus::Done)
      .map(|h| timeout(ABORT_SEND_TIMEOUT, h.writer.send(&message)));
    join_all(sends).await;
  }

  /// Closes every connection and drops buffered results.
  async fn release(&mut self) {
    for handle in self.table.iter() {
      handle.writer.close().await;
    }
    for (_, writer) in self.pending.values() {
      writer.close().await;
    }
    self.table = WorkerTable::default();
    self.pending.clear();
  }
}

async fn reject(writer: &MessageWriter, reason: impl Into<String>) {
  let payload = ErrorPayload::new(ErrorKind::Rejected, reason);
  if let Ok(message) = Message::encode(MessageType::Error, COORDINATOR, &payload) {
    let _ = timeout(ABORT_SEND_TIMEOUT, writer.send(&message)).await;
  }
  writer.close().await;
}
