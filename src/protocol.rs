//! # Wire Protocol
//!
//! Message envelope and payloads exchanged between the coordinator and
//! workers.
//!
//! ```text
//!  worker                      coordinator
//!    | ---- Register ---------------> |
//!    | <--- Assign (partition i/N) -- |
//!    | ---- Heartbeat ------------->  |   (every heartbeat interval)
//!    | ---- Result | Error ---------> |
//! ```
//!
//! The coordinator also sends `Error` to a worker to reject a registration or
//! to abort a failed job.

use crate::partition::Partition;
use crate::source::{Record, SourceSpec};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version for backward compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProtocolVersion {
  /// Version 1: register / assign / result / error / heartbeat.
  #[default]
  V1,
}

/// Message types for coordinator-worker communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
  /// Worker announces itself to the coordinator.
  Register,
  /// Coordinator hands a partition to a worker.
  Assign,
  /// Worker delivers its full transformed output.
  Result,
  /// Worker failure, registration rejection, or job abort.
  Error,
  /// Worker liveness signal.
  Heartbeat,
}

/// Protocol message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
  /// Unique message identifier.
  pub id: String,
  /// Message type.
  pub message_type: MessageType,
  /// Timestamp when the message was created.
  pub timestamp: DateTime<Utc>,
  /// Protocol version.
  pub version: ProtocolVersion,
  /// Sender identifier (worker id, or `coordinator`).
  pub source: String,
  /// Partition the message concerns, where applicable.
  pub partition_index: Option<usize>,
  /// Type-specific payload.
  pub payload: serde_json::Value,
}

/// Sender name used by the coordinator.
pub const COORDINATOR: &str = "coordinator";

impl Message {
  /// Creates a new protocol message.
  #[must_use]
  pub fn new(message_type: MessageType, source: String, payload: serde_json::Value) -> Self {
    Self {
      id: format!("msg-{}", Uuid::new_v4()),
      message_type,
      timestamp: Utc::now(),
      version: ProtocolVersion::default(),
      source,
      partition_index: None,
      payload,
    }
  }

  /// Sets the partition this message concerns.
  #[must_use]
  pub fn with_partition(mut self, index: usize) -> Self {
    self.partition_index = Some(index);
    self
  }

  /// Builds a message carrying a typed payload.
  ///
  /// # Errors
  ///
  /// Returns [`ProtocolError::Serialization`] if the payload cannot be encoded.
  pub fn encode<P: Serialize>(
    message_type: MessageType,
    source: impl Into<String>,
    payload: &P,
  ) -> Result<Self, ProtocolError> {
    let payload =
      serde_json::to_value(payload).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    Ok(Self::new(message_type, source.into(), payload))
  }

  /// Decodes the payload, checking the message type and protocol version first.
  ///
  /// # Errors
  ///
  /// Returns [`ProtocolError::UnsupportedVersion`], [`ProtocolError::UnexpectedMessage`]
  /// or [`ProtocolError::Deserialization`].
  pub fn decode<P: DeserializeOwned>(&self, expected: MessageType) -> Result<P, ProtocolError> {
    if self.version != ProtocolVersion::V1 {
      return Err(ProtocolError::UnsupportedVersion(self.version));
    }
    if self.message_type != expected {
      return Err(ProtocolError::UnexpectedMessage {
        expected,
        actual: self.message_type,
      });
    }
    serde_json::from_value(self.payload.clone())
      .map_err(|e| ProtocolError::Deserialization(e.to_string()))
  }
}

/// Payload of [`MessageType::Register`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPayload {
  /// Unique worker identifier.
  pub worker_id: String,
  /// Job definition the worker has loaded.
  pub job: String,
  /// Launch ordinal within the pool, diagnostic only.
  pub ordinal: Option<usize>,
  /// Pool size the worker was launched for, if known.
  pub pool_size: Option<usize>,
}

/// Payload of [`MessageType::Assign`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignPayload {
  /// Job definition to apply.
  pub job: String,
  /// Partition to read.
  pub partition: Partition,
  /// Source specification, verbatim from the producer.
  pub source: SourceSpec,
}

/// Payload of [`MessageType::Result`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
  /// Records read from the partition.
  pub records_read: u64,
  /// Transformed output, in source order.
  pub values: Vec<Record>,
}

/// Payload of [`MessageType::Heartbeat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeartbeatPayload {
  /// Records read so far.
  pub records_read: u64,
}

/// Classification carried by [`MessageType::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
  /// The worker could not interpret its launch arguments or assignment.
  Configuration,
  /// The worker failed to open or iterate its data source.
  PartitionRead,
  /// The transform function failed.
  Transform,
  /// The coordinator refused the registration.
  Rejected,
  /// The coordinator aborted the job.
  Aborted,
}

/// Payload of [`MessageType::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
  /// Error classification.
  pub kind: ErrorKind,
  /// Human-readable description.
  pub message: String,
}

impl ErrorPayload {
  /// Creates an error payload.
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }
}

/// Protocol-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
  /// Message serialization failed.
  #[error("Serialization error: {0}")]
  Serialization(String),
  /// Message deserialization failed.
  #[error("Deserialization error: {0}")]
  Deserialization(String),
  /// Unsupported protocol version.
  #[error("Unsupported protocol version: {0:?}")]
  UnsupportedVersion(ProtocolVersion),
  /// A message arrived out of sequence.
  #[error("Expected {expected:?} message, got {actual:?}")]
  UnexpectedMessage {
    /// Type the receiver was waiting for.
    expected: MessageType,
    /// Type that arrived.
    actual: MessageType,
  },
  /// Frame exceeds the size limit.
  #[error("Frame of {0} bytes exceeds the limit")]
  FrameTooLarge(usize),
}
