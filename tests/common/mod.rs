//! Shared fixtures for coordinator and worker integration tests.

#![allow(dead_code)]

use mapweave::protocol::{
  AssignPayload, ErrorKind, ErrorPayload, HeartbeatPayload, Message, MessageType, RegisterPayload,
  ResultPayload,
};
use mapweave::transport::{connect_with_retry, MessageReader, MessageWriter, RetryConfig};
use mapweave::{CoordinatorConfig, Record, WorkerConfig};
use std::net::SocketAddr;
use std::time::Duration;

/// Coordinator bound to an ephemeral loopback port with short timeouts.
pub fn coordinator_config() -> CoordinatorConfig {
  CoordinatorConfig::default()
    .with_bind_address(SocketAddr::from(([127, 0, 0, 1], 0)))
    .with_registration_timeout(Duration::from_secs(10))
    .with_heartbeat_timeout(Duration::from_secs(5))
    .with_check_interval(Duration::from_millis(50))
}

pub fn fast_retry() -> RetryConfig {
  RetryConfig::default()
    .with_max_retries(100)
    .with_retry_delay(Duration::from_millis(20))
    .with_connect_timeout(Duration::from_secs(1))
}

pub fn worker_config(addr: SocketAddr, job: &str) -> WorkerConfig {
  WorkerConfig::new(addr, job)
    .with_heartbeat_interval(Duration::from_millis(100))
    .with_assignment_timeout(Duration::from_secs(10))
    .with_retry(fast_retry())
}

/// A scripted worker speaking the wire protocol directly.
pub struct FakeWorker {
  pub id: String,
  reader: MessageReader,
  writer: MessageWriter,
}

impl FakeWorker {
  pub async fn register(addr: SocketAddr, job: &str, id: &str) -> Self {
    let connection = connect_with_retry(addr, &fast_retry()).await.unwrap();
    let (reader, writer) = connection.into_split().unwrap();
    let payload = RegisterPayload {
      worker_id: id.to_string(),
      job: job.to_string(),
      ordinal: None,
      pool_size: None,
    };
    writer
      .send(&Message::encode(MessageType::Register, id, &payload).unwrap())
      .await
      .unwrap();
    Self {
      id: id.to_string(),
      reader,
      writer,
    }
  }

  pub async fn next_message(&mut self) -> Option<Message> {
    tokio::time::timeout(Duration::from_secs(10), self.reader.receive())
      .await
      .expect("no message within 10s")
      .ok()
      .flatten()
  }

  pub async fn assignment(&mut self) -> AssignPayload {
    let message = self.next_message().await.expect("connection closed before ASSIGN");
    assert_eq!(message.message_type, MessageType::Assign);
    let payload: AssignPayload = message.decode(MessageType::Assign).unwrap();
    assert_eq!(message.partition_index, Some(payload.partition.index()));
    payload
  }

  pub async fn error_reply(&mut self) -> ErrorPayload {
    let message = self.next_message().await.expect("connection closed before ERROR");
    message.decode(MessageType::Error).unwrap()
  }

  pub async fn send_result(&self, partition: usize, values: Vec<Record>) {
    let payload = ResultPayload {
      records_read: values.len() as u64,
      values,
    };
    let message = Message::encode(MessageType::Result, self.id.as_str(), &payload)
      .unwrap()
      .with_partition(partition);
    self.writer.send(&message).await.unwrap();
  }

  pub async fn send_error(&self, partition: usize, kind: ErrorKind, text: &str) {
    let message = Message::encode(MessageType::Error, self.id.as_str(), &ErrorPayload::new(kind, text))
      .unwrap()
      .with_partition(partition);
    self.writer.send(&message).await.unwrap();
  }

  pub async fn send_message(&self, message: &Message) {
    self.writer.send(message).await.unwrap();
  }

  pub async fn heartbeat(&self, partition: usize) {
    let message = Message::encode(
      MessageType::Heartbeat,
      self.id.as_str(),
      &HeartbeatPayload { records_read: 0 },
    )
    .unwrap()
    .with_partition(partition);
    let _ = self.writer.send(&message).await;
  }

  pub async fn close(self) {
    self.writer.close().await;
  }
}
