//! # Transport
//!
//! Length-prefixed JSON framing of [`Message`]s over TCP. Each frame is a
//! 4-byte big-endian length followed by the JSON encoding of one message.
//!
//! A [`Connection`] can be split into a [`MessageReader`] and a cloneable
//! [`MessageWriter`], so one task can read while others write (a worker
//! sends heartbeats while it is still producing its result).

use crate::protocol::{Message, ProtocolError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

/// Largest accepted frame, in bytes.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Connection-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
  /// Network I/O error.
  #[error("Network error: {0}")]
  Io(#[from] io::Error),

  /// Protocol error during communication.
  #[error("Protocol error: {0}")]
  Protocol(#[from] ProtocolError),

  /// Connection timeout.
  #[error("Connection timeout")]
  Timeout,

  /// Connection closed unexpectedly.
  #[error("Connection closed")]
  Closed,

  /// Every connection attempt failed.
  #[error("Could not connect to {addr} after {attempts} attempts: {last_error}")]
  RetriesExhausted {
    /// Target address.
    addr: SocketAddr,
    /// Attempts made.
    attempts: usize,
    /// Error of the final attempt.
    last_error: String,
  },
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  /// Connection is active and ready.
  Connected,
  /// Connection is closing.
  Closing,
  /// Connection is closed.
  Closed,
}

/// Retry policy for outbound connections.
#[derive(Debug, Clone)]
pub struct RetryConfig {
  /// Timeout of a single connection attempt.
  pub connect_timeout: Duration,
  /// Retries after the first attempt.
  pub max_retries: usize,
  /// Delay between attempts.
  pub retry_delay: Duration,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      connect_timeout: Duration::from_secs(5),
      max_retries: 20,
      retry_delay: Duration::from_millis(500),
    }
  }
}

impl RetryConfig {
  /// Sets the number of retries.
  #[must_use]
  pub fn with_max_retries(mut self, max_retries: usize) -> Self {
    self.max_retries = max_retries;
    self
  }

  /// Sets the delay between attempts.
  #[must_use]
  pub fn with_retry_delay(mut self, delay: Duration) -> Self {
    self.retry_delay = delay;
    self
  }

  /// Sets the timeout of a single attempt.
  #[must_use]
  pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
    self.connect_timeout = connect_timeout;
    self
  }
}

/// A framed message connection.
pub struct Connection {
  /// Remote address.
  pub remote_addr: SocketAddr,
  state: ConnectionState,
  stream: Option<TcpStream>,
}

impl Connection {
  /// Creates a new outbound connection to the given address.
  ///
  /// # Errors
  ///
  /// Returns [`ConnectionError::Timeout`] or [`ConnectionError::Io`].
  pub async fn connect(
    addr: SocketAddr,
    timeout_duration: Duration,
  ) -> Result<Self, ConnectionError> {
    let stream = timeout(timeout_duration, TcpStream::connect(addr))
      .await
      .map_err(|_| ConnectionError::Timeout)?
      .map_err(ConnectionError::Io)?;
    stream.set_nodelay(true)?;

    Ok(Self::from_stream(stream, addr))
  }

  /// Wraps an accepted TCP stream.
  #[must_use]
  pub fn from_stream(stream: TcpStream, remote_addr: SocketAddr) -> Self {
    Self {
      remote_addr,
      state: ConnectionState::Connected,
      stream: Some(stream),
    }
  }

  /// Sends one message.
  ///
  /// # Errors
  ///
  /// Returns [`ConnectionError::Closed`] after [`close`](Self::close), or the
  /// underlying write error.
  pub async fn send(&mut self, message: &Message) -> Result<(), ConnectionError> {
    let stream = self.stream.as_mut().ok_or(ConnectionError::Closed)?;
    write_frame(stream, message).await
  }

  /// Receives one message; `Ok(None)` when the peer closed cleanly.
  ///
  /// # Errors
  ///
  /// Returns an error on a truncated or oversized frame, or undecodable JSON.
  pub async fn receive(&mut self) -> Result<Option<Message>, ConnectionError> {
    let stream = self.stream.as_mut().ok_or(ConnectionError::Closed)?;
    read_frame(stream).await
  }

  /// Closes the connection gracefully.
  ///
  /// # Errors
  ///
  /// Shutdown errors are ignored; the result is always `Ok`.
  pub async fn close(&mut self) -> Result<(), ConnectionError> {
    self.state = ConnectionState::Closing;
    if let Some(mut stream) = self.stream.take() {
      let _ = stream.shutdown().await;
    }
    self.state = ConnectionState::Closed;
    Ok(())
  }

  /// Checks if the connection is active.
  #[must_use]
  pub fn is_connected(&self) -> bool {
    self.state == ConnectionState::Connected && self.stream.is_some()
  }

  /// Current connection state.
  #[must_use]
  pub fn state(&self) -> ConnectionState {
    self.state
  }

  /// Splits into independently usable read and write halves.
  ///
  /// # Errors
  ///
  /// Returns [`ConnectionError::Closed`] if the connection was closed.
  pub fn into_split(mut self) -> Result<(MessageReader, MessageWriter), ConnectionError> {
    let stream = self.stream.take().ok_or(ConnectionError::Closed)?;
    let (read, write) = stream.into_split();
    Ok((
      MessageReader {
        inner: read,
        remote_addr: self.remote_addr,
      },
      MessageWriter {
        inner: Arc::new(Mutex::new(Some(write))),
        remote_addr: self.remote_addr,
      },
    ))
  }
}

/// Read half of a split [`Connection`].
pub struct MessageReader {
  inner: OwnedReadHalf,
  remote_addr: SocketAddr,
}

impl MessageReader {
  /// Receives one message; `Ok(None)` when the peer closed cleanly.
  ///
  /// # Errors
  ///
  /// See [`Connection::receive`].
  pub async fn receive(&mut self) -> Result<Option<Message>, ConnectionError> {
    read_frame(&mut self.inner).await
  }

  /// Remote address.
  #[must_use]
  pub fn remote_addr(&self) -> SocketAddr {
    self.remote_addr
  }
}

/// Cloneable write half of a split [`Connection`].
#[derive(Clone)]
pub struct MessageWriter {
  inner: Arc<Mutex<Option<OwnedWriteHalf>>>,
  remote_addr: SocketAddr,
}

impl MessageWriter {
  /// Sends one message. Concurrent senders are serialized frame by frame.
  ///
  /// # Errors
  ///
  /// Returns [`ConnectionError::Closed`] after [`close`](Self::close), or the
  /// underlying write error.
  pub async fn send(&self, message: &Message) -> Result<(), ConnectionError> {
    let mut guard = self.inner.lock().await;
    let stream = guard.as_mut().ok_or(ConnectionError::Closed)?;
    write_frame(stream, message).await
  }

  /// Shuts down the write side. Later sends fail with [`ConnectionError::Closed`].
  pub async fn close(&self) {
    if let Some(mut stream) = self.inner.lock().await.take() {
      let _ = stream.shutdown().await;
    }
  }

  /// Remote address.
  #[must_use]
  pub fn remote_addr(&self) -> SocketAddr {
    self.remote_addr
  }
}

impl std::fmt::Debug for MessageWriter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MessageWriter")
      .field("remote_addr", &self.remote_addr)
      .finish_non_exhaustive()
  }
}

/// Connects to `addr`, retrying per `config`.
///
/// Workers may be launched before the producer listens, so refused
/// connections are retried rather than treated as fatal.
///
/// # Errors
///
/// Returns [`ConnectionError::RetriesExhausted`] when every attempt fails.
pub async fn connect_with_retry(
  addr: SocketAddr,
  config: &RetryConfig,
) -> Result<Connection, ConnectionError> {
  let attempts = config.max_retries + 1;
  let mut last_error = None;
  for attempt in 1..=attempts {
    match Connection::connect(addr, config.connect_timeout).await {
      Ok(conn) => return Ok(conn),
      Err(e) => {
        debug!(%addr, attempt, error = %e, "Connection attempt failed");
        last_error = Some(e);
        if attempt < attempts {
          tokio::time::sleep(config.retry_delay).await;
        }
      }
    }
  }
  Err(ConnectionError::RetriesExhausted {
    addr,
    attempts,
    last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
  })
}

async fn write_frame<W>(stream: &mut W, message: &Message) -> Result<(), ConnectionError>
where
  W: AsyncWrite + Unpin,
{
  let serialized =
    serde_json::to_vec(message).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
  if serialized.len() > MAX_FRAME_LEN {
    return Err(ProtocolError::FrameTooLarge(serialized.len()).into());
  }

  let mut frame = Vec::with_capacity(4 + serialized.len());
  frame.extend_from_slice(&(serialized.len() as u32).to_be_bytes());
  frame.extend_from_slice(&serialized);
  stream.write_all(&frame).await?;
  stream.flush().await?;
  Ok(())
}

async fn read_frame<R>(stream: &mut R) -> Result<Option<Message>, ConnectionError>
where
  R: AsyncRead + Unpin,
{
  let length = match stream.read_u32().await {
    Ok(length) => length as usize,
    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
    Err(e) => return Err(ConnectionError::Io(e)),
  };
  if length > MAX_FRAME_LEN {
    return Err(ProtocolError::FrameTooLarge(length).into());
  }

  let mut buffer = vec![0u8; length];
  stream.read_exact(&mut buffer).await.map_err(|e| {
    if e.kind() == io::ErrorKind::UnexpectedEof {
      ConnectionError::Closed
    } else {
      ConnectionError::Io(e)
    }
  })?;

  let message =
    serde_json::from_slice(&buffer).map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
  Ok(Some(message))
}
