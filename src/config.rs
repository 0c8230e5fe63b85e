//! Coordinator and worker configuration.
//!
//! Both are plain values with defaults and `with_*` builders. Nothing is read
//! from process-wide state; the CLI maps flags and environment variables onto
//! these structs.

use crate::transport::RetryConfig;
use std::net::SocketAddr;
use std::time::Duration;

/// Default producer listen port.
pub const DEFAULT_PRODUCER_PORT: u16 = 7070;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
  /// Address to listen on. Port 0 picks a free port.
  pub bind_address: SocketAddr,
  /// How long to wait for the full worker pool to register.
  pub registration_timeout: Duration,
  /// A dispatched worker silent for longer than this is unresponsive.
  pub heartbeat_timeout: Duration,
  /// How often liveness is checked while collecting.
  pub check_interval: Duration,
  /// Bound on registration plus collection; `None` means unbounded.
  pub job_timeout: Option<Duration>,
}

impl Default for CoordinatorConfig {
  fn default() -> Self {
    Self {
      bind_address: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PRODUCER_PORT)),
      registration_timeout: Duration::from_secs(60),
      heartbeat_timeout: Duration::from_secs(15),
      check_interval: Duration::from_millis(500),
      job_timeout: None,
    }
  }
}

impl CoordinatorConfig {
  /// Sets the listen address.
  #[must_use]
  pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
    self.bind_address = addr;
    self
  }

  /// Sets the registration timeout.
  #[must_use]
  pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
    self.registration_timeout = timeout;
    self
  }

  /// Sets the heartbeat timeout.
  #[must_use]
  pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
    self.heartbeat_timeout = timeout;
    self
  }

  /// Sets the liveness check interval.
  #[must_use]
  pub fn with_check_interval(mut self, interval: Duration) -> Self {
    self.check_interval = interval;
    self
  }

  /// Bounds the whole job (registration and collection).
  #[must_use]
  pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
    self.job_timeout = Some(timeout);
    self
  }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  /// Identifier announced at registration.
  pub worker_id: String,
  /// Producer address to connect to.
  pub producer_address: SocketAddr,
  /// Job definition to load from the registry.
  pub job: String,
  /// Source kind the worker expects to be assigned, if pinned at launch.
  pub source_kind: Option<String>,
  /// Launch ordinal within the pool, diagnostic only.
  pub ordinal: Option<usize>,
  /// Expected pool size; checked against the assignment when set.
  pub pool_size: Option<usize>,
  /// Interval between heartbeats.
  pub heartbeat_interval: Duration,
  /// How long to wait for an assignment after registering.
  pub assignment_timeout: Duration,
  /// Outbound connection retry policy.
  pub retry: RetryConfig,
}

impl WorkerConfig {
  /// Creates a configuration for `job` against the producer at `producer_address`.
  pub fn new(producer_address: SocketAddr, job: impl Into<String>) -> Self {
    Self {
      worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
      producer_address,
      job: job.into(),
      source_kind: None,
      ordinal: None,
      pool_size: None,
      heartbeat_interval: Duration::from_secs(2),
      assignment_timeout: Duration::from_secs(300),
      retry: RetryConfig::default(),
    }
  }

  /// Sets the worker identifier.
  #[must_use]
  pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
    self.worker_id = worker_id.into();
    self
  }

  /// Pins the expected source kind.
  #[must_use]
  pub fn with_source_kind(mut self, kind: impl Into<String>) -> Self {
    self.source_kind = Some(kind.into());
    self
  }

  /// Sets the launch ordinal.
  #[must_use]
  pub fn with_ordinal(mut self, ordinal: usize) -> Self {
    self.ordinal = Some(ordinal);
    self
  }

  /// Sets the expected pool size.
  #[must_use]
  pub fn with_pool_size(mut self, pool_size: usize) -> Self {
    self.pool_size = Some(pool_size);
    self
  }

  /// Sets the heartbeat interval.
  #[must_use]
  pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
    self.heartbeat_interval = interval;
    self
  }

  /// Sets the assignment timeout.
  #[must_use]
  pub fn with_assignment_timeout(mut self, timeout: Duration) -> Self {
    self.assignment_timeout = timeout;
    self
  }

  /// Sets the connection retry policy.
  #[must_use]
  pub fn with_retry(mut self, retry: RetryConfig) -> Self {
    self.retry = retry;
    self
  }
}
