//! Error taxonomy for the caching worker.

use thiserror::Error;

/// Errors raised by the caching worker.
///
/// Network failures are recovered locally by the network-first strategy and
/// never reach the page; everything else is surfaced to the host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
  /// No connectivity, DNS failure, timeout or an unreadable body.
  #[error("Network error: {0}")]
  Network(String),

  /// Cache storage could not be read or written.
  #[error("Cache storage error: {0}")]
  CacheStorage(String),

  /// Local database could not be opened or a transaction failed.
  #[error("Database error: {0}")]
  Database(String),

  /// An essential asset could not be fetched during install.
  #[error("Install failed for {url}: {reason}")]
  Install { url: String, reason: String },

  /// A lifecycle transition was requested from the wrong state.
  #[error("State error: {0}")]
  State(String),

  /// A message posted to the worker could not be understood.
  #[error("Invalid message: {0}")]
  Message(String),

  /// Configuration could not be loaded or is invalid.
  #[error("Configuration error: {0}")]
  Config(String),
}

impl WorkerError {
  /// Whether this error came from the network layer.
  pub fn is_network(&self) -> bool {
    matches!(self, Self::Network(_))
  }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, WorkerError>;
