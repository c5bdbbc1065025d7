//! Error types for the offline layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  // Configuration errors are fatal at startup
  #[error("Invalid configuration: {0}")]
  Config(String),

  #[error("Unknown cache tier: {0}")]
  UnknownTier(String),

  // Transient, handled by the strategies
  #[error("Network request failed: {0}")]
  Network(String),

  // Durable store failures; the queue keeps working in memory
  #[error("Storage error: {0}")]
  Storage(String),

  #[error("Install failed: {0}")]
  Install(String),
}

impl Error {
  pub fn is_network(&self) -> bool {
    matches!(self, Error::Network(_))
  }
}

impl From<rusqlite::Error> for Error {
  fn from(err: rusqlite::Error) -> Self {
    Error::Storage(err.to_string())
  }
}

impl From<serde_json::Error> for Error {
  fn from(err: serde_json::Error) -> Self {
    Error::Storage(format!("serialization failed: {}", err))
  }
}

impl From<reqwest::Error> for Error {
  fn from(err: reqwest::Error) -> Self {
    Error::Network(err.to_string())
  }
}

pub type Result<T> = std::result::Result<T, Error>;
