use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
  #[error("store connection error: {0}")]
  Connection(Arc<redis::RedisError>),

  #[error("store client is closed")]
  Closed,

  #[error("store unavailable: {0}")]
  Unavailable(String),

  #[error("malformed value at {key}: {value:?}")]
  Malformed { key: String, value: String },
}

impl StoreError {
  /// True when the store could not be reached at all, as opposed to
  /// answering with data we could not understand.
  pub fn is_connectivity(&self) -> bool {
    !matches!(self, StoreError::Malformed { .. })
  }
}

impl From<redis::RedisError> for StoreError {
  fn from(err: redis::RedisError) -> Self {
    StoreError::Connection(Arc::new(err))
  }
}

pub type Result<T> = std::result::Result<T, StoreError>;
