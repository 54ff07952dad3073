//! Error types for `rapport-core`.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::{
  relationship::RelationshipStatus,
  spam::DetectionType,
  store::{StoreErrorKind, StoreFailure},
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("not found: {0}")]
  NotFound(String),

  /// A constraint or invariant would be violated.
  #[error("conflict: {0}")]
  Conflict(String),

  #[error("rate limited on {action}; retry after {retry_after:?}")]
  RateLimited {
    action:      String,
    retry_after: Duration,
  },

  #[error("restricted by {detection} (score {score})")]
  Restricted {
    detection: DetectionType,
    score:     f64,
  },

  #[error("a user cannot form a relationship with themselves")]
  SelfReference,

  #[error("both accounts belong to the same account group")]
  SameAccountGroup,

  #[error("relationship {id} is {status}; transition not allowed")]
  InvalidState {
    id:     Uuid,
    status: RelationshipStatus,
  },

  #[error("transient store error: {0}")]
  TransientStore(#[source] Box<dyn std::error::Error + Send + Sync>),

  /// A backend failure that is neither transient nor a constraint.
  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("operation cancelled")]
  Cancelled,

  #[error("operation deadline exceeded")]
  DeadlineExceeded,
}

impl Error {
  /// Classify a backend error into the core taxonomy.
  pub fn from_store<E: StoreFailure>(err: E) -> Self {
    match err.kind() {
      StoreErrorKind::NotFound => Self::NotFound(err.to_string()),
      StoreErrorKind::Constraint => Self::Conflict(err.to_string()),
      StoreErrorKind::Transient => Self::TransientStore(Box::new(err)),
      StoreErrorKind::Other => Self::Store(Box::new(err)),
    }
  }

  pub fn is_transient(&self) -> bool {
    matches!(self, Self::TransientStore(_))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
