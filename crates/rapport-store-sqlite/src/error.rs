//! Error type for `rapport-store-sqlite`.

use rapport_core::store::{StoreErrorKind, StoreFailure};
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A column held a value no enum variant serialises to.
  #[error("unknown {column} value: {value:?}")]
  Decode { column: &'static str, value: String },

  #[error("not found: {0}")]
  NotFound(String),

  /// A conditional write found the row in an unexpected state.
  #[error("constraint violated: {0}")]
  Constraint(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl StoreFailure for Error {
  fn kind(&self) -> StoreErrorKind {
    match self {
      Self::NotFound(_) => StoreErrorKind::NotFound,
      Self::Constraint(_) => StoreErrorKind::Constraint,
      Self::Database(err) => classify(err),
      Self::Uuid(_) | Self::DateParse(_) | Self::Decode { .. } => StoreErrorKind::Other,
    }
  }
}

/// Map SQLite result codes onto the engine's failure classes.
fn classify(err: &tokio_rusqlite::Error) -> StoreErrorKind {
  match err {
    tokio_rusqlite::Error::ConnectionClosed => StoreErrorKind::Transient,
    tokio_rusqlite::Error::Rusqlite(err) => match err.sqlite_error_code() {
      Some(ErrorCode::ConstraintViolation) => StoreErrorKind::Constraint,
      Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
        StoreErrorKind::Transient
      }
      _ => StoreErrorKind::Other,
    },
    _ => StoreErrorKind::Other,
  }
}
