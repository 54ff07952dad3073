//! Per-operation cancellation and deadlines.
//!
//! Every externally facing engine operation takes an [`OpContext`]. Store
//! calls and lock acquisitions are raced against the context; when it fires
//! the in-flight future is dropped, which releases any lock guard it held.

use std::{future::Future, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
  Error, Result,
  store::{StoreErrorKind, StoreFailure},
};

#[derive(Debug, Clone, Default)]
pub struct OpContext {
  token:    CancellationToken,
  deadline: Option<Instant>,
}

impl OpContext {
  /// A context that never times out and is cancelled only through
  /// [`OpContext::cancel`].
  pub fn new() -> Self { Self::default() }

  pub fn with_timeout(timeout: Duration) -> Self {
    Self {
      token:    CancellationToken::new(),
      deadline: Some(Instant::now() + timeout),
    }
  }

  /// Bind the context to a caller-owned token.
  pub fn with_token(mut self, token: CancellationToken) -> Self {
    self.token = token;
    self
  }

  pub fn token(&self) -> &CancellationToken { &self.token }

  pub fn cancel(&self) { self.token.cancel(); }

  pub fn is_cancelled(&self) -> bool { self.token.is_cancelled() }

  /// Drive `fut` to completion unless the context is cancelled or its
  /// deadline passes first.
  pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
    let deadline = async {
      match self.deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
      }
    };

    tokio::select! {
      biased;
      _ = self.token.cancelled() => Err(Error::Cancelled),
      _ = deadline => Err(Error::DeadlineExceeded),
      out = fut => Ok(out),
    }
  }

  /// Run a store write. Writes are never retried: a failed write may have
  /// partially applied.
  pub(crate) async fn write<T, E, F>(&self, fut: F) -> Result<T>
  where
    E: StoreFailure,
    F: Future<Output = Result<T, E>>,
  {
    self.run(fut).await?.map_err(Error::from_store)
  }

  /// Run an idempotent store read, retrying once after `backoff` if the
  /// first attempt fails transiently.
  pub(crate) async fn read<T, E, F, Fut>(
    &self,
    backoff: Duration,
    mut op: F,
  ) -> Result<T>
  where
    E: StoreFailure,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    match self.run(op()).await? {
      Ok(value) => Ok(value),
      Err(err) if err.kind() == StoreErrorKind::Transient => {
        tracing::debug!(error = %err, ?backoff, "transient read failure, retrying once");
        self.run(tokio::time::sleep(backoff)).await?;
        self.run(op()).await?.map_err(Error::from_store)
      }
      Err(err) => Err(Error::from_store(err)),
    }
  }
}
