//! Fixed-window rate limiting keyed by `(principal, action)`.
//!
//! Windows reset lazily: a record whose window has elapsed is reset the next
//! time it is checked, so no background sweeper is needed. The cost is
//! boundary bursting. A caller can spend a full budget at the end of one
//! window and another full budget at the start of the next, up to twice the
//! nominal rate across the edge.
//!
//! The state transition itself is the pure function [`advance`]; the
//! [`RateLimiter`] wraps it in a per-key lock plus a compare-and-set against
//! the store so concurrent service instances never double-spend a slot.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result, UserId,
  context::OpContext,
  locks::KeyedLocks,
  store::RateLimitStore,
};

/// How many times a lost compare-and-set race is retried before giving up.
const MAX_CAS_ATTEMPTS: usize = 8;

// ─── Principal ───────────────────────────────────────────────────────────────

/// The identity a budget is charged to: the account group when the user is
/// linked, otherwise the user.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Principal {
  User(UserId),
  Group(Uuid),
}

impl Principal {
  pub fn resolve(user: UserId, group: Option<Uuid>) -> Self {
    group.map_or(Self::User(user), Self::Group)
  }
}

impl fmt::Display for Principal {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::User(id) => write!(f, "user:{id}"),
      Self::Group(id) => write!(f, "group:{id}"),
    }
  }
}

// ─── Record & rule ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
  pub principal:      Principal,
  pub action:         String,
  pub window_start:   DateTime<Utc>,
  pub count:          u32,
  pub last_action_at: DateTime<Utc>,
}

/// `limit` actions per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
  pub limit:       u32,
  pub window_secs: u64,
}

impl RateLimitRule {
  pub fn new(limit: u32, window: Duration) -> Self {
    Self { limit, window_secs: window.as_secs() }
  }

  pub fn window(&self) -> Duration { Duration::from_secs(self.window_secs) }
}

/// Outcome of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
  /// The action was counted; `count` is the new value within the window.
  Admitted { count: u32 },
  /// The budget is spent until `retry_after` has passed.
  Denied { retry_after: Duration },
}

impl Decision {
  pub fn is_admitted(&self) -> bool { matches!(self, Self::Admitted { .. }) }
}

// ─── Pure transition ─────────────────────────────────────────────────────────

/// The result of applying one check to the current record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
  pub decision: Decision,
  /// The record to persist, or `None` when the check must not mutate state.
  pub next:     Option<RateLimitRecord>,
}

/// Apply one check-and-increment to `current`.
///
/// A missing record, or one whose window has fully elapsed, starts a fresh
/// window at `now`. Denials never touch the record.
pub fn advance(
  current: Option<&RateLimitRecord>,
  principal: Principal,
  action: &str,
  rule: RateLimitRule,
  now: DateTime<Utc>,
) -> Transition {
  let window = chrono::Duration::seconds(rule.window_secs as i64);

  let (window_start, count) = match current {
    Some(rec) if now - rec.window_start < window => (rec.window_start, rec.count),
    _ => (now, 0),
  };

  if count >= rule.limit {
    let retry_after = (window_start + window - now).to_std().unwrap_or_default();
    return Transition { decision: Decision::Denied { retry_after }, next: None };
  }

  let count = count + 1;
  Transition {
    decision: Decision::Admitted { count },
    next:     Some(RateLimitRecord {
      principal,
      action: action.to_owned(),
      window_start,
      count,
      last_action_at: now,
    }),
  }
}

// ─── Limiter ─────────────────────────────────────────────────────────────────

pub struct RateLimiter<S> {
  store:   Arc<S>,
  locks:   KeyedLocks<(Principal, String)>,
  backoff: Duration,
}

impl<S: RateLimitStore> RateLimiter<S> {
  pub fn new(store: Arc<S>, read_backoff: Duration) -> Self {
    Self { store, locks: KeyedLocks::new(), backoff: read_backoff }
  }

  /// Count one `action` against `principal` if the budget allows it.
  pub async fn check_and_increment(
    &self,
    cx: &OpContext,
    principal: Principal,
    action: &str,
    rule: RateLimitRule,
    now: DateTime<Utc>,
  ) -> Result<Decision> {
    let _guard = self.locks.lock(cx, (principal, action.to_owned())).await?;
    let store = &*self.store;

    for _ in 0..MAX_CAS_ATTEMPTS {
      let current = cx
        .read(self.backoff, move || store.get_rate_limit(principal, action))
        .await?;

      let Transition { decision, next } =
        advance(current.as_ref(), principal, action, rule, now);
      let Some(next) = next else {
        tracing::debug!(%principal, action, "rate limit denied");
        return Ok(decision);
      };

      if cx.write(store.compare_and_set_rate_limit(current, next)).await? {
        return Ok(decision);
      }
      tracing::debug!(%principal, action, "rate limit record changed concurrently, re-reading");
    }

    Err(Error::Conflict(format!(
      "rate limit record for {principal}/{action} kept changing"
    )))
  }

  /// Administrative override: start a fresh, empty window now.
  pub async fn reset(
    &self,
    cx: &OpContext,
    principal: Principal,
    action: &str,
    now: DateTime<Utc>,
  ) -> Result<()> {
    let _guard = self.locks.lock(cx, (principal, action.to_owned())).await?;
    let record = RateLimitRecord {
      principal,
      action: action.to_owned(),
      window_start: now,
      count: 0,
      last_action_at: now,
    };
    cx.write(self.store.upsert_rate_limit(record)).await?;
    tracing::info!(%principal, action, "rate limit reset");
    Ok(())
  }

  pub async fn record(
    &self,
    cx: &OpContext,
    principal: Principal,
    action: &str,
  ) -> Result<Option<RateLimitRecord>> {
    let store = &*self.store;
    cx.read(self.backoff, move || store.get_rate_limit(principal, action))
      .await
  }
}
