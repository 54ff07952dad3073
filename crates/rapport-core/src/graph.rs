//! The social graph engine.
//!
//! [`SocialGraph`] owns the relationship state machine and wires it to the
//! rate limiter, the spam detector, and the account group linker. Every
//! creation attempt runs the same guard sequence:
//!
//! 1. self-reference,
//! 2. same account group,
//! 3. spam restriction,
//! 4. rate limit (charged to the group-collapsed principal),
//! 5. existing-state conflicts, checked under a lock on the user pair.
//!
//! Each attempt, admitted or denied, is then reported to the spam detector.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  Error, Result, UserId,
  account_group::{AccountGroup, AccountGroupLinker, GroupView},
  clock::{Clock, SystemClock},
  config::GraphConfig,
  context::OpContext,
  locks::KeyedLocks,
  rate_limit::{Decision, Principal, RateLimitRecord, RateLimiter},
  relationship::{
    Direction, Page, PageRequest, Relationship, RelationshipFilter,
    RelationshipKind, RelationshipStats, RelationshipStatus, StatusChange,
  },
  spam::{Denial, DetectionType, GraphSignal, SpamDetector, SpamFlag},
  store::GraphStore,
};

/// Lock key for an unordered pair of users.
fn pair(a: UserId, b: UserId) -> (UserId, UserId) {
  if a <= b { (a, b) } else { (b, a) }
}

pub struct SocialGraph<S, C = SystemClock> {
  store:      Arc<S>,
  clock:      C,
  config:     GraphConfig,
  backoff:    Duration,
  limiter:    RateLimiter<S>,
  detector:   SpamDetector<S>,
  linker:     AccountGroupLinker<S>,
  pair_locks: KeyedLocks<(UserId, UserId)>,
}

impl<S: GraphStore> SocialGraph<S> {
  pub fn new(store: Arc<S>, config: GraphConfig) -> Self {
    Self::with_clock(store, config, SystemClock)
  }
}

impl<S: GraphStore, C: Clock> SocialGraph<S, C> {
  pub fn with_clock(store: Arc<S>, config: GraphConfig, clock: C) -> Self {
    let backoff = config.read_retry_backoff();
    Self {
      limiter: RateLimiter::new(store.clone(), backoff),
      detector: SpamDetector::new(store.clone(), config.spam.clone(), backoff),
      linker: AccountGroupLinker::new(store.clone(), backoff),
      pair_locks: KeyedLocks::new(),
      store,
      clock,
      config,
      backoff,
    }
  }

  pub fn config(&self) -> &GraphConfig { &self.config }

  pub fn store(&self) -> &Arc<S> { &self.store }

  // ─── Creation ──────────────────────────────────────────────────────────────

  /// Create a relationship of `kind` from `from` to `to`.
  ///
  /// Follows and mutes are in force immediately; friend requests start out
  /// pending. Blocks are delegated to [`Self::block_user`].
  pub async fn request_relationship(
    &self,
    cx: &OpContext,
    from: UserId,
    to: UserId,
    kind: RelationshipKind,
  ) -> Result<Relationship> {
    if kind == RelationshipKind::Block {
      return self.block_user(cx, from, to).await;
    }

    let now = self.clock.now();
    let result = self.try_request(cx, from, to, kind, now).await;

    match &result {
      Ok(rel) => {
        tracing::info!(
          relationship_id = %rel.relationship_id,
          %from, %to, %kind, status = %rel.status,
          "relationship created"
        );
        self
          .detector
          .observe(cx, GraphSignal::RelationshipCreated(rel.clone()), now)
          .await;
      }
      Err(Error::Cancelled | Error::DeadlineExceeded) => {}
      Err(err) => {
        tracing::debug!(%from, %to, %kind, error = %err, "relationship request denied");
        let signal =
          GraphSignal::AttemptDenied { actor: from, kind, denial: Denial::of(err) };
        self.detector.observe(cx, signal, now).await;
      }
    }
    result
  }

  async fn try_request(
    &self,
    cx: &OpContext,
    from: UserId,
    to: UserId,
    kind: RelationshipKind,
    now: DateTime<Utc>,
  ) -> Result<Relationship> {
    let principal = self.admit_pair(cx, from, to).await?;

    if let Some(flag) = self.detector.restriction_for(cx, from, kind).await? {
      return Err(Error::Restricted { detection: flag.detection_type, score: flag.score });
    }

    if let Some(rule) = self.config.rate_limits.rule_for(kind) {
      let decision = self
        .limiter
        .check_and_increment(cx, principal, kind.action(), rule, now)
        .await?;
      if let Decision::Denied { retry_after } = decision {
        return Err(Error::RateLimited { action: kind.action().to_owned(), retry_after });
      }
    }

    let _guard = self.pair_locks.lock(cx, pair(from, to)).await?;
    let between = self.between(cx, from, to).await?;

    if let Some(block) = between.iter().find(|r| r.kind == RelationshipKind::Block) {
      return Err(Error::Conflict(format!(
        "{} has blocked {}",
        block.from_user, block.to_user
      )));
    }

    if kind == RelationshipKind::FriendRequest {
      let reverse = between.iter().find(|r| {
        r.kind == kind
          && r.from_user == to
          && matches!(r.status, RelationshipStatus::Pending | RelationshipStatus::Accepted)
      });
      if let Some(reverse) = reverse {
        let reason = match reverse.status {
          RelationshipStatus::Accepted => "already friends",
          _ => "an incoming request is pending",
        };
        return Err(Error::Conflict(format!("{from} and {to}: {reason}")));
      }
    }

    let existing = between
      .iter()
      .find(|r| r.kind == kind && r.from_user == from && r.to_user == to);
    if let Some(existing) = existing {
      if existing.status != RelationshipStatus::Rejected {
        return Err(Error::Conflict(format!(
          "{kind} from {from} to {to} already exists ({})",
          existing.status
        )));
      }
    }

    // Conflict checks are done. A rejected request may be asked again; the
    // old row is retired right before the new one goes in.
    if let Some(rejected) = existing {
      self
        .set_status(
          cx,
          rejected.relationship_id,
          StatusChange::to(RelationshipStatus::Rejected, RelationshipStatus::Removed),
          now,
        )
        .await?;
    }

    cx.write(self.store.insert(Relationship::new(from, to, kind, now))).await
  }

  /// Self-reference and account-group checks shared by every creation path.
  /// Returns the principal the actor is charged to.
  async fn admit_pair(&self, cx: &OpContext, from: UserId, to: UserId) -> Result<Principal> {
    if from == to {
      return Err(Error::SelfReference);
    }
    let group = self.linker.group_for_user(cx, from).await?;
    if group.is_some() && group == self.linker.group_for_user(cx, to).await? {
      return Err(Error::SameAccountGroup);
    }
    Ok(Principal::resolve(from, group))
  }

  // ─── Transitions ───────────────────────────────────────────────────────────

  /// Accept or reject a pending friend request addressed to `responder`.
  pub async fn respond_to_request(
    &self,
    cx: &OpContext,
    responder: UserId,
    request_id: Uuid,
    accept: bool,
  ) -> Result<Relationship> {
    let not_found = || Error::NotFound(format!("friend request {request_id}"));
    let addressed = |rel: &Relationship| {
      rel.kind == RelationshipKind::FriendRequest && rel.to_user == responder
    };

    let rel = self.fetch(cx, request_id).await?.filter(addressed).ok_or_else(not_found)?;
    let _guard = self.pair_locks.lock(cx, pair(rel.from_user, rel.to_user)).await?;
    // Re-read under the lock; a block may have landed in between.
    let rel = self.fetch(cx, request_id).await?.filter(addressed).ok_or_else(not_found)?;

    if rel.status != RelationshipStatus::Pending {
      return Err(Error::InvalidState { id: request_id, status: rel.status });
    }

    let status = if accept { RelationshipStatus::Accepted } else { RelationshipStatus::Rejected };
    let rel = self
      .set_status(
        cx,
        request_id,
        StatusChange::to(RelationshipStatus::Pending, status),
        self.clock.now(),
      )
      .await?;
    tracing::info!(%request_id, %responder, %status, "friend request answered");
    Ok(rel)
  }

  /// Retire the relationship of `kind` from `from` to `to`.
  ///
  /// Returns the retired row, or `None` when there was nothing to remove.
  /// For friend requests an accepted row pointing the other way is matched
  /// too, so either friend can end the friendship. A row suppressed by a
  /// block is retired as well and stays gone after the block is lifted.
  /// Removing a block lifts it as [`Self::unblock_user`] does.
  pub async fn remove_relationship(
    &self,
    cx: &OpContext,
    from: UserId,
    to: UserId,
    kind: RelationshipKind,
  ) -> Result<Option<Relationship>> {
    if kind == RelationshipKind::Block {
      return self.unblock_user(cx, from, to).await;
    }

    let now = self.clock.now();
    let _guard = self.pair_locks.lock(cx, pair(from, to)).await?;
    let between = self.between(cx, from, to).await?;

    let forward = between
      .iter()
      .find(|r| r.kind == kind && r.from_user == from && r.to_user == to);
    let reverse_friendship = between.iter().find(|r| {
      kind == RelationshipKind::FriendRequest
        && r.kind == kind
        && r.from_user == to
        && (r.status == RelationshipStatus::Accepted
          || r.suppressed_from == Some(RelationshipStatus::Accepted))
    });
    // Every row `between` returns is live, so whichever is picked can go.
    let target = match (forward, reverse_friendship) {
      (Some(f), Some(r)) if f.status == RelationshipStatus::Rejected => r,
      (Some(f), _) => f,
      (None, Some(r)) => r,
      (None, None) => return Ok(None),
    };

    let removed = self
      .set_status(
        cx,
        target.relationship_id,
        StatusChange::to(target.status, RelationshipStatus::Removed),
        now,
      )
      .await?;
    tracing::info!(
      relationship_id = %removed.relationship_id,
      %from, %to, %kind,
      "relationship removed"
    );
    self
      .detector
      .observe(cx, GraphSignal::RelationshipRemoved(removed.clone()), now)
      .await;
    Ok(Some(removed))
  }

  /// Block `to` on behalf of `from`.
  ///
  /// Pending requests between the pair are rejected and every follow or
  /// friendship between them is suppressed until the block is lifted. Mutes
  /// are left alone. Blocking again returns the existing block.
  pub async fn block_user(
    &self,
    cx: &OpContext,
    from: UserId,
    to: UserId,
  ) -> Result<Relationship> {
    self.admit_pair(cx, from, to).await?;

    let now = self.clock.now();
    let _guard = self.pair_locks.lock(cx, pair(from, to)).await?;
    let between = self.between(cx, from, to).await?;

    let mut rejected = 0usize;
    let mut suppressed = 0usize;
    for rel in between.iter().filter(|r| r.kind.is_suppressible()) {
      let change = match rel.status {
        RelationshipStatus::Pending => {
          rejected += 1;
          StatusChange::to(RelationshipStatus::Pending, RelationshipStatus::Rejected)
        }
        status @ (RelationshipStatus::Active | RelationshipStatus::Accepted) => {
          suppressed += 1;
          StatusChange {
            expected:        status,
            status:          RelationshipStatus::Blocked,
            suppressed_from: Some(status),
          }
        }
        _ => continue,
      };
      self.set_status(cx, rel.relationship_id, change, now).await?;
    }

    if let Some(existing) = between.iter().find(|r| {
      r.kind == RelationshipKind::Block && r.from_user == from && r.to_user == to
    }) {
      return Ok(existing.clone());
    }

    let block = cx
      .write(self.store.insert(Relationship::new(from, to, RelationshipKind::Block, now)))
      .await?;
    tracing::info!(%from, %to, rejected, suppressed, "user blocked");
    self
      .detector
      .observe(cx, GraphSignal::UserBlocked { blocker: from, blocked: to }, now)
      .await;
    Ok(block)
  }

  /// Lift `from`'s block on `to`. Suppressed rows come back in their prior
  /// status unless `to` is still blocking `from`. Rejected requests stay
  /// rejected.
  pub async fn unblock_user(
    &self,
    cx: &OpContext,
    from: UserId,
    to: UserId,
  ) -> Result<Option<Relationship>> {
    let now = self.clock.now();
    let _guard = self.pair_locks.lock(cx, pair(from, to)).await?;
    let between = self.between(cx, from, to).await?;

    let is_block_from = |r: &Relationship, a: UserId| {
      r.kind == RelationshipKind::Block && r.from_user == a
    };
    let Some(block) = between.iter().find(|r| is_block_from(r, from)) else {
      return Ok(None);
    };

    let lifted = self
      .set_status(
        cx,
        block.relationship_id,
        StatusChange::to(block.status, RelationshipStatus::Removed),
        now,
      )
      .await?;

    if between.iter().any(|r| is_block_from(r, to)) {
      tracing::info!(%from, %to, "block lifted; reverse block keeps rows suppressed");
      return Ok(Some(lifted));
    }

    let mut restored = 0usize;
    for rel in between.iter().filter(|r| r.status == RelationshipStatus::Blocked) {
      let status = rel.suppressed_from.unwrap_or_else(|| rel.kind.initial_status());
      let change = StatusChange {
        expected:        RelationshipStatus::Blocked,
        status,
        suppressed_from: None,
      };
      self.set_status(cx, rel.relationship_id, change, now).await?;
      restored += 1;
    }
    tracing::info!(%from, %to, restored, "block lifted");
    Ok(Some(lifted))
  }

  // ─── Queries ───────────────────────────────────────────────────────────────

  pub async fn get_relationship(&self, cx: &OpContext, id: Uuid) -> Result<Relationship> {
    self
      .fetch(cx, id)
      .await?
      .ok_or_else(|| Error::NotFound(format!("relationship {id}")))
  }

  /// Rows touching `user`, newest first. Without a status filter removed
  /// and suppressed rows are left out.
  pub async fn list_relationships(
    &self,
    cx: &OpContext,
    user: UserId,
    filter: RelationshipFilter,
    page: PageRequest,
  ) -> Result<Page<Relationship>> {
    let store = &*self.store;
    let (items, total) = cx
      .read(self.backoff, move || store.list_by_user(user, filter, page))
      .await?;
    Ok(Page { items, total })
  }

  /// Friend requests waiting for `user` to answer.
  pub async fn pending_requests(
    &self,
    cx: &OpContext,
    user: UserId,
    page: PageRequest,
  ) -> Result<Page<Relationship>> {
    let filter = RelationshipFilter {
      kind:      Some(RelationshipKind::FriendRequest),
      status:    Some(RelationshipStatus::Pending),
      direction: Direction::Incoming,
    };
    self.list_relationships(cx, user, filter, page).await
  }

  pub async fn stats(&self, cx: &OpContext, user: UserId) -> Result<RelationshipStats> {
    use Direction::*;
    use RelationshipKind::*;
    use RelationshipStatus::*;

    Ok(RelationshipStats {
      followers:        self.count(cx, user, Follow, Active, Incoming).await?,
      following:        self.count(cx, user, Follow, Active, Outgoing).await?,
      friends:          self.count(cx, user, FriendRequest, Accepted, Both).await?,
      pending_incoming: self.count(cx, user, FriendRequest, Pending, Incoming).await?,
      pending_outgoing: self.count(cx, user, FriendRequest, Pending, Outgoing).await?,
      blocking:         self.count(cx, user, Block, Active, Outgoing).await?,
      muting:           self.count(cx, user, Mute, Active, Outgoing).await?,
    })
  }

  /// Whether an accepted friend request exists in either direction.
  pub async fn are_friends(&self, cx: &OpContext, a: UserId, b: UserId) -> Result<bool> {
    Ok(self.between(cx, a, b).await?.iter().any(|r| {
      r.kind == RelationshipKind::FriendRequest && r.status == RelationshipStatus::Accepted
    }))
  }

  // ─── Account groups ────────────────────────────────────────────────────────

  pub async fn create_group_with_user(
    &self,
    cx: &OpContext,
    user: UserId,
    is_primary: bool,
  ) -> Result<AccountGroup> {
    self.linker.create_group_with_user(cx, user, is_primary, self.clock.now()).await
  }

  pub async fn add_user_to_group(
    &self,
    cx: &OpContext,
    group_id: Uuid,
    user: UserId,
    is_primary: bool,
  ) -> Result<()> {
    self.linker.add_user_to_group(cx, group_id, user, is_primary, self.clock.now()).await
  }

  /// Returns `true` if the removal dissolved the group.
  pub async fn remove_user_from_group(
    &self,
    cx: &OpContext,
    group_id: Uuid,
    user: UserId,
  ) -> Result<bool> {
    self.linker.remove_user_from_group(cx, group_id, user, self.clock.now()).await
  }

  pub async fn set_primary_account(
    &self,
    cx: &OpContext,
    group_id: Uuid,
    user: UserId,
  ) -> Result<()> {
    self.linker.set_primary_account(cx, group_id, user).await
  }

  pub async fn verify_same_group(&self, cx: &OpContext, a: UserId, b: UserId) -> Result<bool> {
    self.linker.verify_same_group(cx, a, b).await
  }

  pub async fn group_for_user(&self, cx: &OpContext, user: UserId) -> Result<Option<Uuid>> {
    self.linker.group_for_user(cx, user).await
  }

  pub async fn members_of(&self, cx: &OpContext, group_id: Uuid) -> Result<GroupView> {
    self.linker.members_of(cx, group_id).await
  }

  // ─── Rate limits ───────────────────────────────────────────────────────────

  /// Zero the budget for `action` of whichever principal `user` resolves to.
  pub async fn reset_rate_limit(&self, cx: &OpContext, user: UserId, action: &str) -> Result<()> {
    let principal = self.linker.principal_for(cx, user).await?;
    self.limiter.reset(cx, principal, action, self.clock.now()).await
  }

  pub async fn rate_limit_record(
    &self,
    cx: &OpContext,
    user: UserId,
    action: &str,
  ) -> Result<Option<RateLimitRecord>> {
    let principal = self.linker.principal_for(cx, user).await?;
    self.limiter.record(cx, principal, action).await
  }

  // ─── Spam flags ────────────────────────────────────────────────────────────

  pub async fn record_signal(
    &self,
    cx: &OpContext,
    user: UserId,
    detection: DetectionType,
    evidence: f64,
  ) -> Result<SpamFlag> {
    self.detector.record_signal(cx, user, detection, evidence, self.clock.now()).await
  }

  pub async fn active_flags(&self, cx: &OpContext, user: UserId) -> Result<Vec<SpamFlag>> {
    self.detector.active_flags(cx, user).await
  }

  pub async fn flags_for_user(&self, cx: &OpContext, user: UserId) -> Result<Vec<SpamFlag>> {
    self.detector.flags_for_user(cx, user).await
  }

  pub async fn reset_flag(
    &self,
    cx: &OpContext,
    user: UserId,
    detection: DetectionType,
  ) -> Result<Option<SpamFlag>> {
    self.detector.reset_flag(cx, user, detection, self.clock.now()).await
  }

  pub async fn reset_all_flags(&self, cx: &OpContext, user: UserId) -> Result<usize> {
    self.detector.reset_all(cx, user, self.clock.now()).await
  }

  // ─── Store helpers ─────────────────────────────────────────────────────────

  async fn fetch(&self, cx: &OpContext, id: Uuid) -> Result<Option<Relationship>> {
    let store = &*self.store;
    cx.read(self.backoff, move || store.get(id)).await
  }

  async fn between(&self, cx: &OpContext, a: UserId, b: UserId) -> Result<Vec<Relationship>> {
    let store = &*self.store;
    cx.read(self.backoff, move || store.list_between(a, b)).await
  }

  async fn set_status(
    &self,
    cx: &OpContext,
    id: Uuid,
    change: StatusChange,
    at: DateTime<Utc>,
  ) -> Result<Relationship> {
    cx.write(self.store.update_status(id, change, at)).await
  }

  async fn count(
    &self,
    cx: &OpContext,
    user: UserId,
    kind: RelationshipKind,
    status: RelationshipStatus,
    direction: Direction,
  ) -> Result<u64> {
    let filter = RelationshipFilter { kind: Some(kind), status: Some(status), direction };
    let page = self
      .list_relationships(cx, user, filter, PageRequest::count_only())
      .await?;
    Ok(page.total)
  }
}
