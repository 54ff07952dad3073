//! Store traits consumed by the graph engine.
//!
//! The traits are implemented by storage backends ([`crate::memory`] and
//! `rapport-store-sqlite`). All four share one error type, declared once on
//! [`StoreBackend`], so a single backend value can serve every component.
//!
//! Backends must make each individual call atomic. In particular
//! [`RelationshipStore::insert`] must reject a second live row for the same
//! `(from, to, kind)` with a [`StoreErrorKind::Constraint`] error, and the
//! group mutations must apply as a unit.
//!
//! Cancellation follows the usual async contract: the engine drops the
//! returned future when the caller's context is cancelled.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  UserId,
  account_group::{AccountGroup, GroupMember, MemberRemoval},
  rate_limit::{Principal, RateLimitRecord},
  relationship::{
    Direction, PageRequest, Relationship, RelationshipFilter, RelationshipKind,
    StatusChange,
  },
  spam::{DetectionType, SpamFlag},
};

// ─── Error classification ────────────────────────────────────────────────────

/// Coarse classes of backend failure. The engine uses these to decide
/// between retrying, propagating, and treating a failure as a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
  NotFound,
  /// A uniqueness or conditional-update check failed.
  Constraint,
  /// Busy, locked, or disconnected; the call may succeed if repeated.
  Transient,
  Other,
}

pub trait StoreFailure: std::error::Error + Send + Sync + 'static {
  fn kind(&self) -> StoreErrorKind;
}

/// Shared error type for a backend.
pub trait StoreBackend: Send + Sync {
  type Error: StoreFailure;
}

// ─── Relationships ───────────────────────────────────────────────────────────

pub trait RelationshipStore: StoreBackend {
  fn get(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<Relationship>, Self::Error>> + Send + '_;

  /// The live (non-Removed) row for the tuple, if any.
  fn find(
    &self,
    from: UserId,
    to: UserId,
    kind: RelationshipKind,
  ) -> impl Future<Output = Result<Option<Relationship>, Self::Error>> + Send + '_;

  /// Every live row between `a` and `b`, in both directions.
  fn list_between(
    &self,
    a: UserId,
    b: UserId,
  ) -> impl Future<Output = Result<Vec<Relationship>, Self::Error>> + Send + '_;

  /// Insert a new row. Fails with a constraint error if a live row already
  /// exists for the tuple.
  fn insert(
    &self,
    rel: Relationship,
  ) -> impl Future<Output = Result<Relationship, Self::Error>> + Send + '_;

  /// Apply `change` if the row's current status equals `change.expected`.
  /// Fails with a constraint error on a status mismatch and not-found if the
  /// row is missing.
  fn update_status(
    &self,
    id: Uuid,
    change: StatusChange,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<Relationship, Self::Error>> + Send + '_;

  /// Rows touching `user` that match `filter`, ordered `created_at DESC,
  /// relationship_id ASC`, together with the total match count.
  fn list_by_user(
    &self,
    user: UserId,
    filter: RelationshipFilter,
    page: PageRequest,
  ) -> impl Future<Output = Result<(Vec<Relationship>, u64), Self::Error>> + Send + '_;

  /// Rows of `kind` touching `user` on the given side created at or after
  /// `since`, regardless of their current status.
  fn count_since(
    &self,
    user: UserId,
    kind: RelationshipKind,
    direction: Direction,
    since: DateTime<Utc>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;
}

// ─── Rate limits ─────────────────────────────────────────────────────────────

pub trait RateLimitStore: StoreBackend {
  fn get_rate_limit<'a>(
    &'a self,
    principal: Principal,
    action: &'a str,
  ) -> impl Future<Output = Result<Option<RateLimitRecord>, Self::Error>> + Send + 'a;

  /// Unconditionally write `record`.
  fn upsert_rate_limit(
    &self,
    record: RateLimitRecord,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Write `new` only if the stored record still equals `expected` (or is
  /// absent when `expected` is `None`). Returns whether the write applied.
  fn compare_and_set_rate_limit(
    &self,
    expected: Option<RateLimitRecord>,
    new: RateLimitRecord,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;
}

// ─── Spam flags ──────────────────────────────────────────────────────────────

pub trait SpamFlagStore: StoreBackend {
  fn get_flag(
    &self,
    user: UserId,
    detection: DetectionType,
  ) -> impl Future<Output = Result<Option<SpamFlag>, Self::Error>> + Send + '_;

  fn upsert_flag(
    &self,
    flag: SpamFlag,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn list_flags_for_user(
    &self,
    user: UserId,
  ) -> impl Future<Output = Result<Vec<SpamFlag>, Self::Error>> + Send + '_;
}

// ─── Account groups ──────────────────────────────────────────────────────────

pub trait AccountGroupStore: StoreBackend {
  /// The group id `user` currently belongs to.
  fn group_for_user(
    &self,
    user: UserId,
  ) -> impl Future<Output = Result<Option<Uuid>, Self::Error>> + Send + '_;

  /// A group that has not been dissolved.
  fn get_group(
    &self,
    group_id: Uuid,
  ) -> impl Future<Output = Result<Option<AccountGroup>, Self::Error>> + Send + '_;

  fn members_of(
    &self,
    group_id: Uuid,
  ) -> impl Future<Output = Result<Vec<GroupMember>, Self::Error>> + Send + '_;

  /// Create `group` with its single founding member. Constraint error if the
  /// member already belongs to a group.
  fn insert_group(
    &self,
    group: AccountGroup,
    founder: GroupMember,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Add `member`; when `member.is_primary`, the current primary is demoted
  /// in the same transaction. Constraint error if the user is already
  /// grouped; not-found if the group is missing or dissolved.
  fn add_member(
    &self,
    group_id: Uuid,
    member: GroupMember,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  /// Remove `user`. When one member or none is left, the group is marked
  /// dissolved at `at` and the remaining membership released in the same
  /// transaction.
  fn remove_member(
    &self,
    group_id: Uuid,
    user: UserId,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<MemberRemoval, Self::Error>> + Send + '_;

  /// Demote the current primary and promote `user` as one unit.
  fn set_primary(
    &self,
    group_id: Uuid,
    user: UserId,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}

// ─── Composite ───────────────────────────────────────────────────────────────

/// Everything the graph engine needs from a backend.
pub trait GraphStore:
  RelationshipStore + RateLimitStore + SpamFlagStore + AccountGroupStore
{
}

impl<T> GraphStore for T where
  T: RelationshipStore + RateLimitStore + SpamFlagStore + AccountGroupStore
{
}
