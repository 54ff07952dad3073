//! Relationship rows — the directed edges of the social graph.
//!
//! Every row is asymmetric: it points from the acting user to the target.
//! Mutual friendship is represented by a single `FriendRequest` row in the
//! [`RelationshipStatus::Accepted`] state; no complementary row is written.
//! Rows are never deleted. Retirement is a transition to
//! [`RelationshipStatus::Removed`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::UserId;

// ─── Kind & status ───────────────────────────────────────────────────────────

/// The type of edge. Doubles as the rate-limit action name.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RelationshipKind {
  Follow,
  FriendRequest,
  Block,
  Mute,
}

impl RelationshipKind {
  /// The status a freshly created row of this kind starts in.
  pub fn initial_status(self) -> RelationshipStatus {
    match self {
      Self::FriendRequest => RelationshipStatus::Pending,
      Self::Follow | Self::Block | Self::Mute => RelationshipStatus::Active,
    }
  }

  /// Kinds whose rows are hidden while a block exists between the pair.
  pub fn is_suppressible(self) -> bool {
    matches!(self, Self::Follow | Self::FriendRequest)
  }

  pub fn action(self) -> &'static str { self.into() }
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RelationshipStatus {
  /// Awaiting the target's answer (friend requests only).
  Pending,
  Accepted,
  Rejected,
  /// In force without an approval step (follow, block, mute).
  Active,
  Removed,
  /// Suppressed by a block between the pair; the prior status is kept in
  /// [`Relationship::suppressed_from`].
  Blocked,
}

impl RelationshipStatus {
  pub fn is_live(self) -> bool { self != Self::Removed }

  /// Whether the row counts as an existing relationship on default read
  /// paths.
  pub fn is_visible(self) -> bool { !matches!(self, Self::Removed | Self::Blocked) }
}

/// Which end of the edge the queried user sits on.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  /// Rows where the user is `from_user`.
  #[default]
  Outgoing,
  /// Rows where the user is `to_user`.
  Incoming,
  Both,
}

// ─── Row ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
  pub relationship_id: Uuid,
  pub from_user:       UserId,
  pub to_user:         UserId,
  pub kind:            RelationshipKind,
  pub status:          RelationshipStatus,
  /// Status to restore when the suppressing block is lifted. Only set while
  /// `status` is [`RelationshipStatus::Blocked`].
  pub suppressed_from: Option<RelationshipStatus>,
  pub created_at:      DateTime<Utc>,
  pub updated_at:      DateTime<Utc>,
}

impl Relationship {
  pub fn new(
    from_user: UserId,
    to_user: UserId,
    kind: RelationshipKind,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      relationship_id: Uuid::new_v4(),
      from_user,
      to_user,
      kind,
      status: kind.initial_status(),
      suppressed_from: None,
      created_at: now,
      updated_at: now,
    }
  }

  /// True if this row connects `a` and `b`, in either direction.
  pub fn joins(&self, a: UserId, b: UserId) -> bool {
    (self.from_user == a && self.to_user == b)
      || (self.from_user == b && self.to_user == a)
  }
}

/// A requested status change, applied only if the row still has the
/// `expected` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
  pub expected:        RelationshipStatus,
  pub status:          RelationshipStatus,
  pub suppressed_from: Option<RelationshipStatus>,
}

impl StatusChange {
  pub fn to(expected: RelationshipStatus, status: RelationshipStatus) -> Self {
    Self { expected, status, suppressed_from: None }
  }
}

// ─── Queries ─────────────────────────────────────────────────────────────────

/// Filter for [`crate::store::RelationshipStore::list_by_user`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelationshipFilter {
  pub kind:      Option<RelationshipKind>,
  /// When `None`, only visible rows are returned (neither Removed nor
  /// Blocked).
  pub status:    Option<RelationshipStatus>,
  pub direction: Direction,
}

impl RelationshipFilter {
  pub fn matches(&self, user: UserId, rel: &Relationship) -> bool {
    let direction_ok = match self.direction {
      Direction::Outgoing => rel.from_user == user,
      Direction::Incoming => rel.to_user == user,
      Direction::Both => rel.from_user == user || rel.to_user == user,
    };
    let kind_ok = self.kind.is_none_or(|k| k == rel.kind);
    let status_ok = match self.status {
      Some(s) => s == rel.status,
      None => rel.status.is_visible(),
    };
    direction_ok && kind_ok && status_ok
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
  pub limit:  usize,
  pub offset: usize,
}

impl PageRequest {
  pub const DEFAULT_LIMIT: usize = 50;

  pub fn new(limit: usize, offset: usize) -> Self { Self { limit, offset } }

  /// A zero-length page, used when only the total is wanted.
  pub fn count_only() -> Self { Self { limit: 0, offset: 0 } }
}

impl Default for PageRequest {
  fn default() -> Self { Self { limit: Self::DEFAULT_LIMIT, offset: 0 } }
}

/// One page of results plus the total number of matching rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
  pub items: Vec<T>,
  pub total: u64,
}

/// Sort key shared by every listing: newest first, id as the tie-break.
pub fn page_order(a: &Relationship, b: &Relationship) -> std::cmp::Ordering {
  b.created_at
    .cmp(&a.created_at)
    .then_with(|| a.relationship_id.cmp(&b.relationship_id))
}

/// Per-user relationship counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipStats {
  pub followers:        u64,
  pub following:        u64,
  pub friends:          u64,
  pub pending_incoming: u64,
  pub pending_outgoing: u64,
  pub blocking:         u64,
  pub muting:           u64,
}
