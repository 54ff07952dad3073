//! End-to-end scenarios for `SocialGraph` against the in-memory backend.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::{
  Error, SocialGraph, UserId,
  clock::ManualClock,
  config::GraphConfig,
  context::OpContext,
  memory::MemoryStore,
  rate_limit::{Principal, RateLimitRule},
  relationship::{
    Direction, PageRequest, RelationshipFilter, RelationshipKind,
    RelationshipStatus,
  },
  spam::DetectionType,
  store::RelationshipStore,
};

use RelationshipKind::{Block, Follow, FriendRequest, Mute};

fn t0() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() }

fn user() -> UserId { Uuid::new_v4() }

struct Harness {
  graph: SocialGraph<MemoryStore, Arc<ManualClock>>,
  store: Arc<MemoryStore>,
  clock: Arc<ManualClock>,
  cx:    OpContext,
}

fn config() -> GraphConfig {
  GraphConfig { read_retry_backoff_ms: 1, ..GraphConfig::default() }
}

fn harness_with(config: GraphConfig) -> Harness {
  let store = Arc::new(MemoryStore::new());
  let clock = Arc::new(ManualClock::new(t0()));
  let graph = SocialGraph::with_clock(store.clone(), config, clock.clone());
  Harness { graph, store, clock, cx: OpContext::new() }
}

fn harness() -> Harness { harness_with(config()) }

/// No two live rows may share `(from, to, kind)`.
async fn assert_one_live_row_per_tuple(h: &Harness, a: UserId, b: UserId) {
  let rows = h.store.list_between(a, b).await.unwrap();
  let mut seen = HashSet::new();
  for rel in rows {
    assert!(
      seen.insert((rel.from_user, rel.to_user, rel.kind)),
      "duplicate live {} from {} to {}",
      rel.kind,
      rel.from_user,
      rel.to_user
    );
  }
}

// ─── Creation ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn follow_is_active_and_duplicates_conflict() {
  let h = harness();
  let (a, b) = (user(), user());

  let rel = h.graph.request_relationship(&h.cx, a, b, Follow).await.unwrap();
  assert_eq!(rel.status, RelationshipStatus::Active);
  assert_eq!(rel.created_at, t0());

  let again = h.graph.request_relationship(&h.cx, a, b, Follow).await;
  assert!(matches!(again, Err(Error::Conflict(_))));
  assert_eq!(h.store.relationship_count(), 1);

  // The reverse direction is a different tuple.
  h.graph.request_relationship(&h.cx, b, a, Follow).await.unwrap();
  let mute = h.graph.request_relationship(&h.cx, a, b, Mute).await.unwrap();
  assert_eq!(mute.status, RelationshipStatus::Active);
}

#[tokio::test]
async fn self_reference_is_rejected() {
  let h = harness();
  let a = user();
  for kind in [Follow, FriendRequest, Block, Mute] {
    let res = h.graph.request_relationship(&h.cx, a, a, kind).await;
    assert!(matches!(res, Err(Error::SelfReference)), "{kind}");
  }
}

#[tokio::test]
async fn friend_request_accept_flow() {
  let h = harness();
  let (a, b) = (user(), user());

  let req = h.graph.request_relationship(&h.cx, a, b, FriendRequest).await.unwrap();
  assert_eq!(req.status, RelationshipStatus::Pending);

  let pending = h.graph.pending_requests(&h.cx, b, PageRequest::default()).await.unwrap();
  assert_eq!(pending.total, 1);
  assert_eq!(pending.items[0].relationship_id, req.relationship_id);

  let accepted = h
    .graph
    .respond_to_request(&h.cx, b, req.relationship_id, true)
    .await
    .unwrap();
  assert_eq!(accepted.status, RelationshipStatus::Accepted);
  assert!(h.graph.are_friends(&h.cx, a, b).await.unwrap());
  assert!(h.graph.are_friends(&h.cx, b, a).await.unwrap());

  // Friendship is one row; asking from the other side conflicts.
  let back = h.graph.request_relationship(&h.cx, b, a, FriendRequest).await;
  assert!(matches!(back, Err(Error::Conflict(_))));

  let sa = h.graph.stats(&h.cx, a).await.unwrap();
  let sb = h.graph.stats(&h.cx, b).await.unwrap();
  assert_eq!(sa.friends, 1);
  assert_eq!(sb.friends, 1);
  assert_eq!(sb.pending_incoming, 0);
}

#[tokio::test]
async fn respond_checks_addressee_and_state() {
  let h = harness();
  let (a, b, c) = (user(), user(), user());
  let req = h.graph.request_relationship(&h.cx, a, b, FriendRequest).await.unwrap();

  let wrong = h.graph.respond_to_request(&h.cx, c, req.relationship_id, true).await;
  assert!(matches!(wrong, Err(Error::NotFound(_))));
  let sender = h.graph.respond_to_request(&h.cx, a, req.relationship_id, true).await;
  assert!(matches!(sender, Err(Error::NotFound(_))));
  let missing = h.graph.respond_to_request(&h.cx, b, Uuid::new_v4(), true).await;
  assert!(matches!(missing, Err(Error::NotFound(_))));

  h.graph.respond_to_request(&h.cx, b, req.relationship_id, false).await.unwrap();
  let twice = h.graph.respond_to_request(&h.cx, b, req.relationship_id, true).await;
  assert!(matches!(
    twice,
    Err(Error::InvalidState { status: RelationshipStatus::Rejected, .. })
  ));
}

#[tokio::test]
async fn incoming_pending_request_conflicts() {
  let h = harness();
  let (a, b) = (user(), user());
  h.graph.request_relationship(&h.cx, a, b, FriendRequest).await.unwrap();
  let res = h.graph.request_relationship(&h.cx, b, a, FriendRequest).await;
  assert!(matches!(res, Err(Error::Conflict(_))));
}

#[tokio::test]
async fn rejected_request_can_be_asked_again() {
  let h = harness();
  let (a, b) = (user(), user());
  let first = h.graph.request_relationship(&h.cx, a, b, FriendRequest).await.unwrap();
  h.graph.respond_to_request(&h.cx, b, first.relationship_id, false).await.unwrap();

  h.clock.advance(chrono::Duration::hours(1));
  let second = h.graph.request_relationship(&h.cx, a, b, FriendRequest).await.unwrap();
  assert_ne!(second.relationship_id, first.relationship_id);
  assert_eq!(second.status, RelationshipStatus::Pending);

  let old = h.graph.get_relationship(&h.cx, first.relationship_id).await.unwrap();
  assert_eq!(old.status, RelationshipStatus::Removed);
  assert_one_live_row_per_tuple(&h, a, b).await;
}

#[tokio::test]
async fn failed_re_request_leaves_the_rejected_row_alone() {
  let h = harness();
  let (a, b) = (user(), user());
  let first = h.graph.request_relationship(&h.cx, a, b, FriendRequest).await.unwrap();
  h.graph.respond_to_request(&h.cx, b, first.relationship_id, false).await.unwrap();
  h.graph.request_relationship(&h.cx, b, a, FriendRequest).await.unwrap();

  let res = h.graph.request_relationship(&h.cx, a, b, FriendRequest).await;
  assert!(matches!(res, Err(Error::Conflict(_))));

  let old = h.graph.get_relationship(&h.cx, first.relationship_id).await.unwrap();
  assert_eq!(old.status, RelationshipStatus::Rejected);
  assert_one_live_row_per_tuple(&h, a, b).await;
}

// ─── Guards ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn same_account_group_wins_over_spam_and_rate_limits() {
  let mut config = config();
  config.rate_limits.friend_request = RateLimitRule { limit: 0, window_secs: 60 };
  let h = harness_with(config);
  let (a, b, c, d) = (user(), user(), user(), user());

  let g = h.graph.create_group_with_user(&h.cx, a, true).await.unwrap();
  h.graph.add_user_to_group(&h.cx, g.group_id, b, false).await.unwrap();
  h.graph
    .record_signal(&h.cx, a, DetectionType::MassPending, 10.0)
    .await
    .unwrap();

  let linked = h.graph.request_relationship(&h.cx, a, b, FriendRequest).await;
  assert!(matches!(linked, Err(Error::SameAccountGroup)));
  let block = h.graph.block_user(&h.cx, b, a).await;
  assert!(matches!(block, Err(Error::SameAccountGroup)));

  // Restriction is checked before the rate limit.
  let restricted = h.graph.request_relationship(&h.cx, a, c, FriendRequest).await;
  assert!(matches!(restricted, Err(Error::Restricted { .. })));

  let limited = h.graph.request_relationship(&h.cx, d, c, FriendRequest).await;
  assert!(matches!(limited, Err(Error::RateLimited { .. })));
}

#[tokio::test]
async fn mass_pending_score_restricts_friend_requests_only() {
  let h = harness();
  let (a, b) = (user(), user());

  let flag = h
    .graph
    .record_signal(&h.cx, a, DetectionType::MassPending, 10.0)
    .await
    .unwrap();
  assert_eq!(flag.score, 100.0);

  let res = h.graph.request_relationship(&h.cx, a, b, FriendRequest).await;
  match res {
    Err(Error::Restricted { detection, score }) => {
      assert_eq!(detection, DetectionType::MassPending);
      assert_eq!(score, 100.0);
    }
    other => panic!("expected restriction, got {other:?}"),
  }
  // Rate-limit capacity was untouched.
  assert!(h.graph.rate_limit_record(&h.cx, a, "friend_request").await.unwrap().is_none());

  h.graph.request_relationship(&h.cx, a, b, Follow).await.unwrap();

  h.graph.reset_flag(&h.cx, a, DetectionType::MassPending).await.unwrap();
  h.graph.request_relationship(&h.cx, a, b, FriendRequest).await.unwrap();
}

#[tokio::test]
async fn rate_limit_denies_then_recovers_after_window() {
  let mut config = config();
  config.rate_limits.follow = RateLimitRule::new(2, Duration::from_secs(60));
  let h = harness_with(config);
  let (a, b, c, d) = (user(), user(), user(), user());

  h.graph.request_relationship(&h.cx, a, b, Follow).await.unwrap();
  h.graph.request_relationship(&h.cx, a, c, Follow).await.unwrap();
  match h.graph.request_relationship(&h.cx, a, d, Follow).await {
    Err(Error::RateLimited { action, retry_after }) => {
      assert_eq!(action, "follow");
      assert_eq!(retry_after, Duration::from_secs(60));
    }
    other => panic!("expected rate limit, got {other:?}"),
  }

  // The denial was reported as rate-limit pressure.
  let flags = h.graph.flags_for_user(&h.cx, a).await.unwrap();
  assert_eq!(flags.len(), 1);
  assert_eq!(flags[0].detection_type, DetectionType::RateLimitPressure);
  assert_eq!(flags[0].score, 5.0);

  h.clock.advance(chrono::Duration::seconds(61));
  h.graph.request_relationship(&h.cx, a, d, Follow).await.unwrap();
  let rec = h.graph.rate_limit_record(&h.cx, a, "follow").await.unwrap().unwrap();
  assert_eq!(rec.count, 1);
  assert_eq!(rec.principal, Principal::User(a));
}

#[tokio::test]
async fn retrying_into_the_limit_escalates_to_a_restriction() {
  let mut config = config();
  config.rate_limits.follow = RateLimitRule::new(1, Duration::from_secs(60));
  let h = harness_with(config);
  let a = user();

  h.graph.request_relationship(&h.cx, a, user(), Follow).await.unwrap();

  // 5 for the first denial, 7.5 for each one inside the burst window.
  for _ in 0..11 {
    let res = h.graph.request_relationship(&h.cx, a, user(), Follow).await;
    assert!(matches!(res, Err(Error::RateLimited { .. })), "got {res:?}");
  }
  let res = h.graph.request_relationship(&h.cx, a, user(), FriendRequest).await;
  match res {
    Err(Error::Restricted { detection, score }) => {
      assert_eq!(detection, DetectionType::RateLimitPressure);
      assert_eq!(score, 80.0);
    }
    other => panic!("expected restriction, got {other:?}"),
  }

  // The limit window passing does not lift it.
  h.clock.advance(chrono::Duration::seconds(3600));
  let res = h.graph.request_relationship(&h.cx, a, user(), Follow).await;
  assert!(matches!(res, Err(Error::Restricted { .. })), "got {res:?}");

  h.graph.reset_flag(&h.cx, a, DetectionType::RateLimitPressure).await.unwrap();
  h.graph.request_relationship(&h.cx, a, user(), Follow).await.unwrap();
}

#[tokio::test]
async fn linked_accounts_share_one_budget() {
  let mut config = config();
  config.rate_limits.follow = RateLimitRule::new(2, Duration::from_secs(60));
  let h = harness_with(config);
  let (a, b, outsider) = (user(), user(), user());

  let g = h.graph.create_group_with_user(&h.cx, a, true).await.unwrap();
  h.graph.add_user_to_group(&h.cx, g.group_id, b, false).await.unwrap();

  h.graph.request_relationship(&h.cx, a, user(), Follow).await.unwrap();
  h.graph.request_relationship(&h.cx, b, user(), Follow).await.unwrap();
  let res = h.graph.request_relationship(&h.cx, a, user(), Follow).await;
  assert!(matches!(res, Err(Error::RateLimited { .. })));

  let rec = h.graph.rate_limit_record(&h.cx, b, "follow").await.unwrap().unwrap();
  assert_eq!(rec.principal, Principal::Group(g.group_id));
  assert_eq!(rec.count, 2);

  h.graph.request_relationship(&h.cx, outsider, a, Follow).await.unwrap();

  h.graph.reset_rate_limit(&h.cx, a, "follow").await.unwrap();
  h.graph.request_relationship(&h.cx, b, user(), Follow).await.unwrap();
}

#[tokio::test]
async fn blocks_are_never_rate_limited() {
  let mut config = config();
  config.rate_limits.follow = RateLimitRule { limit: 0, window_secs: 60 };
  config.rate_limits.friend_request = RateLimitRule { limit: 0, window_secs: 60 };
  let h = harness_with(config);
  let a = user();
  for _ in 0..5 {
    h.graph.block_user(&h.cx, a, user()).await.unwrap();
  }
  assert_eq!(h.graph.stats(&h.cx, a).await.unwrap().blocking, 5);
}

// ─── Removal ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn remove_is_idempotent() {
  let h = harness();
  let (a, b) = (user(), user());
  h.graph.request_relationship(&h.cx, a, b, Follow).await.unwrap();

  let first = h.graph.remove_relationship(&h.cx, a, b, Follow).await.unwrap();
  assert_eq!(first.unwrap().status, RelationshipStatus::Removed);
  let second = h.graph.remove_relationship(&h.cx, a, b, Follow).await.unwrap();
  assert!(second.is_none());

  let never = h.graph.remove_relationship(&h.cx, b, a, Mute).await.unwrap();
  assert!(never.is_none());
  assert_eq!(h.graph.stats(&h.cx, a).await.unwrap().following, 0);
}

#[tokio::test]
async fn either_friend_can_unfriend() {
  let h = harness();
  let (a, b) = (user(), user());
  let req = h.graph.request_relationship(&h.cx, a, b, FriendRequest).await.unwrap();
  h.graph.respond_to_request(&h.cx, b, req.relationship_id, true).await.unwrap();

  let removed = h
    .graph
    .remove_relationship(&h.cx, b, a, FriendRequest)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(removed.relationship_id, req.relationship_id);
  assert!(!h.graph.are_friends(&h.cx, a, b).await.unwrap());

  h.graph.request_relationship(&h.cx, a, b, FriendRequest).await.unwrap();
}

#[tokio::test]
async fn removing_a_suppressed_row_survives_unblock() {
  let h = harness();
  let (a, b) = (user(), user());
  let follow = h.graph.request_relationship(&h.cx, a, b, Follow).await.unwrap();
  h.graph.block_user(&h.cx, a, b).await.unwrap();
  assert_eq!(h.graph.stats(&h.cx, a).await.unwrap().following, 0);

  let removed = h
    .graph
    .remove_relationship(&h.cx, a, b, Follow)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(removed.relationship_id, follow.relationship_id);
  assert_eq!(removed.status, RelationshipStatus::Removed);
  assert_eq!(removed.suppressed_from, None);

  h.graph.unblock_user(&h.cx, a, b).await.unwrap();
  assert_eq!(h.graph.stats(&h.cx, a).await.unwrap().following, 0);
  let again = h.graph.remove_relationship(&h.cx, a, b, Follow).await.unwrap();
  assert!(again.is_none());
}

#[tokio::test]
async fn either_friend_can_drop_a_suppressed_friendship() {
  let h = harness();
  let (a, b) = (user(), user());
  let req = h.graph.request_relationship(&h.cx, a, b, FriendRequest).await.unwrap();
  h.graph.respond_to_request(&h.cx, b, req.relationship_id, true).await.unwrap();
  h.graph.block_user(&h.cx, b, a).await.unwrap();

  let removed = h.graph.remove_relationship(&h.cx, b, a, FriendRequest).await.unwrap();
  assert_eq!(removed.unwrap().relationship_id, req.relationship_id);

  h.graph.unblock_user(&h.cx, b, a).await.unwrap();
  assert!(!h.graph.are_friends(&h.cx, a, b).await.unwrap());
}

// ─── Blocking ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn block_cascades_and_unblock_restores() {
  let h = harness();
  let (a, b) = (user(), user());

  let follow = h.graph.request_relationship(&h.cx, a, b, Follow).await.unwrap();
  let back = h.graph.request_relationship(&h.cx, b, a, Follow).await.unwrap();
  let req = h.graph.request_relationship(&h.cx, b, a, FriendRequest).await.unwrap();
  let mute = h.graph.request_relationship(&h.cx, a, b, Mute).await.unwrap();

  let block = h.graph.block_user(&h.cx, a, b).await.unwrap();
  assert_eq!(block.kind, Block);
  assert_eq!(block.status, RelationshipStatus::Active);

  let get = |id| h.graph.get_relationship(&h.cx, id);
  let f = get(follow.relationship_id).await.unwrap();
  assert_eq!(f.status, RelationshipStatus::Blocked);
  assert_eq!(f.suppressed_from, Some(RelationshipStatus::Active));
  assert_eq!(get(back.relationship_id).await.unwrap().status, RelationshipStatus::Blocked);
  assert_eq!(get(req.relationship_id).await.unwrap().status, RelationshipStatus::Rejected);
  assert_eq!(get(mute.relationship_id).await.unwrap().status, RelationshipStatus::Active);

  // Suppressed rows are hidden from default reads.
  let following = h
    .graph
    .list_relationships(
      &h.cx,
      a,
      RelationshipFilter { kind: Some(Follow), ..Default::default() },
      PageRequest::default(),
    )
    .await
    .unwrap();
  assert_eq!(following.total, 0);

  // Nothing new can be formed across the block, in either direction.
  for (from, to) in [(a, b), (b, a)] {
    let res = h.graph.request_relationship(&h.cx, from, to, FriendRequest).await;
    assert!(matches!(res, Err(Error::Conflict(_))));
  }

  let lifted = h.graph.unblock_user(&h.cx, a, b).await.unwrap().unwrap();
  assert_eq!(lifted.status, RelationshipStatus::Removed);

  let f = get(follow.relationship_id).await.unwrap();
  assert_eq!(f.status, RelationshipStatus::Active);
  assert_eq!(f.suppressed_from, None);
  assert_eq!(get(back.relationship_id).await.unwrap().status, RelationshipStatus::Active);
  // Rejected stays rejected.
  assert_eq!(get(req.relationship_id).await.unwrap().status, RelationshipStatus::Rejected);

  assert!(h.graph.unblock_user(&h.cx, a, b).await.unwrap().is_none());
  assert_one_live_row_per_tuple(&h, a, b).await;
}

#[tokio::test]
async fn blocking_rejects_own_outgoing_request() {
  let h = harness();
  let (a, b) = (user(), user());
  let req = h.graph.request_relationship(&h.cx, a, b, FriendRequest).await.unwrap();

  h.graph.block_user(&h.cx, a, b).await.unwrap();
  let rel = h.graph.get_relationship(&h.cx, req.relationship_id).await.unwrap();
  assert_eq!(rel.status, RelationshipStatus::Rejected);
  let pending = h.graph.pending_requests(&h.cx, b, PageRequest::default()).await.unwrap();
  assert_eq!(pending.total, 0);

  h.graph.unblock_user(&h.cx, a, b).await.unwrap();
  let rel = h.graph.get_relationship(&h.cx, req.relationship_id).await.unwrap();
  assert_eq!(rel.status, RelationshipStatus::Rejected);
}

#[tokio::test]
async fn unblock_restores_accepted_friendship() {
  let h = harness();
  let (a, b) = (user(), user());
  let req = h.graph.request_relationship(&h.cx, a, b, FriendRequest).await.unwrap();
  h.graph.respond_to_request(&h.cx, b, req.relationship_id, true).await.unwrap();

  h.graph.block_user(&h.cx, b, a).await.unwrap();
  assert!(!h.graph.are_friends(&h.cx, a, b).await.unwrap());
  assert_eq!(h.graph.stats(&h.cx, a).await.unwrap().friends, 0);

  h.graph.unblock_user(&h.cx, b, a).await.unwrap();
  assert!(h.graph.are_friends(&h.cx, a, b).await.unwrap());
}

#[tokio::test]
async fn mutual_blocks_keep_rows_suppressed_until_both_lift() {
  let h = harness();
  let (a, b) = (user(), user());
  let follow = h.graph.request_relationship(&h.cx, a, b, Follow).await.unwrap();

  h.graph.block_user(&h.cx, a, b).await.unwrap();
  h.graph.block_user(&h.cx, b, a).await.unwrap();

  h.graph.unblock_user(&h.cx, a, b).await.unwrap();
  let f = h.graph.get_relationship(&h.cx, follow.relationship_id).await.unwrap();
  assert_eq!(f.status, RelationshipStatus::Blocked);

  // Removing a block through the generic path is the same as unblocking.
  let lifted = h.graph.remove_relationship(&h.cx, b, a, Block).await.unwrap();
  assert!(lifted.is_some());
  let f = h.graph.get_relationship(&h.cx, follow.relationship_id).await.unwrap();
  assert_eq!(f.status, RelationshipStatus::Active);
}

#[tokio::test]
async fn blocking_twice_returns_the_same_block() {
  let h = harness();
  let (a, b) = (user(), user());
  let first = h.graph.request_relationship(&h.cx, a, b, Block).await.unwrap();
  let second = h.graph.block_user(&h.cx, a, b).await.unwrap();
  assert_eq!(first.relationship_id, second.relationship_id);
  assert_eq!(h.graph.stats(&h.cx, a).await.unwrap().blocking, 1);
}

// ─── Spam signals ────────────────────────────────────────────────────────────

#[tokio::test]
async fn rapid_follow_cycling_eventually_restricts_follows() {
  let h = harness();
  let (a, b, c) = (user(), user(), user());

  for _ in 0..8 {
    h.graph.request_relationship(&h.cx, a, b, Follow).await.unwrap();
    h.clock.advance(chrono::Duration::minutes(5));
    h.graph.remove_relationship(&h.cx, a, b, Follow).await.unwrap();
    h.clock.advance(chrono::Duration::minutes(1));
  }

  let res = h.graph.request_relationship(&h.cx, a, c, Follow).await;
  assert!(matches!(
    res,
    Err(Error::Restricted { detection: DetectionType::RapidFollowCycling, .. })
  ));
  h.graph.request_relationship(&h.cx, a, c, FriendRequest).await.unwrap();
}

#[tokio::test]
async fn outbound_pending_over_allowance_adds_evidence() {
  let mut config = config();
  config.spam.pending_allowance = 2;
  let h = harness_with(config);
  let a = user();

  for _ in 0..2 {
    h.graph.request_relationship(&h.cx, a, user(), FriendRequest).await.unwrap();
  }
  assert!(h.graph.flags_for_user(&h.cx, a).await.unwrap().is_empty());

  h.graph.request_relationship(&h.cx, a, user(), FriendRequest).await.unwrap();
  let flags = h.graph.flags_for_user(&h.cx, a).await.unwrap();
  assert_eq!(flags.len(), 1);
  assert_eq!(flags[0].detection_type, DetectionType::MassPending);
  assert_eq!(flags[0].score, 10.0);
}

#[tokio::test]
async fn being_blocked_by_many_targets_raises_a_flag() {
  let h = harness();
  let spammer = user();
  let targets = [user(), user(), user()];
  for t in targets {
    h.graph.request_relationship(&h.cx, spammer, t, Follow).await.unwrap();
  }
  for t in targets {
    h.clock.advance(chrono::Duration::minutes(10));
    h.graph.block_user(&h.cx, t, spammer).await.unwrap();
  }

  let active = h.graph.active_flags(&h.cx, spammer).await.unwrap();
  assert_eq!(active.len(), 1);
  assert_eq!(active[0].detection_type, DetectionType::BlockReceived);
  assert_eq!(active[0].score, 50.0);
}

#[tokio::test]
async fn spam_store_failures_never_fail_the_action() {
  let mut config = config();
  config.rate_limits.follow = RateLimitRule::new(1, Duration::from_secs(60));
  let h = harness_with(config);
  h.store.fail_spam_writes(true);
  let a = user();

  h.graph.request_relationship(&h.cx, a, user(), Follow).await.unwrap();
  let res = h.graph.request_relationship(&h.cx, a, user(), Follow).await;
  assert!(matches!(res, Err(Error::RateLimited { .. })));

  let b = user();
  h.clock.advance(chrono::Duration::minutes(2));
  h.graph.request_relationship(&h.cx, a, b, Follow).await.unwrap();
  assert!(h.graph.remove_relationship(&h.cx, a, b, Follow).await.unwrap().is_some());
  assert!(h.graph.flags_for_user(&h.cx, a).await.unwrap().is_empty());
}

// ─── Queries ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn pagination_is_deterministic() {
  let h = harness();
  let target = user();
  for _ in 0..5 {
    h.graph.request_relationship(&h.cx, user(), target, Follow).await.unwrap();
  }
  h.clock.advance(chrono::Duration::seconds(1));
  let newest = h.graph.request_relationship(&h.cx, user(), target, Follow).await.unwrap();

  let filter = RelationshipFilter {
    kind:      Some(Follow),
    status:    None,
    direction: Direction::Incoming,
  };
  let all = h
    .graph
    .list_relationships(&h.cx, target, filter, PageRequest::new(100, 0))
    .await
    .unwrap();
  assert_eq!(all.total, 6);
  assert_eq!(all.items[0].relationship_id, newest.relationship_id);
  let same_time: Vec<_> = all.items[1..].iter().map(|r| r.relationship_id).collect();
  let mut sorted = same_time.clone();
  sorted.sort();
  assert_eq!(same_time, sorted);

  let mut paged = Vec::new();
  for offset in [0, 2, 4] {
    let page = h
      .graph
      .list_relationships(&h.cx, target, filter, PageRequest::new(2, offset))
      .await
      .unwrap();
    assert_eq!(page.total, 6);
    paged.extend(page.items);
  }
  assert_eq!(paged, all.items);
}

#[tokio::test]
async fn stats_count_each_side() {
  let h = harness();
  let (a, b, c) = (user(), user(), user());
  h.graph.request_relationship(&h.cx, a, b, Follow).await.unwrap();
  h.graph.request_relationship(&h.cx, c, a, Follow).await.unwrap();
  h.graph.request_relationship(&h.cx, a, c, FriendRequest).await.unwrap();
  h.graph.request_relationship(&h.cx, b, a, FriendRequest).await.unwrap();
  h.graph.request_relationship(&h.cx, a, b, Mute).await.unwrap();

  let s = h.graph.stats(&h.cx, a).await.unwrap();
  assert_eq!(s.following, 1);
  assert_eq!(s.followers, 1);
  assert_eq!(s.pending_outgoing, 1);
  assert_eq!(s.pending_incoming, 1);
  assert_eq!(s.muting, 1);
  assert_eq!(s.friends, 0);
  assert_eq!(s.blocking, 0);
}

// ─── Store faults & cancellation ─────────────────────────────────────────────

#[tokio::test]
async fn transient_reads_are_retried_once() {
  let h = harness();
  let rel = h.graph.request_relationship(&h.cx, user(), user(), Follow).await.unwrap();

  h.store.inject_read_failures(1);
  h.graph.get_relationship(&h.cx, rel.relationship_id).await.unwrap();

  h.store.inject_read_failures(2);
  let res = h.graph.get_relationship(&h.cx, rel.relationship_id).await;
  assert!(matches!(res, Err(Error::TransientStore(_))));
}

#[tokio::test]
async fn transient_writes_are_not_retried() {
  let h = harness();
  h.store.inject_write_failures(1);
  let res = h.graph.request_relationship(&h.cx, user(), user(), Follow).await;
  assert!(res.as_ref().is_err_and(Error::is_transient));
  assert_eq!(h.store.relationship_count(), 0);
}

#[tokio::test]
async fn cancelled_context_writes_nothing() {
  let h = harness();
  let cx = OpContext::new();
  cx.cancel();
  let res = h.graph.request_relationship(&cx, user(), user(), Follow).await;
  assert!(matches!(res, Err(Error::Cancelled)));
  assert_eq!(h.store.relationship_count(), 0);
}

#[tokio::test]
async fn concurrent_duplicate_follows_create_one_row() {
  let h = Arc::new(harness());
  let (a, b) = (user(), user());

  let mut tasks = Vec::new();
  for _ in 0..10 {
    let h = h.clone();
    tasks.push(tokio::spawn(async move {
      h.graph.request_relationship(&OpContext::new(), a, b, Follow).await.is_ok()
    }));
  }
  let mut created = 0;
  for task in tasks {
    if task.await.unwrap() {
      created += 1;
    }
  }
  assert_eq!(created, 1);
  assert_eq!(h.store.relationship_count(), 1);
}

#[tokio::test]
async fn mixed_sequence_keeps_one_live_row_per_tuple() {
  let h = harness();
  let (a, b) = (user(), user());
  let g = &h.graph;
  let cx = &h.cx;

  g.request_relationship(cx, a, b, Follow).await.unwrap();
  let _ = g.request_relationship(cx, a, b, Follow).await;
  g.remove_relationship(cx, a, b, Follow).await.unwrap();
  g.request_relationship(cx, a, b, Follow).await.unwrap();
  let req = g.request_relationship(cx, a, b, FriendRequest).await.unwrap();
  let _ = g.request_relationship(cx, b, a, FriendRequest).await;
  g.respond_to_request(cx, b, req.relationship_id, false).await.unwrap();
  g.request_relationship(cx, a, b, FriendRequest).await.unwrap();
  g.block_user(cx, a, b).await.unwrap();
  g.block_user(cx, a, b).await.unwrap();
  let _ = g.request_relationship(cx, b, a, Follow).await;
  g.unblock_user(cx, a, b).await.unwrap();
  g.unblock_user(cx, a, b).await.unwrap();
  let _ = g.request_relationship(cx, b, a, Follow).await;
  g.block_user(cx, b, a).await.unwrap();

  assert_one_live_row_per_tuple(&h, a, b).await;
}
