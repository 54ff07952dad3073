//! Spam and abuse flagging.
//!
//! Each detection heuristic keeps one [`SpamFlag`] per user. Scores are a
//! ledger: evidence only ever adds to them, and the only way down is an
//! explicit administrative [`SpamDetector::reset_flag`]. Two thresholds apply
//! per heuristic. The reporting threshold makes a flag visible to
//! trust-and-safety tooling; the enforcement threshold makes relationship
//! creation fail with [`Error::Restricted`].
//!
//! Signal processing is best-effort. Failures are logged and swallowed so
//! that a flaky flag store never blocks the relationship action that fed it.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::{
  Error, Result, UserId,
  context::OpContext,
  relationship::{
    Direction, PageRequest, Relationship, RelationshipFilter, RelationshipKind,
    RelationshipStatus,
  },
  store::{RelationshipStore, SpamFlagStore},
};

// ─── Detection types ─────────────────────────────────────────────────────────

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
  EnumIter,
  IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DetectionType {
  /// Follows withdrawn shortly after being made.
  RapidFollowCycling,
  /// Friend requests piling up unanswered.
  MassPending,
  /// Blocked by many of the people the user reached out to.
  BlockReceived,
  /// Repeatedly running into rate limits.
  ///
  /// Each denial adds evidence and scores never decay. With the default
  /// rule a user who keeps retrying inside one burst window reaches
  /// enforcement, after which follows and friend requests stay vetoed until
  /// an operator calls `reset_flag`.
  RateLimitPressure,
}

impl DetectionType {
  /// Whether a flag of this type at enforcement level vetoes creating a
  /// relationship of `kind`.
  pub fn restricts(self, kind: RelationshipKind) -> bool {
    use RelationshipKind::*;
    match self {
      Self::RapidFollowCycling => kind == Follow,
      Self::MassPending => kind == FriendRequest,
      Self::BlockReceived | Self::RateLimitPressure => {
        matches!(kind, Follow | FriendRequest)
      }
    }
  }
}

// ─── Flag ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpamFlag {
  pub user_id:         UserId,
  pub detection_type:  DetectionType,
  pub score:           f64,
  /// When the flag was first created.
  pub flagged_at:      DateTime<Utc>,
  pub last_updated_at: DateTime<Utc>,
}

// ─── Policy ──────────────────────────────────────────────────────────────────

/// Scoring and thresholds for one detection type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionRule {
  /// Score added per unit of evidence.
  pub weight:                f64,
  pub reporting_threshold:   f64,
  pub enforcement_threshold: f64,
  /// Evidence arriving within this many seconds of the previous update is
  /// multiplied by `burst_multiplier`.
  pub burst_window_secs:     u64,
  pub burst_multiplier:      f64,
}

impl DetectionRule {
  pub const fn new(weight: f64, reporting: f64, enforcement: f64) -> Self {
    Self {
      weight,
      reporting_threshold: reporting,
      enforcement_threshold: enforcement,
      burst_window_secs: 60,
      burst_multiplier: 1.5,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamPolicy {
  pub rapid_follow_cycling:    DetectionRule,
  pub mass_pending:            DetectionRule,
  pub block_received:          DetectionRule,
  pub rate_limit_pressure:     DetectionRule,
  /// A follow removed within this many seconds of creation counts as a
  /// cycle.
  pub cycle_window_secs:       u64,
  /// Outbound pending friend requests tolerated before each new one adds
  /// evidence.
  pub pending_allowance:       u64,
  /// Look-back used for the block-received ratio.
  pub block_ratio_window_secs: u64,
  /// Blocks received within the window before the ratio is evaluated.
  pub block_ratio_min_blocks:  u64,
  /// Blocks received per relationship created at which evidence is added.
  pub block_ratio_threshold:   f64,
}

impl Default for SpamPolicy {
  fn default() -> Self {
    Self {
      rapid_follow_cycling:    DetectionRule::new(10.0, 40.0, 80.0),
      mass_pending:            DetectionRule::new(10.0, 40.0, 80.0),
      block_received:          DetectionRule::new(50.0, 40.0, 80.0),
      rate_limit_pressure:     DetectionRule::new(5.0, 40.0, 80.0),
      cycle_window_secs:       60 * 60,
      pending_allowance:       20,
      block_ratio_window_secs: 7 * 24 * 60 * 60,
      block_ratio_min_blocks:  3,
      block_ratio_threshold:   0.2,
    }
  }
}

impl SpamPolicy {
  pub fn rule(&self, detection: DetectionType) -> &DetectionRule {
    match detection {
      DetectionType::RapidFollowCycling => &self.rapid_follow_cycling,
      DetectionType::MassPending => &self.mass_pending,
      DetectionType::BlockReceived => &self.block_received,
      DetectionType::RateLimitPressure => &self.rate_limit_pressure,
    }
  }
}

// ─── Pure scoring ────────────────────────────────────────────────────────────

/// Fold `evidence` into `previous`. Non-positive evidence leaves the score
/// unchanged, so the result is never lower than the input.
pub fn accumulate(
  previous: Option<&SpamFlag>,
  user: UserId,
  detection: DetectionType,
  evidence: f64,
  rule: &DetectionRule,
  now: DateTime<Utc>,
) -> SpamFlag {
  let evidence = if evidence > 0.0 { evidence } else { 0.0 };

  match previous {
    None => SpamFlag {
      user_id: user,
      detection_type: detection,
      score: rule.weight * evidence,
      flagged_at: now,
      last_updated_at: now,
    },
    Some(prev) => {
      let elapsed = now - prev.last_updated_at;
      let burst = if elapsed <= chrono::Duration::seconds(rule.burst_window_secs as i64) {
        rule.burst_multiplier.max(1.0)
      } else {
        1.0
      };
      SpamFlag {
        score: prev.score + rule.weight * evidence * burst,
        last_updated_at: now,
        ..prev.clone()
      }
    }
  }
}

// ─── Signals ─────────────────────────────────────────────────────────────────

/// Why a relationship attempt was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
  RateLimited,
  Restricted,
  Conflict,
  Other,
}

impl Denial {
  pub fn of(err: &Error) -> Self {
    match err {
      Error::RateLimited { .. } => Self::RateLimited,
      Error::Restricted { .. } => Self::Restricted,
      Error::Conflict(_) => Self::Conflict,
      _ => Self::Other,
    }
  }
}

/// Behavioral events the relationship engine reports.
#[derive(Debug, Clone)]
pub enum GraphSignal {
  RelationshipCreated(Relationship),
  RelationshipRemoved(Relationship),
  UserBlocked { blocker: UserId, blocked: UserId },
  AttemptDenied {
    actor:  UserId,
    kind:   RelationshipKind,
    denial: Denial,
  },
}

// ─── Detector ────────────────────────────────────────────────────────────────

pub struct SpamDetector<S> {
  store:   Arc<S>,
  policy:  SpamPolicy,
  backoff: Duration,
}

impl<S> SpamDetector<S>
where
  S: SpamFlagStore + RelationshipStore,
{
  pub fn new(store: Arc<S>, policy: SpamPolicy, read_backoff: Duration) -> Self {
    Self { store, policy, backoff: read_backoff }
  }

  pub fn policy(&self) -> &SpamPolicy { &self.policy }

  /// Add evidence to a user's flag and return the updated flag.
  pub async fn record_signal(
    &self,
    cx: &OpContext,
    user: UserId,
    detection: DetectionType,
    evidence: f64,
    now: DateTime<Utc>,
  ) -> Result<SpamFlag> {
    let store = &*self.store;
    let previous = cx.read(self.backoff, move || store.get_flag(user, detection)).await?;
    let rule = self.policy.rule(detection);
    let flag = accumulate(previous.as_ref(), user, detection, evidence, rule, now);

    let before = previous.as_ref().map_or(0.0, |f| f.score);
    if before < rule.enforcement_threshold && flag.score >= rule.enforcement_threshold {
      tracing::warn!(%user, %detection, score = flag.score, "spam flag reached enforcement threshold");
    } else if before < rule.reporting_threshold && flag.score >= rule.reporting_threshold {
      tracing::info!(%user, %detection, score = flag.score, "spam flag reached reporting threshold");
    }

    cx.write(store.upsert_flag(flag.clone())).await?;
    Ok(flag)
  }

  /// Flags at or above their reporting threshold.
  pub async fn active_flags(&self, cx: &OpContext, user: UserId) -> Result<Vec<SpamFlag>> {
    let mut flags = self.flags_for_user(cx, user).await?;
    flags.retain(|f| f.score >= self.policy.rule(f.detection_type).reporting_threshold);
    Ok(flags)
  }

  /// Every flag recorded for `user`, including those below reporting level.
  pub async fn flags_for_user(&self, cx: &OpContext, user: UserId) -> Result<Vec<SpamFlag>> {
    let store = &*self.store;
    cx.read(self.backoff, move || store.list_flags_for_user(user)).await
  }

  /// The first flag that vetoes creating a relationship of `kind`.
  pub async fn restriction_for(
    &self,
    cx: &OpContext,
    user: UserId,
    kind: RelationshipKind,
  ) -> Result<Option<SpamFlag>> {
    let flags = self.active_flags(cx, user).await?;
    Ok(flags.into_iter().find(|f| {
      f.detection_type.restricts(kind)
        && f.score >= self.policy.rule(f.detection_type).enforcement_threshold
    }))
  }

  /// Administrative reset of one flag back to zero. Missing flags are left
  /// alone.
  pub async fn reset_flag(
    &self,
    cx: &OpContext,
    user: UserId,
    detection: DetectionType,
    now: DateTime<Utc>,
  ) -> Result<Option<SpamFlag>> {
    let store = &*self.store;
    let Some(flag) = cx.read(self.backoff, move || store.get_flag(user, detection)).await?
    else {
      return Ok(None);
    };
    let flag = SpamFlag { score: 0.0, last_updated_at: now, ..flag };
    cx.write(store.upsert_flag(flag.clone())).await?;
    tracing::info!(%user, %detection, "spam flag reset");
    Ok(Some(flag))
  }

  /// Reset every detection type for `user`.
  pub async fn reset_all(
    &self,
    cx: &OpContext,
    user: UserId,
    now: DateTime<Utc>,
  ) -> Result<usize> {
    let mut reset = 0;
    for detection in DetectionType::iter() {
      if self.reset_flag(cx, user, detection, now).await?.is_some() {
        reset += 1;
      }
    }
    Ok(reset)
  }

  /// Feed one behavioral event through the heuristics. Never fails; errors
  /// are logged and dropped.
  pub async fn observe(&self, cx: &OpContext, signal: GraphSignal, now: DateTime<Utc>) {
    if let Err(err) = self.evaluate(cx, &signal, now).await {
      tracing::warn!(error = %err, ?signal, "failed to record spam signal");
    }
  }

  async fn evaluate(
    &self,
    cx: &OpContext,
    signal: &GraphSignal,
    now: DateTime<Utc>,
  ) -> Result<()> {
    match signal {
      GraphSignal::RelationshipCreated(rel) if rel.kind == RelationshipKind::FriendRequest => {
        let pending = self.outbound_pending(cx, rel.from_user).await?;
        if pending > self.policy.pending_allowance {
          self
            .record_signal(cx, rel.from_user, DetectionType::MassPending, 1.0, now)
            .await?;
        }
      }
      GraphSignal::RelationshipCreated(_) => {}

      GraphSignal::RelationshipRemoved(rel) if rel.kind == RelationshipKind::Follow => {
        let window = chrono::Duration::seconds(self.policy.cycle_window_secs as i64);
        if now - rel.created_at <= window {
          self
            .record_signal(cx, rel.from_user, DetectionType::RapidFollowCycling, 1.0, now)
            .await?;
        }
      }
      GraphSignal::RelationshipRemoved(_) => {}

      GraphSignal::UserBlocked { blocked, .. } => {
        if let Some(ratio) = self.block_ratio(cx, *blocked, now).await? {
          self
            .record_signal(cx, *blocked, DetectionType::BlockReceived, ratio, now)
            .await?;
        }
      }

      GraphSignal::AttemptDenied { actor, denial: Denial::RateLimited, .. } => {
        self
          .record_signal(cx, *actor, DetectionType::RateLimitPressure, 1.0, now)
          .await?;
      }
      GraphSignal::AttemptDenied { actor, kind, denial } => {
        tracing::debug!(%actor, %kind, ?denial, "relationship attempt denied");
      }
    }
    Ok(())
  }

  async fn outbound_pending(&self, cx: &OpContext, user: UserId) -> Result<u64> {
    let store = &*self.store;
    let filter = RelationshipFilter {
      kind:      Some(RelationshipKind::FriendRequest),
      status:    Some(RelationshipStatus::Pending),
      direction: Direction::Outgoing,
    };
    let (_, total) = cx
      .read(self.backoff, move || {
        store.list_by_user(user, filter, PageRequest::count_only())
      })
      .await?;
    Ok(total)
  }

  /// Blocks received per relationship created within the look-back window,
  /// when it is over the configured threshold.
  async fn block_ratio(
    &self,
    cx: &OpContext,
    user: UserId,
    now: DateTime<Utc>,
  ) -> Result<Option<f64>> {
    let store = &*self.store;
    let since = now - chrono::Duration::seconds(self.policy.block_ratio_window_secs as i64);
    let count = |kind: RelationshipKind, direction: Direction| {
      cx.read(self.backoff, move || store.count_since(user, kind, direction, since))
    };

    let blocks = count(RelationshipKind::Block, Direction::Incoming).await?;
    if blocks < self.policy.block_ratio_min_blocks {
      return Ok(None);
    }
    let created = count(RelationshipKind::Follow, Direction::Outgoing).await?
      + count(RelationshipKind::FriendRequest, Direction::Outgoing).await?;

    let ratio = blocks as f64 / created.max(1) as f64;
    Ok((ratio >= self.policy.block_ratio_threshold).then_some(ratio))
  }
}
