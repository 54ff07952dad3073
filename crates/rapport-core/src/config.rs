//! Engine configuration, deserialisable from the binary's config file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{rate_limit::RateLimitRule, relationship::RelationshipKind, spam::SpamPolicy};

/// Per-kind rate-limit rules. Blocking is never limited; muting is limited
/// only when a rule is configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
  pub follow:         RateLimitRule,
  pub friend_request: RateLimitRule,
  pub mute:           Option<RateLimitRule>,
}

impl Default for RateLimits {
  fn default() -> Self {
    Self {
      follow:         RateLimitRule { limit: 100, window_secs: 60 * 60 },
      friend_request: RateLimitRule { limit: 30, window_secs: 60 * 60 },
      mute:           None,
    }
  }
}

impl RateLimits {
  pub fn rule_for(&self, kind: RelationshipKind) -> Option<RateLimitRule> {
    match kind {
      RelationshipKind::Follow => Some(self.follow),
      RelationshipKind::FriendRequest => Some(self.friend_request),
      RelationshipKind::Mute => self.mute,
      RelationshipKind::Block => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
  pub rate_limits:           RateLimits,
  pub spam:                  SpamPolicy,
  /// Pause before the single retry of a read that failed transiently.
  pub read_retry_backoff_ms: u64,
}

impl Default for GraphConfig {
  fn default() -> Self {
    Self {
      rate_limits:           RateLimits::default(),
      spam:                  SpamPolicy::default(),
      read_retry_backoff_ms: 50,
    }
  }
}

impl GraphConfig {
  pub fn read_retry_backoff(&self) -> Duration {
    Duration::from_millis(self.read_retry_backoff_ms)
  }
}
