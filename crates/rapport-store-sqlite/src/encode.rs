//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings with microsecond
//! precision, so lexical order matches chronological order and equality
//! checks in compare-and-set statements are exact. Enums are stored as their
//! `strum` names. UUIDs are stored as hyphenated lowercase strings.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rapport_core::{
  account_group::{AccountGroup, GroupMember},
  rate_limit::{Principal, RateLimitRecord},
  relationship::{Relationship, RelationshipKind, RelationshipStatus},
  spam::{DetectionType, SpamFlag},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Enums ───────────────────────────────────────────────────────────────────

fn decode_enum<T: FromStr>(column: &'static str, s: &str) -> Result<T> {
  s.parse()
    .map_err(|_| Error::Decode { column, value: s.to_owned() })
}

pub fn decode_kind(s: &str) -> Result<RelationshipKind> { decode_enum("kind", s) }

pub fn decode_status(s: &str) -> Result<RelationshipStatus> { decode_enum("status", s) }

pub fn decode_detection(s: &str) -> Result<DetectionType> {
  decode_enum("detection_type", s)
}

// ─── Principal ───────────────────────────────────────────────────────────────

/// `user:<uuid>` or `group:<uuid>`; the same text as `Principal`'s `Display`.
pub fn encode_principal(p: Principal) -> String { p.to_string() }

pub fn decode_principal(s: &str) -> Result<Principal> {
  match s.split_once(':') {
    Some(("user", id)) => Ok(Principal::User(decode_uuid(id)?)),
    Some(("group", id)) => Ok(Principal::Group(decode_uuid(id)?)),
    _ => Err(Error::Decode { column: "principal", value: s.to_owned() }),
  }
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Column list matching [`RawRelationship::from_row`].
pub const RELATIONSHIP_COLUMNS: &str = "relationship_id, from_user, to_user, kind, status, \
                                        suppressed_from, created_at, updated_at";

/// Raw strings read directly from a `relationships` row.
pub struct RawRelationship {
  pub relationship_id: String,
  pub from_user:       String,
  pub to_user:         String,
  pub kind:            String,
  pub status:          String,
  pub suppressed_from: Option<String>,
  pub created_at:      String,
  pub updated_at:      String,
}

impl RawRelationship {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      relationship_id: row.get(0)?,
      from_user:       row.get(1)?,
      to_user:         row.get(2)?,
      kind:            row.get(3)?,
      status:          row.get(4)?,
      suppressed_from: row.get(5)?,
      created_at:      row.get(6)?,
      updated_at:      row.get(7)?,
    })
  }

  pub fn into_relationship(self) -> Result<Relationship> {
    Ok(Relationship {
      relationship_id: decode_uuid(&self.relationship_id)?,
      from_user:       decode_uuid(&self.from_user)?,
      to_user:         decode_uuid(&self.to_user)?,
      kind:            decode_kind(&self.kind)?,
      status:          decode_status(&self.status)?,
      suppressed_from: self.suppressed_from.as_deref().map(decode_status).transpose()?,
      created_at:      decode_dt(&self.created_at)?,
      updated_at:      decode_dt(&self.updated_at)?,
    })
  }
}

/// Raw strings read directly from a `rate_limits` row.
pub struct RawRateLimit {
  pub principal:      String,
  pub action:         String,
  pub window_start:   String,
  pub count:          u32,
  pub last_action_at: String,
}

impl RawRateLimit {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      principal:      row.get(0)?,
      action:         row.get(1)?,
      window_start:   row.get(2)?,
      count:          row.get(3)?,
      last_action_at: row.get(4)?,
    })
  }

  pub fn into_record(self) -> Result<RateLimitRecord> {
    Ok(RateLimitRecord {
      principal:      decode_principal(&self.principal)?,
      action:         self.action,
      window_start:   decode_dt(&self.window_start)?,
      count:          self.count,
      last_action_at: decode_dt(&self.last_action_at)?,
    })
  }
}

/// Raw values read directly from a `spam_flags` row.
pub struct RawSpamFlag {
  pub user_id:         String,
  pub detection_type:  String,
  pub score:           f64,
  pub flagged_at:      String,
  pub last_updated_at: String,
}

impl RawSpamFlag {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      user_id:         row.get(0)?,
      detection_type:  row.get(1)?,
      score:           row.get(2)?,
      flagged_at:      row.get(3)?,
      last_updated_at: row.get(4)?,
    })
  }

  pub fn into_flag(self) -> Result<SpamFlag> {
    Ok(SpamFlag {
      user_id:         decode_uuid(&self.user_id)?,
      detection_type:  decode_detection(&self.detection_type)?,
      score:           self.score,
      flagged_at:      decode_dt(&self.flagged_at)?,
      last_updated_at: decode_dt(&self.last_updated_at)?,
    })
  }
}

pub struct RawGroup {
  pub group_id:     String,
  pub created_at:   String,
  pub dissolved_at: Option<String>,
}

impl RawGroup {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      group_id:     row.get(0)?,
      created_at:   row.get(1)?,
      dissolved_at: row.get(2)?,
    })
  }

  pub fn into_group(self) -> Result<AccountGroup> {
    Ok(AccountGroup {
      group_id:     decode_uuid(&self.group_id)?,
      created_at:   decode_dt(&self.created_at)?,
      dissolved_at: self.dissolved_at.as_deref().map(decode_dt).transpose()?,
    })
  }
}

pub struct RawMember {
  pub user_id:    String,
  pub is_primary: bool,
  pub joined_at:  String,
}

impl RawMember {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      user_id:    row.get(0)?,
      is_primary: row.get(1)?,
      joined_at:  row.get(2)?,
    })
  }

  pub fn into_member(self) -> Result<GroupMember> {
    Ok(GroupMember {
      user_id:    decode_uuid(&self.user_id)?,
      is_primary: self.is_primary,
      joined_at:  decode_dt(&self.joined_at)?,
    })
  }
}
