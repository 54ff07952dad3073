//! [`SqliteStore`]: the SQLite implementation of the Rapport store traits.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, params, params_from_iter};
use uuid::Uuid;

use rapport_core::{
  UserId,
  account_group::{AccountGroup, GroupMember, MemberRemoval},
  rate_limit::{Principal, RateLimitRecord},
  relationship::{
    Direction, PageRequest, Relationship, RelationshipFilter, RelationshipKind,
    StatusChange,
  },
  spam::{DetectionType, SpamFlag},
  store::{
    AccountGroupStore, RateLimitStore, RelationshipStore, SpamFlagStore,
    StoreBackend,
  },
};

use crate::{
  Error, Result,
  encode::{
    RELATIONSHIP_COLUMNS, RawGroup, RawMember, RawRateLimit, RawRelationship,
    RawSpamFlag, decode_uuid, encode_dt, encode_principal, encode_uuid,
  },
  schema::SCHEMA,
};

/// Outcome of a conditional write evaluated on the connection thread.
enum Applied<T> {
  Done(T),
  /// The target row does not exist (or the group is dissolved).
  Missing,
  /// The row exists but is not in the expected state; carries what was found.
  Mismatch(String),
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Rapport store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    tracing::debug!(path = %path.display(), "opened sqlite store");
    Ok(store)
  }

  /// Open an in-memory store; useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

impl StoreBackend for SqliteStore {
  type Error = Error;
}

/// `WHERE` clause and its positional parameters for a user-centred
/// relationship query. `?1` is always the user.
fn user_clause(
  user: UserId,
  kind: Option<RelationshipKind>,
  direction: Direction,
) -> (String, Vec<String>) {
  let mut sql = match direction {
    Direction::Outgoing => "from_user = ?1",
    Direction::Incoming => "to_user = ?1",
    Direction::Both => "(from_user = ?1 OR to_user = ?1)",
  }
  .to_owned();
  let mut params = vec![encode_uuid(user)];

  if let Some(kind) = kind {
    params.push(kind.to_string());
    sql.push_str(&format!(" AND kind = ?{}", params.len()));
  }
  (sql, params)
}

// ─── Relationships ───────────────────────────────────────────────────────────

impl RelationshipStore for SqliteStore {
  async fn get(&self, id: Uuid) -> Result<Option<Relationship>> {
    let id_str = encode_uuid(id);

    let raw: Option<RawRelationship> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!(
              "SELECT {RELATIONSHIP_COLUMNS} FROM relationships WHERE relationship_id = ?1"
            ),
            params![id_str],
            RawRelationship::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawRelationship::into_relationship).transpose()
  }

  async fn find(
    &self,
    from: UserId,
    to: UserId,
    kind: RelationshipKind,
  ) -> Result<Option<Relationship>> {
    let from_str = encode_uuid(from);
    let to_str   = encode_uuid(to);
    let kind_str = kind.to_string();

    let raw: Option<RawRelationship> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!(
              "SELECT {RELATIONSHIP_COLUMNS} FROM relationships
               WHERE from_user = ?1 AND to_user = ?2 AND kind = ?3
                 AND status != 'removed'"
            ),
            params![from_str, to_str, kind_str],
            RawRelationship::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawRelationship::into_relationship).transpose()
  }

  async fn list_between(&self, a: UserId, b: UserId) -> Result<Vec<Relationship>> {
    let a_str = encode_uuid(a);
    let b_str = encode_uuid(b);

    let raws: Vec<RawRelationship> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {RELATIONSHIP_COLUMNS} FROM relationships
           WHERE ((from_user = ?1 AND to_user = ?2) OR (from_user = ?2 AND to_user = ?1))
             AND status != 'removed'
           ORDER BY created_at DESC, relationship_id ASC"
        ))?;
        let rows = stmt
          .query_map(params![a_str, b_str], RawRelationship::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawRelationship::into_relationship).collect()
  }

  async fn insert(&self, rel: Relationship) -> Result<Relationship> {
    let id_str                           = encode_uuid(rel.relationship_id);
    let from_str                         = encode_uuid(rel.from_user);
    let to_str                           = encode_uuid(rel.to_user);
    let kind_str: &'static str           = rel.kind.into();
    let status_str: &'static str         = rel.status.into();
    let suppressed: Option<&'static str> = rel.suppressed_from.map(Into::into);
    let created_str                      = encode_dt(rel.created_at);
    let updated_str                      = encode_dt(rel.updated_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO relationships (
             relationship_id, from_user, to_user, kind, status,
             suppressed_from, created_at, updated_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
          params![
            id_str,
            from_str,
            to_str,
            kind_str,
            status_str,
            suppressed,
            created_str,
            updated_str,
          ],
        )?;
        Ok(())
      })
      .await?;
    Ok(rel)
  }

  async fn update_status(
    &self,
    id: Uuid,
    change: StatusChange,
    at: DateTime<Utc>,
  ) -> Result<Relationship> {
    let id_str                           = encode_uuid(id);
    let expected: &'static str           = change.expected.into();
    let status: &'static str             = change.status.into();
    let suppressed: Option<&'static str> = change.suppressed_from.map(Into::into);
    let at_str                           = encode_dt(at);

    let applied = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let changed = tx.execute(
          "UPDATE relationships
           SET status = ?1, suppressed_from = ?2, updated_at = ?3
           WHERE relationship_id = ?4 AND status = ?5",
          params![status, suppressed, at_str, id_str, expected],
        )?;

        let outcome = if changed == 0 {
          let current: Option<String> = tx
            .query_row(
              "SELECT status FROM relationships WHERE relationship_id = ?1",
              params![id_str],
              |row| row.get(0),
            )
            .optional()?;
          current.map_or(Applied::Missing, Applied::Mismatch)
        } else {
          Applied::Done(tx.query_row(
            &format!(
              "SELECT {RELATIONSHIP_COLUMNS} FROM relationships WHERE relationship_id = ?1"
            ),
            params![id_str],
            RawRelationship::from_row,
          )?)
        };
        tx.commit()?;
        Ok(outcome)
      })
      .await?;

    match applied {
      Applied::Done(raw) => raw.into_relationship(),
      Applied::Missing => Err(Error::NotFound(format!("relationship {id}"))),
      Applied::Mismatch(current) => Err(Error::Constraint(format!(
        "relationship {id} is {current}, expected {}",
        change.expected
      ))),
    }
  }

  async fn list_by_user(
    &self,
    user: UserId,
    filter: RelationshipFilter,
    page: PageRequest,
  ) -> Result<(Vec<Relationship>, u64)> {
    let (mut clause, mut params) = user_clause(user, filter.kind, filter.direction);
    match filter.status {
      Some(status) => {
        params.push(status.to_string());
        clause.push_str(&format!(" AND status = ?{}", params.len()));
      }
      None => clause.push_str(" AND status NOT IN ('removed', 'blocked')"),
    }
    let limit  = i64::try_from(page.limit).unwrap_or(i64::MAX);
    let offset = i64::try_from(page.offset).unwrap_or(i64::MAX);

    let (raws, total): (Vec<RawRelationship>, i64) = self
      .conn
      .call(move |conn| {
        let total: i64 = conn.query_row(
          &format!("SELECT COUNT(*) FROM relationships WHERE {clause}"),
          params_from_iter(params.iter()),
          |row| row.get(0),
        )?;
        if limit == 0 {
          return Ok((Vec::new(), total));
        }

        let mut stmt = conn.prepare(&format!(
          "SELECT {RELATIONSHIP_COLUMNS} FROM relationships
           WHERE {clause}
           ORDER BY created_at DESC, relationship_id ASC
           LIMIT {limit} OFFSET {offset}"
        ))?;
        let rows = stmt
          .query_map(params_from_iter(params.iter()), RawRelationship::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((rows, total))
      })
      .await?;

    let items = raws
      .into_iter()
      .map(RawRelationship::into_relationship)
      .collect::<Result<_>>()?;
    Ok((items, total.max(0) as u64))
  }

  async fn count_since(
    &self,
    user: UserId,
    kind: RelationshipKind,
    direction: Direction,
    since: DateTime<Utc>,
  ) -> Result<u64> {
    let (mut clause, mut params) = user_clause(user, Some(kind), direction);
    params.push(encode_dt(since));
    clause.push_str(&format!(" AND created_at >= ?{}", params.len()));

    let count: i64 = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          &format!("SELECT COUNT(*) FROM relationships WHERE {clause}"),
          params_from_iter(params.iter()),
          |row| row.get(0),
        )?)
      })
      .await?;
    Ok(count.max(0) as u64)
  }
}

// ─── Rate limits ─────────────────────────────────────────────────────────────

impl RateLimitStore for SqliteStore {
  async fn get_rate_limit<'a>(
    &'a self,
    principal: Principal,
    action: &'a str,
  ) -> Result<Option<RateLimitRecord>> {
    let principal_str = encode_principal(principal);
    let action        = action.to_owned();

    let raw: Option<RawRateLimit> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT principal, action, window_start, count, last_action_at
             FROM rate_limits WHERE principal = ?1 AND action = ?2",
            params![principal_str, action],
            RawRateLimit::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawRateLimit::into_record).transpose()
  }

  async fn upsert_rate_limit(&self, record: RateLimitRecord) -> Result<()> {
    let principal_str = encode_principal(record.principal);
    let window_str    = encode_dt(record.window_start);
    let last_str      = encode_dt(record.last_action_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO rate_limits (principal, action, window_start, count, last_action_at)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT (principal, action) DO UPDATE SET
             window_start   = excluded.window_start,
             count          = excluded.count,
             last_action_at = excluded.last_action_at",
          params![principal_str, record.action, window_str, record.count, last_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn compare_and_set_rate_limit(
    &self,
    expected: Option<RateLimitRecord>,
    new: RateLimitRecord,
  ) -> Result<bool> {
    let principal_str = encode_principal(new.principal);
    let window_str    = encode_dt(new.window_start);
    let last_str      = encode_dt(new.last_action_at);
    let expected      = expected
      .map(|e| (encode_dt(e.window_start), e.count, encode_dt(e.last_action_at)));

    let changed = self
      .conn
      .call(move |conn| {
        let changed = match expected {
          None => conn.execute(
            "INSERT INTO rate_limits (principal, action, window_start, count, last_action_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (principal, action) DO NOTHING",
            params![principal_str, new.action, window_str, new.count, last_str],
          )?,
          Some((exp_window, exp_count, exp_last)) => conn.execute(
            "UPDATE rate_limits
             SET window_start = ?1, count = ?2, last_action_at = ?3
             WHERE principal = ?4 AND action = ?5
               AND window_start = ?6 AND count = ?7 AND last_action_at = ?8",
            params![
              window_str,
              new.count,
              last_str,
              principal_str,
              new.action,
              exp_window,
              exp_count,
              exp_last,
            ],
          )?,
        };
        Ok(changed)
      })
      .await?;
    Ok(changed == 1)
  }
}

// ─── Spam flags ──────────────────────────────────────────────────────────────

impl SpamFlagStore for SqliteStore {
  async fn get_flag(&self, user: UserId, detection: DetectionType) -> Result<Option<SpamFlag>> {
    let user_str                    = encode_uuid(user);
    let detection_str: &'static str = detection.into();

    let raw: Option<RawSpamFlag> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT user_id, detection_type, score, flagged_at, last_updated_at
             FROM spam_flags WHERE user_id = ?1 AND detection_type = ?2",
            params![user_str, detection_str],
            RawSpamFlag::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawSpamFlag::into_flag).transpose()
  }

  async fn upsert_flag(&self, flag: SpamFlag) -> Result<()> {
    let user_str                    = encode_uuid(flag.user_id);
    let detection_str: &'static str = flag.detection_type.into();
    let flagged_str                 = encode_dt(flag.flagged_at);
    let updated_str                 = encode_dt(flag.last_updated_at);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO spam_flags (user_id, detection_type, score, flagged_at, last_updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT (user_id, detection_type) DO UPDATE SET
             score           = excluded.score,
             last_updated_at = excluded.last_updated_at",
          params![user_str, detection_str, flag.score, flagged_str, updated_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn list_flags_for_user(&self, user: UserId) -> Result<Vec<SpamFlag>> {
    let user_str = encode_uuid(user);

    let raws: Vec<RawSpamFlag> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT user_id, detection_type, score, flagged_at, last_updated_at
           FROM spam_flags WHERE user_id = ?1 ORDER BY detection_type",
        )?;
        let rows = stmt
          .query_map(params![user_str], RawSpamFlag::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawSpamFlag::into_flag).collect()
  }
}

// ─── Account groups ──────────────────────────────────────────────────────────

fn group_is_open(conn: &rusqlite::Connection, group_id: &str) -> rusqlite::Result<bool> {
  Ok(conn
    .query_row(
      "SELECT 1 FROM account_groups WHERE group_id = ?1 AND dissolved_at IS NULL",
      params![group_id],
      |_| Ok(()),
    )
    .optional()?
    .is_some())
}

fn members(conn: &rusqlite::Connection, group_id: &str) -> rusqlite::Result<Vec<RawMember>> {
  let mut stmt = conn.prepare(
    "SELECT user_id, is_primary, joined_at FROM group_members
     WHERE group_id = ?1 ORDER BY joined_at, user_id",
  )?;
  let rows = stmt
    .query_map(params![group_id], RawMember::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(rows)
}

impl AccountGroupStore for SqliteStore {
  async fn group_for_user(&self, user: UserId) -> Result<Option<Uuid>> {
    let user_str = encode_uuid(user);

    let group: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT group_id FROM group_members WHERE user_id = ?1",
            params![user_str],
            |row| row.get(0),
          )
          .optional()?)
      })
      .await?;

    group.as_deref().map(decode_uuid).transpose()
  }

  async fn get_group(&self, group_id: Uuid) -> Result<Option<AccountGroup>> {
    let group_str = encode_uuid(group_id);

    let raw: Option<RawGroup> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT group_id, created_at, dissolved_at FROM account_groups
             WHERE group_id = ?1 AND dissolved_at IS NULL",
            params![group_str],
            RawGroup::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawGroup::into_group).transpose()
  }

  async fn members_of(&self, group_id: Uuid) -> Result<Vec<GroupMember>> {
    let group_str = encode_uuid(group_id);
    let raws = self
      .conn
      .call(move |conn| Ok(members(conn, &group_str)?))
      .await?;
    raws.into_iter().map(RawMember::into_member).collect()
  }

  async fn insert_group(&self, group: AccountGroup, founder: GroupMember) -> Result<()> {
    let group_str   = encode_uuid(group.group_id);
    let created_str = encode_dt(group.created_at);
    let user_str    = encode_uuid(founder.user_id);
    let joined_str  = encode_dt(founder.joined_at);

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO account_groups (group_id, created_at) VALUES (?1, ?2)",
          params![group_str, created_str],
        )?;
        tx.execute(
          "INSERT INTO group_members (user_id, group_id, is_primary, joined_at)
           VALUES (?1, ?2, ?3, ?4)",
          params![user_str, group_str, founder.is_primary, joined_str],
        )?;
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn add_member(&self, group_id: Uuid, member: GroupMember) -> Result<()> {
    let group_str  = encode_uuid(group_id);
    let user_str   = encode_uuid(member.user_id);
    let joined_str = encode_dt(member.joined_at);

    let applied = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if !group_is_open(&tx, &group_str)? {
          return Ok(Applied::Missing);
        }
        if member.is_primary {
          tx.execute(
            "UPDATE group_members SET is_primary = 0 WHERE group_id = ?1",
            params![group_str],
          )?;
        }
        tx.execute(
          "INSERT INTO group_members (user_id, group_id, is_primary, joined_at)
           VALUES (?1, ?2, ?3, ?4)",
          params![user_str, group_str, member.is_primary, joined_str],
        )?;
        tx.commit()?;
        Ok(Applied::Done(()))
      })
      .await?;

    match applied {
      Applied::Done(()) => Ok(()),
      Applied::Missing | Applied::Mismatch(_) => {
        Err(Error::NotFound(format!("account group {group_id}")))
      }
    }
  }

  async fn remove_member(
    &self,
    group_id: Uuid,
    user: UserId,
    at: DateTime<Utc>,
  ) -> Result<MemberRemoval> {
    let group_str = encode_uuid(group_id);
    let user_str  = encode_uuid(user);
    let at_str    = encode_dt(at);

    let applied = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let removed = tx.execute(
          "DELETE FROM group_members WHERE user_id = ?1 AND group_id = ?2",
          params![user_str, group_str],
        )?;
        if removed == 0 {
          return Ok(Applied::Missing);
        }
        let remaining = members(&tx, &group_str)?;
        if remaining.len() > 1 {
          tx.commit()?;
          return Ok(Applied::Done((remaining, false)));
        }
        tx.execute(
          "UPDATE account_groups SET dissolved_at = COALESCE(dissolved_at, ?1)
           WHERE group_id = ?2",
          params![at_str, group_str],
        )?;
        tx.execute("DELETE FROM group_members WHERE group_id = ?1", params![group_str])?;
        tx.commit()?;
        Ok(Applied::Done((Vec::new(), true)))
      })
      .await?;

    match applied {
      Applied::Done((raws, dissolved)) => Ok(MemberRemoval {
        remaining: raws
          .into_iter()
          .map(RawMember::into_member)
          .collect::<Result<_>>()?,
        dissolved,
      }),
      Applied::Missing | Applied::Mismatch(_) => Err(Error::NotFound(format!(
        "user {user} is not a member of account group {group_id}"
      ))),
    }
  }

  async fn set_primary(&self, group_id: Uuid, user: UserId) -> Result<()> {
    let group_str = encode_uuid(group_id);
    let user_str  = encode_uuid(user);

    let applied = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if !group_is_open(&tx, &group_str)? {
          return Ok(Applied::Missing);
        }
        let is_member = tx
          .query_row(
            "SELECT 1 FROM group_members WHERE user_id = ?1 AND group_id = ?2",
            params![user_str, group_str],
            |_| Ok(()),
          )
          .optional()?
          .is_some();
        if !is_member {
          return Ok(Applied::Mismatch(user_str));
        }
        tx.execute(
          "UPDATE group_members SET is_primary = 0 WHERE group_id = ?1",
          params![group_str],
        )?;
        tx.execute(
          "UPDATE group_members SET is_primary = 1 WHERE user_id = ?1",
          params![user_str],
        )?;
        tx.commit()?;
        Ok(Applied::Done(()))
      })
      .await?;

    match applied {
      Applied::Done(()) => Ok(()),
      Applied::Missing => Err(Error::NotFound(format!("account group {group_id}"))),
      Applied::Mismatch(_) => Err(Error::NotFound(format!(
        "user {user} is not a member of account group {group_id}"
      ))),
    }
  }
}
