//! In-process backend implementing every store trait.
//!
//! State lives behind one mutex, so each trait call is trivially atomic. The
//! backend is used by the test suites and selectable at startup for
//! throwaway deployments. It also carries fault-injection switches for
//! exercising the engine's retry and best-effort paths.

use std::{
  collections::HashMap,
  sync::{
    Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::{
  UserId,
  account_group::{AccountGroup, GroupMember, MemberRemoval},
  rate_limit::{Principal, RateLimitRecord},
  relationship::{
    Direction, PageRequest, Relationship, RelationshipFilter, RelationshipKind,
    StatusChange, page_order,
  },
  spam::{DetectionType, SpamFlag},
  store::{
    AccountGroupStore, RateLimitStore, RelationshipStore, SpamFlagStore,
    StoreBackend, StoreErrorKind, StoreFailure,
  },
};

#[derive(Debug, Error)]
pub enum MemoryError {
  #[error("not found: {0}")]
  NotFound(String),

  #[error("constraint violated: {0}")]
  Constraint(String),

  #[error("injected transient failure")]
  Transient,
}

impl StoreFailure for MemoryError {
  fn kind(&self) -> StoreErrorKind {
    match self {
      Self::NotFound(_) => StoreErrorKind::NotFound,
      Self::Constraint(_) => StoreErrorKind::Constraint,
      Self::Transient => StoreErrorKind::Transient,
    }
  }
}

type Result<T, E = MemoryError> = std::result::Result<T, E>;

#[derive(Default)]
struct State {
  relationships: HashMap<Uuid, Relationship>,
  rate_limits:   HashMap<(Principal, String), RateLimitRecord>,
  flags:         HashMap<(UserId, DetectionType), SpamFlag>,
  groups:        HashMap<Uuid, AccountGroup>,
  /// user -> (group, membership)
  memberships:   HashMap<UserId, (Uuid, GroupMember)>,
}

#[derive(Default)]
pub struct MemoryStore {
  state:            Mutex<State>,
  read_failures:    AtomicUsize,
  write_failures:   AtomicUsize,
  fail_spam_writes: AtomicBool,
}

impl MemoryStore {
  pub fn new() -> Self { Self::default() }

  /// Make the next `n` reads fail with a transient error.
  pub fn inject_read_failures(&self, n: usize) {
    self.read_failures.store(n, Ordering::SeqCst);
  }

  /// Make the next `n` relationship writes fail with a transient error.
  pub fn inject_write_failures(&self, n: usize) {
    self.write_failures.store(n, Ordering::SeqCst);
  }

  /// Make every spam flag write fail until switched off again.
  pub fn fail_spam_writes(&self, fail: bool) {
    self.fail_spam_writes.store(fail, Ordering::SeqCst);
  }

  /// Total number of relationship rows ever written, live or not.
  pub fn relationship_count(&self) -> usize { self.lock().relationships.len() }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn take_failure(counter: &AtomicUsize) -> Result<()> {
    let hit = counter
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if hit { Err(MemoryError::Transient) } else { Ok(()) }
  }

  fn read(&self) -> Result<MutexGuard<'_, State>> {
    Self::take_failure(&self.read_failures)?;
    Ok(self.lock())
  }

  fn write(&self) -> Result<MutexGuard<'_, State>> {
    Self::take_failure(&self.write_failures)?;
    Ok(self.lock())
  }
}

impl StoreBackend for MemoryStore {
  type Error = MemoryError;
}

// ─── Relationships ───────────────────────────────────────────────────────────

impl State {
  fn live(&self, from: UserId, to: UserId, kind: RelationshipKind) -> Option<&Relationship> {
    self.relationships.values().find(|r| {
      r.from_user == from && r.to_user == to && r.kind == kind && r.status.is_live()
    })
  }
}

impl RelationshipStore for MemoryStore {
  async fn get(&self, id: Uuid) -> Result<Option<Relationship>> {
    Ok(self.read()?.relationships.get(&id).cloned())
  }

  async fn find(
    &self,
    from: UserId,
    to: UserId,
    kind: RelationshipKind,
  ) -> Result<Option<Relationship>> {
    Ok(self.read()?.live(from, to, kind).cloned())
  }

  async fn list_between(&self, a: UserId, b: UserId) -> Result<Vec<Relationship>> {
    let state = self.read()?;
    let mut rows: Vec<_> = state
      .relationships
      .values()
      .filter(|r| r.joins(a, b) && r.status.is_live())
      .cloned()
      .collect();
    rows.sort_by(page_order);
    Ok(rows)
  }

  async fn insert(&self, rel: Relationship) -> Result<Relationship> {
    let mut state = self.write()?;
    if state.live(rel.from_user, rel.to_user, rel.kind).is_some() {
      return Err(MemoryError::Constraint(format!(
        "live {} already exists from {} to {}",
        rel.kind, rel.from_user, rel.to_user
      )));
    }
    state.relationships.insert(rel.relationship_id, rel.clone());
    Ok(rel)
  }

  async fn update_status(
    &self,
    id: Uuid,
    change: StatusChange,
    at: DateTime<Utc>,
  ) -> Result<Relationship> {
    let mut state = self.write()?;
    let (from, to, kind) = {
      let rel = state
        .relationships
        .get(&id)
        .ok_or_else(|| MemoryError::NotFound(format!("relationship {id}")))?;
      if rel.status != change.expected {
        return Err(MemoryError::Constraint(format!(
          "relationship {id} is {}, expected {}",
          rel.status, change.expected
        )));
      }
      (rel.from_user, rel.to_user, rel.kind)
    };

    // Reviving a removed row must not create a second live one.
    if !change.expected.is_live()
      && change.status.is_live()
      && state.live(from, to, kind).is_some()
    {
      return Err(MemoryError::Constraint(format!(
        "live {kind} already exists from {from} to {to}"
      )));
    }

    let rel = state
      .relationships
      .get_mut(&id)
      .ok_or_else(|| MemoryError::NotFound(format!("relationship {id}")))?;
    rel.status = change.status;
    rel.suppressed_from = change.suppressed_from;
    rel.updated_at = at;
    Ok(rel.clone())
  }

  async fn list_by_user(
    &self,
    user: UserId,
    filter: RelationshipFilter,
    page: PageRequest,
  ) -> Result<(Vec<Relationship>, u64)> {
    let state = self.read()?;
    let mut rows: Vec<_> = state
      .relationships
      .values()
      .filter(|r| filter.matches(user, r))
      .cloned()
      .collect();
    rows.sort_by(page_order);
    let total = rows.len() as u64;
    let items = rows.into_iter().skip(page.offset).take(page.limit).collect();
    Ok((items, total))
  }

  async fn count_since(
    &self,
    user: UserId,
    kind: RelationshipKind,
    direction: Direction,
    since: DateTime<Utc>,
  ) -> Result<u64> {
    let state = self.read()?;
    let count = state
      .relationships
      .values()
      .filter(|r| r.kind == kind && r.created_at >= since)
      .filter(|r| match direction {
        Direction::Outgoing => r.from_user == user,
        Direction::Incoming => r.to_user == user,
        Direction::Both => r.from_user == user || r.to_user == user,
      })
      .count();
    Ok(count as u64)
  }
}

// ─── Rate limits ─────────────────────────────────────────────────────────────

impl RateLimitStore for MemoryStore {
  async fn get_rate_limit<'a>(
    &'a self,
    principal: Principal,
    action: &'a str,
  ) -> Result<Option<RateLimitRecord>> {
    Ok(self.read()?.rate_limits.get(&(principal, action.to_owned())).cloned())
  }

  async fn upsert_rate_limit(&self, record: RateLimitRecord) -> Result<()> {
    let key = (record.principal, record.action.clone());
    self.lock().rate_limits.insert(key, record);
    Ok(())
  }

  async fn compare_and_set_rate_limit(
    &self,
    expected: Option<RateLimitRecord>,
    new: RateLimitRecord,
  ) -> Result<bool> {
    let mut state = self.lock();
    let key = (new.principal, new.action.clone());
    if state.rate_limits.get(&key) != expected.as_ref() {
      return Ok(false);
    }
    state.rate_limits.insert(key, new);
    Ok(true)
  }
}

// ─── Spam flags ──────────────────────────────────────────────────────────────

impl SpamFlagStore for MemoryStore {
  async fn get_flag(&self, user: UserId, detection: DetectionType) -> Result<Option<SpamFlag>> {
    Ok(self.read()?.flags.get(&(user, detection)).cloned())
  }

  async fn upsert_flag(&self, flag: SpamFlag) -> Result<()> {
    if self.fail_spam_writes.load(Ordering::SeqCst) {
      return Err(MemoryError::Transient);
    }
    self.lock().flags.insert((flag.user_id, flag.detection_type), flag);
    Ok(())
  }

  async fn list_flags_for_user(&self, user: UserId) -> Result<Vec<SpamFlag>> {
    let state = self.read()?;
    let mut flags: Vec<_> =
      state.flags.values().filter(|f| f.user_id == user).cloned().collect();
    flags.sort_by_key(|f| f.detection_type as u8);
    Ok(flags)
  }
}

// ─── Account groups ──────────────────────────────────────────────────────────

impl State {
  fn open_group(&self, group_id: Uuid) -> Result<&AccountGroup> {
    self
      .groups
      .get(&group_id)
      .filter(|g| g.dissolved_at.is_none())
      .ok_or_else(|| MemoryError::NotFound(format!("account group {group_id}")))
  }

  fn members(&self, group_id: Uuid) -> Vec<GroupMember> {
    let mut members: Vec<_> = self
      .memberships
      .values()
      .filter(|(g, _)| *g == group_id)
      .map(|(_, m)| m.clone())
      .collect();
    members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.user_id.cmp(&b.user_id)));
    members
  }

  fn demote_all(&mut self, group_id: Uuid) {
    for (g, m) in self.memberships.values_mut() {
      if *g == group_id {
        m.is_primary = false;
      }
    }
  }
}

impl AccountGroupStore for MemoryStore {
  async fn group_for_user(&self, user: UserId) -> Result<Option<Uuid>> {
    Ok(self.read()?.memberships.get(&user).map(|(g, _)| *g))
  }

  async fn get_group(&self, group_id: Uuid) -> Result<Option<AccountGroup>> {
    let state = self.read()?;
    Ok(state.open_group(group_id).ok().cloned())
  }

  async fn members_of(&self, group_id: Uuid) -> Result<Vec<GroupMember>> {
    Ok(self.read()?.members(group_id))
  }

  async fn insert_group(&self, group: AccountGroup, founder: GroupMember) -> Result<()> {
    let mut state = self.lock();
    if state.memberships.contains_key(&founder.user_id) {
      return Err(MemoryError::Constraint(format!(
        "user {} is already grouped",
        founder.user_id
      )));
    }
    state.memberships.insert(founder.user_id, (group.group_id, founder));
    state.groups.insert(group.group_id, group);
    Ok(())
  }

  async fn add_member(&self, group_id: Uuid, member: GroupMember) -> Result<()> {
    let mut state = self.lock();
    state.open_group(group_id)?;
    if state.memberships.contains_key(&member.user_id) {
      return Err(MemoryError::Constraint(format!(
        "user {} is already grouped",
        member.user_id
      )));
    }
    if member.is_primary {
      state.demote_all(group_id);
    }
    state.memberships.insert(member.user_id, (group_id, member));
    Ok(())
  }

  async fn remove_member(
    &self,
    group_id: Uuid,
    user: UserId,
    at: DateTime<Utc>,
  ) -> Result<MemberRemoval> {
    let mut state = self.write()?;
    if !matches!(state.memberships.get(&user), Some((g, _)) if *g == group_id) {
      return Err(MemoryError::NotFound(format!(
        "user {user} is not a member of account group {group_id}"
      )));
    }
    state.memberships.remove(&user);

    let remaining = state.members(group_id);
    if remaining.len() > 1 {
      return Ok(MemberRemoval { remaining, dissolved: false });
    }
    if let Some(group) = state.groups.get_mut(&group_id) {
      group.dissolved_at.get_or_insert(at);
    }
    state.memberships.retain(|_, (g, _)| *g != group_id);
    Ok(MemberRemoval { remaining: Vec::new(), dissolved: true })
  }

  async fn set_primary(&self, group_id: Uuid, user: UserId) -> Result<()> {
    let mut state = self.lock();
    state.open_group(group_id)?;
    if !matches!(state.memberships.get(&user), Some((g, _)) if *g == group_id) {
      return Err(MemoryError::NotFound(format!(
        "user {user} is not a member of account group {group_id}"
      )));
    }
    state.demote_all(group_id);
    if let Some((_, member)) = state.memberships.get_mut(&user) {
      member.is_primary = true;
    }
    Ok(())
  }
}
