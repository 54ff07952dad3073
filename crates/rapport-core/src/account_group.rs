//! Account groups — several login identities belonging to one person.
//!
//! A user is in at most one group. A group has at most one primary member;
//! it may have none after the primary leaves, until another member is
//! promoted. Groups are dissolved once a removal leaves them with a single
//! member or none.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result, UserId,
  context::OpContext,
  rate_limit::Principal,
  store::AccountGroupStore,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountGroup {
  pub group_id:     Uuid,
  pub created_at:   DateTime<Utc>,
  pub dissolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
  pub user_id:    UserId,
  pub is_primary: bool,
  pub joined_at:  DateTime<Utc>,
}

/// A group together with its current members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupView {
  pub group:   AccountGroup,
  pub members: Vec<GroupMember>,
}

impl GroupView {
  pub fn primary(&self) -> Option<&GroupMember> {
    self.members.iter().find(|m| m.is_primary)
  }
}

/// What a single member removal left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRemoval {
  /// Members still linked after the call; empty once the group dissolved.
  pub remaining: Vec<GroupMember>,
  /// The removal left one member or none, so the group was dissolved and
  /// the last membership released along with it.
  pub dissolved: bool,
}

pub struct AccountGroupLinker<S> {
  store:   Arc<S>,
  backoff: Duration,
}

impl<S: AccountGroupStore> AccountGroupLinker<S> {
  pub fn new(store: Arc<S>, read_backoff: Duration) -> Self {
    Self { store, backoff: read_backoff }
  }

  pub async fn group_for_user(&self, cx: &OpContext, user: UserId) -> Result<Option<Uuid>> {
    let store = &*self.store;
    cx.read(self.backoff, move || store.group_for_user(user)).await
  }

  /// The identity rate limits are charged to.
  pub async fn principal_for(&self, cx: &OpContext, user: UserId) -> Result<Principal> {
    Ok(Principal::resolve(user, self.group_for_user(cx, user).await?))
  }

  pub async fn members_of(&self, cx: &OpContext, group_id: Uuid) -> Result<GroupView> {
    let store = &*self.store;
    let group = cx
      .read(self.backoff, move || store.get_group(group_id))
      .await?
      .ok_or_else(|| Error::NotFound(format!("account group {group_id}")))?;
    let members = cx.read(self.backoff, move || store.members_of(group_id)).await?;
    Ok(GroupView { group, members })
  }

  pub async fn create_group_with_user(
    &self,
    cx: &OpContext,
    user: UserId,
    is_primary: bool,
    now: DateTime<Utc>,
  ) -> Result<AccountGroup> {
    if let Some(existing) = self.group_for_user(cx, user).await? {
      return Err(Error::Conflict(format!(
        "user {user} already belongs to account group {existing}"
      )));
    }

    let group = AccountGroup { group_id: Uuid::new_v4(), created_at: now, dissolved_at: None };
    let founder = GroupMember { user_id: user, is_primary, joined_at: now };
    cx.write(self.store.insert_group(group.clone(), founder)).await?;
    tracing::info!(group_id = %group.group_id, %user, "account group created");
    Ok(group)
  }

  pub async fn add_user_to_group(
    &self,
    cx: &OpContext,
    group_id: Uuid,
    user: UserId,
    is_primary: bool,
    now: DateTime<Utc>,
  ) -> Result<()> {
    let store = &*self.store;
    if cx.read(self.backoff, move || store.get_group(group_id)).await?.is_none() {
      return Err(Error::NotFound(format!("account group {group_id}")));
    }
    if let Some(existing) = self.group_for_user(cx, user).await? {
      return Err(Error::Conflict(format!(
        "user {user} already belongs to account group {existing}"
      )));
    }

    let member = GroupMember { user_id: user, is_primary, joined_at: now };
    cx.write(store.add_member(group_id, member)).await?;
    tracing::info!(%group_id, %user, is_primary, "account linked");
    Ok(())
  }

  /// Unlink `user`. Returns `true` if the removal dissolved the group.
  pub async fn remove_user_from_group(
    &self,
    cx: &OpContext,
    group_id: Uuid,
    user: UserId,
    now: DateTime<Utc>,
  ) -> Result<bool> {
    let removal = cx.write(self.store.remove_member(group_id, user, now)).await?;
    tracing::info!(
      %group_id, %user,
      remaining = removal.remaining.len(),
      dissolved = removal.dissolved,
      "account unlinked"
    );

    if !removal.dissolved && !removal.remaining.iter().any(|m| m.is_primary) {
      tracing::debug!(%group_id, "account group has no primary");
    }
    Ok(removal.dissolved)
  }

  pub async fn set_primary_account(
    &self,
    cx: &OpContext,
    group_id: Uuid,
    user: UserId,
  ) -> Result<()> {
    cx.write(self.store.set_primary(group_id, user)).await?;
    tracing::info!(%group_id, %user, "primary account changed");
    Ok(())
  }

  /// True only if both users resolve to the same, non-null group.
  pub async fn verify_same_group(&self, cx: &OpContext, a: UserId, b: UserId) -> Result<bool> {
    let ga = self.group_for_user(cx, a).await?;
    if ga.is_none() {
      return Ok(false);
    }
    Ok(ga == self.group_for_user(cx, b).await?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::memory::MemoryStore;

  fn linker() -> AccountGroupLinker<MemoryStore> {
    AccountGroupLinker::new(Arc::new(MemoryStore::new()), Duration::from_millis(1))
  }

  fn primaries(view: &GroupView) -> usize {
    view.members.iter().filter(|m| m.is_primary).count()
  }

  #[tokio::test]
  async fn create_fails_for_grouped_user() {
    let l = linker();
    let cx = OpContext::new();
    let u = Uuid::new_v4();
    l.create_group_with_user(&cx, u, true, Utc::now()).await.unwrap();
    let err = l.create_group_with_user(&cx, u, true, Utc::now()).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
  }

  #[tokio::test]
  async fn adding_a_primary_demotes_the_old_one() {
    let l = linker();
    let cx = OpContext::new();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let g = l.create_group_with_user(&cx, a, true, Utc::now()).await.unwrap();

    l.add_user_to_group(&cx, g.group_id, b, true, Utc::now()).await.unwrap();
    let view = l.members_of(&cx, g.group_id).await.unwrap();
    assert_eq!(primaries(&view), 1);
    assert_eq!(view.primary().unwrap().user_id, b);
  }

  #[tokio::test]
  async fn add_rejects_users_in_any_group() {
    let l = linker();
    let cx = OpContext::new();
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let g1 = l.create_group_with_user(&cx, a, true, Utc::now()).await.unwrap();
    let g2 = l.create_group_with_user(&cx, b, true, Utc::now()).await.unwrap();
    l.add_user_to_group(&cx, g2.group_id, c, false, Utc::now()).await.unwrap();

    let same = l.add_user_to_group(&cx, g2.group_id, c, false, Utc::now()).await;
    assert!(matches!(same, Err(Error::Conflict(_))));
    let other = l.add_user_to_group(&cx, g1.group_id, b, false, Utc::now()).await;
    assert!(matches!(other, Err(Error::Conflict(_))));
  }

  #[tokio::test]
  async fn add_to_unknown_group_is_not_found() {
    let l = linker();
    let cx = OpContext::new();
    let res = l.add_user_to_group(&cx, Uuid::new_v4(), Uuid::new_v4(), false, Utc::now()).await;
    assert!(matches!(res, Err(Error::NotFound(_))));
  }

  #[tokio::test]
  async fn removing_the_primary_leaves_no_primary() {
    let l = linker();
    let cx = OpContext::new();
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let g = l.create_group_with_user(&cx, a, true, Utc::now()).await.unwrap();
    l.add_user_to_group(&cx, g.group_id, b, false, Utc::now()).await.unwrap();
    l.add_user_to_group(&cx, g.group_id, c, false, Utc::now()).await.unwrap();

    let dissolved = l.remove_user_from_group(&cx, g.group_id, a, Utc::now()).await.unwrap();
    assert!(!dissolved);
    let view = l.members_of(&cx, g.group_id).await.unwrap();
    assert_eq!(primaries(&view), 0);

    l.set_primary_account(&cx, g.group_id, c).await.unwrap();
    let view = l.members_of(&cx, g.group_id).await.unwrap();
    assert_eq!(view.primary().unwrap().user_id, c);
    assert_eq!(primaries(&view), 1);
  }

  #[tokio::test]
  async fn group_dissolves_at_one_member() {
    let l = linker();
    let cx = OpContext::new();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let g = l.create_group_with_user(&cx, a, true, Utc::now()).await.unwrap();
    l.add_user_to_group(&cx, g.group_id, b, false, Utc::now()).await.unwrap();
    assert!(l.verify_same_group(&cx, a, b).await.unwrap());

    let dissolved = l.remove_user_from_group(&cx, g.group_id, b, Utc::now()).await.unwrap();
    assert!(dissolved);
    assert!(l.group_for_user(&cx, a).await.unwrap().is_none());
    assert!(matches!(l.members_of(&cx, g.group_id).await, Err(Error::NotFound(_))));
    assert!(!l.verify_same_group(&cx, a, b).await.unwrap());
  }

  #[tokio::test]
  async fn failed_removal_keeps_the_group_whole() {
    let store = Arc::new(MemoryStore::new());
    let l = AccountGroupLinker::new(store.clone(), Duration::from_millis(1));
    let cx = OpContext::new();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let g = l.create_group_with_user(&cx, a, true, Utc::now()).await.unwrap();
    l.add_user_to_group(&cx, g.group_id, b, false, Utc::now()).await.unwrap();

    store.inject_write_failures(1);
    let res = l.remove_user_from_group(&cx, g.group_id, b, Utc::now()).await;
    assert!(matches!(res, Err(Error::TransientStore(_))));
    assert_eq!(l.members_of(&cx, g.group_id).await.unwrap().members.len(), 2);

    // Dissolution happens in the same call as the removal, never after it.
    assert!(l.remove_user_from_group(&cx, g.group_id, b, Utc::now()).await.unwrap());
    assert!(matches!(l.members_of(&cx, g.group_id).await, Err(Error::NotFound(_))));
    assert!(l.group_for_user(&cx, a).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn ungrouped_users_are_never_the_same_group() {
    let l = linker();
    let cx = OpContext::new();
    assert!(!l.verify_same_group(&cx, Uuid::new_v4(), Uuid::new_v4()).await.unwrap());
  }

  #[tokio::test]
  async fn set_primary_for_non_member_is_not_found() {
    let l = linker();
    let cx = OpContext::new();
    let g = l.create_group_with_user(&cx, Uuid::new_v4(), true, Utc::now()).await.unwrap();
    let res = l.set_primary_account(&cx, g.group_id, Uuid::new_v4()).await;
    assert!(matches!(res, Err(Error::NotFound(_))));
  }
}
