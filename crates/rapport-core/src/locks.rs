//! Per-key async mutexes.
//!
//! Used to serialize check-then-write sequences on a single key (a user pair,
//! a rate-limit bucket) without blocking unrelated keys. Entries are created
//! on first use and dropped again once the last holder or waiter lets go.

use std::{hash::Hash, sync::Arc};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{Result, context::OpContext};

pub struct KeyedLocks<K: Eq + Hash + Clone> {
  locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
  fn default() -> Self { Self { locks: DashMap::new() } }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
  pub fn new() -> Self { Self::default() }

  /// Wait for exclusive access to `key`, giving up if `cx` fires first.
  pub async fn lock(&self, cx: &OpContext, key: K) -> Result<KeyGuard<'_, K>> {
    // Clone under the shard lock so `release` can trust the strong count.
    let mutex = self.locks.entry(key.clone()).or_default().value().clone();
    match cx.run(mutex.lock_owned()).await {
      Ok(guard) => Ok(KeyGuard { owner: self, key, guard: Some(guard) }),
      Err(err) => {
        // The aborted future took our reference down with it.
        self.release(&key, 0);
        Err(err)
      }
    }
  }

  /// Number of keys with a live entry.
  pub fn len(&self) -> usize { self.locks.len() }

  pub fn is_empty(&self) -> bool { self.locks.is_empty() }

  /// Drop the map entry if nobody other than the map and `held` extra
  /// references still point at it.
  fn release(&self, key: &K, held: usize) {
    self
      .locks
      .remove_if(key, |_, mutex| Arc::strong_count(mutex) <= 1 + held);
  }
}

/// Exclusive access to one key; released on drop.
pub struct KeyGuard<'a, K: Eq + Hash + Clone> {
  owner: &'a KeyedLocks<K>,
  key:   K,
  guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> Drop for KeyGuard<'_, K> {
  fn drop(&mut self) {
    // The owned guard keeps one reference to the mutex alive.
    self.owner.release(&self.key, 1);
    self.guard.take();
  }
}
