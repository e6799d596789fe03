//! Per-fingerprint coalescing of concurrent misses.
//!
//! The first caller to [`SingleFlight::join`] an absent key becomes the
//! leader and does the upstream work; later callers become followers and
//! await the leader's result. A leader that is dropped without completing
//! releases the group, and its followers come back with `None` so one of
//! them can take over as the next leader.

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

type Slot<V> = Option<Result<V>>;

struct Group<V> {
    id: u64,
    rx: watch::Receiver<Slot<V>>,
}

/// Registry of in-flight computations keyed by fingerprint.
pub struct SingleFlight<V> {
    groups: Arc<DashMap<Fingerprint, Group<V>>>,
    next_id: AtomicU64,
}

/// Role assigned by [`SingleFlight::join`].
pub enum Flight<V> {
    Leader(LeaderGuard<V>),
    Follower(Waiter<V>),
}

impl<V: Clone> SingleFlight<V> {
    pub fn new() -> Self {
        SingleFlight {
            groups: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Join the group for `key`, creating it if absent.
    pub fn join(&self, key: Fingerprint) -> Flight<V> {
        match self.groups.entry(key) {
            Entry::Occupied(group) => {
                trace!("singleflight {} -> follower", key.short());
                Flight::Follower(Waiter {
                    rx: group.get().rx.clone(),
                })
            }
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                vacant.insert(Group { id, rx });
                trace!("singleflight {} -> leader #{}", key.short(), id);
                Flight::Leader(LeaderGuard {
                    key,
                    id,
                    tx,
                    groups: Arc::clone(&self.groups),
                    completed: false,
                })
            }
        }
    }

    /// Number of keys with a computation in flight.
    pub fn in_flight(&self) -> usize {
        self.groups.len()
    }
}

impl<V: Clone> Default for SingleFlight<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by the caller doing the upstream work.
///
/// Dropping it without calling [`LeaderGuard::complete`] abandons the group.
pub struct LeaderGuard<V> {
    key: Fingerprint,
    id: u64,
    tx: watch::Sender<Slot<V>>,
    groups: Arc<DashMap<Fingerprint, Group<V>>>,
    completed: bool,
}

impl<V> LeaderGuard<V> {
    pub fn key(&self) -> Fingerprint {
        self.key
    }

    /// Publish the result to every follower and release the group.
    pub fn complete(mut self, result: Result<V>) {
        self.tx.send_replace(Some(result));
        self.completed = true;
    }
}

impl<V> Drop for LeaderGuard<V> {
    fn drop(&mut self) {
        let id = self.id;
        self.groups.remove_if(&self.key, |_, group| group.id == id);
        if !self.completed {
            warn!(
                "singleflight leader for {} abandoned; followers will retry",
                self.key.short()
            );
        }
    }
}

/// Held by a caller waiting on someone else's computation.
pub struct Waiter<V> {
    rx: watch::Receiver<Slot<V>>,
}

impl<V: Clone> Waiter<V> {
    /// Wait for the leader.
    ///
    /// Returns `None` when the leader was dropped before completing; the
    /// caller should join again.
    pub async fn wait(mut self) -> Option<Result<V>> {
        match self.rx.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        }
    }
}
