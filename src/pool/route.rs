use std::{collections::VecDeque, sync::Arc};

use ahash::AHashMap;
use crossbeam_queue::SegQueue;

use super::{
    entry::PoolEntry,
    lease::{CompletedLease, Completion},
};
use crate::connect::{ConnectHandle, Poolable};

/// One connect attempt bound to the lease that initiated it.
pub(crate) struct PendingConnect<R, C, S> {
    pub(crate) handle: Arc<ConnectHandle<R>>,
    pub(crate) completion: Completion<R, C, S>,
}

/// Per-route bookkeeping: the route's leased, idle and pending sets.
///
/// Does no global accounting and takes no locks of its own; the pool core
/// serializes all access.
pub(crate) struct RoutePool<R, C, S> {
    leased: AHashMap<u64, Arc<PoolEntry<R, C, S>>>,
    available: VecDeque<Arc<PoolEntry<R, C, S>>>,
    pending: AHashMap<u64, PendingConnect<R, C, S>>,
}

impl<R, C, S> RoutePool<R, C, S> {
    pub(crate) fn new() -> Self {
        RoutePool {
            leased: AHashMap::new(),
            available: VecDeque::new(),
            pending: AHashMap::new(),
        }
    }

    pub(crate) fn allocated(&self) -> usize {
        self.leased.len() + self.available.len() + self.pending.len()
    }

    pub(crate) fn leased_count(&self) -> usize {
        self.leased.len()
    }

    pub(crate) fn available_count(&self) -> usize {
        self.available.len()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Pick an idle entry for the requested state without removing it.
    ///
    /// Exact state matches only; stateless entries serve stateless
    /// requests. Most recently freed wins.
    pub(crate) fn get_free(&self, state: Option<&S>) -> Option<Arc<PoolEntry<R, C, S>>>
    where
        S: PartialEq,
    {
        self.available
            .iter()
            .find(|entry| entry.state_matches(state))
            .cloned()
    }

    /// The least recently freed idle entry, the eviction victim.
    pub(crate) fn last_used(&self) -> Option<Arc<PoolEntry<R, C, S>>> {
        self.available.back().cloned()
    }

    /// Move a leased entry back to the idle set, or just drop it from the
    /// leased set when it is not reusable.
    pub(crate) fn free(&mut self, entry: &Arc<PoolEntry<R, C, S>>, reusable: bool) {
        if self.leased.remove(&entry.id()).is_some() && reusable {
            self.available.push_front(entry.clone());
        }
    }

    /// Claim an idle entry for lease.
    pub(crate) fn claim(&mut self, entry: &Arc<PoolEntry<R, C, S>>) {
        self.drop_available(entry.id());
        self.leased.insert(entry.id(), entry.clone());
    }

    /// Drop an idle entry that turned out closed or was evicted.
    pub(crate) fn discard(&mut self, entry: &PoolEntry<R, C, S>) {
        self.drop_available(entry.id());
    }

    /// Remove the entry from whichever of leased/available holds it.
    pub(crate) fn remove(&mut self, entry: &PoolEntry<R, C, S>) {
        if self.leased.remove(&entry.id()).is_none() {
            self.drop_available(entry.id());
        }
    }

    /// Record a freshly created entry as leased.
    pub(crate) fn insert_leased(&mut self, entry: Arc<PoolEntry<R, C, S>>) {
        self.leased.insert(entry.id(), entry);
    }

    pub(crate) fn add_pending(
        &mut self,
        handle: Arc<ConnectHandle<R>>,
        completion: Completion<R, C, S>,
    ) {
        self.pending
            .insert(handle.id(), PendingConnect { handle, completion });
    }

    /// Take the pending record for a resolved connect attempt. Shared by
    /// the completed, failed, cancelled and timeout outcomes; what happens
    /// to the bound lease differs at the core.
    pub(crate) fn take_pending(&mut self, id: u64) -> Option<PendingConnect<R, C, S>> {
        self.pending.remove(&id)
    }

    /// Cancel outstanding attempts and close everything this route holds.
    ///
    /// Completions of cancelled attempts are queued for fan-out rather
    /// than notified here; the caller still holds the pool lock.
    pub(crate) fn shutdown(mut self, cancelled: &SegQueue<CompletedLease<R, C, S>>)
    where
        C: Poolable,
    {
        for (_, pending) in self.pending.drain() {
            pending.handle.cancel();
            cancelled.push(pending.completion.into_cancelled());
        }
        for entry in self.available.drain(..) {
            entry.close();
        }
        for (_, entry) in self.leased.drain() {
            entry.close();
        }
    }

    fn drop_available(&mut self, id: u64) {
        if let Some(pos) = self.available.iter().position(|entry| entry.id() == id) {
            self.available.remove(pos);
        }
    }
}
