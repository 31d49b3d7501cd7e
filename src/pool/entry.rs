use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use crate::{connect::Poolable, sync::Mutex};

/// A handle to one live pooled connection.
///
/// Entries are shared between the pool's bookkeeping and the caller that
/// leased them, so the connection, affinity state and timestamps sit
/// behind a small per-entry mutex. `closed` is a monotone latch: once an
/// entry is closed it stays closed.
pub struct PoolEntry<R, C, S = ()> {
    id: u64,
    route: R,
    created_at: Instant,
    valid_until: Option<Instant>,
    closed: AtomicBool,
    mutable: Mutex<EntryMut<C, S>>,
}

struct EntryMut<C, S> {
    conn: Option<C>,
    state: Option<S>,
    updated_at: Instant,
    expiry: Option<Instant>,
}

impl<R, C, S> PoolEntry<R, C, S> {
    pub(crate) fn new(id: u64, route: R, conn: C, time_to_live: Option<Duration>) -> Self {
        let now = Instant::now();
        let valid_until = time_to_live.and_then(|ttl| now.checked_add(ttl));
        PoolEntry {
            id,
            route,
            created_at: now,
            valid_until,
            closed: AtomicBool::new(false),
            mutable: Mutex::new(EntryMut {
                conn: Some(conn),
                state: None,
                updated_at: now,
                expiry: valid_until,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn route(&self) -> &R {
        &self.route
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the entry was created or last released back to the pool.
    pub fn updated_at(&self) -> Instant {
        self.mutable.lock().updated_at
    }

    /// Run `f` against the live connection.
    ///
    /// Returns `None` once the entry has been closed.
    pub fn with_connection<T>(&self, f: impl FnOnce(&mut C) -> T) -> Option<T> {
        self.mutable.lock().conn.as_mut().map(f)
    }

    /// The affinity state stamped on this entry, if any.
    pub fn state(&self) -> Option<S>
    where
        S: Clone,
    {
        self.mutable.lock().state.clone()
    }

    /// Stamp an affinity state on this entry.
    ///
    /// A stated entry is only reused by leases asking for an equal state;
    /// a stateless entry only by stateless leases.
    pub fn set_state(&self, state: Option<S>) {
        self.mutable.lock().state = state;
    }

    /// Refresh the keep-alive expiry: the entry stays reusable for
    /// `keep_alive` from now, never beyond its creation TTL.
    pub fn update_expiry(&self, keep_alive: Option<Duration>) {
        let now = Instant::now();
        let keep_alive_until = keep_alive.and_then(|dur| now.checked_add(dur));
        let mut mutable = self.mutable.lock();
        mutable.updated_at = now;
        mutable.expiry = match (self.valid_until, keep_alive_until) {
            (Some(ttl), Some(ka)) => Some(ttl.min(ka)),
            (ttl, None) => ttl,
            (None, ka) => ka,
        };
    }

    pub(crate) fn mark_updated(&self) {
        self.mutable.lock().updated_at = Instant::now();
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.mutable
            .lock()
            .expiry
            .is_some_and(|expiry| now >= expiry)
    }

    pub(crate) fn state_matches(&self, state: Option<&S>) -> bool
    where
        S: PartialEq,
    {
        match (state, self.mutable.lock().state.as_ref()) {
            (Some(want), Some(have)) => want == have,
            (None, None) => true,
            _ => false,
        }
    }
}

impl<R, C, S> PoolEntry<R, C, S>
where
    C: Poolable,
{
    /// Close the entry and its connection.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let conn = self.mutable.lock().conn.take();
        if let Some(mut conn) = conn {
            conn.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return true;
        }
        match self.mutable.lock().conn {
            Some(ref conn) => !conn.is_open(),
            None => true,
        }
    }
}

impl<R: fmt::Debug, C, S> fmt::Debug for PoolEntry<R, C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.id)
            .field("route", &self.route)
            .finish()
    }
}
