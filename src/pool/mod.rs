//! A non-blocking, route-partitioned connection lease pool.
//!
//! The pool leases reusable connections to asynchronous callers, opening
//! new ones through an injected [`ConnectionInitiator`] when necessary,
//! while enforcing a global cap and per-route caps. Callers that cannot be
//! served immediately wait in FIFO order on the future returned by
//! [`Pool::lease`]; capacity freed by a release or a resolved connect
//! attempt is handed to the first eligible waiter.
//!
//! All bookkeeping lives behind a single mutex. Futures and callbacks are
//! never completed while that lock is held: terminal leases are pushed
//! onto a lock-free queue and drained after every state-changing
//! operation, so completion handlers may re-enter the pool freely.

mod entry;
mod lease;
mod route;

use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    hash::Hash,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use ahash::AHashMap;
use crossbeam_queue::SegQueue;
use futures_util::future::{self, Either};
use tokio::sync::oneshot;
use tracing::{debug, trace};

pub use self::{
    entry::PoolEntry,
    lease::{Lease, LeaseCallback},
};
use self::{
    lease::{CompletedLease, Completion, LeaseRequest},
    route::RoutePool,
};
use crate::{
    connect::{
        ConnectHandle, Connecting, ConnectionFactory, ConnectionInitiator, InitiatorStatus,
        Poolable,
    },
    error::Error,
    resolve::AddressResolver,
    rt::{BoxSendFuture, Exec, Executor, Sleep, Timer, TimerHandle},
    sync::Mutex,
};

/// Route key identifying a destination.
///
/// Equality and hashing are supplied by the caller; two equal routes share
/// caps and idle connections.
pub trait Route: Eq + Hash + Clone + Debug + Send + 'static {}

impl<T> Route for T where T: Eq + Hash + Clone + Debug + Send + 'static {}

/// Optional affinity discriminator carried by entries and lease requests.
pub trait State: PartialEq + Debug + Send + 'static {}

impl<T> State for T where T: PartialEq + Debug + Send + 'static {}

/// Pool configuration.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Ceiling on leased entries plus in-flight connect attempts across
    /// all routes.
    pub max_total: usize,
    /// Per-route allocation cap used when no override is set.
    pub default_max_per_route: usize,
    /// Entries older than this are never reused.
    pub time_to_live: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_total: 20,
            default_max_per_route: 2,
            time_to_live: None,
        }
    }
}

/// Hooks observing entry lifecycle transitions.
///
/// Invoked while the pool lock is held; implementations must be quick and
/// must not call back into the pool.
pub trait PoolObserver<R, C, S>: Send + Sync {
    fn on_lease(&self, entry: &PoolEntry<R, C, S>) {
        let _ = entry;
    }

    fn on_release(&self, entry: &PoolEntry<R, C, S>) {
        let _ = entry;
    }

    fn on_reuse(&self, entry: &PoolEntry<R, C, S>) {
        let _ = entry;
    }
}

/// Counters for the whole pool or for one route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub leased: usize,
    pub pending: usize,
    pub available: usize,
    pub max: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[leased: {}; pending: {}; available: {}; max: {}]",
            self.leased, self.pending, self.available, self.max
        )
    }
}

/// A pool of connections partitioned by route.
///
/// `R` is the route key, `C` the pooled connection, `IO` the session type
/// produced by the initiator, and `S` an optional affinity state. The pool
/// is cheap to clone; all clones share the same state.
pub struct Pool<R, C, IO, S = ()> {
    shared: Arc<PoolShared<R, C, IO, S>>,
}

impl<R, C, IO, S> Clone for Pool<R, C, IO, S> {
    fn clone(&self) -> Self {
        Pool {
            shared: self.shared.clone(),
        }
    }
}

struct PoolShared<R, C, IO, S> {
    initiator: Arc<dyn ConnectionInitiator<Session = IO>>,
    resolver: Arc<dyn AddressResolver<R>>,
    factory: Arc<dyn ConnectionFactory<R, IO, Connection = C>>,
    observer: Option<Arc<dyn PoolObserver<R, C, S>>>,
    exec: Exec,
    timer: Option<TimerHandle>,
    time_to_live: Option<Duration>,
    inner: Mutex<PoolInner<R, C, S>>,
    // Terminal leases awaiting fan-out; drained outside the lock.
    completed: SegQueue<CompletedLease<R, C, S>>,
    is_shut_down: AtomicBool,
    next_id: AtomicU64,
}

struct PoolInner<R, C, S> {
    routes: AHashMap<R, RoutePool<R, C, S>>,
    // Global leased set; always the union of the per-route leased sets.
    leased: AHashMap<u64, Arc<PoolEntry<R, C, S>>>,
    // Global idle list: front = most recently released, back = LRU.
    available: VecDeque<Arc<PoolEntry<R, C, S>>>,
    // Outstanding connect attempts across all routes.
    pending: AHashMap<u64, Arc<ConnectHandle<R>>>,
    // Waiting leases in arrival order; the order defines fairness.
    waiting: VecDeque<LeaseRequest<R, C, S>>,
    max_total: usize,
    default_max_per_route: usize,
    max_per_route: AHashMap<R, usize>,
}

/// What `process_pending_request` did with a request.
enum Processed<R, C, S> {
    /// Satisfied from the idle set or turned into a pending connect.
    Advanced,
    /// Reached a terminal state without consuming the dispatch slot.
    Settled,
    /// Cannot be served right now.
    Parked(LeaseRequest<R, C, S>),
}

enum ConnectOutcome<IO> {
    Ready(IO),
    Failed(io::Error),
    TimedOut,
    Cancelled,
}

impl<R, C, IO, S> Pool<R, C, IO, S>
where
    R: Route,
    C: Poolable,
    IO: Send + 'static,
    S: State,
{
    /// Create a pool around an initiator, a resolver and a connection
    /// factory.
    ///
    /// Without a timer, connect attempts are unbounded in time; lease
    /// deadlines are still enforced on every queue scan.
    pub fn new<I, A, F, E, M>(
        config: PoolConfig,
        initiator: I,
        resolver: A,
        factory: F,
        executor: E,
        timer: Option<M>,
    ) -> Pool<R, C, IO, S>
    where
        I: ConnectionInitiator<Session = IO>,
        A: AddressResolver<R>,
        F: ConnectionFactory<R, IO, Connection = C>,
        E: Executor<BoxSendFuture> + Send + Sync + 'static,
        M: Timer + Send + Sync + 'static,
    {
        assert!(config.max_total > 0, "max_total must be positive");
        assert!(
            config.default_max_per_route > 0,
            "default_max_per_route must be positive"
        );
        Pool {
            shared: Arc::new(PoolShared {
                initiator: Arc::new(initiator),
                resolver: Arc::new(resolver),
                factory: Arc::new(factory),
                observer: None,
                exec: Exec::new(executor),
                timer: timer.map(TimerHandle::new),
                time_to_live: config.time_to_live,
                inner: Mutex::new(PoolInner {
                    routes: AHashMap::new(),
                    leased: AHashMap::new(),
                    available: VecDeque::new(),
                    pending: AHashMap::new(),
                    waiting: VecDeque::new(),
                    max_total: config.max_total,
                    default_max_per_route: config.default_max_per_route,
                    max_per_route: AHashMap::new(),
                }),
                completed: SegQueue::new(),
                is_shut_down: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Install lifecycle hooks. Must be called before the pool is cloned
    /// or handed out.
    pub fn with_observer(mut self, observer: Arc<dyn PoolObserver<R, C, S>>) -> Self {
        Arc::get_mut(&mut self.shared)
            .expect("observer must be installed before the pool is shared")
            .observer = Some(observer);
        self
    }

    /// Lease an entry for `route`, waiting indefinitely.
    pub fn lease(&self, route: R, state: Option<S>) -> Result<Lease<R, C, S>, Error> {
        self.lease_with(route, state, None, None)
    }

    /// Lease an entry for `route`.
    ///
    /// `connect_timeout` bounds both the wait for capacity and the connect
    /// attempt itself; when it elapses the lease fails with
    /// [`Error::Timeout`]. The callback, if any, is invoked once with the
    /// terminal outcome, after the caller's future has been completed.
    ///
    /// Fails synchronously with [`Error::ShutDown`] once the pool has been
    /// shut down.
    pub fn lease_with(
        &self,
        route: R,
        state: Option<S>,
        connect_timeout: Option<Duration>,
        callback: Option<Box<dyn LeaseCallback<R, C, S>>>,
    ) -> Result<Lease<R, C, S>, Error> {
        if self.shared.is_shut_down() {
            return Err(Error::ShutDown);
        }
        let (tx, rx) = oneshot::channel();
        let request =
            LeaseRequest::new(route, state, connect_timeout, Completion::new(tx, callback));
        {
            let mut inner = self.shared.inner.lock();
            if let Processed::Parked(request) =
                self.shared.process_pending_request(&mut inner, request)
            {
                inner.waiting.push_back(request);
            }
        }
        self.shared.fire_callbacks();
        Ok(Lease::new(rx))
    }

    /// Return a leased entry to the pool.
    ///
    /// A reusable entry becomes the most recently released idle entry for
    /// its route; otherwise it is closed. Releasing an entry that is not
    /// currently leased is a no-op, as is releasing after shutdown.
    pub fn release(&self, entry: Arc<PoolEntry<R, C, S>>, reusable: bool) {
        self.shared.release(entry, reusable);
    }

    /// Fail every waiting lease whose deadline has passed.
    pub fn validate_pending_requests(&self) {
        self.shared.validate_pending_requests();
    }

    /// Close idle entries that were last used at least `idle_time` ago.
    pub fn close_idle(&self, idle_time: Duration) {
        let deadline = Instant::now().checked_sub(idle_time);
        self.enum_available(|entry| {
            if deadline.is_some_and(|deadline| entry.updated_at() <= deadline) {
                entry.close();
            }
        });
    }

    /// Close idle entries whose expiry has passed.
    pub fn close_expired(&self) {
        let now = Instant::now();
        self.enum_available(|entry| {
            if entry.is_expired(now) {
                entry.close();
            }
        });
    }

    /// Visit every idle entry under the pool lock.
    ///
    /// Entries the callback closes are dropped from the pool; afterwards
    /// the waiting queue is re-scanned and empty route tables are purged.
    pub fn enum_available(&self, mut f: impl FnMut(&PoolEntry<R, C, S>)) {
        self.shared.enum_available(&mut f);
    }

    /// Visit every leased entry under the pool lock.
    pub fn enum_leased(&self, mut f: impl FnMut(&PoolEntry<R, C, S>)) {
        self.shared.enum_leased(&mut f);
    }

    /// Counters across all routes.
    pub fn total_stats(&self) -> PoolStats {
        let inner = self.shared.inner.lock();
        PoolStats {
            leased: inner.leased.len(),
            pending: inner.pending.len(),
            available: inner.available.len(),
            max: inner.max_total,
        }
    }

    /// Counters for one route.
    pub fn route_stats(&self, route: &R) -> PoolStats {
        let inner = self.shared.inner.lock();
        let (leased, pending, available) = inner.routes.get(route).map_or((0, 0, 0), |pool| {
            (
                pool.leased_count(),
                pool.pending_count(),
                pool.available_count(),
            )
        });
        PoolStats {
            leased,
            pending,
            available,
            max: inner.max_per_route(route),
        }
    }

    /// Snapshot of the routes the pool currently tracks.
    pub fn routes(&self) -> Vec<R> {
        self.shared.inner.lock().routes.keys().cloned().collect()
    }

    pub fn set_max_total(&self, max: usize) {
        assert!(max > 0, "max_total must be positive");
        self.shared.inner.lock().max_total = max;
    }

    pub fn max_total(&self) -> usize {
        self.shared.inner.lock().max_total
    }

    pub fn set_default_max_per_route(&self, max: usize) {
        assert!(max > 0, "default_max_per_route must be positive");
        self.shared.inner.lock().default_max_per_route = max;
    }

    pub fn default_max_per_route(&self) -> usize {
        self.shared.inner.lock().default_max_per_route
    }

    /// Cap `route` at `max` allocations.
    ///
    /// Lowering a cap does not evict anything by itself; the next lease
    /// for the route reconciles the overshoot.
    pub fn set_max_per_route(&self, route: R, max: usize) {
        assert!(max > 0, "max_per_route must be positive");
        self.shared.inner.lock().max_per_route.insert(route, max);
    }

    pub fn max_per_route(&self, route: &R) -> usize {
        self.shared.inner.lock().max_per_route(route)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// Shut the pool down.
    ///
    /// Cancels every pending connect attempt, closes every leased and idle
    /// entry, fails waiting leases as cancelled and finally shuts down the
    /// initiator, allowing it `wait` to wind down. Later calls are no-ops;
    /// late connect events on a shut-down pool are ignored.
    pub fn shutdown(&self, wait: Duration) {
        self.shared.shutdown(wait);
    }
}

impl<R, C, IO, S> fmt::Debug for Pool<R, C, IO, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("Pool")
            .field("leased", &inner.leased.len())
            .field("pending", &inner.pending.len())
            .field("available", &inner.available.len())
            .field("max_total", &inner.max_total)
            .finish()
    }
}

impl<R, C, S> PoolInner<R, C, S>
where
    R: Route,
{
    fn max_per_route(&self, route: &R) -> usize {
        self.max_per_route
            .get(route)
            .copied()
            .unwrap_or(self.default_max_per_route)
    }

    fn purge_empty_routes(&mut self) {
        self.routes.retain(|_, pool| pool.allocated() > 0);
    }
}

impl<R, C, IO, S> PoolShared<R, C, IO, S>
where
    R: Route,
    C: Poolable,
    IO: Send + 'static,
    S: State,
{
    fn is_shut_down(&self) -> bool {
        self.is_shut_down.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn observer(&self) -> Option<&dyn PoolObserver<R, C, S>> {
        self.observer.as_deref()
    }

    /// Try to satisfy one lease request: reuse an idle entry or initiate a
    /// new connect, evicting idle entries that stand in the way of the
    /// route or global cap.
    fn process_pending_request(
        self: &Arc<Self>,
        inner: &mut PoolInner<R, C, S>,
        request: LeaseRequest<R, C, S>,
    ) -> Processed<R, C, S> {
        if request.deadline_passed(Instant::now()) {
            trace!(route = ?request.route, "lease deadline passed while waiting");
            self.completed.push(request.into_failed(Error::Timeout));
            return Processed::Settled;
        }

        let route = request.route.clone();
        inner
            .routes
            .entry(route.clone())
            .or_insert_with(RoutePool::new);

        // Reuse path: skim closed and expired entries until a live one
        // turns up.
        loop {
            let candidate = inner
                .routes
                .get(&route)
                .and_then(|pool| pool.get_free(request.state.as_ref()));
            let Some(entry) = candidate else { break };
            if entry.is_expired(Instant::now()) {
                trace!(route = ?route, id = entry.id(), "discarding expired idle entry");
                entry.close();
            }
            if entry.is_closed() {
                remove_available(&mut inner.available, entry.id());
                if let Some(pool) = inner.routes.get_mut(&route) {
                    pool.discard(&entry);
                }
                continue;
            }
            remove_available(&mut inner.available, entry.id());
            if let Some(pool) = inner.routes.get_mut(&route) {
                pool.claim(&entry);
            }
            inner.leased.insert(entry.id(), entry.clone());
            debug!(route = ?route, id = entry.id(), "reusing idle connection");
            self.completed.push(request.into_completed(entry.clone()));
            if let Some(observer) = self.observer() {
                observer.on_reuse(&entry);
                observer.on_lease(&entry);
            }
            return Processed::Advanced;
        }

        // A new connection is needed. Shrink the route below its cap
        // before growing it.
        let max_per_route = inner.max_per_route(&route);
        let allocated = inner.routes.get(&route).map_or(0, RoutePool::allocated);
        let excess = (allocated + 1).saturating_sub(max_per_route);
        for _ in 0..excess {
            let last_used = inner.routes.get(&route).and_then(RoutePool::last_used);
            let Some(entry) = last_used else { break };
            trace!(route = ?route, id = entry.id(), "evicting idle entry over route cap");
            entry.close();
            remove_available(&mut inner.available, entry.id());
            if let Some(pool) = inner.routes.get_mut(&route) {
                pool.remove(&entry);
            }
        }

        if inner.routes.get(&route).map_or(0, RoutePool::allocated) >= max_per_route {
            return Processed::Parked(request);
        }

        let total_used = inner.pending.len() + inner.leased.len();
        let free_capacity = inner.max_total.saturating_sub(total_used);
        if free_capacity == 0 {
            return Processed::Parked(request);
        }
        // Make room so that pending + leased stays within max_total once
        // this connect is issued.
        if inner.available.len() > free_capacity - 1 {
            if let Some(entry) = inner.available.pop_back() {
                trace!(id = entry.id(), "evicting least recently used idle entry");
                entry.close();
                if let Some(pool) = inner.routes.get_mut(entry.route()) {
                    pool.remove(&entry);
                }
            }
        }

        let remote = match self.resolver.resolve_remote(&route) {
            Ok(remote) => remote,
            Err(err) => {
                debug!(route = ?route, error = %err, "remote address resolution failed");
                self.completed.push(request.into_failed(Error::Io(err)));
                return Processed::Settled;
            }
        };
        let local = match self.resolver.resolve_local(&route) {
            Ok(local) => local,
            Err(err) => {
                debug!(route = ?route, error = %err, "local address resolution failed");
                self.completed.push(request.into_failed(Error::Io(err)));
                return Processed::Settled;
            }
        };

        let (handle, cancel) =
            ConnectHandle::new(self.next_id(), route.clone(), request.connect_timeout);
        let handle = Arc::new(handle);
        debug!(route = ?route, id = handle.id(), "initiating new connection");
        self.spawn_connect(&handle, remote, local, cancel);
        inner.pending.insert(handle.id(), handle.clone());
        if let Some(pool) = inner.routes.get_mut(&route) {
            pool.add_pending(handle, request.into_completion());
        }
        Processed::Advanced
    }

    /// Spawn the task driving one connect attempt and routing its terminal
    /// outcome back into the pool.
    fn spawn_connect(
        self: &Arc<Self>,
        handle: &Arc<ConnectHandle<R>>,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        cancel: oneshot::Receiver<()>,
    ) {
        let connecting = self.initiator.connect(remote, local);
        let sleep = match (handle.connect_timeout(), &self.timer) {
            (Some(timeout), Some(timer)) => Some(timer.sleep(timeout)),
            _ => None,
        };
        let pool = Arc::downgrade(self);
        let handle = handle.clone();
        self.exec.execute(async move {
            let outcome = drive_connect(connecting, sleep, cancel).await;
            let Some(pool) = pool.upgrade() else { return };
            match outcome {
                ConnectOutcome::Ready(session) => pool.connect_completed(&handle, session),
                ConnectOutcome::Failed(err) => pool.connect_failed(&handle, err),
                ConnectOutcome::TimedOut => pool.connect_timed_out(&handle),
                ConnectOutcome::Cancelled => pool.connect_cancelled(&handle),
            }
        });
    }

    fn connect_completed(self: &Arc<Self>, handle: &ConnectHandle<R>, session: IO) {
        if self.is_shut_down() {
            return;
        }
        {
            let mut inner = self.inner.lock();
            inner.pending.remove(&handle.id());
            let pending = inner
                .routes
                .get_mut(handle.route())
                .and_then(|pool| pool.take_pending(handle.id()));
            if let Some(pending) = pending {
                match self.factory.create(handle.route(), session) {
                    Ok(conn) => {
                        let entry = Arc::new(PoolEntry::new(
                            self.next_id(),
                            handle.route().clone(),
                            conn,
                            self.time_to_live,
                        ));
                        if let Some(pool) = inner.routes.get_mut(handle.route()) {
                            pool.insert_leased(entry.clone());
                        }
                        inner.leased.insert(entry.id(), entry.clone());
                        debug!(route = ?handle.route(), id = entry.id(), "connection established");
                        self.completed
                            .push(pending.completion.into_completed(entry.clone()));
                        if let Some(observer) = self.observer() {
                            observer.on_lease(&entry);
                        }
                    }
                    Err(err) => {
                        debug!(route = ?handle.route(), error = %err, "connection construction failed");
                        self.completed
                            .push(pending.completion.into_failed(Error::Io(err)));
                    }
                }
            }
        }
        self.fire_callbacks();
    }

    fn connect_failed(self: &Arc<Self>, handle: &ConnectHandle<R>, err: io::Error) {
        if self.is_shut_down() {
            return;
        }
        {
            let mut inner = self.inner.lock();
            inner.pending.remove(&handle.id());
            let pending = inner
                .routes
                .get_mut(handle.route())
                .and_then(|pool| pool.take_pending(handle.id()));
            if let Some(pending) = pending {
                debug!(route = ?handle.route(), error = %err, "connect failed");
                self.completed
                    .push(pending.completion.into_failed(Error::Io(err)));
            }
            self.process_waiting(&mut inner, true);
        }
        self.fire_callbacks();
    }

    fn connect_timed_out(self: &Arc<Self>, handle: &ConnectHandle<R>) {
        if self.is_shut_down() {
            return;
        }
        {
            let mut inner = self.inner.lock();
            inner.pending.remove(&handle.id());
            let pending = inner
                .routes
                .get_mut(handle.route())
                .and_then(|pool| pool.take_pending(handle.id()));
            if let Some(pending) = pending {
                debug!(route = ?handle.route(), "connect timed out");
                self.completed
                    .push(pending.completion.into_failed(Error::Timeout));
            }
            self.process_waiting(&mut inner, true);
        }
        self.fire_callbacks();
    }

    fn connect_cancelled(self: &Arc<Self>, handle: &ConnectHandle<R>) {
        if self.is_shut_down() {
            return;
        }
        {
            let mut inner = self.inner.lock();
            inner.pending.remove(&handle.id());
            let pending = inner
                .routes
                .get_mut(handle.route())
                .and_then(|pool| pool.take_pending(handle.id()));
            if let Some(pending) = pending {
                trace!(route = ?handle.route(), "connect cancelled");
                self.completed.push(pending.completion.into_cancelled());
            }
            if self.initiator.status() <= InitiatorStatus::Active {
                self.process_waiting(&mut inner, true);
            }
        }
        self.fire_callbacks();
    }

    fn release(self: &Arc<Self>, entry: Arc<PoolEntry<R, C, S>>, reusable: bool) {
        if self.is_shut_down() {
            return;
        }
        {
            let mut inner = self.inner.lock();
            if inner.leased.remove(&entry.id()).is_some() {
                if let Some(pool) = inner.routes.get_mut(entry.route()) {
                    pool.free(&entry, reusable);
                }
                if reusable {
                    entry.mark_updated();
                    inner.available.push_front(entry.clone());
                    trace!(route = ?entry.route(), id = entry.id(), "connection released back to pool");
                    if let Some(observer) = self.observer() {
                        observer.on_release(&entry);
                    }
                } else {
                    entry.close();
                }
                self.process_waiting(&mut inner, true);
            }
        }
        self.fire_callbacks();
    }

    /// Scan the waiting FIFO. With `stop_on_advance`, stop at the first
    /// request that is satisfied or becomes a pending connect: one unit of
    /// freed capacity yields at most one new assignment. Requests that
    /// settle without consuming the slot (deadline passed, resolution
    /// failed) do not stop the scan.
    fn process_waiting(
        self: &Arc<Self>,
        inner: &mut PoolInner<R, C, S>,
        stop_on_advance: bool,
    ) {
        let mut index = 0;
        while index < inner.waiting.len() {
            let Some(request) = inner.waiting.remove(index) else {
                break;
            };
            if request.is_abandoned() {
                trace!(route = ?request.route, "dropping abandoned lease request");
                self.completed.push(request.into_cancelled());
                continue;
            }
            match self.process_pending_request(inner, request) {
                Processed::Advanced => {
                    if stop_on_advance {
                        return;
                    }
                }
                Processed::Settled => {}
                Processed::Parked(request) => {
                    inner.waiting.insert(index, request);
                    index += 1;
                }
            }
        }
    }

    fn validate_pending_requests(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let mut index = 0;
            while index < inner.waiting.len() {
                if inner.waiting[index].deadline_passed(now) {
                    let Some(request) = inner.waiting.remove(index) else {
                        break;
                    };
                    trace!(route = ?request.route, "failing lease past its deadline");
                    self.completed.push(request.into_failed(Error::Timeout));
                } else {
                    index += 1;
                }
            }
        }
        self.fire_callbacks();
    }

    fn enum_available(self: &Arc<Self>, f: &mut dyn FnMut(&PoolEntry<R, C, S>)) {
        {
            let mut inner = self.inner.lock();
            let mut index = 0;
            while index < inner.available.len() {
                let entry = inner.available[index].clone();
                f(&entry);
                if entry.is_closed() {
                    inner.available.remove(index);
                    if let Some(pool) = inner.routes.get_mut(entry.route()) {
                        pool.remove(&entry);
                    }
                } else {
                    index += 1;
                }
            }
            self.process_waiting(&mut inner, false);
            inner.purge_empty_routes();
        }
        self.fire_callbacks();
    }

    fn enum_leased(self: &Arc<Self>, f: &mut dyn FnMut(&PoolEntry<R, C, S>)) {
        let inner = self.inner.lock();
        for entry in inner.leased.values() {
            f(entry);
        }
    }

    /// Drain the completion queue, notifying futures and callbacks outside
    /// the pool lock. An entry whose future was dropped before delivery
    /// goes straight back into the pool.
    fn fire_callbacks(self: &Arc<Self>) {
        while let Some(done) = self.completed.pop() {
            if let Some(entry) = done.deliver() {
                trace!(id = entry.id(), "lease abandoned before delivery; re-pooling entry");
                self.release(entry, true);
            }
        }
    }

    fn shutdown(self: &Arc<Self>, wait: Duration) {
        if self.is_shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("shutting down pool");
        self.fire_callbacks();
        {
            let mut inner = self.inner.lock();
            for handle in inner.pending.values() {
                handle.cancel();
            }
            for entry in inner.available.iter() {
                entry.close();
            }
            for entry in inner.leased.values() {
                entry.close();
            }
            for (_, pool) in inner.routes.drain() {
                pool.shutdown(&self.completed);
            }
            inner.leased.clear();
            inner.pending.clear();
            inner.available.clear();
            for request in inner.waiting.drain(..) {
                self.completed.push(request.into_cancelled());
            }
        }
        self.fire_callbacks();
        self.initiator.shutdown(wait);
    }
}

fn remove_available<R, C, S>(available: &mut VecDeque<Arc<PoolEntry<R, C, S>>>, id: u64) {
    if let Some(pos) = available.iter().position(|entry| entry.id() == id) {
        available.remove(pos);
    }
}

async fn drive_connect<IO>(
    connecting: Connecting<IO>,
    sleep: Option<Pin<Box<dyn Sleep>>>,
    cancel: oneshot::Receiver<()>,
) -> ConnectOutcome<IO> {
    let attempt = async move {
        match sleep {
            Some(sleep) => match future::select(connecting, sleep).await {
                Either::Left((result, _)) => match result {
                    Ok(session) => ConnectOutcome::Ready(session),
                    Err(err) => ConnectOutcome::Failed(err),
                },
                Either::Right(((), _)) => ConnectOutcome::TimedOut,
            },
            None => match connecting.await {
                Ok(session) => ConnectOutcome::Ready(session),
                Err(err) => ConnectOutcome::Failed(err),
            },
        }
    };
    let attempt = std::pin::pin!(attempt);
    // A closed cancel channel means the pool dropped the attempt's handle;
    // both that and an explicit cancel end the attempt the same way.
    match future::select(cancel, attempt).await {
        Either::Left((_, _)) => ConnectOutcome::Cancelled,
        Either::Right((outcome, _)) => outcome,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future,
        io,
        net::SocketAddr,
        pin::Pin,
        sync::{
            Arc, Mutex as StdMutex,
            atomic::{AtomicU32, Ordering},
        },
        task::{self, Poll},
        time::Duration,
    };

    use tokio::sync::oneshot;

    use super::*;
    use crate::rt::{TokioExecutor, TokioTimer};

    #[derive(Debug)]
    struct TestConn {
        token: u32,
        open: bool,
    }

    impl Poolable for TestConn {
        fn is_open(&self) -> bool {
            self.open
        }

        fn close(&mut self) {
            self.open = false;
        }
    }

    struct TestFactory;

    impl ConnectionFactory<&'static str, u32> for TestFactory {
        type Connection = TestConn;

        fn create(&self, _route: &&'static str, session: u32) -> io::Result<TestConn> {
            Ok(TestConn {
                token: session,
                open: true,
            })
        }
    }

    struct FailingFactory;

    impl ConnectionFactory<&'static str, u32> for FailingFactory {
        type Connection = TestConn;

        fn create(&self, _route: &&'static str, _session: u32) -> io::Result<TestConn> {
            Err(io::Error::other("factory refused the session"))
        }
    }

    struct TestResolver;

    impl AddressResolver<&'static str> for TestResolver {
        fn resolve_remote(&self, _route: &&'static str) -> io::Result<SocketAddr> {
            Ok(([127, 0, 0, 1], 4000).into())
        }
    }

    struct FailingResolver;

    impl AddressResolver<&'static str> for FailingResolver {
        fn resolve_remote(&self, _route: &&'static str) -> io::Result<SocketAddr> {
            Err(io::Error::other("no address for route"))
        }
    }

    /// Resolves every connect attempt immediately with a fresh session.
    struct InstantInitiator {
        next: AtomicU32,
    }

    impl InstantInitiator {
        fn new() -> InstantInitiator {
            InstantInitiator {
                next: AtomicU32::new(0),
            }
        }
    }

    impl ConnectionInitiator for InstantInitiator {
        type Session = u32;

        fn connect(&self, _remote: SocketAddr, _local: Option<SocketAddr>) -> Connecting<u32> {
            let token = self.next.fetch_add(1, Ordering::Relaxed);
            Box::pin(async move { Ok(token) })
        }
    }

    /// Hands every connect attempt to the test to resolve by hand.
    struct ScriptedInitiator {
        attempts: StdMutex<Vec<oneshot::Sender<io::Result<u32>>>>,
    }

    impl ScriptedInitiator {
        fn new() -> Arc<ScriptedInitiator> {
            Arc::new(ScriptedInitiator {
                attempts: StdMutex::new(Vec::new()),
            })
        }

        fn attempt_count(&self) -> usize {
            self.attempts.lock().unwrap().len()
        }

        fn resolve_next(&self, result: io::Result<u32>) {
            let tx = self.attempts.lock().unwrap().remove(0);
            let _ = tx.send(result);
        }
    }

    impl ConnectionInitiator for Arc<ScriptedInitiator> {
        type Session = u32;

        fn connect(&self, _remote: SocketAddr, _local: Option<SocketAddr>) -> Connecting<u32> {
            let (tx, rx) = oneshot::channel();
            self.attempts.lock().unwrap().push(tx);
            Box::pin(async move {
                match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(io::Error::other("attempt dropped")),
                }
            })
        }
    }

    type TestPool = Pool<&'static str, TestConn, u32, &'static str>;

    fn config(max_total: usize, default_max_per_route: usize) -> PoolConfig {
        PoolConfig {
            max_total,
            default_max_per_route,
            time_to_live: None,
        }
    }

    fn pool(config: PoolConfig) -> TestPool {
        Pool::new(
            config,
            InstantInitiator::new(),
            TestResolver,
            TestFactory,
            TokioExecutor::new(),
            Some(TokioTimer::new()),
        )
    }

    fn scripted(config: PoolConfig) -> (TestPool, Arc<ScriptedInitiator>) {
        let script = ScriptedInitiator::new();
        let pool = Pool::new(
            config,
            script.clone(),
            TestResolver,
            TestFactory,
            TokioExecutor::new(),
            Some(TokioTimer::new()),
        );
        (pool, script)
    }

    /// Helper to check if the future is ready after polling once.
    struct PollOnce<'a, F>(&'a mut F);

    impl<F, T, U> Future for PollOnce<'_, F>
    where
        F: Future<Output = Result<T, U>> + Unpin,
    {
        type Output = Option<()>;

        fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
            match Pin::new(&mut self.0).poll(cx) {
                Poll::Ready(Ok(_)) => Poll::Ready(Some(())),
                Poll::Ready(Err(_)) => Poll::Ready(Some(())),
                Poll::Pending => Poll::Ready(None),
            }
        }
    }

    #[tokio::test]
    async fn lease_opens_new_connection() {
        let pool = pool(config(2, 2));
        let entry = pool.lease("alpha", None).unwrap().await.unwrap();
        assert_eq!(entry.with_connection(|conn| conn.token), Some(0));
        assert_eq!(
            pool.total_stats(),
            PoolStats {
                leased: 1,
                pending: 0,
                available: 0,
                max: 2
            }
        );
        assert_eq!(pool.route_stats(&"alpha").leased, 1);
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: StdMutex<Vec<&'static str>>,
    }

    impl PoolObserver<&'static str, TestConn, &'static str> for RecordingObserver {
        fn on_lease(&self, _entry: &PoolEntry<&'static str, TestConn, &'static str>) {
            self.events.lock().unwrap().push("lease");
        }

        fn on_release(&self, _entry: &PoolEntry<&'static str, TestConn, &'static str>) {
            self.events.lock().unwrap().push("release");
        }

        fn on_reuse(&self, _entry: &PoolEntry<&'static str, TestConn, &'static str>) {
            self.events.lock().unwrap().push("reuse");
        }
    }

    #[tokio::test]
    async fn released_entry_is_reused() {
        let observer = Arc::new(RecordingObserver::default());
        let pool = pool(config(2, 2)).with_observer(observer.clone());
        let first = pool.lease("alpha", None).unwrap().await.unwrap();
        let id = first.id();
        pool.release(first, true);

        let second = pool.lease("alpha", None).unwrap().await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(
            *observer.events.lock().unwrap(),
            vec!["lease", "release", "reuse", "lease"]
        );
    }

    #[tokio::test]
    async fn most_recently_released_is_preferred() {
        let pool = pool(config(4, 4));
        let first = pool.lease("alpha", None).unwrap().await.unwrap();
        let second = pool.lease("alpha", None).unwrap().await.unwrap();
        let second_id = second.id();
        pool.release(first, true);
        pool.release(second, true);

        let reused = pool.lease("alpha", None).unwrap().await.unwrap();
        assert_eq!(reused.id(), second_id);
    }

    #[tokio::test]
    async fn state_affinity_governs_reuse() {
        let pool = pool(config(4, 4));
        let entry = pool.lease("alpha", None).unwrap().await.unwrap();
        let stated = entry.id();
        entry.set_state(Some("auth"));
        pool.release(entry, true);

        // A stateless lease must not pick up the stated entry.
        let fresh = pool.lease("alpha", None).unwrap().await.unwrap();
        assert_ne!(fresh.id(), stated);

        // A lease asking for the state gets it back.
        let matched = pool.lease("alpha", Some("auth")).unwrap().await.unwrap();
        assert_eq!(matched.id(), stated);
        assert_eq!(matched.state(), Some("auth"));
    }

    #[tokio::test]
    async fn route_cap_queues_until_release() {
        let pool = pool(config(10, 2));
        pool.set_max_per_route("alpha", 1);
        let first = pool.lease("alpha", None).unwrap().await.unwrap();
        let mut waiting = pool.lease("alpha", None).unwrap();
        assert!(PollOnce(&mut waiting).await.is_none());
        assert_eq!(pool.total_stats().pending, 0);

        let id = first.id();
        pool.release(first, true);
        let entry = waiting.await.unwrap();
        assert_eq!(entry.id(), id);
    }

    #[tokio::test]
    async fn waiters_are_served_in_fifo_order() {
        let pool = pool(config(1, 1));
        let first = pool.lease("alpha", None).unwrap().await.unwrap();
        let mut second = pool.lease("alpha", None).unwrap();
        let mut third = pool.lease("alpha", None).unwrap();
        assert!(PollOnce(&mut second).await.is_none());
        assert!(PollOnce(&mut third).await.is_none());

        pool.release(first, true);
        let entry = second.await.unwrap();
        assert!(PollOnce(&mut third).await.is_none());

        pool.release(entry, true);
        third.await.unwrap();
    }

    #[tokio::test]
    async fn global_cap_evicts_least_recently_used() {
        let pool = pool(config(2, 2));
        let one = pool.lease("r1", None).unwrap().await.unwrap();
        let two = pool.lease("r2", None).unwrap().await.unwrap();
        pool.release(one.clone(), true);
        pool.release(two.clone(), true);
        assert_eq!(pool.total_stats().available, 2);

        pool.set_max_per_route("r3", 1);
        let _three = pool.lease("r3", None).unwrap().await.unwrap();
        // The earlier released of the two idle entries was the victim.
        assert!(one.is_closed());
        assert!(!two.is_closed());
        let stats = pool.total_stats();
        assert_eq!(stats.leased, 1);
        assert_eq!(stats.available, 1);
        assert_eq!(pool.route_stats(&"r1").available, 0);
    }

    #[tokio::test]
    async fn route_cap_eviction_discards_idle_entries() {
        let pool = pool(config(4, 2));
        let one = pool.lease("alpha", None).unwrap().await.unwrap();
        let two = pool.lease("alpha", None).unwrap().await.unwrap();
        one.set_state(Some("a"));
        two.set_state(Some("b"));
        pool.release(one.clone(), true);
        pool.release(two.clone(), true);

        pool.set_max_per_route("alpha", 1);
        // No idle entry matches state "c"; both are evicted to make room.
        let entry = pool.lease("alpha", Some("c")).unwrap().await.unwrap();
        assert!(one.is_closed());
        assert!(two.is_closed());
        assert_eq!(entry.state(), None);
        assert_eq!(pool.route_stats(&"alpha").available, 0);
    }

    #[tokio::test]
    async fn waiting_lease_times_out() {
        let pool = pool(config(1, 1));
        let _held = pool.lease("alpha", None).unwrap().await.unwrap();
        let lease = pool
            .lease_with("alpha", None, Some(Duration::from_millis(20)), None)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        pool.validate_pending_requests();
        let err = lease.await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn connect_failure_fails_lease_and_serves_queue() {
        let (pool, script) = scripted(config(1, 1));
        let first = pool.lease("alpha", None).unwrap();
        let mut second = pool.lease("alpha", None).unwrap();
        assert_eq!(pool.total_stats().pending, 1);
        assert!(PollOnce(&mut second).await.is_none());

        script.resolve_next(Err(io::Error::other("refused")));
        let err = first.await.unwrap_err();
        assert!(err.is_io());

        // The failure freed capacity; the queued lease got its own attempt.
        assert_eq!(script.attempt_count(), 1);
        script.resolve_next(Ok(7));
        let entry = second.await.unwrap();
        assert_eq!(entry.with_connection(|conn| conn.token), Some(7));
        assert_eq!(pool.total_stats().pending, 0);
    }

    #[tokio::test]
    async fn connect_attempt_times_out() {
        let (pool, script) = scripted(config(1, 1));
        let lease = pool
            .lease_with("alpha", None, Some(Duration::from_millis(20)), None)
            .unwrap();
        let err = lease.await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(pool.total_stats().pending, 0);
        assert_eq!(script.attempt_count(), 1);
    }

    #[tokio::test]
    async fn resolver_failure_fails_lease() {
        let pool: TestPool = Pool::new(
            config(2, 2),
            InstantInitiator::new(),
            FailingResolver,
            TestFactory,
            TokioExecutor::new(),
            Some(TokioTimer::new()),
        );
        let err = pool.lease("alpha", None).unwrap().await.unwrap_err();
        assert!(err.is_io());
        let stats = pool.total_stats();
        assert_eq!((stats.leased, stats.pending), (0, 0));
    }

    #[tokio::test]
    async fn factory_failure_fails_lease_only() {
        let script = ScriptedInitiator::new();
        let pool: TestPool = Pool::new(
            config(2, 2),
            script.clone(),
            TestResolver,
            FailingFactory,
            TokioExecutor::new(),
            Some(TokioTimer::new()),
        );
        let lease = pool.lease("alpha", None).unwrap();
        script.resolve_next(Ok(1));
        let err = lease.await.unwrap_err();
        assert!(err.is_io());
        let stats = pool.total_stats();
        assert_eq!((stats.leased, stats.pending), (0, 0));
        assert!(!pool.is_shut_down());
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_attempts() {
        let (pool, script) = scripted(config(2, 2));
        let lease = pool.lease("alpha", None).unwrap();
        assert_eq!(pool.total_stats().pending, 1);

        pool.shutdown(Duration::ZERO);
        let err = lease.await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(pool.is_shut_down());
        assert!(pool.lease("alpha", None).unwrap_err().is_shut_down());

        // A late resolution of the cancelled attempt is ignored.
        script.resolve_next(Ok(9));
        tokio::task::yield_now().await;
        let stats = pool.total_stats();
        assert_eq!((stats.leased, stats.pending, stats.available), (0, 0, 0));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let pool = pool(config(2, 2));
        let entry = pool.lease("alpha", None).unwrap().await.unwrap();
        pool.release(entry.clone(), true);
        pool.release(entry, true);
        let stats = pool.total_stats();
        assert_eq!((stats.leased, stats.available), (0, 1));
    }

    #[tokio::test]
    async fn non_reusable_release_closes_entry() {
        let pool = pool(config(2, 2));
        let entry = pool.lease("alpha", None).unwrap().await.unwrap();
        pool.release(entry.clone(), false);
        assert!(entry.is_closed());
        assert_eq!(pool.total_stats().available, 0);
    }

    #[tokio::test]
    async fn close_idle_reaps_stale_entries() {
        let pool = pool(config(2, 2));
        let entry = pool.lease("alpha", None).unwrap().await.unwrap();
        pool.release(entry, true);

        pool.close_idle(Duration::from_secs(3600));
        assert_eq!(pool.total_stats().available, 1);

        pool.close_idle(Duration::ZERO);
        assert_eq!(pool.total_stats().available, 0);
        assert!(pool.routes().is_empty());
    }

    #[tokio::test]
    async fn close_expired_honors_time_to_live() {
        let pool = pool(PoolConfig {
            max_total: 2,
            default_max_per_route: 2,
            time_to_live: Some(Duration::from_millis(10)),
        });
        let entry = pool.lease("alpha", None).unwrap().await.unwrap();
        pool.release(entry, true);

        pool.close_expired();
        assert_eq!(pool.total_stats().available, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close_expired();
        assert_eq!(pool.total_stats().available, 0);
    }

    #[tokio::test]
    async fn pending_attempts_count_against_global_cap() {
        let (pool, script) = scripted(config(1, 1));
        let first = pool.lease("alpha", None).unwrap();
        let mut second = pool.lease("beta", None).unwrap();
        // The outstanding attempt consumes the only global slot.
        assert!(PollOnce(&mut second).await.is_none());
        assert_eq!(script.attempt_count(), 1);

        script.resolve_next(Ok(3));
        let entry = first.await.unwrap();
        pool.release(entry, true);

        script.resolve_next(Ok(4));
        second.await.unwrap();
    }

    struct RecordingCallback {
        events: Arc<StdMutex<Vec<&'static str>>>,
    }

    impl LeaseCallback<&'static str, TestConn, &'static str> for RecordingCallback {
        fn completed(&self, _entry: &Arc<PoolEntry<&'static str, TestConn, &'static str>>) {
            self.events.lock().unwrap().push("completed");
        }

        fn failed(&self, _error: &Error) {
            self.events.lock().unwrap().push("failed");
        }

        fn cancelled(&self) {
            self.events.lock().unwrap().push("cancelled");
        }
    }

    #[tokio::test]
    async fn lease_callback_observes_outcome() {
        let pool = pool(config(2, 2));
        let events = Arc::new(StdMutex::new(Vec::new()));
        let callback = RecordingCallback {
            events: events.clone(),
        };
        let _entry = pool
            .lease_with("alpha", None, None, Some(Box::new(callback)))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(*events.lock().unwrap(), vec!["completed"]);
    }

    #[tokio::test]
    async fn abandoned_lease_repools_completed_entry() {
        let (pool, script) = scripted(config(1, 1));
        let lease = pool.lease("alpha", None).unwrap();
        drop(lease);
        script.resolve_next(Ok(5));
        tokio::task::yield_now().await;

        let stats = pool.total_stats();
        assert_eq!((stats.leased, stats.available), (0, 1));
    }

    #[tokio::test]
    async fn enum_leased_visits_leased_entries() {
        let pool = pool(config(2, 2));
        let entry = pool.lease("alpha", None).unwrap().await.unwrap();
        let mut seen = Vec::new();
        pool.enum_leased(|e| seen.push(e.id()));
        assert_eq!(seen, vec![entry.id()]);
    }

    #[test]
    fn stats_render_in_bracketed_form() {
        let stats = PoolStats {
            leased: 1,
            pending: 2,
            available: 3,
            max: 4,
        };
        assert_eq!(
            stats.to_string(),
            "[leased: 1; pending: 2; available: 3; max: 4]"
        );
    }
}
