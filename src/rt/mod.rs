//! Runtime components
//!
//! The traits and types within this module are used to allow plugging in
//! runtime types. These include:
//!
//! - Executors
//! - Timers
//!
//! The pool never spawns on a hard-coded runtime; connect attempts are
//! driven through an [`Executor`] and their timeouts through a [`Timer`].

mod tokio;

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

pub use self::tokio::{TokioExecutor, TokioTimer};

/// An executor of futures.
///
/// This trait allows abstracting over async runtimes. Implement this trait
/// for your own type.
pub trait Executor<Fut> {
    /// Place the future into the executor to be run.
    fn execute(&self, fut: Fut);
}

/// A timer which provides timer-like functions.
pub trait Timer {
    /// Return a future that resolves in `duration` time.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>>;
}

/// A future returned by a `Timer`.
pub trait Sleep: Send + Sync + Future<Output = ()> {}

pub(crate) type BoxSendFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Type-erased executor handle held by the pool.
#[derive(Clone)]
pub(crate) struct Exec(Arc<dyn Executor<BoxSendFuture> + Send + Sync>);

impl Exec {
    pub(crate) fn new<E>(executor: E) -> Exec
    where
        E: Executor<BoxSendFuture> + Send + Sync + 'static,
    {
        Exec(Arc::new(executor))
    }

    pub(crate) fn execute<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.0.execute(Box::pin(fut));
    }
}

/// Type-erased timer handle held by the pool.
#[derive(Clone)]
pub(crate) struct TimerHandle(Arc<dyn Timer + Send + Sync>);

impl TimerHandle {
    pub(crate) fn new<M>(timer: M) -> TimerHandle
    where
        M: Timer + Send + Sync + 'static,
    {
        TimerHandle(Arc::new(timer))
    }

    pub(crate) fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>> {
        self.0.sleep(duration)
    }
}
