use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
    time::{Duration, Instant},
};

use tokio::sync::oneshot;

use super::entry::PoolEntry;
use crate::error::Error;

/// Completion hooks attached to a lease.
///
/// Invoked during callback fan-out, after the pool lock has been released;
/// implementations may call back into the pool.
pub trait LeaseCallback<R, C, S>: Send + 'static {
    fn completed(&self, entry: &Arc<PoolEntry<R, C, S>>) {
        let _ = entry;
    }

    fn failed(&self, error: &Error) {
        let _ = error;
    }

    fn cancelled(&self) {}
}

pub(crate) type LeaseResult<R, C, S> = Result<Arc<PoolEntry<R, C, S>>, Error>;

/// The delivery half of a lease: the caller's oneshot plus the optional
/// callback.
pub(crate) struct Completion<R, C, S> {
    tx: oneshot::Sender<LeaseResult<R, C, S>>,
    callback: Option<Box<dyn LeaseCallback<R, C, S>>>,
}

impl<R, C, S> Completion<R, C, S> {
    pub(crate) fn new(
        tx: oneshot::Sender<LeaseResult<R, C, S>>,
        callback: Option<Box<dyn LeaseCallback<R, C, S>>>,
    ) -> Self {
        Completion { tx, callback }
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn into_completed(self, entry: Arc<PoolEntry<R, C, S>>) -> CompletedLease<R, C, S> {
        CompletedLease {
            completion: self,
            outcome: LeaseOutcome::Completed(entry),
        }
    }

    pub(crate) fn into_failed(self, error: Error) -> CompletedLease<R, C, S> {
        CompletedLease {
            completion: self,
            outcome: LeaseOutcome::Failed(error),
        }
    }

    pub(crate) fn into_cancelled(self) -> CompletedLease<R, C, S> {
        CompletedLease {
            completion: self,
            outcome: LeaseOutcome::Cancelled,
        }
    }
}

enum LeaseOutcome<R, C, S> {
    Completed(Arc<PoolEntry<R, C, S>>),
    Failed(Error),
    Cancelled,
}

/// A terminal lease waiting for lock-free fan-out.
pub(crate) struct CompletedLease<R, C, S> {
    completion: Completion<R, C, S>,
    outcome: LeaseOutcome<R, C, S>,
}

impl<R: 'static, C: 'static, S: 'static> CompletedLease<R, C, S> {
    /// Deliver the outcome to the caller's future and callback.
    ///
    /// Returns the entry back when the caller's future was dropped before
    /// delivery, so the pool can re-release it.
    pub(crate) fn deliver(self) -> Option<Arc<PoolEntry<R, C, S>>> {
        let Completion { tx, callback } = self.completion;
        match self.outcome {
            LeaseOutcome::Completed(entry) => {
                if tx.send(Ok(entry.clone())).is_ok() {
                    if let Some(callback) = callback {
                        callback.completed(&entry);
                    }
                    None
                } else {
                    if let Some(callback) = callback {
                        callback.cancelled();
                    }
                    Some(entry)
                }
            }
            LeaseOutcome::Failed(error) => {
                if let Some(callback) = callback {
                    callback.failed(&error);
                }
                let _ = tx.send(Err(error));
                None
            }
            LeaseOutcome::Cancelled => {
                if let Some(callback) = callback {
                    callback.cancelled();
                }
                None
            }
        }
    }
}

/// A caller's outstanding request for an entry.
pub(crate) struct LeaseRequest<R, C, S> {
    pub(crate) route: R,
    pub(crate) state: Option<S>,
    pub(crate) connect_timeout: Option<Duration>,
    deadline: Option<Instant>,
    completion: Completion<R, C, S>,
}

impl<R, C, S> LeaseRequest<R, C, S> {
    pub(crate) fn new(
        route: R,
        state: Option<S>,
        connect_timeout: Option<Duration>,
        completion: Completion<R, C, S>,
    ) -> Self {
        let deadline = connect_timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        LeaseRequest {
            route,
            state,
            connect_timeout,
            deadline,
            completion,
        }
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.completion.is_abandoned()
    }

    pub(crate) fn deadline_passed(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now > deadline)
    }

    pub(crate) fn into_completed(self, entry: Arc<PoolEntry<R, C, S>>) -> CompletedLease<R, C, S> {
        self.completion.into_completed(entry)
    }

    pub(crate) fn into_failed(self, error: Error) -> CompletedLease<R, C, S> {
        self.completion.into_failed(error)
    }

    pub(crate) fn into_cancelled(self) -> CompletedLease<R, C, S> {
        self.completion.into_cancelled()
    }

    pub(crate) fn into_completion(self) -> Completion<R, C, S> {
        self.completion
    }
}

pin_project_lite::pin_project! {
    /// Future returned by lease calls, resolving to a pooled entry.
    ///
    /// Dropping the future cancels the request: a queued request is
    /// discarded on the next scan, and an entry that completes afterwards
    /// goes straight back into the pool.
    pub struct Lease<R, C, S> {
        #[pin]
        rx: oneshot::Receiver<LeaseResult<R, C, S>>,
    }
}

impl<R, C, S> Lease<R, C, S> {
    pub(crate) fn new(rx: oneshot::Receiver<LeaseResult<R, C, S>>) -> Self {
        Lease { rx }
    }
}

impl<R, C, S> Future for Lease<R, C, S> {
    type Output = LeaseResult<R, C, S>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().rx.poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(_closed) => Poll::Ready(Err(Error::Cancelled)),
        }
    }
}
