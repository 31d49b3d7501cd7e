//! Connection initiation used by the pool.
//!
//! This module contains:
//!
//! - The [`ConnectionInitiator`] seam the pool drives its outbound connect
//!   attempts through, and a default [`TcpConnectionInitiator`] over plain
//!   TCP.
//! - The [`ConnectionFactory`] that turns a ready I/O session into the
//!   wire-level connection the pool hands out.
//! - The [`Poolable`] contract every pooled connection satisfies.
//!
//! A "session" is whatever the initiator produces (a [`TcpStream`] for the
//! TCP initiator); the factory decides what actually lives inside a pool
//! entry, so a TLS or protocol handshake layer slots in without the pool
//! knowing.

use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::atomic::{AtomicU8, Ordering},
    time::Duration,
};

use tokio::{
    net::{TcpSocket, TcpStream},
    sync::oneshot,
};

use crate::sync::Mutex;

/// A connection held by the pool.
///
/// The pool checks `is_open` before handing an idle connection back out
/// and calls `close` when it discards one.
pub trait Poolable: Send + 'static {
    fn is_open(&self) -> bool;

    fn close(&mut self);
}

/// Builds a wire-level connection from a ready I/O session.
pub trait ConnectionFactory<R, IO>: Send + Sync + 'static {
    type Connection: Poolable;

    /// Construct the connection for `route` on top of `session`.
    ///
    /// A failure here fails the lease the session was opened for; the pool
    /// itself is unaffected.
    fn create(&self, route: &R, session: IO) -> io::Result<Self::Connection>;
}

/// Alias for the boxed future returned by a connection initiator.
pub type Connecting<IO> = Pin<Box<dyn Future<Output = io::Result<IO>> + Send>>;

/// Lifecycle states of a connection initiator, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum InitiatorStatus {
    Inactive,
    Active,
    ShuttingDown,
    ShutDown,
}

/// Initiates asynchronous outbound connections.
///
/// Implementations only open the transport. Timeouts and cancellation are
/// driven by the pool around the returned future, so `connect` does not
/// need to race a clock of its own.
pub trait ConnectionInitiator: Send + Sync + 'static {
    type Session: Send + 'static;

    /// Begin connecting to `remote`, optionally bound to `local` first.
    fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>) -> Connecting<Self::Session>;

    fn status(&self) -> InitiatorStatus {
        InitiatorStatus::Active
    }

    /// Stop initiating connections, waiting up to `wait` for in-flight
    /// work to settle.
    fn shutdown(&self, wait: Duration) {
        let _ = wait;
    }
}

/// A [`ConnectionInitiator`] over plain TCP.
pub struct TcpConnectionInitiator {
    status: AtomicU8,
}

const STATUS_ACTIVE: u8 = InitiatorStatus::Active as u8;
const STATUS_SHUT_DOWN: u8 = InitiatorStatus::ShutDown as u8;

impl TcpConnectionInitiator {
    pub fn new() -> TcpConnectionInitiator {
        TcpConnectionInitiator {
            status: AtomicU8::new(STATUS_ACTIVE),
        }
    }
}

impl Default for TcpConnectionInitiator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TcpConnectionInitiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnectionInitiator")
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionInitiator for TcpConnectionInitiator {
    type Session = TcpStream;

    fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>) -> Connecting<TcpStream> {
        Box::pin(async move {
            match local {
                Some(addr) => {
                    let socket = if addr.is_ipv4() {
                        TcpSocket::new_v4()?
                    } else {
                        TcpSocket::new_v6()?
                    };
                    socket.bind(addr)?;
                    socket.connect(remote).await
                }
                None => TcpStream::connect(remote).await,
            }
        })
    }

    fn status(&self) -> InitiatorStatus {
        if self.status.load(Ordering::Relaxed) == STATUS_SHUT_DOWN {
            InitiatorStatus::ShutDown
        } else {
            InitiatorStatus::Active
        }
    }

    fn shutdown(&self, _wait: Duration) {
        self.status.store(STATUS_SHUT_DOWN, Ordering::Relaxed);
    }
}

/// Handle to one outstanding connect attempt.
///
/// Carries the route the attempt was made for and the cancellation side of
/// the attempt's driver task. Dropping the handle's last clone also closes
/// the cancel channel, which the driver treats as cancellation.
pub(crate) struct ConnectHandle<R> {
    id: u64,
    route: R,
    connect_timeout: Option<Duration>,
    cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl<R> ConnectHandle<R> {
    pub(crate) fn new(
        id: u64,
        route: R,
        connect_timeout: Option<Duration>,
    ) -> (ConnectHandle<R>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let handle = ConnectHandle {
            id,
            route,
            connect_timeout,
            cancel: Mutex::new(Some(tx)),
        };
        (handle, rx)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn route(&self) -> &R {
        &self.route
    }

    pub(crate) fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub(crate) fn cancel(&self) {
        if let Some(tx) = self.cancel.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl<R: fmt::Debug> fmt::Debug for ConnectHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectHandle")
            .field("id", &self.id)
            .field("route", &self.route)
            .finish()
    }
}
