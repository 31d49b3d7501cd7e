//! A non-blocking, route-partitioned connection lease pool.
//!
//! `leasepool` sits between asynchronous callers and a network connection
//! initiator. Callers [`lease`][pool::Pool::lease] a connection for a
//! *route* (an opaque key identifying a destination); the pool reuses an
//! idle connection when one matches, opens a new one when caps allow, and
//! otherwise queues the caller in FIFO order. Both a global cap and
//! per-route caps are enforced, reclaiming capacity from idle connections
//! in least-recently-used order when needed.
//!
//! The collaborators are injected: a [`ConnectionInitiator`] opens raw
//! sessions, an [`AddressResolver`] turns routes into socket addresses,
//! and a [`ConnectionFactory`] builds the pooled connection from a ready
//! session. A tokio TCP initiator is included.
//!
//! ```rust,ignore
//! use std::{net::SocketAddr, time::Duration};
//!
//! use leasepool::{
//!     Pool, PoolConfig, SocketAddrResolver, TcpConnectionInitiator,
//!     rt::{TokioExecutor, TokioTimer},
//! };
//!
//! let pool: Pool<SocketAddr, MyConn, _, ()> = Pool::new(
//!     PoolConfig::default(),
//!     TcpConnectionInitiator::new(),
//!     SocketAddrResolver::new(),
//!     MyConnFactory,
//!     TokioExecutor::new(),
//!     Some(TokioTimer::new()),
//! );
//!
//! let entry = pool
//!     .lease_with(addr, None, Some(Duration::from_secs(5)), None)?
//!     .await?;
//! // ... use the connection ...
//! pool.release(entry, true);
//! ```

mod sync;

pub mod connect;
pub mod error;
pub mod pool;
pub mod resolve;
pub mod rt;

pub use self::{
    connect::{
        Connecting, ConnectionFactory, ConnectionInitiator, InitiatorStatus, Poolable,
        TcpConnectionInitiator,
    },
    error::Error,
    pool::{
        Lease, LeaseCallback, Pool, PoolConfig, PoolEntry, PoolObserver, PoolStats, Route, State,
    },
    resolve::{AddressResolver, SocketAddrResolver},
};
