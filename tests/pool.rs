//! End-to-end pool tests over real TCP connections.

use std::{io, net::SocketAddr, time::Duration};

use leasepool::{
    ConnectionFactory, Pool, PoolConfig, Poolable, SocketAddrResolver, TcpConnectionInitiator,
    rt::{TokioExecutor, TokioTimer},
};
use tokio::net::{TcpListener, TcpStream};

struct TcpConn {
    stream: Option<TcpStream>,
}

impl Poolable for TcpConn {
    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

struct TcpFactory;

impl ConnectionFactory<SocketAddr, TcpStream> for TcpFactory {
    type Connection = TcpConn;

    fn create(&self, _route: &SocketAddr, session: TcpStream) -> io::Result<TcpConn> {
        Ok(TcpConn {
            stream: Some(session),
        })
    }
}

type TcpPool = Pool<SocketAddr, TcpConn, TcpStream, ()>;

fn tcp_pool(config: PoolConfig) -> TcpPool {
    Pool::new(
        config,
        TcpConnectionInitiator::new(),
        SocketAddrResolver::new(),
        TcpFactory,
        TokioExecutor::new(),
        Some(TokioTimer::new()),
    )
}

/// Bind a listener that accepts and holds incoming connections.
async fn spawn_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            match listener.accept().await {
                Ok((stream, _)) => held.push(stream),
                Err(_) => break,
            }
        }
    });
    addr
}

#[tokio::test]
async fn lease_connects_and_reuses_over_tcp() {
    let addr = spawn_server().await;
    let pool = tcp_pool(PoolConfig::default());

    let entry = pool
        .lease_with(addr, None, Some(Duration::from_secs(5)), None)
        .unwrap()
        .await
        .unwrap();
    let peer = entry
        .with_connection(|conn| conn.stream.as_ref().unwrap().peer_addr().unwrap())
        .unwrap();
    assert_eq!(peer, addr);

    let id = entry.id();
    pool.release(entry, true);
    assert_eq!(pool.total_stats().available, 1);

    let reused = pool.lease(addr, None).unwrap().await.unwrap();
    assert_eq!(reused.id(), id);
    assert_eq!(pool.total_stats().available, 0);

    pool.release(reused, true);
    pool.shutdown(Duration::ZERO);
}

#[tokio::test]
async fn per_route_cap_holds_over_tcp() {
    let addr = spawn_server().await;
    let pool = tcp_pool(PoolConfig {
        max_total: 10,
        default_max_per_route: 1,
        time_to_live: None,
    });

    let first = pool
        .lease_with(addr, None, Some(Duration::from_secs(5)), None)
        .unwrap()
        .await
        .unwrap();

    // The route is at its cap; a second lease waits for the release.
    let waiting = pool.lease(addr, None).unwrap();
    pool.release(first, true);
    let second = waiting.await.unwrap();
    assert_eq!(pool.route_stats(&addr).leased, 1);

    pool.release(second, true);
    pool.shutdown(Duration::ZERO);
}

#[tokio::test]
async fn connect_refused_fails_lease() {
    // Bind a port and drop the listener so nothing is accepting.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let pool = tcp_pool(PoolConfig::default());
    let err = pool
        .lease_with(addr, None, Some(Duration::from_secs(5)), None)
        .unwrap()
        .await
        .unwrap_err();
    assert!(err.is_io() || err.is_timeout());
    let stats = pool.total_stats();
    assert_eq!((stats.leased, stats.pending), (0, 0));
}

#[tokio::test]
async fn shutdown_closes_leased_entries() {
    let addr = spawn_server().await;
    let pool = tcp_pool(PoolConfig::default());

    let entry = pool
        .lease_with(addr, None, Some(Duration::from_secs(5)), None)
        .unwrap()
        .await
        .unwrap();
    pool.shutdown(Duration::ZERO);

    assert!(entry.is_closed());
    assert!(pool.lease(addr, None).unwrap_err().is_shut_down());
    let stats = pool.total_stats();
    assert_eq!((stats.leased, stats.pending, stats.available), (0, 0, 0));
}
