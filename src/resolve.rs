//! Socket address resolution for routes.

use std::{io, net::SocketAddr};

/// Resolves the socket addresses used to open a connection for a route.
///
/// The pool consults the resolver right before initiating a connect
/// attempt; a resolution failure fails only the lease that needed it.
///
/// Resolution is expected to be a fast, non-blocking lookup (a literal
/// address, a cached record, a config table). Implementations that need
/// real DNS should resolve ahead of time and serve the answer from here.
pub trait AddressResolver<R>: Send + Sync + 'static {
    /// The remote address to connect to for `route`.
    fn resolve_remote(&self, route: &R) -> io::Result<SocketAddr>;

    /// The local address to bind before connecting, if any.
    fn resolve_local(&self, route: &R) -> io::Result<Option<SocketAddr>> {
        let _ = route;
        Ok(None)
    }
}

/// Resolver for pools whose routes already are socket addresses.
#[derive(Clone, Copy, Debug, Default)]
pub struct SocketAddrResolver;

impl SocketAddrResolver {
    pub fn new() -> SocketAddrResolver {
        SocketAddrResolver
    }
}

impl AddressResolver<SocketAddr> for SocketAddrResolver {
    fn resolve_remote(&self, route: &SocketAddr) -> io::Result<SocketAddr> {
        Ok(*route)
    }
}
