//! The resolver seam used for hostname targets from SOCKS requests.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;

/// A handle that can resolve hostnames to socket addresses.
///
/// The engine treats this as opaque: SOCKS-mode listeners use it for
/// hostname CONNECT targets, and tests substitute their own.
#[async_trait]
pub trait NetResolver: Send + Sync {
    /// Resolve `host` to one or more addresses carrying `port`.
    ///
    /// An empty result is treated like a resolution failure.
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// The system resolver, by way of tokio's `getaddrinfo` wrapper.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct SystemResolver {}

impl SystemResolver {
    /// Construct a handle to the system resolver.
    pub fn new() -> Self {
        SystemResolver {}
    }
}

#[async_trait]
impl NetResolver for SystemResolver {
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}
