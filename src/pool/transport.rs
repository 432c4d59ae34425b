use super::config::PoolConfig;
use super::key::{server_name, AddressFamily, BucketKey};
use super::request::Request;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::task::{Context, Poll};
use std::time::Duration;

/// Everything a transport needs to open a connection for one bucket.
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub host: String,
    pub port: Option<u16>,
    pub local_address: Option<IpAddr>,
    pub family: Option<AddressFamily>,
    /// Rendered bucket key, for correlating transport logs with pool logs.
    pub key: String,
    /// TLS server name (SNI) to present, if the transport speaks TLS.
    pub servername: String,
    pub keep_alive: bool,
    pub keep_alive_interval: Duration,
    pub connect_timeout: Option<Duration>,
}

impl DialOptions {
    /// Merge request attributes with pool-wide settings.
    pub fn new(request: &Request, key: &BucketKey, config: &PoolConfig) -> Self {
        let destination = request.destination();
        Self {
            host: key.host().to_string(),
            port: destination.port,
            local_address: destination.local_address,
            family: destination.family,
            key: key.to_string(),
            servername: server_name(request),
            keep_alive: config.keep_alive,
            keep_alive_interval: config.keep_alive_interval,
            connect_timeout: config.connect_timeout,
        }
    }
}

/// Opens new connections on behalf of the pool.
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;

    fn dial(
        &self,
        options: DialOptions,
    ) -> impl Future<Output = io::Result<Self::Connection>> + Send;
}

/// Capabilities the pool needs from a pooled connection.
///
/// Connections are shared between the pool and the lease holding them, so
/// every method takes `&self`. The pool calls `close` at most once.
pub trait Connection: Send + Sync + 'static {
    /// False once the connection can no longer carry a request.
    fn is_open(&self) -> bool;

    fn timeout(&self) -> Option<Duration>;

    fn set_timeout(&self, timeout: Option<Duration>);

    /// Enable or disable transport-level keep-alive probes.
    fn set_keep_alive(&self, _enable: bool, _interval: Duration) -> io::Result<()> {
        Ok(())
    }

    /// Resolves with an error when an idle connection breaks (peer hangup,
    /// unsolicited data). Only polled while the connection sits idle.
    fn poll_idle_fault(&self, _cx: &mut Context<'_>) -> Poll<io::Error> {
        Poll::Pending
    }

    fn close(&self) -> io::Result<()>;
}
