pub mod config;
pub mod key;
pub mod lease;
mod manager;
pub mod request;
pub mod stats;
pub mod tcp;
pub mod transport;

pub use config::PoolConfig;
pub use key::{AddressFamily, BucketKey, Destination};
pub use lease::Lease;
pub use manager::ConnectionPool;
pub use request::Request;
pub use stats::{BucketStats, PoolCounters, PoolStats};
pub use tcp::{TcpConnection, TcpTransport};
pub use transport::{Connection, DialOptions, Transport};
