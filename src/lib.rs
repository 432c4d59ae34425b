// session-pool - Keyed outbound connection pool with session affinity

pub mod config;
pub mod pool;
pub mod utils;

// Re-export commonly used types
pub use pool::{ConnectionPool, Lease, PoolConfig, Request};
pub use utils::error::{PoolError, Result};
