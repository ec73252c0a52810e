// connpool - bounded transport connection pool

pub mod config;
pub mod pool;
pub mod utils;

// Re-export commonly used types
pub use pool::{Conn, ConnInfo, ConnPool, PoolOptions, PoolStats, PopOrder, Transport};
pub use utils::error::{PoolError, Result};
