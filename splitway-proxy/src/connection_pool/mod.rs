//! Upstream connection reuse.

pub mod pool;

pub use pool::ConnectionPool;
