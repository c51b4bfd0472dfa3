#![allow(clippy::result_large_err)]

mod pool;
mod pooled;
mod transaction;

pub use pool::ConnectionPool;
pub use pooled::PooledConnection;
pub use transaction::TransactionManager;
