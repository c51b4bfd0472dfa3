use std::any::Any;
use std::sync::Arc;

use crate::error::DbError;
use crate::result_set::ResultSet;
use crate::statement::PreparedStatement;
use crate::value::IsolationLevel;

/// Active database session.
///
/// Implementations are thread-safe; operations on one connection
/// serialize through its internal session lock. Child resources
/// (statements, cursors, blobs) hold weak references to the session
/// handle and fail with a connection-closed error once `close()` ran.
pub trait Connection: Send + Sync {
    fn prepare_statement(&self, sql: &str) -> Result<Box<dyn PreparedStatement>, DbError>;

    fn execute_query(&self, sql: &str) -> Result<ResultSet, DbError>;

    fn execute_update(&self, sql: &str) -> Result<u64, DbError>;

    fn set_auto_commit(&self, auto_commit: bool) -> Result<(), DbError>;

    fn auto_commit(&self) -> Result<bool, DbError>;

    /// Open an explicit transaction on engines that distinguish this from
    /// switching auto-commit off.
    fn begin_transaction(&self) -> Result<(), DbError>;

    fn transaction_active(&self) -> Result<bool, DbError>;

    fn commit(&self) -> Result<(), DbError>;

    fn rollback(&self) -> Result<(), DbError>;

    fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<(), DbError>;

    fn transaction_isolation(&self) -> Result<IsolationLevel, DbError>;

    /// Idempotent. Once closed a connection never reopens; children
    /// observe the closure on their next access.
    fn close(&self) -> Result<(), DbError>;

    fn is_closed(&self) -> bool;

    /// No-op unless the connection is a pooled wrapper.
    fn return_to_pool(&self) -> Result<(), DbError> {
        Ok(())
    }

    fn is_pooled(&self) -> bool {
        false
    }

    /// The URL this connection was opened with, for identification.
    fn url(&self) -> String;

    /// Run a liveness probe. The default executes the query and discards
    /// the result; document drivers override this with a native ping.
    fn validate(&self, query: &str) -> Result<(), DbError> {
        self.execute_query(query).map(|_| ())
    }

    /// Downcast support for engine-specific surfaces (e.g. the MongoDB
    /// document API).
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}
