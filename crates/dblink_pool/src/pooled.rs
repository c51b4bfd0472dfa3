use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use dblink_core::{
    Connection, DbError, IsolationLevel, PreparedStatement, ResultSet,
};

use crate::pool::PoolInner;

/// Wrapper handed out by the pool.
///
/// `close()` does not close the physical connection; it returns the
/// wrapper to the owning pool. The physical connection is only closed by
/// the pool itself (eviction, validation discard, pool shutdown). After
/// that, every operation on the wrapper surfaces a connection-closed
/// error.
pub struct PooledConnection {
    physical: Arc<dyn Connection>,
    pool: Weak<PoolInner>,
    me: Weak<PooledConnection>,
    created: Instant,
    last_used: Mutex<Instant>,
    active: AtomicBool,
    closed: AtomicBool,
}

impl PooledConnection {
    pub(crate) fn new(
        physical: Arc<dyn Connection>,
        pool: Weak<PoolInner>,
        me: Weak<PooledConnection>,
    ) -> Self {
        let now = Instant::now();
        Self {
            physical,
            pool,
            me,
            created: now,
            last_used: Mutex::new(now),
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn physical(&self) -> &Arc<dyn Connection> {
        &self.physical
    }

    pub(crate) fn created(&self) -> Instant {
        self.created
    }

    pub(crate) fn last_used(&self) -> Instant {
        *self.lock_last_used()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_active(&self) {
        self.active.store(true, Ordering::SeqCst);
        self.touch();
    }

    pub(crate) fn mark_inactive(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.touch();
    }

    /// Pool-side teardown of the physical connection. Errors are
    /// swallowed; this runs from eviction and shutdown paths.
    pub(crate) fn close_physical(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.physical.close() {
            log::warn!("error closing pooled connection: {}", e);
        }
    }

    fn touch(&self) {
        *self.lock_last_used() = Instant::now();
    }

    fn lock_last_used(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.last_used.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::connection_closed(
                "E62A9C04B7D1",
                "pooled connection is closed",
            ));
        }
        Ok(())
    }
}

impl Connection for PooledConnection {
    fn prepare_statement(&self, sql: &str) -> Result<Box<dyn PreparedStatement>, DbError> {
        self.check_open()?;
        self.touch();
        self.physical.prepare_statement(sql)
    }

    fn execute_query(&self, sql: &str) -> Result<ResultSet, DbError> {
        self.check_open()?;
        self.touch();
        self.physical.execute_query(sql)
    }

    fn execute_update(&self, sql: &str) -> Result<u64, DbError> {
        self.check_open()?;
        self.touch();
        self.physical.execute_update(sql)
    }

    fn set_auto_commit(&self, auto_commit: bool) -> Result<(), DbError> {
        self.check_open()?;
        self.touch();
        self.physical.set_auto_commit(auto_commit)
    }

    fn auto_commit(&self) -> Result<bool, DbError> {
        self.check_open()?;
        self.physical.auto_commit()
    }

    fn begin_transaction(&self) -> Result<(), DbError> {
        self.check_open()?;
        self.touch();
        self.physical.begin_transaction()
    }

    fn transaction_active(&self) -> Result<bool, DbError> {
        self.check_open()?;
        self.physical.transaction_active()
    }

    fn commit(&self) -> Result<(), DbError> {
        self.check_open()?;
        self.touch();
        self.physical.commit()
    }

    fn rollback(&self) -> Result<(), DbError> {
        self.check_open()?;
        self.touch();
        self.physical.rollback()
    }

    fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<(), DbError> {
        self.check_open()?;
        self.physical.set_transaction_isolation(level)
    }

    fn transaction_isolation(&self) -> Result<IsolationLevel, DbError> {
        self.check_open()?;
        self.physical.transaction_isolation()
    }

    /// Return to the pool. A wrapper that is not checked out, or whose
    /// pool is gone, makes this a no-op.
    fn close(&self) -> Result<(), DbError> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.touch();

        match (self.pool.upgrade(), self.me.upgrade()) {
            (Some(pool), Some(me)) => {
                PoolInner::return_connection(&pool, me);
            }
            _ => {
                log::debug!("pool already gone; dropping returned connection");
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.physical.is_closed()
    }

    fn return_to_pool(&self) -> Result<(), DbError> {
        self.close()
    }

    fn is_pooled(&self) -> bool {
        true
    }

    fn url(&self) -> String {
        self.physical.url()
    }

    fn validate(&self, query: &str) -> Result<(), DbError> {
        self.check_open()?;
        self.physical.validate(query)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
