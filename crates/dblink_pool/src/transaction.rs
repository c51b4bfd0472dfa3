use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dblink_core::{Connection, DbError};
use uuid::Uuid;

use crate::pool::ConnectionPool;

const DEFAULT_TRANSACTION_TIMEOUT_MILLIS: u64 = 300_000;
const DEFAULT_CLEANUP_INTERVAL_MILLIS: u64 = 60_000;

struct TransactionContext {
    connection: Arc<dyn Connection>,
    #[allow(dead_code)]
    created: Instant,
    last_access: Instant,
}

struct TxnInner {
    pool: Arc<ConnectionPool>,
    active: Mutex<HashMap<String, TransactionContext>>,
    running: AtomicBool,
    timeout_millis: AtomicU64,
}

impl TxnInner {
    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, TransactionContext>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, transaction_id: &str) -> Result<TransactionContext, DbError> {
        self.lock_active().remove(transaction_id).ok_or_else(|| {
            DbError::transaction_not_found(
                "4C89025ABD37",
                format!("transaction not found: {}", transaction_id),
            )
        })
    }

    /// Finish a transaction: run the terminal operation outside the map
    /// lock, then restore auto-commit and hand the connection back to the
    /// pool whatever happened.
    fn finish(
        &self,
        context: TransactionContext,
        op: impl FnOnce(&dyn Connection) -> Result<(), DbError>,
    ) -> Result<(), DbError> {
        let result = op(context.connection.as_ref());

        if let Err(e) = context.connection.set_auto_commit(true) {
            log::warn!("could not restore auto-commit after transaction: {}", e);
        }
        if let Err(e) = context.connection.return_to_pool() {
            log::warn!("could not return transaction connection to pool: {}", e);
        }

        result
    }

    /// One expiry sweep. IDs are collected under the lock; rollbacks run
    /// outside it so a slow engine cannot stall other transactions.
    fn cleanup_pass(&self) {
        let timeout = Duration::from_millis(self.timeout_millis.load(Ordering::SeqCst));
        let now = Instant::now();

        let expired: Vec<String> = {
            let active = self.lock_active();
            active
                .iter()
                .filter(|(_, ctx)| now.duration_since(ctx.last_access) > timeout)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in expired {
            log::warn!("rolling back abandoned transaction {}", id);
            match self.remove(&id) {
                Ok(context) => {
                    if let Err(e) = self.finish(context, |conn| conn.rollback()) {
                        log::warn!("rollback of abandoned transaction {} failed: {}", id, e);
                    }
                }
                // Committed or rolled back concurrently; nothing to do.
                Err(_) => {}
            }
        }
    }

    fn cleanup_loop(self: Arc<Self>, shutdown: mpsc::Receiver<()>, interval: Duration) {
        loop {
            match shutdown.recv_timeout(interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.cleanup_pass();
        }
        log::debug!("transaction cleanup thread exiting");
    }
}

/// Correlates opaque transaction IDs with borrowed pool connections so a
/// transaction can be driven from more than one thread. The manager does
/// not arbitrate concurrent access to one transaction's connection; that
/// is the caller's contract.
pub struct TransactionManager {
    inner: Arc<TxnInner>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl TransactionManager {
    pub fn new(pool: Arc<ConnectionPool>) -> Result<Self, DbError> {
        Self::with_settings(
            pool,
            DEFAULT_TRANSACTION_TIMEOUT_MILLIS,
            DEFAULT_CLEANUP_INTERVAL_MILLIS,
        )
    }

    /// Explicit timeout and sweep cadence; `new` uses 5 min / 1 min.
    pub fn with_settings(
        pool: Arc<ConnectionPool>,
        timeout_millis: u64,
        cleanup_interval_millis: u64,
    ) -> Result<Self, DbError> {
        let inner = Arc::new(TxnInner {
            pool,
            active: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            timeout_millis: AtomicU64::new(timeout_millis),
        });

        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let loop_inner = inner.clone();
        let interval = Duration::from_millis(cleanup_interval_millis);
        let handle = std::thread::Builder::new()
            .name("dblink-txn-cleanup".to_string())
            .spawn(move || loop_inner.cleanup_loop(shutdown_rx, interval))
            .map_err(|e| {
                DbError::creation_failed(
                    "5D9A136BCE48",
                    format!("could not spawn transaction cleanup thread: {}", e),
                )
            })?;

        Ok(Self {
            inner,
            cleanup: Mutex::new(Some(handle)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        })
    }

    /// Borrow a connection, switch auto-commit off and key it under a
    /// fresh UUID v4.
    pub fn begin_transaction(&self) -> Result<String, DbError> {
        let connection = self.inner.pool.get_connection()?;

        if let Err(e) = connection.set_auto_commit(false) {
            if let Err(ret) = connection.return_to_pool() {
                log::warn!("could not return connection after failed begin: {}", ret);
            }
            return Err(e);
        }

        let transaction_id = Uuid::new_v4().to_string();
        let now = Instant::now();
        self.inner.lock_active().insert(
            transaction_id.clone(),
            TransactionContext {
                connection,
                created: now,
                last_access: now,
            },
        );

        log::debug!("transaction {} started", transaction_id);
        Ok(transaction_id)
    }

    /// The connection backing a transaction. Refreshes the last-access
    /// time that the expiry sweep looks at.
    pub fn transaction_connection(
        &self,
        transaction_id: &str,
    ) -> Result<Arc<dyn Connection>, DbError> {
        let mut active = self.inner.lock_active();
        let context = active.get_mut(transaction_id).ok_or_else(|| {
            DbError::transaction_not_found(
                "6EAB247CDF59",
                format!("transaction not found: {}", transaction_id),
            )
        })?;
        context.last_access = Instant::now();
        Ok(context.connection.clone())
    }

    pub fn commit_transaction(&self, transaction_id: &str) -> Result<(), DbError> {
        let context = self.inner.remove(transaction_id)?;
        log::debug!("committing transaction {}", transaction_id);
        self.inner.finish(context, |conn| conn.commit())
    }

    pub fn rollback_transaction(&self, transaction_id: &str) -> Result<(), DbError> {
        let context = self.inner.remove(transaction_id)?;
        log::debug!("rolling back transaction {}", transaction_id);
        self.inner.finish(context, |conn| conn.rollback())
    }

    pub fn is_transaction_active(&self, transaction_id: &str) -> bool {
        self.inner.lock_active().contains_key(transaction_id)
    }

    pub fn active_transaction_count(&self) -> usize {
        self.inner.lock_active().len()
    }

    pub fn set_transaction_timeout(&self, timeout_millis: u64) {
        self.inner
            .timeout_millis
            .store(timeout_millis, Ordering::SeqCst);
    }

    /// Stop the sweep thread and roll back everything outstanding.
    /// Idempotent.
    pub fn close(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(());
        }
        if let Some(handle) = self
            .cleanup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }

        let ids: Vec<String> = self.inner.lock_active().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.rollback_transaction(&id) {
                log::warn!("rollback during shutdown failed for {}: {}", id, e);
            }
        }
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dblink_core::{DriverManager, PoolConfig};
    use dblink_test_support::FakeDriver;

    fn setup(scheme: &str) -> (FakeDriver, Arc<ConnectionPool>) {
        let driver = FakeDriver::with_scheme(scheme);
        DriverManager::register(format!("fake-{}", scheme), driver.clone().into_driver());

        let pool = ConnectionPool::new(PoolConfig {
            url: format!("cpp_dbc:{}://txn-host:1/db", scheme),
            initial_size: 2,
            max_size: 4,
            min_idle: 1,
            max_wait_millis: 200,
            ..PoolConfig::default()
        })
        .unwrap();
        (driver, Arc::new(pool))
    }

    fn assert_uuid_v4(id: &str) {
        let bytes = id.as_bytes();
        assert_eq!(bytes.len(), 36, "unexpected length for {}", id);
        for (i, b) in bytes.iter().enumerate() {
            match i {
                8 | 13 | 18 | 23 => assert_eq!(*b, b'-', "hyphen expected in {}", id),
                14 => assert_eq!(*b, b'4', "version nibble expected in {}", id),
                19 => assert!(
                    matches!(*b, b'8' | b'9' | b'a' | b'b'),
                    "variant nibble expected in {}",
                    id
                ),
                _ => assert!(
                    b.is_ascii_hexdigit() && !b.is_ascii_uppercase(),
                    "lower hex expected in {}",
                    id
                ),
            }
        }
    }

    #[test]
    fn begin_commit_lifecycle() {
        let (driver, pool) = setup("txncommit");
        let manager = TransactionManager::new(pool.clone()).unwrap();

        let id = manager.begin_transaction().unwrap();
        assert_uuid_v4(&id);
        assert!(manager.is_transaction_active(&id));
        assert_eq!(manager.active_transaction_count(), 1);

        let conn = manager.transaction_connection(&id).unwrap();
        assert!(!conn.auto_commit().unwrap());

        manager.commit_transaction(&id).unwrap();
        assert!(!manager.is_transaction_active(&id));
        assert_eq!(driver.stats().commits, 1);

        // The connection went back to the pool with auto-commit restored.
        assert_eq!(pool.active_connections(), 0);
        let again = pool.get_connection().unwrap();
        assert!(again.auto_commit().unwrap());
        again.close().unwrap();

        // A finished id is gone for every operation.
        assert!(matches!(
            manager.commit_transaction(&id).unwrap_err(),
            DbError::TransactionNotFound(_)
        ));
        assert!(matches!(
            manager.transaction_connection(&id).map(|_| ()).unwrap_err(),
            DbError::TransactionNotFound(_)
        ));
    }

    #[test]
    fn rollback_removes_transaction() {
        let (driver, pool) = setup("txnrollback");
        let manager = TransactionManager::new(pool).unwrap();

        let id = manager.begin_transaction().unwrap();
        manager.rollback_transaction(&id).unwrap();

        assert!(!manager.is_transaction_active(&id));
        assert_eq!(driver.stats().rollbacks, 1);
        assert!(manager.rollback_transaction(&id).is_err());
    }

    #[test]
    fn ids_are_unique() {
        let (_, pool) = setup("txnunique");
        let manager = TransactionManager::new(pool).unwrap();

        let a = manager.begin_transaction().unwrap();
        let b = manager.begin_transaction().unwrap();
        assert_ne!(a, b);

        manager.rollback_transaction(&a).unwrap();
        manager.rollback_transaction(&b).unwrap();
    }

    #[test]
    fn abandoned_transactions_are_rolled_back() {
        let (driver, pool) = setup("txnexpire");
        let manager = TransactionManager::with_settings(pool.clone(), 40, 20).unwrap();

        let id = manager.begin_transaction().unwrap();
        assert_eq!(pool.active_connections(), 1);

        let deadline = Instant::now() + Duration::from_secs(3);
        while manager.is_transaction_active(&id) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        assert!(!manager.is_transaction_active(&id));
        assert_eq!(driver.stats().rollbacks, 1);
        assert_eq!(pool.active_connections(), 0);
    }

    #[test]
    fn keeping_a_transaction_warm_defers_expiry() {
        let (_, pool) = setup("txnwarm");
        let manager = TransactionManager::with_settings(pool, 120, 20).unwrap();

        let id = manager.begin_transaction().unwrap();
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(40));
            manager.transaction_connection(&id).unwrap();
        }
        assert!(manager.is_transaction_active(&id));
        manager.commit_transaction(&id).unwrap();
    }

    #[test]
    fn close_rolls_back_outstanding_transactions() {
        let (driver, pool) = setup("txnclose");
        let manager = TransactionManager::new(pool).unwrap();

        let a = manager.begin_transaction().unwrap();
        let b = manager.begin_transaction().unwrap();

        manager.close();
        assert!(!manager.is_transaction_active(&a));
        assert!(!manager.is_transaction_active(&b));
        assert_eq!(driver.stats().rollbacks, 2);

        manager.close();
    }
}
