use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dblink_core::{Connection, DbError, DriverManager, PoolConfig};

use crate::pooled::PooledConnection;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) struct PoolState {
    pub(crate) all: Vec<Arc<PooledConnection>>,
    pub(crate) idle: VecDeque<Arc<PooledConnection>>,
}

/// Shared pool internals. Wrappers hold a `Weak` to this so an
/// outstanding wrapper can never keep a closed pool alive, and a return
/// after pool teardown degrades to a no-op.
pub(crate) struct PoolInner {
    config: PoolConfig,
    // Single state mutex paired with the condvar: borrow, return and
    // maintenance all synchronize here.
    state: Mutex<PoolState>,
    available: Condvar,
    running: AtomicBool,
    active: AtomicUsize,
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn create_pooled(self: &Arc<Self>) -> Result<Arc<PooledConnection>, DbError> {
        let physical = DriverManager::connection(
            &self.config.url,
            &self.config.username,
            &self.config.password,
        )
        .map_err(|e| {
            DbError::creation_failed(
                "F73BAD15C8E2",
                format!("could not create pooled connection for {}", self.config.url),
            )
            .with_cause(e)
        })?;

        Ok(Arc::new_cyclic(|me| {
            PooledConnection::new(physical, Arc::downgrade(self), me.clone())
        }))
    }

    fn validate(&self, conn: &PooledConnection) -> bool {
        match conn.physical().validate(&self.config.validation_query) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("pooled connection failed validation: {}", e);
                false
            }
        }
    }

    fn remove_from_all(state: &mut PoolState, conn: &Arc<PooledConnection>) {
        state.all.retain(|c| !Arc::ptr_eq(c, conn));
        state.idle.retain(|c| !Arc::ptr_eq(c, conn));
    }

    /// One borrow attempt under the state lock: idle entry (validated if
    /// configured) or a fresh connection within capacity.
    fn try_acquire(
        self: &Arc<Self>,
        state: &mut PoolState,
    ) -> Result<Option<Arc<PooledConnection>>, DbError> {
        while let Some(conn) = state.idle.pop_front() {
            if self.config.test_on_borrow && !self.validate(&conn) {
                Self::remove_from_all(state, &conn);
                conn.close_physical();
                continue;
            }
            return Ok(Some(conn));
        }

        if state.all.len() < self.config.max_size {
            let conn = self.create_pooled()?;
            state.all.push(conn.clone());
            return Ok(Some(conn));
        }

        Ok(None)
    }

    /// Called from `PooledConnection::close()`.
    pub(crate) fn return_connection(self: &Arc<Self>, conn: Arc<PooledConnection>) {
        let mut state = self.lock_state();

        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.config.test_on_return && !self.validate(&conn) {
            Self::remove_from_all(&mut state, &conn);
            conn.close_physical();

            if state.all.len() < self.config.min_idle {
                match self.create_pooled() {
                    Ok(fresh) => {
                        state.all.push(fresh.clone());
                        state.idle.push_back(fresh);
                        self.available.notify_one();
                    }
                    Err(e) => log::warn!("could not replace discarded connection: {}", e),
                }
            }
            return;
        }

        conn.mark_inactive();
        state.idle.push_back(conn);
        self.available.notify_one();
    }

    /// One eviction/top-up pass. Runs under the state lock.
    pub(crate) fn maintenance_pass(self: &Arc<Self>) {
        let mut state = self.lock_state();
        let now = Instant::now();

        let mut i = 0;
        while i < state.all.len() {
            let conn = state.all[i].clone();
            if conn.is_active() {
                i += 1;
                continue;
            }

            let idle_ms = now.duration_since(conn.last_used()).as_millis() as u64;
            let life_ms = now.duration_since(conn.created()).as_millis() as u64;
            let expired = idle_ms > self.config.idle_timeout_millis
                || life_ms > self.config.max_lifetime_millis;

            if expired && state.all.len() > self.config.min_idle {
                log::debug!(
                    "evicting pooled connection (idle {} ms, life {} ms)",
                    idle_ms,
                    life_ms
                );
                Self::remove_from_all(&mut state, &conn);
                conn.close_physical();
            } else {
                i += 1;
            }
        }

        while self.running.load(Ordering::SeqCst) && state.all.len() < self.config.min_idle {
            match self.create_pooled() {
                Ok(conn) => {
                    state.all.push(conn.clone());
                    state.idle.push_back(conn);
                    self.available.notify_one();
                }
                Err(e) => {
                    log::warn!("maintenance could not top up pool: {}", e);
                    break;
                }
            }
        }
    }

    fn maintenance_loop(self: Arc<Self>, shutdown: mpsc::Receiver<()>) {
        loop {
            match shutdown.recv_timeout(MAINTENANCE_INTERVAL) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.maintenance_pass();
        }
        log::debug!("pool maintenance thread exiting");
    }
}

/// Bounded, thread-safe connection pool.
///
/// Physical connections are created through the process-wide
/// [`DriverManager`], so the drivers for the configured URL must be
/// registered before the pool is built.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl ConnectionPool {
    /// Create `initial_size` connections up front and start the
    /// maintenance thread. Fails if any initial connection fails.
    pub fn new(config: PoolConfig) -> Result<Self, DbError> {
        let inner = Arc::new(PoolInner {
            config,
            state: Mutex::new(PoolState {
                all: Vec::new(),
                idle: VecDeque::new(),
            }),
            available: Condvar::new(),
            running: AtomicBool::new(true),
            active: AtomicUsize::new(0),
        });

        {
            let mut state = inner.lock_state();
            for _ in 0..inner.config.initial_size {
                let conn = inner.create_pooled()?;
                state.all.push(conn.clone());
                state.idle.push_back(conn);
            }
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let loop_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name("dblink-pool-maintenance".to_string())
            .spawn(move || loop_inner.maintenance_loop(shutdown_rx))
            .map_err(|e| {
                DbError::creation_failed(
                    "0845CE26D9F3",
                    format!("could not spawn pool maintenance thread: {}", e),
                )
            })?;

        Ok(Self {
            inner,
            maintenance: Mutex::new(Some(handle)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        })
    }

    /// Borrow a connection, waiting up to `max_wait_millis`.
    pub fn get_connection(&self) -> Result<Arc<dyn Connection>, DbError> {
        let inner = &self.inner;
        let mut state = inner.lock_state();

        if !inner.running.load(Ordering::SeqCst) {
            return Err(DbError::pool_closed("1956DF37EA04", "pool is closed"));
        }

        let wait_start = Instant::now();
        let max_wait = Duration::from_millis(inner.config.max_wait_millis);

        let conn = loop {
            if let Some(conn) = inner.try_acquire(&mut state)? {
                break conn;
            }

            let waited = wait_start.elapsed();
            if waited >= max_wait {
                return Err(DbError::borrow_timeout(
                    "2A67E048FB15",
                    format!(
                        "no connection became available within {} ms",
                        inner.config.max_wait_millis
                    ),
                ));
            }

            let (guard, _timeout) = inner
                .available
                .wait_timeout(state, max_wait - waited)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;

            if !inner.running.load(Ordering::SeqCst) {
                return Err(DbError::pool_closed("3B78F159AC26", "pool is closed"));
            }
        };

        conn.mark_active();
        inner.active.fetch_add(1, Ordering::SeqCst);
        Ok(conn)
    }

    pub fn active_connections(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn idle_connections(&self) -> usize {
        self.inner.lock_state().idle.len()
    }

    pub fn total_connections(&self) -> usize {
        self.inner.lock_state().all.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Shut the pool down: wake all waiters, stop maintenance, close
    /// every physical connection. Idempotent.
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
        self.inner.available.notify_all();

        if let Some(handle) = self
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = handle.join();
        }

        let mut state = self.inner.lock_state();
        for conn in state.all.drain(..) {
            conn.close_physical();
        }
        state.idle.clear();
        self.inner.active.store(0, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn run_maintenance_pass(&self) {
        self.inner.maintenance_pass();
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dblink_test_support::FakeDriver;

    fn pool_config(scheme: &str, initial: usize, max: usize, min_idle: usize) -> PoolConfig {
        PoolConfig {
            url: format!("cpp_dbc:{}://pool-host:1/db", scheme),
            username: "u".to_string(),
            password: "p".to_string(),
            initial_size: initial,
            max_size: max,
            min_idle,
            max_wait_millis: 200,
            ..PoolConfig::default()
        }
    }

    fn register(scheme: &str) -> FakeDriver {
        let driver = FakeDriver::with_scheme(scheme);
        DriverManager::register(format!("fake-{}", scheme), driver.clone().into_driver());
        driver
    }

    #[test]
    fn initial_connections_are_idle() {
        let driver = register("poolinit");
        let pool = ConnectionPool::new(pool_config("poolinit", 3, 5, 2)).unwrap();

        assert_eq!(pool.total_connections(), 3);
        assert_eq!(pool.idle_connections(), 3);
        assert_eq!(pool.active_connections(), 0);
        assert_eq!(driver.stats().connections_opened, 3);
    }

    #[test]
    fn construction_fails_when_a_connection_fails() {
        let driver = register("poolbadinit");
        driver.set_connect_error(Some("engine down".to_string()));

        let err = match ConnectionPool::new(pool_config("poolbadinit", 2, 5, 1)) {
            Err(e) => e,
            Ok(_) => panic!("expected construction to fail"),
        };
        assert!(matches!(err, DbError::CreationFailed(_)));
    }

    #[test]
    fn borrow_and_return_keep_counts_consistent() {
        register("poolborrow");
        let pool = ConnectionPool::new(pool_config("poolborrow", 2, 5, 1)).unwrap();

        let conn = pool.get_connection().unwrap();
        assert!(conn.is_pooled());
        assert_eq!(pool.active_connections(), 1);
        assert_eq!(pool.idle_connections(), 1);
        assert_eq!(pool.total_connections(), 2);

        conn.close().unwrap();
        assert_eq!(pool.active_connections(), 0);
        assert_eq!(pool.idle_connections(), 2);

        // Second close is a no-op, not a double return.
        conn.close().unwrap();
        assert_eq!(pool.idle_connections(), 2);
    }

    #[test]
    fn pool_grows_up_to_max_size() {
        register("poolgrow");
        let pool = ConnectionPool::new(pool_config("poolgrow", 1, 3, 1)).unwrap();

        let a = pool.get_connection().unwrap();
        let b = pool.get_connection().unwrap();
        let c = pool.get_connection().unwrap();
        assert_eq!(pool.total_connections(), 3);

        let err = match pool.get_connection() {
            Err(e) => e,
            Ok(_) => panic!("expected get_connection to fail"),
        };
        assert!(matches!(err, DbError::BorrowTimeout(_)));

        drop((a, b, c));
    }

    #[test]
    fn failed_validation_on_borrow_is_replaced() {
        let driver = register("poolvalidate");
        let pool = ConnectionPool::new(pool_config("poolvalidate", 1, 3, 1)).unwrap();
        let opened_before = driver.stats().connections_opened;

        driver.fail_next_validations(1);
        let conn = pool.get_connection().unwrap();

        // The sick connection was discarded and a fresh one created.
        assert_eq!(driver.stats().connections_opened, opened_before + 1);
        assert_eq!(pool.total_connections(), 1);
        conn.close().unwrap();
    }

    #[test]
    fn closed_pool_rejects_borrows_and_nullifies_wrappers() {
        let driver = register("poolclose");
        let pool = ConnectionPool::new(pool_config("poolclose", 2, 3, 1)).unwrap();

        let held = pool.get_connection().unwrap();
        pool.close();

        assert!(matches!(
            pool.get_connection().map(|_| ()).unwrap_err(),
            DbError::PoolClosed(_)
        ));
        // All physical connections were closed, including the checked-out one.
        assert_eq!(driver.stats().physical_closes, 2);
        assert!(matches!(
            held.execute_query("SELECT 1").map(|_| ()).unwrap_err(),
            DbError::ConnectionClosed(_)
        ));
        // Returning the wrapper after close is harmless.
        held.close().unwrap();

        // close() is idempotent.
        pool.close();
    }

    #[test]
    fn maintenance_evicts_idle_connections_above_min_idle() {
        register("poolevict");
        let mut config = pool_config("poolevict", 3, 5, 1);
        config.idle_timeout_millis = 0;
        let pool = ConnectionPool::new(config).unwrap();

        std::thread::sleep(Duration::from_millis(10));
        pool.run_maintenance_pass();

        // Evicted down to min_idle, then topped back up to it.
        assert_eq!(pool.total_connections(), 1);
        assert_eq!(pool.idle_connections(), 1);
    }

    #[test]
    fn maintenance_retains_connections_at_or_below_min_idle() {
        register("poolretain");
        let mut config = pool_config("poolretain", 2, 5, 2);
        config.idle_timeout_millis = 0;
        let pool = ConnectionPool::new(config).unwrap();

        std::thread::sleep(Duration::from_millis(10));
        pool.run_maintenance_pass();

        assert_eq!(pool.total_connections(), 2);
    }

    #[test]
    fn maintenance_ignores_active_connections() {
        register("poolactive");
        let mut config = pool_config("poolactive", 2, 5, 1);
        config.idle_timeout_millis = 0;
        let pool = ConnectionPool::new(config).unwrap();

        let held = pool.get_connection().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        pool.run_maintenance_pass();

        // The held connection stays; only surplus idle entries go.
        assert_eq!(pool.active_connections(), 1);
        assert!(pool.total_connections() >= 1);
        held.close().unwrap();
    }
}
