use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dblink_core::{
    Connection, DbError, Driver, IsolationLevel, ParamSlots, ParamType, PreparedStatement,
    ResultSet, Value, count_placeholders, has_scheme,
};

/// Scripted result of executing a piece of SQL on a fake connection.
#[derive(Clone)]
pub enum FakeQueryOutcome {
    Rows(Vec<String>, Vec<Vec<Value>>),
    Error(String),
}

impl FakeQueryOutcome {
    fn into_result(&self) -> Result<ResultSet, DbError> {
        match self {
            Self::Rows(columns, rows) => Ok(ResultSet::new(columns.clone(), rows.clone())),
            Self::Error(message) => {
                Err(DbError::execute_failed("FAB0DE500001", message.clone()))
            }
        }
    }
}

/// Counters exposed to assertions.
#[derive(Debug, Clone, Default)]
pub struct FakeDriverStats {
    pub connections_opened: usize,
    pub physical_closes: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub executed_sql: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    query_outcomes: RwLock<HashMap<String, FakeQueryOutcome>>,
    connect_error: RwLock<Option<String>>,
    // The next N validation-query executions fail, across all connections.
    validation_failures: AtomicUsize,
    connections_opened: AtomicUsize,
    physical_closes: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    executed_sql: Mutex<Vec<String>>,
}

/// Deterministic in-memory driver for registry, pool and transaction
/// manager tests. Accepts `cpp_dbc:<scheme>:` URLs for its configured
/// scheme and opens connections that honor scripted outcomes.
#[derive(Clone)]
pub struct FakeDriver {
    scheme: String,
    state: Arc<FakeState>,
}

impl FakeDriver {
    pub fn with_scheme(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            state: Arc::new(FakeState::default()),
        }
    }

    pub fn with_query_rows(
        self,
        sql: impl Into<String>,
        columns: Vec<&str>,
        rows: Vec<Vec<Value>>,
    ) -> Self {
        rwlock_write(&self.state.query_outcomes).insert(
            sql.into(),
            FakeQueryOutcome::Rows(columns.into_iter().map(String::from).collect(), rows),
        );
        self
    }

    pub fn with_query_error(self, sql: impl Into<String>, message: impl Into<String>) -> Self {
        rwlock_write(&self.state.query_outcomes)
            .insert(sql.into(), FakeQueryOutcome::Error(message.into()));
        self
    }

    pub fn with_connect_error(self, message: impl Into<String>) -> Self {
        *rwlock_write(&self.state.connect_error) = Some(message.into());
        self
    }

    /// Make the next `n` validation-query executions fail.
    pub fn fail_next_validations(&self, n: usize) {
        self.state.validation_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_connect_error(&self, message: Option<String>) {
        *rwlock_write(&self.state.connect_error) = message;
    }

    pub fn stats(&self) -> FakeDriverStats {
        FakeDriverStats {
            connections_opened: self.state.connections_opened.load(Ordering::SeqCst),
            physical_closes: self.state.physical_closes.load(Ordering::SeqCst),
            commits: self.state.commits.load(Ordering::SeqCst),
            rollbacks: self.state.rollbacks.load(Ordering::SeqCst),
            executed_sql: mutex_lock(&self.state.executed_sql).clone(),
        }
    }

    pub fn into_driver(self) -> Arc<dyn Driver> {
        Arc::new(self)
    }
}

impl Driver for FakeDriver {
    fn name(&self) -> &'static str {
        "Fake"
    }

    fn accepts_url(&self, url: &str) -> bool {
        has_scheme(url, &self.scheme)
    }

    fn connect(
        &self,
        url: &str,
        _user: &str,
        _password: &str,
        _options: &HashMap<String, String>,
    ) -> Result<Arc<dyn Connection>, DbError> {
        if let Some(message) = rwlock_read(&self.state.connect_error).clone() {
            return Err(DbError::connect_failed("FAB0DE500002", message));
        }

        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(FakeConnection {
            url: url.to_string(),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
            auto_commit: AtomicBool::new(true),
            transaction_active: AtomicBool::new(false),
            isolation: Mutex::new(IsolationLevel::ReadCommitted),
        }))
    }
}

struct FakeConnection {
    url: String,
    state: Arc<FakeState>,
    closed: AtomicBool,
    auto_commit: AtomicBool,
    transaction_active: AtomicBool,
    isolation: Mutex<IsolationLevel>,
}

impl FakeConnection {
    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::connection_closed(
                "FAB0DE500003",
                "connection is closed",
            ));
        }
        Ok(())
    }

    fn run(&self, sql: &str) -> Result<ResultSet, DbError> {
        self.check_open()?;
        mutex_lock(&self.state.executed_sql).push(sql.to_string());

        if self.state.validation_failures.load(Ordering::SeqCst) > 0
            && sql.trim().eq_ignore_ascii_case("select 1")
        {
            self.state.validation_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(DbError::execute_failed(
                "FAB0DE500004",
                "scripted validation failure",
            ));
        }

        if let Some(outcome) = rwlock_read(&self.state.query_outcomes).get(sql).cloned() {
            return outcome.into_result();
        }

        Ok(ResultSet::new(Vec::new(), Vec::new()))
    }
}

impl Connection for FakeConnection {
    fn prepare_statement(&self, sql: &str) -> Result<Box<dyn PreparedStatement>, DbError> {
        self.check_open()?;
        Ok(Box::new(FakeStatement {
            sql: sql.to_string(),
            slots: ParamSlots::new(count_placeholders(sql)),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn execute_query(&self, sql: &str) -> Result<ResultSet, DbError> {
        self.run(sql)
    }

    fn execute_update(&self, sql: &str) -> Result<u64, DbError> {
        self.run(sql).map(|_| 0)
    }

    fn set_auto_commit(&self, auto_commit: bool) -> Result<(), DbError> {
        self.check_open()?;
        self.auto_commit.store(auto_commit, Ordering::SeqCst);
        Ok(())
    }

    fn auto_commit(&self) -> Result<bool, DbError> {
        self.check_open()?;
        Ok(self.auto_commit.load(Ordering::SeqCst))
    }

    fn begin_transaction(&self) -> Result<(), DbError> {
        self.check_open()?;
        self.transaction_active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn transaction_active(&self) -> Result<bool, DbError> {
        self.check_open()?;
        Ok(self.transaction_active.load(Ordering::SeqCst))
    }

    fn commit(&self) -> Result<(), DbError> {
        self.check_open()?;
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        self.transaction_active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self) -> Result<(), DbError> {
        self.check_open()?;
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.transaction_active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<(), DbError> {
        self.check_open()?;
        *mutex_lock(&self.isolation) = level;
        Ok(())
    }

    fn transaction_isolation(&self) -> Result<IsolationLevel, DbError> {
        self.check_open()?;
        Ok(*mutex_lock(&self.isolation))
    }

    fn close(&self) -> Result<(), DbError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.physical_closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct FakeStatement {
    sql: String,
    slots: ParamSlots,
    state: Arc<FakeState>,
    closed: AtomicBool,
}

impl FakeStatement {
    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::connection_closed(
                "FAB0DE500005",
                "statement is closed",
            ));
        }
        Ok(())
    }

    fn run(&self) -> Result<ResultSet, DbError> {
        self.check_open()?;
        self.slots.resolve()?;
        mutex_lock(&self.state.executed_sql).push(self.sql.clone());

        if let Some(outcome) = rwlock_read(&self.state.query_outcomes)
            .get(&self.sql)
            .cloned()
        {
            return outcome.into_result();
        }
        Ok(ResultSet::new(Vec::new(), Vec::new()))
    }
}

impl PreparedStatement for FakeStatement {
    fn set_int(&self, index: usize, value: i32) -> Result<(), DbError> {
        self.slots.bind(index, dblink_core::ParamValue::Int(value))
    }

    fn set_long(&self, index: usize, value: i64) -> Result<(), DbError> {
        self.slots.bind(index, dblink_core::ParamValue::Long(value))
    }

    fn set_double(&self, index: usize, value: f64) -> Result<(), DbError> {
        self.slots
            .bind(index, dblink_core::ParamValue::Double(value))
    }

    fn set_string(&self, index: usize, value: &str) -> Result<(), DbError> {
        self.slots
            .bind(index, dblink_core::ParamValue::Text(value.to_string()))
    }

    fn set_bool(&self, index: usize, value: bool) -> Result<(), DbError> {
        self.slots.bind(index, dblink_core::ParamValue::Bool(value))
    }

    fn set_date(&self, index: usize, value: &str) -> Result<(), DbError> {
        self.slots
            .bind(index, dblink_core::ParamValue::Date(value.to_string()))
    }

    fn set_timestamp(&self, index: usize, value: &str) -> Result<(), DbError> {
        self.slots
            .bind(index, dblink_core::ParamValue::Timestamp(value.to_string()))
    }

    fn set_null(&self, index: usize, kind: ParamType) -> Result<(), DbError> {
        self.slots.bind(index, dblink_core::ParamValue::Null(kind))
    }

    fn set_bytes(&self, index: usize, value: &[u8]) -> Result<(), DbError> {
        self.slots
            .bind(index, dblink_core::ParamValue::Bytes(value.to_vec()))
    }

    fn set_blob(&self, index: usize, value: Arc<dyn dblink_core::Blob>) -> Result<(), DbError> {
        self.slots.bind(index, dblink_core::ParamValue::Blob(value))
    }

    fn set_binary_stream(
        &self,
        index: usize,
        value: Box<dyn dblink_core::InputStream>,
    ) -> Result<(), DbError> {
        self.slots
            .bind(index, dblink_core::ParamValue::Stream(value))
    }

    fn execute_query(&self) -> Result<ResultSet, DbError> {
        self.run()
    }

    fn execute_update(&self) -> Result<u64, DbError> {
        self.run().map(|_| 0)
    }

    fn execute(&self) -> Result<bool, DbError> {
        self.run().map(|rs| !rs.is_empty())
    }

    fn close(&self) -> Result<(), DbError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn rwlock_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poison_error) => poison_error.into_inner(),
    }
}

fn rwlock_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poison_error) => poison_error.into_inner(),
    }
}

fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poison_error) => poison_error.into_inner(),
    }
}
