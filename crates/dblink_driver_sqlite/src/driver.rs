use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dblink_core::{
    Blob, Connection, DbError, Driver, InputStream, IsolationLevel, ParamSlots, ParamType,
    ParamValue, PreparedStatement, ResolvedParam, ResultSet, Value, count_placeholders,
    has_scheme, parse_sqlite_path,
};
use rusqlite::Connection as RusqliteConnection;

use crate::blob::SqliteBlob;

/// Engine session handle. The connection owns the strong reference;
/// statements and blobs hold weak counterparts so a closed connection is
/// detected at their next access.
pub(crate) type SessionHandle = Arc<Mutex<RusqliteConnection>>;

pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }

    /// Parse `cpp_dbc:sqlite:PATH` (or `:memory:`).
    pub fn parse_url(url: &str) -> Result<String, DbError> {
        parse_sqlite_path(url)
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "SQLite"
    }

    fn accepts_url(&self, url: &str) -> bool {
        has_scheme(url, "sqlite")
    }

    fn connect(
        &self,
        url: &str,
        _user: &str,
        _password: &str,
        _options: &HashMap<String, String>,
    ) -> Result<Arc<dyn Connection>, DbError> {
        let path = Self::parse_url(url)?;

        let conn = RusqliteConnection::open(&path).map_err(|e| {
            DbError::connect_failed(
                "7FBC358DE06A",
                format!("could not open SQLite database '{}': {}", path, e),
            )
        })?;

        log::debug!("[CONNECT] SQLite database opened: {}", path);

        Ok(Arc::new(SqliteConnection {
            session: Mutex::new(Some(Arc::new(Mutex::new(conn)))),
            url: url.to_string(),
            closed: AtomicBool::new(false),
            auto_commit: AtomicBool::new(true),
            transaction_active: AtomicBool::new(false),
            isolation: Mutex::new(IsolationLevel::Serializable),
        }))
    }
}

pub struct SqliteConnection {
    session: Mutex<Option<SessionHandle>>,
    url: String,
    closed: AtomicBool,
    auto_commit: AtomicBool,
    transaction_active: AtomicBool,
    isolation: Mutex<IsolationLevel>,
}

impl SqliteConnection {
    fn session(&self) -> Result<SessionHandle, DbError> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                DbError::connection_closed("8ACD469EF17B", "connection is closed")
            })
    }

    fn session_weak(&self) -> Result<Weak<Mutex<RusqliteConnection>>, DbError> {
        Ok(Arc::downgrade(&self.session()?))
    }

    fn run_batch(&self, sql: &str) -> Result<(), DbError> {
        let session = self.session()?;
        let guard = lock_session(&session);
        guard.execute_batch(sql).map_err(|e| format_sqlite_error(&e))
    }

    /// Lazy blob over a single table cell, addressed by rowid.
    pub fn open_blob(
        &self,
        table: &str,
        column: &str,
        rowid: i64,
    ) -> Result<Arc<SqliteBlob>, DbError> {
        Ok(Arc::new(SqliteBlob::new(
            self.session_weak()?,
            table.to_string(),
            column.to_string(),
            rowid,
        )))
    }

    /// Rowid of the most recent successful INSERT on this connection.
    pub fn last_insert_rowid(&self) -> Result<i64, DbError> {
        let session = self.session()?;
        let guard = lock_session(&session);
        Ok(guard.last_insert_rowid())
    }
}

impl Connection for SqliteConnection {
    fn prepare_statement(&self, sql: &str) -> Result<Box<dyn PreparedStatement>, DbError> {
        let session = self.session()?;

        // Compile once up front so malformed SQL fails at preparation.
        {
            let guard = lock_session(&session);
            guard
                .prepare(sql)
                .map_err(|e| format_sqlite_error(&e))?;
        }

        Ok(Box::new(SqliteStatement {
            sql: sql.to_string(),
            slots: ParamSlots::new(count_placeholders(sql)),
            session: Arc::downgrade(&session),
            closed: AtomicBool::new(false),
        }))
    }

    fn execute_query(&self, sql: &str) -> Result<ResultSet, DbError> {
        let session = self.session()?;
        let guard = lock_session(&session);
        let mut stmt = guard.prepare(sql).map_err(|e| format_sqlite_error(&e))?;
        collect_result_set(&mut stmt, Vec::new())
    }

    fn execute_update(&self, sql: &str) -> Result<u64, DbError> {
        let session = self.session()?;
        let guard = lock_session(&session);
        guard
            .execute(sql, [])
            .map(|affected| affected as u64)
            .map_err(|e| format_sqlite_error(&e))
    }

    fn set_auto_commit(&self, auto_commit: bool) -> Result<(), DbError> {
        if auto_commit == self.auto_commit.load(Ordering::SeqCst) {
            return Ok(());
        }

        if auto_commit {
            // Leaving manual mode commits whatever is open.
            if self.transaction_active.swap(false, Ordering::SeqCst) {
                self.run_batch("COMMIT")?;
            }
        } else {
            self.run_batch("BEGIN")?;
            self.transaction_active.store(true, Ordering::SeqCst);
        }
        self.auto_commit.store(auto_commit, Ordering::SeqCst);
        Ok(())
    }

    fn auto_commit(&self) -> Result<bool, DbError> {
        Ok(self.auto_commit.load(Ordering::SeqCst))
    }

    fn begin_transaction(&self) -> Result<(), DbError> {
        if self.transaction_active.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.run_batch("BEGIN")?;
        self.transaction_active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn transaction_active(&self) -> Result<bool, DbError> {
        Ok(self.transaction_active.load(Ordering::SeqCst))
    }

    fn commit(&self) -> Result<(), DbError> {
        if !self.transaction_active.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.run_batch("COMMIT")
            .map_err(|e| DbError::commit_failed("9BDE570FA28C", "COMMIT failed").with_cause(e))?;
        self.transaction_active.store(false, Ordering::SeqCst);

        // Manual mode stays transactional across commits.
        if !self.auto_commit.load(Ordering::SeqCst) {
            self.run_batch("BEGIN")?;
            self.transaction_active.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn rollback(&self) -> Result<(), DbError> {
        if !self.transaction_active.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.run_batch("ROLLBACK").map_err(|e| {
            DbError::rollback_failed("AC0E681FB39D", "ROLLBACK failed").with_cause(e)
        })?;
        self.transaction_active.store(false, Ordering::SeqCst);

        if !self.auto_commit.load(Ordering::SeqCst) {
            self.run_batch("BEGIN")?;
            self.transaction_active.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<(), DbError> {
        // SQLite only distinguishes read-uncommitted (shared-cache mode);
        // the remaining levels keep the engine's serialized default.
        let pragma = match level {
            IsolationLevel::ReadUncommitted => "PRAGMA read_uncommitted = 1",
            _ => "PRAGMA read_uncommitted = 0",
        };
        self.run_batch(pragma)?;
        *self.isolation.lock().unwrap_or_else(|e| e.into_inner()) = level;
        Ok(())
    }

    fn transaction_isolation(&self) -> Result<IsolationLevel, DbError> {
        Ok(*self.isolation.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Dropping the strong handle is the cascade: every statement and
        // blob holds a weak reference that stops upgrading now.
        let handle = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(handle);

        log::debug!("[CLOSE] SQLite connection closed: {}", self.url);
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

struct SqliteStatement {
    sql: String,
    slots: ParamSlots,
    session: Weak<Mutex<RusqliteConnection>>,
    closed: AtomicBool,
}

impl SqliteStatement {
    fn session(&self) -> Result<SessionHandle, DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::connection_closed(
                "BD1F792AC40E",
                "statement is closed",
            ));
        }
        self.session.upgrade().ok_or_else(|| {
            DbError::connection_closed("CE20803BD51F", "connection is closed")
        })
    }

    fn engine_params(&self) -> Result<Vec<rusqlite::types::Value>, DbError> {
        Ok(self
            .slots
            .resolve()?
            .into_iter()
            .map(resolved_to_sqlite)
            .collect())
    }
}

impl PreparedStatement for SqliteStatement {
    fn set_int(&self, index: usize, value: i32) -> Result<(), DbError> {
        self.slots.bind(index, ParamValue::Int(value))
    }

    fn set_long(&self, index: usize, value: i64) -> Result<(), DbError> {
        self.slots.bind(index, ParamValue::Long(value))
    }

    fn set_double(&self, index: usize, value: f64) -> Result<(), DbError> {
        self.slots.bind(index, ParamValue::Double(value))
    }

    fn set_string(&self, index: usize, value: &str) -> Result<(), DbError> {
        self.slots.bind(index, ParamValue::Text(value.to_string()))
    }

    fn set_bool(&self, index: usize, value: bool) -> Result<(), DbError> {
        self.slots.bind(index, ParamValue::Bool(value))
    }

    fn set_date(&self, index: usize, value: &str) -> Result<(), DbError> {
        self.slots.bind(index, ParamValue::Date(value.to_string()))
    }

    fn set_timestamp(&self, index: usize, value: &str) -> Result<(), DbError> {
        self.slots
            .bind(index, ParamValue::Timestamp(value.to_string()))
    }

    fn set_null(&self, index: usize, kind: ParamType) -> Result<(), DbError> {
        self.slots.bind(index, ParamValue::Null(kind))
    }

    fn set_bytes(&self, index: usize, value: &[u8]) -> Result<(), DbError> {
        self.slots.bind(index, ParamValue::Bytes(value.to_vec()))
    }

    fn set_blob(&self, index: usize, value: Arc<dyn Blob>) -> Result<(), DbError> {
        self.slots.bind(index, ParamValue::Blob(value))
    }

    fn set_binary_stream(
        &self,
        index: usize,
        value: Box<dyn InputStream>,
    ) -> Result<(), DbError> {
        self.slots.bind(index, ParamValue::Stream(value))
    }

    fn execute_query(&self) -> Result<ResultSet, DbError> {
        let session = self.session()?;
        let params = self.engine_params()?;
        let guard = lock_session(&session);
        let mut stmt = guard
            .prepare(&self.sql)
            .map_err(|e| format_sqlite_error(&e))?;
        collect_result_set(&mut stmt, params)
    }

    fn execute_update(&self) -> Result<u64, DbError> {
        let session = self.session()?;
        let params = self.engine_params()?;
        let guard = lock_session(&session);
        guard
            .execute(&self.sql, rusqlite::params_from_iter(params))
            .map(|affected| affected as u64)
            .map_err(|e| format_sqlite_error(&e))
    }

    fn execute(&self) -> Result<bool, DbError> {
        let session = self.session()?;
        let params = self.engine_params()?;
        let guard = lock_session(&session);
        let mut stmt = guard
            .prepare(&self.sql)
            .map_err(|e| format_sqlite_error(&e))?;

        if stmt.column_count() > 0 {
            collect_result_set(&mut stmt, params)?;
            Ok(true)
        } else {
            stmt.execute(rusqlite::params_from_iter(params))
                .map_err(|e| format_sqlite_error(&e))?;
            Ok(false)
        }
    }

    fn close(&self) -> Result<(), DbError> {
        self.closed.store(true, Ordering::SeqCst);
        self.slots.clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub(crate) fn lock_session(
    session: &SessionHandle,
) -> MutexGuard<'_, RusqliteConnection> {
    session.lock().unwrap_or_else(|e| e.into_inner())
}

fn collect_result_set(
    stmt: &mut rusqlite::Statement<'_>,
    params: Vec<rusqlite::types::Value>,
) -> Result<ResultSet, DbError> {
    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let column_count = columns.len();

    let mut rows = Vec::new();
    let mut result_rows = stmt
        .query(rusqlite::params_from_iter(params))
        .map_err(|e| format_sqlite_error(&e))?;

    while let Some(row) = result_rows.next().map_err(|e| format_sqlite_error(&e))? {
        let mut values = Vec::with_capacity(column_count);
        for i in 0..column_count {
            values.push(sqlite_value_to_value(row, i));
        }
        rows.push(values);
    }

    Ok(ResultSet::new(columns, rows))
}

fn sqlite_value_to_value(row: &rusqlite::Row<'_>, idx: usize) -> Value {
    use rusqlite::types::ValueRef;

    match row.get_ref(idx) {
        Ok(ValueRef::Null) => Value::Null,
        Ok(ValueRef::Integer(i)) => Value::Int(i),
        Ok(ValueRef::Real(f)) => Value::Float(f),
        Ok(ValueRef::Text(t)) => Value::Text(String::from_utf8_lossy(t).to_string()),
        Ok(ValueRef::Blob(b)) => Value::Bytes(b.to_vec()),
        Err(_) => Value::Null,
    }
}

fn resolved_to_sqlite(param: ResolvedParam) -> rusqlite::types::Value {
    use rusqlite::types::Value as SqlValue;

    match param {
        ResolvedParam::Null(_) => SqlValue::Null,
        ResolvedParam::Int(v) => SqlValue::Integer(v as i64),
        ResolvedParam::Long(v) => SqlValue::Integer(v),
        ResolvedParam::Double(v) => SqlValue::Real(v),
        ResolvedParam::Text(v) | ResolvedParam::Date(v) | ResolvedParam::Timestamp(v) => {
            SqlValue::Text(v)
        }
        ResolvedParam::Bool(v) => SqlValue::Integer(i64::from(v)),
        ResolvedParam::Bytes(v) => SqlValue::Blob(v),
    }
}

pub(crate) fn format_sqlite_error(e: &rusqlite::Error) -> DbError {
    let message = match e {
        rusqlite::Error::SqliteFailure(err, msg) => match msg {
            Some(msg) => format!("{} ({:?})", msg, err.code),
            None => format!("{:?}", err.code),
        },
        other => other.to_string(),
    };

    log::error!("SQLite operation failed: {}", message);
    DbError::execute_failed("DF31914CE620", message)
}
