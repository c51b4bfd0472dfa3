use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dblink_core::{
    Blob, Connection, DbError, Driver, InputStream, IsolationLevel, ParamSlots, ParamType,
    ParamValue, PreparedStatement, ResolvedParam, ResultSet, Value, count_placeholders,
    has_scheme, parse_host_port_database,
};
use mysql::prelude::*;
use mysql::{Conn, Opts, OptsBuilder};

pub(crate) type SessionHandle = Arc<Mutex<Conn>>;

const DEFAULT_PORT: u16 = 3306;

pub struct MySqlDriver;

impl MySqlDriver {
    pub fn new() -> Self {
        Self
    }

    /// Parse `cpp_dbc:mysql://HOST[:PORT]/DATABASE`, default port 3306.
    pub fn parse_url(url: &str) -> Result<dblink_core::HostPortDatabase, DbError> {
        parse_host_port_database(url, "mysql", DEFAULT_PORT)
    }
}

impl Default for MySqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MySqlDriver {
    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn accepts_url(&self, url: &str) -> bool {
        has_scheme(url, "mysql")
    }

    fn connect(
        &self,
        url: &str,
        user: &str,
        password: &str,
        options: &HashMap<String, String>,
    ) -> Result<Arc<dyn Connection>, DbError> {
        let parsed = Self::parse_url(url)?;

        let mut builder = OptsBuilder::new()
            .ip_or_hostname(Some(parsed.host.clone()))
            .tcp_port(parsed.port)
            .user(Some(user))
            .pass(Some(password))
            .db_name(Some(parsed.database.clone()));

        if let Some(timeout) = options.get("connect_timeout")
            && let Ok(secs) = timeout.parse::<u64>()
        {
            builder = builder.tcp_connect_timeout(Some(std::time::Duration::from_secs(secs)));
        }

        let conn = Conn::new(Opts::from(builder)).map_err(|e| {
            DbError::connect_failed(
                "A60D47F1B58C",
                format!(
                    "could not connect to MySQL at {}:{}: {}",
                    parsed.host, parsed.port, e
                ),
            )
        })?;

        log::debug!(
            "[CONNECT] MySQL connection established: {}:{}/{}",
            parsed.host,
            parsed.port,
            parsed.database
        );

        Ok(Arc::new(MySqlConnection {
            session: Mutex::new(Some(Arc::new(Mutex::new(conn)))),
            url: url.to_string(),
            closed: AtomicBool::new(false),
            auto_commit: AtomicBool::new(true),
            transaction_active: AtomicBool::new(false),
            isolation: Mutex::new(IsolationLevel::RepeatableRead),
        }))
    }
}

pub struct MySqlConnection {
    session: Mutex<Option<SessionHandle>>,
    url: String,
    closed: AtomicBool,
    auto_commit: AtomicBool,
    transaction_active: AtomicBool,
    isolation: Mutex<IsolationLevel>,
}

impl MySqlConnection {
    fn session(&self) -> Result<SessionHandle, DbError> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                DbError::connection_closed("B71E58A2C69D", "connection is closed")
            })
    }

    fn run_command(&self, sql: &str) -> Result<(), DbError> {
        let session = self.session()?;
        let mut guard = lock_session(&session);
        guard.query_drop(sql).map_err(|e| format_mysql_error(&e))
    }
}

impl Connection for MySqlConnection {
    fn prepare_statement(&self, sql: &str) -> Result<Box<dyn PreparedStatement>, DbError> {
        let session = self.session()?;

        // Compile once so malformed SQL fails at preparation time.
        {
            let mut guard = lock_session(&session);
            guard.prep(sql).map_err(|e| format_mysql_error(&e))?;
        }

        Ok(Box::new(MySqlStatement {
            sql: sql.to_string(),
            slots: ParamSlots::new(count_placeholders(sql)),
            session: Arc::downgrade(&session),
            closed: AtomicBool::new(false),
        }))
    }

    fn execute_query(&self, sql: &str) -> Result<ResultSet, DbError> {
        let session = self.session()?;
        let mut guard = lock_session(&session);
        run_query(&mut guard, sql, Vec::new())
    }

    fn execute_update(&self, sql: &str) -> Result<u64, DbError> {
        let session = self.session()?;
        let mut guard = lock_session(&session);
        guard.query_drop(sql).map_err(|e| format_mysql_error(&e))?;
        Ok(guard.affected_rows())
    }

    fn set_auto_commit(&self, auto_commit: bool) -> Result<(), DbError> {
        if auto_commit == self.auto_commit.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.run_command(if auto_commit {
            "SET autocommit = 1"
        } else {
            "SET autocommit = 0"
        })?;
        self.auto_commit.store(auto_commit, Ordering::SeqCst);
        // With autocommit off the server keeps an implicit transaction
        // open from the next statement onward.
        self.transaction_active.store(!auto_commit, Ordering::SeqCst);
        Ok(())
    }

    fn auto_commit(&self) -> Result<bool, DbError> {
        Ok(self.auto_commit.load(Ordering::SeqCst))
    }

    fn begin_transaction(&self) -> Result<(), DbError> {
        if self.transaction_active.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.run_command("START TRANSACTION")?;
        self.transaction_active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn transaction_active(&self) -> Result<bool, DbError> {
        Ok(self.transaction_active.load(Ordering::SeqCst))
    }

    fn commit(&self) -> Result<(), DbError> {
        self.run_command("COMMIT")
            .map_err(|e| DbError::commit_failed("C82F69B3D7AE", "COMMIT failed").with_cause(e))?;
        self.transaction_active
            .store(!self.auto_commit.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self) -> Result<(), DbError> {
        self.run_command("ROLLBACK").map_err(|e| {
            DbError::rollback_failed("D9307AC4E8BF", "ROLLBACK failed").with_cause(e)
        })?;
        self.transaction_active
            .store(!self.auto_commit.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    }

    fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<(), DbError> {
        self.run_command(&format!(
            "SET SESSION TRANSACTION ISOLATION LEVEL {}",
            level.as_sql()
        ))?;
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

        let handle = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(handle);

        log::debug!("[CLOSE] MySQL connection closed: {}", self.url);
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

struct MySqlStatement {
    sql: String,
    slots: ParamSlots,
    session: Weak<Mutex<Conn>>,
    closed: AtomicBool,
}

impl MySqlStatement {
    fn session(&self) -> Result<SessionHandle, DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::connection_closed(
                "EA41B8D5F90C",
                "statement is closed",
            ));
        }
        self.session.upgrade().ok_or_else(|| {
            DbError::connection_closed("FB52C9E60A1D", "connection is closed")
        })
    }

    fn engine_params(&self) -> Result<Vec<mysql::Value>, DbError> {
        Ok(self
            .slots
            .resolve()?
            .into_iter()
            .map(resolved_to_mysql)
            .collect())
    }
}

impl PreparedStatement for MySqlStatement {
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
        let mut guard = lock_session(&session);
        run_query(&mut guard, &self.sql, params)
    }

    fn execute_update(&self) -> Result<u64, DbError> {
        let session = self.session()?;
        let params = self.engine_params()?;
        let mut guard = lock_session(&session);

        let stmt = guard.prep(&self.sql).map_err(|e| format_mysql_error(&e))?;
        guard
            .exec_drop(&stmt, params_for(params))
            .map_err(|e| format_mysql_error(&e))?;
        Ok(guard.affected_rows())
    }

    fn execute(&self) -> Result<bool, DbError> {
        let session = self.session()?;
        let params = self.engine_params()?;
        let mut guard = lock_session(&session);

        let stmt = guard.prep(&self.sql).map_err(|e| format_mysql_error(&e))?;
        let produces_rows = !stmt.columns().is_empty();

        if produces_rows {
            let _: Vec<mysql::Row> = guard
                .exec(&stmt, params_for(params))
                .map_err(|e| format_mysql_error(&e))?;
        } else {
            guard
                .exec_drop(&stmt, params_for(params))
                .map_err(|e| format_mysql_error(&e))?;
        }
        Ok(produces_rows)
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

pub(crate) fn lock_session(session: &SessionHandle) -> MutexGuard<'_, Conn> {
    session.lock().unwrap_or_else(|e| e.into_inner())
}

fn params_for(values: Vec<mysql::Value>) -> mysql::Params {
    if values.is_empty() {
        mysql::Params::Empty
    } else {
        mysql::Params::Positional(values)
    }
}

fn run_query(
    conn: &mut Conn,
    sql: &str,
    params: Vec<mysql::Value>,
) -> Result<ResultSet, DbError> {
    // Prepare first so column metadata is available even for zero rows.
    let stmt = conn.prep(sql).map_err(|e| format_mysql_error(&e))?;

    let columns: Vec<String> = stmt
        .columns()
        .iter()
        .map(|col| col.name_str().to_string())
        .collect();

    let rows: Vec<mysql::Row> = conn
        .exec(&stmt, params_for(params))
        .map_err(|e| format_mysql_error(&e))?;

    let converted = rows
        .iter()
        .map(|row| {
            (0..columns.len())
                .map(|i| mysql_value_to_value(row, i))
                .collect()
        })
        .collect();

    Ok(ResultSet::new(columns, converted))
}

fn mysql_value_to_value(row: &mysql::Row, idx: usize) -> Value {
    match row.as_ref(idx) {
        Some(mysql::Value::NULL) | None => Value::Null,
        Some(mysql::Value::Bytes(bytes)) => match std::str::from_utf8(bytes) {
            Ok(text) => Value::Text(text.to_string()),
            Err(_) => Value::Bytes(bytes.clone()),
        },
        Some(mysql::Value::Int(i)) => Value::Int(*i),
        Some(mysql::Value::UInt(u)) => {
            if *u <= i64::MAX as u64 {
                Value::Int(*u as i64)
            } else {
                Value::Text(u.to_string())
            }
        }
        Some(mysql::Value::Float(f)) => Value::Float(*f as f64),
        Some(mysql::Value::Double(d)) => Value::Float(*d),
        Some(mysql::Value::Date(year, month, day, hour, min, sec, micro)) => {
            if *hour == 0 && *min == 0 && *sec == 0 && *micro == 0 {
                Value::Text(format!("{:04}-{:02}-{:02}", year, month, day))
            } else {
                Value::Text(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    year, month, day, hour, min, sec
                ))
            }
        }
        Some(mysql::Value::Time(negative, days, hours, mins, secs, _micros)) => {
            let sign = if *negative { "-" } else { "" };
            Value::Text(format!(
                "{}{:02}:{:02}:{:02}",
                sign,
                u32::from(*hours) + days * 24,
                mins,
                secs
            ))
        }
    }
}

fn resolved_to_mysql(param: ResolvedParam) -> mysql::Value {
    match param {
        ResolvedParam::Null(_) => mysql::Value::NULL,
        ResolvedParam::Int(v) => mysql::Value::Int(v as i64),
        ResolvedParam::Long(v) => mysql::Value::Int(v),
        ResolvedParam::Double(v) => mysql::Value::Double(v),
        ResolvedParam::Text(v) | ResolvedParam::Date(v) | ResolvedParam::Timestamp(v) => {
            mysql::Value::Bytes(v.into_bytes())
        }
        ResolvedParam::Bool(v) => mysql::Value::Int(i64::from(v)),
        ResolvedParam::Bytes(v) => mysql::Value::Bytes(v),
    }
}

pub(crate) fn format_mysql_error(e: &mysql::Error) -> DbError {
    let message = e.to_string();
    log::error!("MySQL operation failed: {}", message);
    DbError::execute_failed("0C63DAF71B2E", message)
}
