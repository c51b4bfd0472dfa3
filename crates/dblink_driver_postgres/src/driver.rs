use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dblink_core::{
    Blob, BlobId, BlobResolver, Connection, DbError, Driver, InputStream, IsolationLevel,
    ParamSlots, ParamType, ParamValue, PreparedStatement, ResolvedParam, ResultSet, Value,
    has_scheme, parse_host_port_database,
};
use postgres::types::ToSql;
use postgres::{Client, NoTls};

use crate::blob::PgBlob;

pub(crate) type SessionHandle = Arc<Mutex<Client>>;

const DEFAULT_PORT: u16 = 5432;

pub struct PgDriver;

impl PgDriver {
    pub fn new() -> Self {
        Self
    }

    /// Parse `cpp_dbc:postgresql://HOST[:PORT]/DATABASE`, default port 5432.
    pub fn parse_url(url: &str) -> Result<dblink_core::HostPortDatabase, DbError> {
        parse_host_port_database(url, "postgresql", DEFAULT_PORT)
    }
}

impl Default for PgDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for PgDriver {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn accepts_url(&self, url: &str) -> bool {
        has_scheme(url, "postgresql")
    }

    fn connect(
        &self,
        url: &str,
        user: &str,
        password: &str,
        options: &HashMap<String, String>,
    ) -> Result<Arc<dyn Connection>, DbError> {
        let parsed = Self::parse_url(url)?;

        let mut config = Client::configure();
        config
            .host(&parsed.host)
            .port(parsed.port)
            .user(user)
            .password(password)
            .dbname(&parsed.database);

        if let Some(timeout) = options.get("connect_timeout")
            && let Ok(secs) = timeout.parse::<u64>()
        {
            config.connect_timeout(std::time::Duration::from_secs(secs));
        }

        let client = config.connect(NoTls).map_err(|e| {
            DbError::connect_failed(
                "F1528B6A0D3C",
                format!(
                    "could not connect to PostgreSQL at {}:{}: {}",
                    parsed.host, parsed.port, e
                ),
            )
        })?;

        log::debug!(
            "[CONNECT] PostgreSQL connection established: {}:{}/{}",
            parsed.host,
            parsed.port,
            parsed.database
        );

        Ok(Arc::new(PgConnection {
            session: Mutex::new(Some(Arc::new(Mutex::new(client)))),
            url: url.to_string(),
            closed: AtomicBool::new(false),
            auto_commit: AtomicBool::new(true),
            transaction_active: AtomicBool::new(false),
            isolation: Mutex::new(IsolationLevel::ReadCommitted),
            statement_counter: AtomicU64::new(0),
        }))
    }
}

pub struct PgConnection {
    session: Mutex<Option<SessionHandle>>,
    url: String,
    closed: AtomicBool,
    auto_commit: AtomicBool,
    transaction_active: AtomicBool,
    isolation: Mutex<IsolationLevel>,
    statement_counter: AtomicU64,
}

impl PgConnection {
    fn session(&self) -> Result<SessionHandle, DbError> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                DbError::connection_closed("02639C7B1E4D", "connection is closed")
            })
    }

    fn run_batch(&self, sql: &str) -> Result<(), DbError> {
        let session = self.session()?;
        let mut guard = lock_session(&session);
        guard.batch_execute(sql).map_err(|e| format_pg_error(&e))
    }

    fn next_statement_name(&self) -> String {
        let n = self.statement_counter.fetch_add(1, Ordering::SeqCst);
        format!("dblink_stmt_{}", n)
    }

    /// New, empty large object (created server-side on `save()`).
    pub fn create_blob(&self) -> Result<Arc<PgBlob>, DbError> {
        Ok(Arc::new(PgBlob::new_empty(Arc::downgrade(
            &self.session()?,
        ))))
    }

    /// Lazy blob over an existing large object.
    pub fn open_large_object(&self, oid: u32) -> Result<Arc<PgBlob>, DbError> {
        Ok(Arc::new(PgBlob::with_oid(
            Arc::downgrade(&self.session()?),
            oid,
        )))
    }
}

impl Connection for PgConnection {
    fn prepare_statement(&self, sql: &str) -> Result<Box<dyn PreparedStatement>, DbError> {
        let session = self.session()?;
        let (translated, param_count) = translate_placeholders(sql);
        let name = self.next_statement_name();

        // Server-side compile up front so malformed SQL fails here.
        {
            let mut guard = lock_session(&session);
            guard
                .prepare(&translated)
                .map_err(|e| format_pg_error(&e))?;
        }

        log::debug!("[PREPARE] {} -> {}", name, translated);

        Ok(Box::new(PgStatement {
            sql: translated,
            name,
            slots: ParamSlots::new(param_count),
            session: Arc::downgrade(&session),
            closed: AtomicBool::new(false),
        }))
    }

    fn execute_query(&self, sql: &str) -> Result<ResultSet, DbError> {
        let session = self.session()?;
        let (columns, rows) = {
            let mut guard = lock_session(&session);
            let stmt = guard.prepare(sql).map_err(|e| format_pg_error(&e))?;
            let columns = column_names(&stmt);
            let rows = guard.query(&stmt, &[]).map_err(|e| format_pg_error(&e))?;
            (columns, rows)
        };
        Ok(
            build_result_set(columns, &rows).with_blob_resolver(Arc::new(PgBlobResolver {
                session: Arc::downgrade(&session),
            })),
        )
    }

    fn execute_update(&self, sql: &str) -> Result<u64, DbError> {
        let session = self.session()?;
        let mut guard = lock_session(&session);
        guard.execute(sql, &[]).map_err(|e| format_pg_error(&e))
    }

    fn set_auto_commit(&self, auto_commit: bool) -> Result<(), DbError> {
        if auto_commit == self.auto_commit.load(Ordering::SeqCst) {
            return Ok(());
        }

        if auto_commit {
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
            .map_err(|e| DbError::commit_failed("1374AD8C2F5E", "COMMIT failed").with_cause(e))?;
        self.transaction_active.store(false, Ordering::SeqCst);

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
            DbError::rollback_failed("2485BE9D306F", "ROLLBACK failed").with_cause(e)
        })?;
        self.transaction_active.store(false, Ordering::SeqCst);

        if !self.auto_commit.load(Ordering::SeqCst) {
            self.run_batch("BEGIN")?;
            self.transaction_active.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn set_transaction_isolation(&self, level: IsolationLevel) -> Result<(), DbError> {
        self.run_batch(&format!(
            "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}",
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

        log::debug!("[CLOSE] PostgreSQL connection closed: {}", self.url);
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

struct PgStatement {
    sql: String,
    // Generated server-side identifier; the wire-level name is managed by
    // the client library, this one keys log lines.
    name: String,
    slots: ParamSlots,
    session: Weak<Mutex<Client>>,
    closed: AtomicBool,
}

impl PgStatement {
    fn session(&self) -> Result<SessionHandle, DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::connection_closed(
                "3596CFAE417A",
                "statement is closed",
            ));
        }
        self.session.upgrade().ok_or_else(|| {
            DbError::connection_closed("46A7D0BF528B", "connection is closed")
        })
    }
}

impl PreparedStatement for PgStatement {
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
        let params = self.slots.resolve()?;
        let boxed = engine_params(&params);
        let refs: Vec<&(dyn ToSql + Sync)> = boxed.iter().map(|p| p.as_ref()).collect();

        log::debug!("[EXECUTE] {}", self.name);
        let (columns, rows) = {
            let mut guard = lock_session(&session);
            let stmt = guard
                .prepare(&self.sql)
                .map_err(|e| format_pg_error(&e))?;
            let columns = column_names(&stmt);
            let rows = guard
                .query(&stmt, &refs)
                .map_err(|e| format_pg_error(&e))?;
            (columns, rows)
        };
        Ok(
            build_result_set(columns, &rows).with_blob_resolver(Arc::new(PgBlobResolver {
                session: self.session.clone(),
            })),
        )
    }

    fn execute_update(&self) -> Result<u64, DbError> {
        let session = self.session()?;
        let params = self.slots.resolve()?;
        let boxed = engine_params(&params);
        let refs: Vec<&(dyn ToSql + Sync)> = boxed.iter().map(|p| p.as_ref()).collect();

        log::debug!("[EXECUTE] {}", self.name);
        let mut guard = lock_session(&session);
        guard
            .execute(&self.sql, &refs)
            .map_err(|e| format_pg_error(&e))
    }

    fn execute(&self) -> Result<bool, DbError> {
        let session = self.session()?;
        let produces_rows = {
            let mut guard = lock_session(&session);
            let stmt = guard
                .prepare(&self.sql)
                .map_err(|e| format_pg_error(&e))?;
            !stmt.columns().is_empty()
        };

        if produces_rows {
            self.execute_query().map(|_| true)
        } else {
            self.execute_update().map(|_| false)
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

struct PgBlobResolver {
    session: Weak<Mutex<Client>>,
}

impl BlobResolver for PgBlobResolver {
    fn open_blob(&self, id: &BlobId) -> Result<Arc<dyn Blob>, DbError> {
        match id {
            BlobId::LargeObject(oid) => Ok(Arc::new(PgBlob::with_oid(self.session.clone(), *oid))),
            BlobId::TableCell { .. } => Err(DbError::type_mismatch(
                "57B8E1C0639C",
                "table-cell blob identifiers are not a PostgreSQL shape",
            )),
        }
    }
}

pub(crate) fn lock_session(session: &SessionHandle) -> MutexGuard<'_, Client> {
    session.lock().unwrap_or_else(|e| e.into_inner())
}

/// Translate JDBC-style `?` placeholders to `$1..$n`, skipping string
/// literals, quoted identifiers, dollar-quoted strings and comments.
/// Returns the rewritten SQL and the placeholder count.
pub fn translate_placeholders(sql: &str) -> (String, usize) {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len() + 8);
    let mut count = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                let quote = bytes[i];
                let start = i;
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        if i + 1 < bytes.len() && bytes[i + 1] == quote {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                let end = (i + 1).min(bytes.len());
                out.push_str(&sql[start..end]);
            }
            b'$' if i + 1 < bytes.len() && (bytes[i + 1] == b'$' || bytes[i + 1].is_ascii_alphabetic()) =>
            {
                // Dollar-quoted string: $tag$ ... $tag$
                if let Some(tag_end) = sql[i + 1..].find('$') {
                    let tag = &sql[i..i + tag_end + 2];
                    let body_start = i + tag.len();
                    if let Some(close) = sql[body_start..].find(tag) {
                        let end = body_start + close + tag.len();
                        out.push_str(&sql[i..end]);
                        i = end - 1;
                    } else {
                        out.push('$');
                    }
                } else {
                    out.push('$');
                }
            }
            b'-' if i + 1 < bytes.len() && bytes[i + 1] == b'-' => {
                let start = i;
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                out.push_str(&sql[start..i.min(bytes.len())]);
                if i < bytes.len() {
                    out.push('\n');
                }
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                let start = i;
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 1).min(bytes.len() - 1);
                out.push_str(&sql[start..=i]);
            }
            b'?' => {
                count += 1;
                out.push('$');
                out.push_str(&count.to_string());
            }
            b if b.is_ascii() => out.push(b as char),
            _ => {
                // Copy the whole multi-byte character.
                let ch = sql[i..].chars().next().unwrap_or('\u{FFFD}');
                out.push(ch);
                i += ch.len_utf8() - 1;
            }
        }
        i += 1;
    }

    (out, count)
}

fn engine_params(params: &[ResolvedParam]) -> Vec<Box<dyn ToSql + Sync>> {
    params
        .iter()
        .map(|p| -> Box<dyn ToSql + Sync> {
            match p {
                ResolvedParam::Null(kind) => match kind {
                    ParamType::Integer => Box::new(None::<i32>),
                    ParamType::Float => Box::new(None::<f32>),
                    ParamType::Double => Box::new(None::<f64>),
                    ParamType::Boolean => Box::new(None::<bool>),
                    ParamType::Blob => Box::new(None::<Vec<u8>>),
                    ParamType::Varchar | ParamType::Date | ParamType::Timestamp => {
                        Box::new(None::<String>)
                    }
                },
                ResolvedParam::Int(v) => Box::new(*v),
                ResolvedParam::Long(v) => Box::new(*v),
                ResolvedParam::Double(v) => Box::new(*v),
                ResolvedParam::Text(v) | ResolvedParam::Date(v) | ResolvedParam::Timestamp(v) => {
                    Box::new(v.clone())
                }
                ResolvedParam::Bool(v) => Box::new(*v),
                ResolvedParam::Bytes(v) => Box::new(v.clone()),
            }
        })
        .collect()
}

fn column_names(stmt: &postgres::Statement) -> Vec<String> {
    stmt.columns().iter().map(|c| c.name().to_string()).collect()
}

fn build_result_set(columns: Vec<String>, rows: &[postgres::Row]) -> ResultSet {
    let converted = rows
        .iter()
        .map(|row| {
            (0..row.columns().len())
                .map(|i| pg_value_to_value(row, i))
                .collect()
        })
        .collect();

    ResultSet::new(columns, converted)
}

fn pg_value_to_value(row: &postgres::Row, idx: usize) -> Value {
    let col_type = row.columns()[idx].type_();

    match col_type.name() {
        "bool" => row
            .try_get::<_, Option<bool>>(idx)
            .map(|v| v.map_or(Value::Null, Value::Bool))
            .unwrap_or(Value::Null),
        "int2" => row
            .try_get::<_, Option<i16>>(idx)
            .map(|v| v.map_or(Value::Null, |v| Value::Int(v as i64)))
            .unwrap_or(Value::Null),
        "int4" => row
            .try_get::<_, Option<i32>>(idx)
            .map(|v| v.map_or(Value::Null, |v| Value::Int(v as i64)))
            .unwrap_or(Value::Null),
        "int8" => row
            .try_get::<_, Option<i64>>(idx)
            .map(|v| v.map_or(Value::Null, Value::Int))
            .unwrap_or(Value::Null),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)
            .map(|v| v.map_or(Value::Null, |v| Value::Float(v as f64)))
            .unwrap_or(Value::Null),
        "float8" => row
            .try_get::<_, Option<f64>>(idx)
            .map(|v| v.map_or(Value::Null, Value::Float))
            .unwrap_or(Value::Null),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .map(|v| v.map_or(Value::Null, Value::Bytes))
            .unwrap_or(Value::Null),
        // Large-object references stay lazy.
        "oid" => row
            .try_get::<_, Option<u32>>(idx)
            .map(|v| v.map_or(Value::Null, |oid| Value::BlobRef(BlobId::LargeObject(oid))))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .map(|v| v.map_or(Value::Null, Value::Text))
            .unwrap_or(Value::Null),
    }
}

pub(crate) fn format_pg_error(e: &postgres::Error) -> DbError {
    let message = e.to_string();
    log::error!("PostgreSQL operation failed: {}", message);
    DbError::execute_failed("68C9F2D174AD", message)
}
