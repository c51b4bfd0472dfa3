use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bson::{Document, doc};
use dblink_core::{
    Connection, DbError, IsolationLevel, PreparedStatement, ResultSet,
};
use mongodb::sync::{Client, ClientSession};

use crate::collection::MongoCollection;
use crate::cursor::CursorRegistry;
use crate::document::{MongoDocument, parse_json_document};

/// MongoDB session.
///
/// Owns the client handle; collections and cursors hold weak
/// counterparts, so closing the connection renders them inert. Logical
/// sessions (for multi-document transactions) are tracked by generated id
/// and ended on close or pool return.
pub struct MongoConnection {
    client: Mutex<Option<Arc<Client>>>,
    database_name: Mutex<String>,
    url: String,
    closed: AtomicBool,
    sessions: Mutex<HashMap<String, ClientSession>>,
    session_counter: AtomicU64,
    registry: Arc<CursorRegistry>,
}

impl MongoConnection {
    pub(crate) fn new(client: Client, database_name: String, url: String) -> Self {
        Self {
            client: Mutex::new(Some(Arc::new(client))),
            database_name: Mutex::new(database_name),
            url,
            closed: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
            session_counter: AtomicU64::new(0),
            registry: Arc::new(CursorRegistry::new()),
        }
    }

    fn client(&self) -> Result<Arc<Client>, DbError> {
        self.client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                DbError::connection_closed("4B07BF12335D", "connection is closed")
            })
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, ClientSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn database_name(&self) -> String {
        self.database_name
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Switch the default database for subsequent collection lookups.
    pub fn use_database(&self, database_name: &str) -> Result<(), DbError> {
        self.client()?;
        *self.database_name.lock().unwrap_or_else(|e| e.into_inner()) =
            database_name.to_string();
        Ok(())
    }

    pub fn list_databases(&self) -> Result<Vec<String>, DbError> {
        let client = self.client()?;
        client
            .list_database_names()
            .run()
            .map_err(|e| format_mongo_error(&e))
    }

    pub fn database_exists(&self, database_name: &str) -> Result<bool, DbError> {
        Ok(self.list_databases()?.iter().any(|d| d == database_name))
    }

    pub fn drop_database(&self, database_name: &str) -> Result<(), DbError> {
        let client = self.client()?;
        client
            .database(database_name)
            .drop()
            .run()
            .map_err(|e| format_mongo_error(&e))
    }

    pub fn collection(&self, name: &str) -> Result<MongoCollection, DbError> {
        let client = self.client()?;
        let database_name = self.database_name();
        let collection = client
            .database(&database_name)
            .collection::<Document>(name);

        Ok(MongoCollection::new(
            name.to_string(),
            database_name,
            Arc::downgrade(&client),
            collection,
            self.registry.clone(),
        ))
    }

    pub fn list_collections(&self) -> Result<Vec<String>, DbError> {
        let client = self.client()?;
        client
            .database(&self.database_name())
            .list_collection_names()
            .run()
            .map_err(|e| format_mongo_error(&e))
    }

    pub fn collection_exists(&self, name: &str) -> Result<bool, DbError> {
        Ok(self.list_collections()?.iter().any(|c| c == name))
    }

    /// Create a collection. `options_json` is merged into the `create`
    /// command (capped, size, validator, ...).
    pub fn create_collection(
        &self,
        name: &str,
        options_json: &str,
    ) -> Result<MongoCollection, DbError> {
        let client = self.client()?;

        let mut command = doc! { "create": name };
        command.extend(parse_json_document(options_json)?);
        client
            .database(&self.database_name())
            .run_command(command)
            .run()
            .map_err(|e| format_mongo_error(&e))?;

        self.collection(name)
    }

    pub fn drop_collection(&self, name: &str) -> Result<(), DbError> {
        self.collection(name)?.drop()
    }

    pub fn create_document(&self) -> MongoDocument {
        MongoDocument::new()
    }

    pub fn create_document_from_json(&self, json: &str) -> Result<MongoDocument, DbError> {
        MongoDocument::from_json(json)
    }

    /// Run a database command given as JSON text.
    pub fn run_command(&self, command_json: &str) -> Result<MongoDocument, DbError> {
        let client = self.client()?;
        let command = parse_json_document(command_json)?;

        let reply = client
            .database(&self.database_name())
            .run_command(command)
            .run()
            .map_err(|e| format_mongo_error(&e))?;
        Ok(MongoDocument::from_document(reply))
    }

    pub fn server_info(&self) -> Result<MongoDocument, DbError> {
        self.admin_command(doc! { "buildInfo": 1 })
    }

    pub fn server_status(&self) -> Result<MongoDocument, DbError> {
        self.admin_command(doc! { "serverStatus": 1 })
    }

    pub fn ping(&self) -> Result<(), DbError> {
        self.admin_command(doc! { "ping": 1 }).map(|_| ())
    }

    fn admin_command(&self, command: Document) -> Result<MongoDocument, DbError> {
        let client = self.client()?;
        let reply = client
            .database("admin")
            .run_command(command)
            .run()
            .map_err(|e| format_mongo_error(&e))?;
        Ok(MongoDocument::from_document(reply))
    }

    // ------------------------------------------------------------------
    // Logical sessions & multi-document transactions
    // ------------------------------------------------------------------

    pub fn start_session(&self) -> Result<String, DbError> {
        let client = self.client()?;
        let session = client
            .start_session()
            .run()
            .map_err(|e| format_mongo_error(&e))?;

        let id = format!(
            "session_{}",
            self.session_counter.fetch_add(1, Ordering::SeqCst)
        );
        self.lock_sessions().insert(id.clone(), session);
        log::debug!("[SESSION] started {}", id);
        Ok(id)
    }

    /// Ending a session aborts any transaction still open on it.
    pub fn end_session(&self, session_id: &str) -> Result<(), DbError> {
        let mut session = self.lock_sessions().remove(session_id).ok_or_else(|| {
            DbError::transaction_not_found(
                "5C18C023446E",
                format!("no session named {}", session_id),
            )
        })?;

        if let Err(e) = session.abort_transaction().run() {
            log::debug!("no transaction to abort on {}: {}", session_id, e);
        }
        log::debug!("[SESSION] ended {}", session_id);
        Ok(())
    }

    pub fn start_transaction(&self, session_id: &str) -> Result<(), DbError> {
        self.with_session(session_id, |session| {
            session
                .start_transaction()
                .run()
                .map_err(|e| format_mongo_error(&e))
        })
    }

    pub fn commit_transaction(&self, session_id: &str) -> Result<(), DbError> {
        self.with_session(session_id, |session| {
            session.commit_transaction().run().map_err(|e| {
                DbError::commit_failed("6D29D134557F", "transaction commit failed")
                    .with_cause(format_mongo_error(&e))
            })
        })
    }

    pub fn abort_transaction(&self, session_id: &str) -> Result<(), DbError> {
        self.with_session(session_id, |session| {
            session.abort_transaction().run().map_err(|e| {
                DbError::rollback_failed("7E3AE2456680", "transaction abort failed")
                    .with_cause(format_mongo_error(&e))
            })
        })
    }

    fn with_session(
        &self,
        session_id: &str,
        op: impl FnOnce(&mut ClientSession) -> Result<(), DbError>,
    ) -> Result<(), DbError> {
        self.client()?;
        let mut sessions = self.lock_sessions();
        let session = sessions.get_mut(session_id).ok_or_else(|| {
            DbError::transaction_not_found(
                "8F4BF3567791",
                format!("no session named {}", session_id),
            )
        })?;
        op(session)
    }

    /// Multi-document transactions need a replica set (wire version 7+)
    /// or mongos (wire version 8+); standalone servers never qualify.
    pub fn supports_transactions(&self) -> Result<bool, DbError> {
        let reply = self.admin_command(doc! { "hello": 1 })?;
        let reply = reply.as_document();

        let wire_version = reply
            .get_i32("maxWireVersion")
            .map(i64::from)
            .or_else(|_| reply.get_i64("maxWireVersion"))
            .unwrap_or(0);

        if reply.get_str("msg").ok() == Some("isdbgrid") {
            return Ok(wire_version >= 8);
        }
        if reply.get_str("setName").is_ok() {
            return Ok(wire_version >= 7);
        }
        Ok(false)
    }

    /// Scrub per-borrow state before the wrapper goes back to a pool:
    /// close live cursors and end every session, aborting uncommitted
    /// transactions.
    pub fn prepare_for_pool_return(&self) -> Result<(), DbError> {
        self.registry.close_all();

        let sessions: Vec<String> = self.lock_sessions().keys().cloned().collect();
        for id in sessions {
            if let Err(e) = self.end_session(&id) {
                log::warn!("could not end session {}: {}", id, e);
            }
        }
        Ok(())
    }
}

const NOT_RELATIONAL: &str = "SQL statements are not supported on MongoDB connections";

impl Connection for MongoConnection {
    fn prepare_statement(&self, _sql: &str) -> Result<Box<dyn PreparedStatement>, DbError> {
        Err(DbError::execute_failed("905CA46788A2", NOT_RELATIONAL))
    }

    fn execute_query(&self, _sql: &str) -> Result<ResultSet, DbError> {
        Err(DbError::execute_failed("A16DB57899B3", NOT_RELATIONAL))
    }

    fn execute_update(&self, _sql: &str) -> Result<u64, DbError> {
        Err(DbError::execute_failed("B27EC689AAC4", NOT_RELATIONAL))
    }

    fn set_auto_commit(&self, _auto_commit: bool) -> Result<(), DbError> {
        Err(DbError::execute_failed(
            "C38FD79ABBD5",
            "use logical sessions for MongoDB transactions",
        ))
    }

    fn auto_commit(&self) -> Result<bool, DbError> {
        Ok(true)
    }

    fn begin_transaction(&self) -> Result<(), DbError> {
        Err(DbError::execute_failed(
            "D490E8ABCCE6",
            "use start_session()/start_transaction() on MongoDB connections",
        ))
    }

    fn transaction_active(&self) -> Result<bool, DbError> {
        Ok(false)
    }

    fn commit(&self) -> Result<(), DbError> {
        Err(DbError::execute_failed(
            "E5A1F9BCDDF7",
            "use commit_transaction(session_id) on MongoDB connections",
        ))
    }

    fn rollback(&self) -> Result<(), DbError> {
        Err(DbError::execute_failed(
            "F6B20ACDEE08",
            "use abort_transaction(session_id) on MongoDB connections",
        ))
    }

    fn set_transaction_isolation(&self, _level: IsolationLevel) -> Result<(), DbError> {
        Err(DbError::execute_failed(
            "07C31BDEFF19",
            "isolation levels do not apply to MongoDB connections",
        ))
    }

    fn transaction_isolation(&self) -> Result<IsolationLevel, DbError> {
        Ok(IsolationLevel::ReadCommitted)
    }

    fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.registry.close_all();
        self.lock_sessions().clear();

        let handle = self
            .client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(handle);

        log::debug!("[CLOSE] MongoDB connection closed: {}", self.url);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn validate(&self, _query: &str) -> Result<(), DbError> {
        self.ping()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub(crate) fn format_mongo_error(e: &mongodb::error::Error) -> DbError {
    let message = e.to_string();
    log::error!("MongoDB operation failed: {}", message);
    DbError::execute_failed("18D42CEF002A", message)
}
