use std::sync::{Arc, Mutex, Weak};

use dblink_core::{
    BLOB_SEGMENT_SIZE, Blob, DbError, InputStream, MemoryInputStream, MemoryOutputStream,
    OutputStream,
};
use postgres::Client;

use crate::driver::{format_pg_error, lock_session};

// Large-object access modes (libpq's INV_READ / INV_WRITE).
const INV_READ: i32 = 0x0004_0000;
const INV_WRITE: i32 = 0x0002_0000;

struct BlobState {
    data: Arc<Mutex<Vec<u8>>>,
    loaded: bool,
    dirty: bool,
}

/// Lazy blob over a PostgreSQL large object.
///
/// Holds the object's OID and a weak session reference. The object is
/// materialized on first access, reading 32 KiB segments under a short
/// transaction; `save()` rewrites it the same way, committing on success
/// and rolling back if any segment write fails.
pub struct PgBlob {
    session: Weak<Mutex<Client>>,
    oid: Mutex<u32>,
    state: Mutex<BlobState>,
}

impl PgBlob {
    pub(crate) fn new_empty(session: Weak<Mutex<Client>>) -> Self {
        Self::build(session, 0, true)
    }

    pub(crate) fn with_oid(session: Weak<Mutex<Client>>, oid: u32) -> Self {
        Self::build(session, oid, false)
    }

    fn build(session: Weak<Mutex<Client>>, oid: u32, loaded: bool) -> Self {
        Self {
            session,
            oid: Mutex::new(oid),
            state: Mutex::new(BlobState {
                data: Arc::new(Mutex::new(Vec::new())),
                loaded,
                dirty: false,
            }),
        }
    }

    pub fn oid(&self) -> u32 {
        *self.oid.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connection_valid(&self) -> bool {
        self.session.upgrade().is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.lock_state().dirty
    }

    fn session(&self) -> Result<Arc<Mutex<Client>>, DbError> {
        self.session.upgrade().ok_or_else(|| {
            DbError::connection_closed("79DA03E285BE", "connection is closed")
        })
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BlobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_loaded(&self, state: &mut BlobState) -> Result<(), DbError> {
        let oid = self.oid();
        if state.loaded || oid == 0 {
            return Ok(());
        }

        let session = self.session()?;
        let mut client = lock_session(&session);
        let mut txn = client.transaction().map_err(|e| format_pg_error(&e))?;

        let fd: i32 = txn
            .query_one("SELECT lo_open($1, $2)", &[&oid, &INV_READ])
            .map_err(|e| format_pg_error(&e))?
            .get(0);
        if fd < 0 {
            return Err(DbError::execute_failed(
                "8AEB14F396CF",
                format!("could not open large object {}", oid),
            ));
        }

        let mut data = Vec::new();
        loop {
            let chunk: Vec<u8> = txn
                .query_one(
                    "SELECT loread($1, $2)",
                    &[&fd, &(BLOB_SEGMENT_SIZE as i32)],
                )
                .map_err(|e| format_pg_error(&e))?
                .get(0);
            let done = chunk.len() < BLOB_SEGMENT_SIZE;
            data.extend_from_slice(&chunk);
            if done {
                break;
            }
        }

        txn.query_one("SELECT lo_close($1)", &[&fd])
            .map_err(|e| format_pg_error(&e))?;
        txn.commit().map_err(|e| format_pg_error(&e))?;

        *state.data.lock().unwrap_or_else(|e| e.into_inner()) = data;
        state.loaded = true;
        Ok(())
    }

    /// Create the large object if needed and rewrite it from the
    /// in-memory bytes. Returns the object's OID.
    pub fn save(&self) -> Result<u32, DbError> {
        let mut state = self.lock_state();
        let session = self.session()?;
        let mut client = lock_session(&session);
        let mut txn = client.transaction().map_err(|e| format_pg_error(&e))?;

        let mut oid = self.oid();
        if oid == 0 {
            oid = txn
                .query_one("SELECT lo_creat($1)", &[&INV_WRITE])
                .map_err(|e| format_pg_error(&e))?
                .get(0);
        }

        let fd: i32 = txn
            .query_one("SELECT lo_open($1, $2)", &[&oid, &INV_WRITE])
            .map_err(|e| format_pg_error(&e))?
            .get(0);

        txn.query_one("SELECT lo_truncate($1, $2)", &[&fd, &0_i32])
            .map_err(|e| format_pg_error(&e))?;

        let data = state.data.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for chunk in data.chunks(BLOB_SEGMENT_SIZE) {
            let written: i32 = txn
                .query_one("SELECT lowrite($1, $2)", &[&fd, &chunk])
                .map_err(|e| format_pg_error(&e))?
                .get(0);
            // A dropped transaction rolls the partial write back.
            if written as usize != chunk.len() {
                return Err(DbError::execute_failed(
                    "9BFC25049DA0",
                    format!("short write to large object {}", oid),
                ));
            }
        }

        txn.query_one("SELECT lo_close($1)", &[&fd])
            .map_err(|e| format_pg_error(&e))?;
        txn.commit().map_err(|e| format_pg_error(&e))?;

        *self.oid.lock().unwrap_or_else(|e| e.into_inner()) = oid;
        state.dirty = false;
        state.loaded = true;
        Ok(oid)
    }
}

impl Blob for PgBlob {
    fn length(&self) -> Result<u64, DbError> {
        let mut state = self.lock_state();
        self.ensure_loaded(&mut state)?;
        let len = state.data.lock().unwrap_or_else(|e| e.into_inner()).len();
        Ok(len as u64)
    }

    fn get_bytes(&self, pos: u64, len: usize) -> Result<Vec<u8>, DbError> {
        let mut state = self.lock_state();
        self.ensure_loaded(&mut state)?;

        let data = state.data.lock().unwrap_or_else(|e| e.into_inner());
        let pos = pos as usize;
        if pos >= data.len() {
            return Ok(Vec::new());
        }
        let end = (pos + len).min(data.len());
        Ok(data[pos..end].to_vec())
    }

    fn set_bytes(&self, pos: u64, bytes: &[u8]) -> Result<(), DbError> {
        let mut state = self.lock_state();
        self.ensure_loaded(&mut state)?;

        {
            let mut data = state.data.lock().unwrap_or_else(|e| e.into_inner());
            let pos = pos as usize;
            if pos + bytes.len() > data.len() {
                data.resize(pos + bytes.len(), 0);
            }
            data[pos..pos + bytes.len()].copy_from_slice(bytes);
        }
        state.dirty = true;
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<(), DbError> {
        let mut state = self.lock_state();
        self.ensure_loaded(&mut state)?;

        {
            let mut data = state.data.lock().unwrap_or_else(|e| e.into_inner());
            if (len as usize) < data.len() {
                data.truncate(len as usize);
            }
        }
        state.dirty = true;
        Ok(())
    }

    fn free(&self) -> Result<(), DbError> {
        let oid = self.oid();
        if oid != 0 {
            let session = self.session()?;
            let mut client = lock_session(&session);
            let mut txn = client.transaction().map_err(|e| format_pg_error(&e))?;
            txn.query_one("SELECT lo_unlink($1)", &[&oid])
                .map_err(|e| format_pg_error(&e))?;
            txn.commit().map_err(|e| format_pg_error(&e))?;
            *self.oid.lock().unwrap_or_else(|e| e.into_inner()) = 0;
        }

        let mut state = self.lock_state();
        {
            let mut data = state.data.lock().unwrap_or_else(|e| e.into_inner());
            data.clear();
            data.shrink_to_fit();
        }
        state.loaded = false;
        state.dirty = false;
        Ok(())
    }

    fn binary_stream(&self) -> Result<Box<dyn InputStream>, DbError> {
        let mut state = self.lock_state();
        self.ensure_loaded(&mut state)?;
        let snapshot = state.data.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(Box::new(MemoryInputStream::new(snapshot)))
    }

    fn binary_writer(&self, pos: u64) -> Result<Box<dyn OutputStream>, DbError> {
        let mut state = self.lock_state();
        self.ensure_loaded(&mut state)?;
        state.dirty = true;
        Ok(Box::new(MemoryOutputStream::new(
            state.data.clone(),
            pos as usize,
        )))
    }
}
