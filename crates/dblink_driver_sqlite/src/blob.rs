use std::sync::{Arc, Mutex, Weak};

use dblink_core::{
    Blob, DbError, InputStream, MemoryInputStream, MemoryOutputStream, OutputStream,
};
use rusqlite::Connection as RusqliteConnection;

use crate::driver::{format_sqlite_error, lock_session};

struct BlobState {
    data: Arc<Mutex<Vec<u8>>>,
    loaded: bool,
    dirty: bool,
}

/// Lazy blob over one table cell, addressed by rowid.
///
/// The cell is read in full on first access and written back with
/// `save()`. A weak session reference detects a closed connection before
/// any engine call.
pub struct SqliteBlob {
    session: Weak<Mutex<RusqliteConnection>>,
    table: String,
    column: String,
    rowid: i64,
    state: Mutex<BlobState>,
}

impl SqliteBlob {
    pub(crate) fn new(
        session: Weak<Mutex<RusqliteConnection>>,
        table: String,
        column: String,
        rowid: i64,
    ) -> Self {
        Self {
            session,
            table,
            column,
            rowid,
            state: Mutex::new(BlobState {
                data: Arc::new(Mutex::new(Vec::new())),
                loaded: false,
                dirty: false,
            }),
        }
    }

    fn session(&self) -> Result<Arc<Mutex<RusqliteConnection>>, DbError> {
        self.session.upgrade().ok_or_else(|| {
            DbError::connection_closed("E042A25DF731", "connection is closed")
        })
    }

    pub fn is_connection_valid(&self) -> bool {
        self.session.upgrade().is_some()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BlobState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_loaded(&self, state: &mut BlobState) -> Result<(), DbError> {
        if state.loaded {
            return Ok(());
        }

        let session = self.session()?;
        let guard = lock_session(&session);

        let sql = format!(
            "SELECT {} FROM {} WHERE rowid = ?",
            self.column, self.table
        );
        let cell: Option<Vec<u8>> = guard
            .query_row(&sql, [self.rowid], |row| row.get(0))
            .map_err(|e| format_sqlite_error(&e))?;

        *state.data.lock().unwrap_or_else(|e| e.into_inner()) = cell.unwrap_or_default();
        state.loaded = true;
        Ok(())
    }

    /// Write the in-memory bytes back to the cell.
    pub fn save(&self) -> Result<(), DbError> {
        let mut state = self.lock_state();
        let session = self.session()?;
        let guard = lock_session(&session);

        let sql = format!(
            "UPDATE {} SET {} = ? WHERE rowid = ?",
            self.table, self.column
        );
        let data = state.data.lock().unwrap_or_else(|e| e.into_inner()).clone();
        guard
            .execute(&sql, rusqlite::params![data, self.rowid])
            .map_err(|e| format_sqlite_error(&e))?;

        state.dirty = false;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.lock_state().dirty
    }
}

impl Blob for SqliteBlob {
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
        // NULL out the cell, then drop the in-memory copy.
        if let Ok(session) = self.session() {
            let guard = lock_session(&session);
            let sql = format!(
                "UPDATE {} SET {} = NULL WHERE rowid = ?",
                self.table, self.column
            );
            guard
                .execute(&sql, [self.rowid])
                .map_err(|e| format_sqlite_error(&e))?;
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
