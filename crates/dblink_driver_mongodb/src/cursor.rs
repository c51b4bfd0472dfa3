use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};

use bson::{Document, doc};
use dblink_core::DbError;
use mongodb::options::FindOptions;
use mongodb::sync::{Client, Collection, Cursor};

use crate::document::MongoDocument;

pub(crate) enum CursorSource {
    Find {
        collection: Collection<Document>,
        filter: Document,
    },
    Aggregate {
        collection: Collection<Document>,
        pipeline: Vec<Document>,
    },
}

struct CursorState {
    source: Option<CursorSource>,
    cursor: Option<Cursor<Document>>,
    // Row buffered by has_next(), consumed by the next advance.
    peeked: Option<Document>,
    current: Option<MongoDocument>,
    position: u64,
    started: bool,
    exhausted: bool,
    skip: Option<u64>,
    limit: Option<i64>,
    sort: Option<Document>,
}

/// Forward-only iterator over query results.
///
/// `skip`/`limit`/`sort` chain before iteration; the server cursor is
/// opened on the first advance, so modifiers fail once iteration has
/// started. Each advance stores an owned copy of the current document.
/// Not rewindable.
pub struct MongoCursor {
    client: Weak<Client>,
    state: Mutex<CursorState>,
    closed: AtomicBool,
}

impl MongoCursor {
    pub(crate) fn new(client: Weak<Client>, source: CursorSource) -> Self {
        Self {
            client,
            state: Mutex::new(CursorState {
                source: Some(source),
                cursor: None,
                peeked: None,
                current: None,
                position: 0,
                started: false,
                exhausted: false,
                skip: None,
                limit: None,
                sort: None,
            }),
            closed: AtomicBool::new(false),
        }
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, CursorState>, DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::connection_closed(
                "B71E258A9AC4",
                "cursor is closed",
            ));
        }
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn is_connection_valid(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.client.upgrade().is_some()
    }

    /// Skip the first `n` results. Fails once iteration has started.
    pub fn skip(&self, n: u64) -> Result<&Self, DbError> {
        let mut state = self.lock_state()?;
        self.check_not_started(&state)?;
        state.skip = Some(n);
        Ok(self)
    }

    /// Cap the number of results. Fails once iteration has started.
    pub fn limit(&self, n: u64) -> Result<&Self, DbError> {
        let mut state = self.lock_state()?;
        self.check_not_started(&state)?;
        state.limit = Some(n as i64);
        Ok(self)
    }

    /// Order results by one field. Fails once iteration has started.
    pub fn sort(&self, field: &str, ascending: bool) -> Result<&Self, DbError> {
        let mut state = self.lock_state()?;
        self.check_not_started(&state)?;

        let mut spec = Document::new();
        spec.insert(field, if ascending { 1 } else { -1 });
        state.sort = Some(spec);
        Ok(self)
    }

    fn check_not_started(&self, state: &CursorState) -> Result<(), DbError> {
        if state.started {
            return Err(DbError::modify_after_iteration(
                "C82F369BABD5",
                "cursor modifiers must be applied before iteration starts",
            ));
        }
        Ok(())
    }

    fn materialize(&self, state: &mut CursorState) -> Result<(), DbError> {
        if state.cursor.is_some() {
            return Ok(());
        }

        // A dead weak handle means the connection has been closed.
        self.client.upgrade().ok_or_else(|| {
            DbError::connection_closed("D93047ACBCE6", "connection is closed")
        })?;

        let source = state.source.take().ok_or_else(|| {
            DbError::cursor_position("EA4158BDCDF7", "cursor has no remaining source")
        })?;
        state.started = true;

        let cursor = match source {
            CursorSource::Find { collection, filter } => {
                let mut options = FindOptions::default();
                options.skip = state.skip;
                options.limit = state.limit;
                options.sort = state.sort.clone();

                collection
                    .find(filter)
                    .with_options(options)
                    .run()
                    .map_err(|e| format_cursor_error(&e))?
            }
            CursorSource::Aggregate {
                collection,
                mut pipeline,
            } => {
                if let Some(sort) = &state.sort {
                    pipeline.push(doc! { "$sort": sort.clone() });
                }
                if let Some(skip) = state.skip {
                    pipeline.push(doc! { "$skip": skip as i64 });
                }
                if let Some(limit) = state.limit {
                    pipeline.push(doc! { "$limit": limit });
                }

                collection
                    .aggregate(pipeline)
                    .run()
                    .map_err(|e| format_cursor_error(&e))?
            }
        };

        state.cursor = Some(cursor);
        Ok(())
    }

    /// Advance to the next document. False once the cursor is exhausted,
    /// and forever after.
    pub fn next(&self) -> Result<bool, DbError> {
        let mut state = self.lock_state()?;
        if state.exhausted {
            return Ok(false);
        }
        self.materialize(&mut state)?;

        let item = match state.peeked.take() {
            Some(doc) => Some(Ok(doc)),
            None => state.cursor.as_mut().and_then(|c| c.next()),
        };

        match item {
            Some(Ok(doc)) => {
                // Own the row; the engine's buffer is only valid until
                // the next advance.
                state.current = Some(MongoDocument::from_document(doc));
                state.position += 1;
                Ok(true)
            }
            Some(Err(e)) => Err(format_cursor_error(&e)),
            None => {
                state.current = None;
                state.exhausted = true;
                Ok(false)
            }
        }
    }

    /// True when another document is available, without consuming it.
    pub fn has_next(&self) -> Result<bool, DbError> {
        let mut state = self.lock_state()?;
        if state.exhausted {
            return Ok(false);
        }
        self.materialize(&mut state)?;

        if state.peeked.is_some() {
            return Ok(true);
        }
        match state.cursor.as_mut().and_then(|c| c.next()) {
            Some(Ok(doc)) => {
                state.peeked = Some(doc);
                Ok(true)
            }
            Some(Err(e)) => Err(format_cursor_error(&e)),
            None => {
                state.exhausted = true;
                Ok(false)
            }
        }
    }

    /// The document the cursor is positioned on.
    pub fn current(&self) -> Result<MongoDocument, DbError> {
        let state = self.lock_state()?;
        state.current.clone().ok_or_else(|| {
            DbError::cursor_position(
                "FB526A9CDE08",
                "no current document; call next() first",
            )
        })
    }

    /// Advance and return the new current document, if any.
    pub fn next_document(&self) -> Result<Option<MongoDocument>, DbError> {
        if self.next()? {
            Ok(Some(self.current()?))
        } else {
            Ok(None)
        }
    }

    /// Drain everything that remains.
    pub fn to_vector(&self) -> Result<Vec<MongoDocument>, DbError> {
        let mut documents = Vec::new();
        while self.next()? {
            documents.push(self.current()?);
        }
        Ok(documents)
    }

    /// Drain up to `batch_size` documents.
    pub fn batch(&self, batch_size: usize) -> Result<Vec<MongoDocument>, DbError> {
        let mut documents = Vec::with_capacity(batch_size);
        while documents.len() < batch_size {
            if !self.next()? {
                break;
            }
            documents.push(self.current()?);
        }
        Ok(documents)
    }

    /// Number of documents consumed so far.
    pub fn position(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .position
    }

    pub fn is_exhausted(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .exhausted
    }

    /// Server cursors are forward-only.
    pub fn rewind(&self) -> Result<(), DbError> {
        Err(DbError::rewind_unsupported(
            "0C637BADEF19",
            "cursors are not rewindable; issue the query again",
        ))
    }

    /// Idempotent. Further operations fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.cursor = None;
        state.source = None;
        state.current = None;
        state.peeked = None;
    }
}

fn format_cursor_error(e: &mongodb::error::Error) -> DbError {
    let message = e.to_string();
    log::error!("MongoDB cursor operation failed: {}", message);
    DbError::execute_failed("1D748BCF002A", message)
}

/// Tracks live cursors so a connection can render them inert when it
/// closes or returns to a pool. Dead entries are pruned opportunistically
/// once the set grows past a small threshold.
pub(crate) struct CursorRegistry {
    cursors: Mutex<Vec<Weak<MongoCursor>>>,
}

const PRUNE_THRESHOLD: usize = 50;

impl CursorRegistry {
    pub(crate) fn new() -> Self {
        Self {
            cursors: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, cursor: Weak<MongoCursor>) {
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        if cursors.len() > PRUNE_THRESHOLD {
            cursors.retain(|c| c.strong_count() > 0);
        }
        cursors.push(cursor);
    }

    pub(crate) fn close_all(&self) {
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        for cursor in cursors.drain(..) {
            if let Some(cursor) = cursor.upgrade() {
                cursor.close();
            }
        }
    }
}
