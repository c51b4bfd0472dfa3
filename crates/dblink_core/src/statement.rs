use std::sync::{Arc, Mutex};

use crate::blob::Blob;
use crate::error::DbError;
use crate::result_set::ResultSet;
use crate::stream::{self, InputStream};
use crate::value::ParamType;

/// Pre-compiled, parameterized SQL statement.
///
/// Parameter indices are 1-based. Bound values are owned by the statement
/// (side storage) until it is rebound, closed, or dropped. A statement
/// whose connection has been closed fails every operation with a
/// connection-closed error.
pub trait PreparedStatement: Send + Sync {
    fn set_int(&self, index: usize, value: i32) -> Result<(), DbError>;
    fn set_long(&self, index: usize, value: i64) -> Result<(), DbError>;
    fn set_double(&self, index: usize, value: f64) -> Result<(), DbError>;
    fn set_string(&self, index: usize, value: &str) -> Result<(), DbError>;
    fn set_bool(&self, index: usize, value: bool) -> Result<(), DbError>;
    fn set_date(&self, index: usize, value: &str) -> Result<(), DbError>;
    fn set_timestamp(&self, index: usize, value: &str) -> Result<(), DbError>;
    fn set_null(&self, index: usize, kind: ParamType) -> Result<(), DbError>;
    fn set_bytes(&self, index: usize, value: &[u8]) -> Result<(), DbError>;
    fn set_blob(&self, index: usize, value: Arc<dyn Blob>) -> Result<(), DbError>;
    fn set_binary_stream(&self, index: usize, value: Box<dyn InputStream>)
    -> Result<(), DbError>;

    fn execute_query(&self) -> Result<ResultSet, DbError>;

    /// Affected-row count.
    fn execute_update(&self) -> Result<u64, DbError>;

    /// Generic execution; true iff a result set was produced.
    fn execute(&self) -> Result<bool, DbError>;

    /// Idempotent; the statement is unusable afterwards.
    fn close(&self) -> Result<(), DbError>;

    fn is_closed(&self) -> bool;
}

/// One bound parameter slot, owning its payload.
pub enum ParamValue {
    Unset,
    Null(ParamType),
    Int(i32),
    Long(i64),
    Double(f64),
    Text(String),
    Bool(bool),
    Date(String),
    Timestamp(String),
    Bytes(Vec<u8>),
    Blob(Arc<dyn Blob>),
    Stream(Box<dyn InputStream>),
}

/// Parameter value with indirections (blobs, streams) already drained,
/// ready to hand to an engine binding API.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedParam {
    Null(ParamType),
    Int(i32),
    Long(i64),
    Double(f64),
    Text(String),
    Bool(bool),
    Date(String),
    Timestamp(String),
    Bytes(Vec<u8>),
}

/// Side storage for bound parameters, shared by the relational drivers.
///
/// Slots are sized from the statement's placeholder count at preparation
/// time; binding outside that range is an error.
pub struct ParamSlots {
    slots: Mutex<Vec<ParamValue>>,
}

impl ParamSlots {
    pub fn new(count: usize) -> Self {
        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, || ParamValue::Unset);
        Self {
            slots: Mutex::new(slots),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ParamValue>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind a 1-based slot.
    pub fn bind(&self, index: usize, value: ParamValue) -> Result<(), DbError> {
        let mut slots = self.lock();
        if index == 0 || index > slots.len() {
            return Err(DbError::invalid_parameter_index(
                "B91E3A5C07D4",
                format!(
                    "parameter index {} out of range 1..={}",
                    index,
                    slots.len()
                ),
            ));
        }
        slots[index - 1] = value;
        Ok(())
    }

    /// Drain indirections and produce engine-ready values. Streams are
    /// consumed here and replaced by their bytes, so a statement can be
    /// re-executed with the same bindings.
    pub fn resolve(&self) -> Result<Vec<ResolvedParam>, DbError> {
        let mut slots = self.lock();
        let mut resolved = Vec::with_capacity(slots.len());

        for (i, slot) in slots.iter_mut().enumerate() {
            let value = match slot {
                ParamValue::Unset => {
                    return Err(DbError::bind_failed(
                        "C48D20EF1B36",
                        format!("parameter {} was never bound", i + 1),
                    ));
                }
                ParamValue::Null(kind) => ResolvedParam::Null(*kind),
                ParamValue::Int(v) => ResolvedParam::Int(*v),
                ParamValue::Long(v) => ResolvedParam::Long(*v),
                ParamValue::Double(v) => ResolvedParam::Double(*v),
                ParamValue::Text(v) => ResolvedParam::Text(v.clone()),
                ParamValue::Bool(v) => ResolvedParam::Bool(*v),
                ParamValue::Date(v) => ResolvedParam::Date(v.clone()),
                ParamValue::Timestamp(v) => ResolvedParam::Timestamp(v.clone()),
                ParamValue::Bytes(v) => ResolvedParam::Bytes(v.clone()),
                ParamValue::Blob(blob) => {
                    let len = blob.length()?;
                    ResolvedParam::Bytes(blob.get_bytes(0, len as usize)?)
                }
                ParamValue::Stream(input) => {
                    let bytes = stream::read_to_end(input.as_mut())?;
                    let value = ResolvedParam::Bytes(bytes.clone());
                    *slot = ParamValue::Bytes(bytes);
                    value
                }
            };
            resolved.push(value);
        }

        Ok(resolved)
    }

    pub fn clear(&self) {
        let mut slots = self.lock();
        let len = slots.len();
        slots.clear();
        slots.resize_with(len, || ParamValue::Unset);
    }
}

/// Count `?` placeholders in a SQL text, ignoring string literals,
/// quoted identifiers and comments.
pub fn count_placeholders(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut count = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        // Doubled quote is an escape inside the literal.
                        if i + 1 < bytes.len() && bytes[i + 1] == quote {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
            }
            b'-' if i + 1 < bytes.len() && bytes[i + 1] == b'-' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            b'?' => count += 1,
            _ => {}
        }
        i += 1;
    }

    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlob;
    use crate::stream::MemoryInputStream;

    #[test]
    fn placeholder_count_skips_literals_and_comments() {
        assert_eq!(count_placeholders("SELECT ?"), 1);
        assert_eq!(
            count_placeholders("INSERT INTO t(a, b) VALUES(?, ?)"),
            2
        );
        assert_eq!(count_placeholders("SELECT '?' || \"?\" || ?"), 1);
        assert_eq!(count_placeholders("SELECT 'it''s ?', ?"), 1);
        assert_eq!(count_placeholders("SELECT ? -- not this ?\n, ?"), 2);
        assert_eq!(count_placeholders("SELECT /* ? */ ?"), 1);
    }

    #[test]
    fn bind_rejects_out_of_range_indices() {
        let slots = ParamSlots::new(2);
        assert!(slots.bind(0, ParamValue::Int(1)).is_err());
        assert!(slots.bind(3, ParamValue::Int(1)).is_err());
        assert!(slots.bind(1, ParamValue::Int(1)).is_ok());
        assert!(slots.bind(2, ParamValue::Int(2)).is_ok());
    }

    #[test]
    fn resolve_requires_every_slot_bound() {
        let slots = ParamSlots::new(2);
        slots.bind(1, ParamValue::Text("x".into())).unwrap();
        assert!(slots.resolve().is_err());

        slots.bind(2, ParamValue::Null(ParamType::Varchar)).unwrap();
        let resolved = slots.resolve().unwrap();
        assert_eq!(resolved[0], ResolvedParam::Text("x".into()));
        assert_eq!(resolved[1], ResolvedParam::Null(ParamType::Varchar));
    }

    #[test]
    fn resolve_drains_blobs_and_streams() {
        let slots = ParamSlots::new(2);
        slots
            .bind(
                1,
                ParamValue::Blob(Arc::new(MemoryBlob::from_bytes(vec![1, 2, 3]))),
            )
            .unwrap();
        slots
            .bind(
                2,
                ParamValue::Stream(Box::new(MemoryInputStream::new(vec![4, 5]))),
            )
            .unwrap();

        let resolved = slots.resolve().unwrap();
        assert_eq!(resolved[0], ResolvedParam::Bytes(vec![1, 2, 3]));
        assert_eq!(resolved[1], ResolvedParam::Bytes(vec![4, 5]));

        // Streams were materialized, so a second execution sees the same bytes.
        let again = slots.resolve().unwrap();
        assert_eq!(again[1], ResolvedParam::Bytes(vec![4, 5]));
    }
}
