use serde::{Deserialize, Serialize};

/// Identifier of a database-resident blob, resolved lazily by the driver
/// that produced the result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobId {
    /// PostgreSQL large-object OID.
    LargeObject(u32),
    /// Coordinates of a blob cell for engines with incremental blob I/O.
    TableCell {
        table: String,
        column: String,
        rowid: i64,
    },
}

/// Database value.
///
/// Custom enum instead of `serde_json::Value` so getters can apply the
/// library's coercion rules without a JSON detour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Reference to a database-resident blob, materialized on demand.
    BlobRef(BlobId),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric coercion: NULL reads as 0, text parses when it can.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Null => Some(0),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Bytes(_) | Value::BlobRef(_) => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Null => Some(0.0),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Bytes(_) | Value::BlobRef(_) => None,
        }
    }

    /// String coercion: NULL reads as the empty string.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => Some(String::new()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Bytes(_) | Value::BlobRef(_) => None,
        }
    }

    /// Textual truthiness: exactly "1", "true", "TRUE" or "True".
    /// Numerics are true when nonzero. NULL is false.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Null => Some(false),
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Float(f) => Some(*f != 0.0),
            Value::Text(s) => Some(matches!(s.as_str(), "1" | "true" | "TRUE" | "True")),
            Value::Bytes(_) | Value::BlobRef(_) => None,
        }
    }
}

/// Intended engine type of a NULL parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    Integer,
    Float,
    Double,
    Varchar,
    Date,
    Timestamp,
    Boolean,
    Blob,
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling shared by MySQL and PostgreSQL `SET ... ISOLATION LEVEL`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_coerces_to_zero_and_empty() {
        assert_eq!(Value::Null.as_int(), Some(0));
        assert_eq!(Value::Null.as_double(), Some(0.0));
        assert_eq!(Value::Null.as_text(), Some(String::new()));
        assert_eq!(Value::Null.as_bool(), Some(false));
    }

    #[test]
    fn boolean_truthiness_is_exact() {
        for truthy in ["1", "true", "TRUE", "True"] {
            assert_eq!(Value::Text(truthy.into()).as_bool(), Some(true));
        }
        for falsy in ["0", "yes", "t", "truE", ""] {
            assert_eq!(Value::Text(falsy.into()).as_bool(), Some(false));
        }
        assert_eq!(Value::Int(-3).as_bool(), Some(true));
        assert_eq!(Value::Int(0).as_bool(), Some(false));
    }

    #[test]
    fn text_parses_numerics() {
        assert_eq!(Value::Text(" 42 ".into()).as_int(), Some(42));
        assert_eq!(Value::Text("2.5".into()).as_double(), Some(2.5));
        assert_eq!(Value::Text("nope".into()).as_int(), None);
    }
}
