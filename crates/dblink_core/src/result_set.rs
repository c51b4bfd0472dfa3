use std::collections::HashMap;
use std::sync::Arc;

use crate::blob::{Blob, BlobResolver, MemoryBlob};
use crate::error::DbError;
use crate::value::Value;

/// Column selector for result-set getters: a 1-based index or a name.
pub trait ColumnIndex {
    fn resolve(&self, result_set: &ResultSet) -> Result<usize, DbError>;
}

impl ColumnIndex for usize {
    fn resolve(&self, result_set: &ResultSet) -> Result<usize, DbError> {
        if *self == 0 || *self > result_set.columns.len() {
            return Err(DbError::column_not_found(
                "D7290FA1C5E8",
                format!(
                    "column index {} out of range 1..={}",
                    self,
                    result_set.columns.len()
                ),
            ));
        }
        Ok(*self - 1)
    }
}

impl ColumnIndex for &str {
    fn resolve(&self, result_set: &ResultSet) -> Result<usize, DbError> {
        result_set.index.get(*self).copied().ok_or_else(|| {
            DbError::column_not_found("E1B63D09F247", format!("no column named '{}'", self))
        })
    }
}

/// Forward-only cursor over the rows of a relational query result.
///
/// Rows are owned copies; the engine handle was released before the result
/// set was handed out, so its lifetime is independent of the statement
/// that produced it. The row count is therefore always known up front.
pub struct ResultSet {
    columns: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<Vec<Value>>,
    // 0 = before first, 1..=N = on a row, N+1 = after last.
    position: usize,
    closed: bool,
    blob_resolver: Option<Arc<dyn BlobResolver>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            // first-wins on duplicate names
            .rev()
            .collect();

        Self {
            columns,
            index,
            rows,
            position: 0,
            closed: false,
            blob_resolver: None,
        }
    }

    pub fn with_blob_resolver(mut self, resolver: Arc<dyn BlobResolver>) -> Self {
        self.blob_resolver = Some(resolver);
        self
    }

    /// Advance to the next row. True exactly while a fresh row is positioned.
    pub fn next(&mut self) -> bool {
        if self.closed || self.position > self.rows.len() {
            return false;
        }
        self.position += 1;
        self.position <= self.rows.len()
    }

    pub fn is_before_first(&self) -> bool {
        self.position == 0
    }

    pub fn is_after_last(&self) -> bool {
        self.position > self.rows.len()
    }

    /// 1-based index of the current row; 0 when not positioned on one.
    pub fn row(&self) -> u64 {
        if self.position >= 1 && self.position <= self.rows.len() {
            self.position as u64
        } else {
            0
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Idempotent. Further `next()` calls return false.
    pub fn close(&mut self) {
        self.closed = true;
    }

    fn current_row(&self) -> Result<&[Value], DbError> {
        if self.closed {
            return Err(DbError::cursor_position(
                "F0A81C37D92B",
                "result set is closed",
            ));
        }
        if self.position == 0 {
            return Err(DbError::cursor_position(
                "A5E2B94D10C7",
                "cursor is before the first row; call next() first",
            ));
        }
        if self.position > self.rows.len() {
            return Err(DbError::cursor_position(
                "B6F3CA05E218",
                "cursor is after the last row",
            ));
        }
        Ok(&self.rows[self.position - 1])
    }

    pub fn value<C: ColumnIndex>(&self, column: C) -> Result<&Value, DbError> {
        let idx = column.resolve(self)?;
        Ok(&self.current_row()?[idx])
    }

    pub fn get_int<C: ColumnIndex>(&self, column: C) -> Result<i32, DbError> {
        self.get_long(column).map(|v| v as i32)
    }

    pub fn get_long<C: ColumnIndex>(&self, column: C) -> Result<i64, DbError> {
        let value = self.value(column)?;
        value.as_int().ok_or_else(|| {
            DbError::type_mismatch("C3D14E8A6F05", format!("{:?} is not numeric", value))
        })
    }

    pub fn get_double<C: ColumnIndex>(&self, column: C) -> Result<f64, DbError> {
        let value = self.value(column)?;
        value.as_double().ok_or_else(|| {
            DbError::type_mismatch("D4E25F9B7A16", format!("{:?} is not numeric", value))
        })
    }

    pub fn get_string<C: ColumnIndex>(&self, column: C) -> Result<String, DbError> {
        let value = self.value(column)?;
        value.as_text().ok_or_else(|| {
            DbError::type_mismatch("E5F36A0C8B27", format!("{:?} is not textual", value))
        })
    }

    pub fn get_boolean<C: ColumnIndex>(&self, column: C) -> Result<bool, DbError> {
        let value = self.value(column)?;
        value.as_bool().ok_or_else(|| {
            DbError::type_mismatch("F6A47B1D9C38", format!("{:?} has no truthiness", value))
        })
    }

    pub fn get_bytes<C: ColumnIndex>(&self, column: C) -> Result<Vec<u8>, DbError> {
        match self.value(column)? {
            Value::Null => Ok(Vec::new()),
            Value::Bytes(b) => Ok(b.clone()),
            Value::Text(s) => Ok(s.clone().into_bytes()),
            other => Err(DbError::type_mismatch(
                "07B58C2E0D49",
                format!("{:?} is not binary", other),
            )),
        }
    }

    pub fn is_null<C: ColumnIndex>(&self, column: C) -> Result<bool, DbError> {
        Ok(self.value(column)?.is_null())
    }

    /// Blob access. Database-resident blobs come back lazy, bound to the
    /// connection that produced this result set; inline binary values are
    /// wrapped in a memory blob copy.
    pub fn get_blob<C: ColumnIndex>(&self, column: C) -> Result<Arc<dyn Blob>, DbError> {
        match self.value(column)? {
            Value::BlobRef(id) => {
                let resolver = self.blob_resolver.as_ref().ok_or_else(|| {
                    DbError::type_mismatch(
                        "18C69D3F1E5A",
                        "result set has no blob resolver for this column",
                    )
                })?;
                resolver.open_blob(id)
            }
            Value::Bytes(b) => Ok(Arc::new(MemoryBlob::from_bytes(b.clone()))),
            Value::Null => Ok(Arc::new(MemoryBlob::new())),
            other => Err(DbError::type_mismatch(
                "29D70E401F6B",
                format!("{:?} is not a blob", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResultSet {
        ResultSet::new(
            vec!["id".to_string(), "name".to_string()],
            vec![
                vec![Value::Int(1), Value::Text("alice".into())],
                vec![Value::Int(2), Value::Null],
            ],
        )
    }

    #[test]
    fn iteration_walks_rows_once() {
        let mut rs = sample();
        assert!(rs.is_before_first());
        assert_eq!(rs.row(), 0);

        assert!(rs.next());
        assert_eq!(rs.row(), 1);
        assert!(rs.next());
        assert_eq!(rs.row(), 2);
        assert!(!rs.next());
        assert!(rs.is_after_last());
        assert!(!rs.next());
    }

    #[test]
    fn access_before_first_and_after_last_fails() {
        let mut rs = sample();
        assert!(rs.get_int(1_usize).is_err());

        while rs.next() {}
        assert!(rs.get_int(1_usize).is_err());
    }

    #[test]
    fn getters_by_index_and_name() {
        let mut rs = sample();
        rs.next();

        assert_eq!(rs.get_int(1_usize).unwrap(), 1);
        assert_eq!(rs.get_int("id").unwrap(), 1);
        assert_eq!(rs.get_string("name").unwrap(), "alice");
        assert!(rs.get_string("missing").is_err());
        assert!(rs.get_int(3_usize).is_err());
    }

    #[test]
    fn null_coercion_rules() {
        let mut rs = sample();
        rs.next();
        rs.next();

        assert!(rs.is_null("name").unwrap());
        assert_eq!(rs.get_string("name").unwrap(), "");
        assert_eq!(rs.get_int("name").unwrap(), 0);
        assert!(!rs.get_boolean("name").unwrap());
    }

    #[test]
    fn duplicate_column_names_resolve_to_first() {
        let mut rs = ResultSet::new(
            vec!["x".into(), "x".into()],
            vec![vec![Value::Int(1), Value::Int(2)]],
        );
        rs.next();
        assert_eq!(rs.get_int("x").unwrap(), 1);
    }

    #[test]
    fn close_stops_iteration() {
        let mut rs = sample();
        rs.next();
        rs.close();
        assert!(!rs.next());
        assert!(rs.get_int(1_usize).is_err());
    }

    #[test]
    fn inline_bytes_surface_as_memory_blob() {
        let mut rs = ResultSet::new(
            vec!["payload".into()],
            vec![vec![Value::Bytes(vec![1, 2, 3])]],
        );
        rs.next();

        let blob = rs.get_blob("payload").unwrap();
        assert_eq!(blob.length().unwrap(), 3);
        assert_eq!(blob.get_bytes(0, 3).unwrap(), vec![1, 2, 3]);
    }
}
