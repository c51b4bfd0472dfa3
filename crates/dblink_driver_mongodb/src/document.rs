use std::sync::Mutex;

use bson::oid::ObjectId;
use bson::{Bson, Document};
use dblink_core::DbError;

/// BSON-backed document with typed field access.
///
/// Reads navigate dotted paths (`address.city`, `tags.0`). Writes are
/// limited to top-level fields and preserve the order of the remaining
/// fields; writing through a dotted path is rejected.
pub struct MongoDocument {
    doc: Document,
    // `_id` rendered as text, invalidated by any mutation.
    cached_id: Mutex<Option<String>>,
}

impl MongoDocument {
    pub fn new() -> Self {
        Self::from_document(Document::new())
    }

    pub fn from_document(doc: Document) -> Self {
        Self {
            doc,
            cached_id: Mutex::new(None),
        }
    }

    /// Parse JSON text (plain or extended) into a document.
    pub fn from_json(json: &str) -> Result<Self, DbError> {
        Ok(Self::from_document(parse_json_document(json)?))
    }

    pub fn to_json(&self) -> String {
        Bson::Document(self.doc.clone())
            .into_relaxed_extjson()
            .to_string()
    }

    pub fn as_document(&self) -> &Document {
        &self.doc
    }

    pub fn into_document(self) -> Document {
        self.doc
    }

    pub fn field_names(&self) -> Vec<String> {
        self.doc.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.doc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.is_empty()
    }

    pub fn has_field(&self, path: &str) -> bool {
        navigate(&self.doc, path).is_some()
    }

    fn field(&self, path: &str) -> Result<&Bson, DbError> {
        navigate(&self.doc, path).ok_or_else(|| {
            DbError::field_not_found("1D74EB86F02A", format!("field not found: {}", path))
        })
    }

    pub fn get_string(&self, path: &str) -> Result<String, DbError> {
        match self.field(path)? {
            Bson::String(s) => Ok(s.clone()),
            other => Err(type_mismatch(path, "string", other)),
        }
    }

    pub fn get_int(&self, path: &str) -> Result<i64, DbError> {
        match self.field(path)? {
            Bson::Int32(v) => Ok(i64::from(*v)),
            Bson::Int64(v) => Ok(*v),
            other => Err(type_mismatch(path, "integer", other)),
        }
    }

    pub fn get_double(&self, path: &str) -> Result<f64, DbError> {
        match self.field(path)? {
            Bson::Double(v) => Ok(*v),
            Bson::Int32(v) => Ok(f64::from(*v)),
            Bson::Int64(v) => Ok(*v as f64),
            other => Err(type_mismatch(path, "double", other)),
        }
    }

    pub fn get_bool(&self, path: &str) -> Result<bool, DbError> {
        match self.field(path)? {
            Bson::Boolean(v) => Ok(*v),
            other => Err(type_mismatch(path, "boolean", other)),
        }
    }

    pub fn is_null(&self, path: &str) -> Result<bool, DbError> {
        Ok(matches!(self.field(path)?, Bson::Null))
    }

    pub fn get_document(&self, path: &str) -> Result<MongoDocument, DbError> {
        match self.field(path)? {
            Bson::Document(d) => Ok(MongoDocument::from_document(d.clone())),
            other => Err(type_mismatch(path, "document", other)),
        }
    }

    pub fn get_array(&self, path: &str) -> Result<Vec<Bson>, DbError> {
        match self.field(path)? {
            Bson::Array(items) => Ok(items.clone()),
            other => Err(type_mismatch(path, "array", other)),
        }
    }

    pub fn get_string_array(&self, path: &str) -> Result<Vec<String>, DbError> {
        self.get_array(path)?
            .into_iter()
            .map(|item| match item {
                Bson::String(s) => Ok(s),
                other => Err(type_mismatch(path, "string array", &other)),
            })
            .collect()
    }

    pub fn set_string(&mut self, path: &str, value: &str) -> Result<(), DbError> {
        self.set_field(path, Bson::String(value.to_string()))
    }

    pub fn set_int(&mut self, path: &str, value: i64) -> Result<(), DbError> {
        self.set_field(path, Bson::Int64(value))
    }

    pub fn set_double(&mut self, path: &str, value: f64) -> Result<(), DbError> {
        self.set_field(path, Bson::Double(value))
    }

    pub fn set_bool(&mut self, path: &str, value: bool) -> Result<(), DbError> {
        self.set_field(path, Bson::Boolean(value))
    }

    pub fn set_null(&mut self, path: &str) -> Result<(), DbError> {
        self.set_field(path, Bson::Null)
    }

    pub fn set_document(&mut self, path: &str, value: &MongoDocument) -> Result<(), DbError> {
        self.set_field(path, Bson::Document(value.doc.clone()))
    }

    pub fn set_array(&mut self, path: &str, value: Vec<Bson>) -> Result<(), DbError> {
        self.set_field(path, Bson::Array(value))
    }

    /// Replace or append a top-level field, keeping every other field in
    /// its existing position. Appends new fields at the end.
    fn set_field(&mut self, path: &str, value: Bson) -> Result<(), DbError> {
        if path.contains('.') {
            return Err(DbError::nested_set_unsupported(
                "2E85FC97013B",
                format!(
                    "setting nested path '{}' is not supported; replace the top-level field",
                    path
                ),
            ));
        }

        let mut rebuilt = Document::new();
        let mut replaced = false;
        for (key, existing) in &self.doc {
            if key == path {
                rebuilt.insert(key.clone(), value.clone());
                replaced = true;
            } else {
                rebuilt.insert(key.clone(), existing.clone());
            }
        }
        if !replaced {
            rebuilt.insert(path.to_string(), value);
        }

        self.doc = rebuilt;
        *self.lock_cached() = None;
        Ok(())
    }

    /// `_id` as text: ObjectId renders as 24 hex characters, strings pass
    /// through. Cached until the document mutates.
    pub fn id(&self) -> Result<String, DbError> {
        if let Some(cached) = self.lock_cached().clone() {
            return Ok(cached);
        }

        let id = match self.field("_id")? {
            Bson::ObjectId(oid) => oid.to_hex(),
            Bson::String(s) => s.clone(),
            other => return Err(type_mismatch("_id", "ObjectId or string", other)),
        };

        *self.lock_cached() = Some(id.clone());
        Ok(id)
    }

    /// Set `_id`. 24-hex text becomes an ObjectId, anything else is
    /// stored as a plain string.
    pub fn set_id(&mut self, id: &str) -> Result<(), DbError> {
        let value = match ObjectId::parse_str(id) {
            Ok(oid) => Bson::ObjectId(oid),
            Err(_) => Bson::String(id.to_string()),
        };
        self.set_field("_id", value)
    }

    fn lock_cached(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.cached_id.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MongoDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MongoDocument {
    fn clone(&self) -> Self {
        Self {
            doc: self.doc.clone(),
            cached_id: Mutex::new(self.lock_cached().clone()),
        }
    }
}

impl std::fmt::Debug for MongoDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MongoDocument").field(&self.doc).finish()
    }
}

/// Descend a dotted path. Numeric segments index into arrays.
fn navigate<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;

    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn type_mismatch(path: &str, expected: &str, actual: &Bson) -> DbError {
    DbError::type_mismatch(
        "3F96AD08124C",
        format!(
            "field '{}' is not a {} (found {:?})",
            path,
            expected,
            actual.element_type()
        ),
    )
}

/// Parse JSON text into a BSON document. The empty string is the empty
/// document; invalid JSON and non-object roots are rejected.
pub fn parse_json_document(json: &str) -> Result<Document, DbError> {
    if json.trim().is_empty() {
        return Ok(Document::new());
    }

    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| {
        DbError::invalid_json("40A7BE19235D", format!("invalid JSON: {}", e))
    })?;

    let bson = Bson::try_from(value).map_err(|e| {
        DbError::invalid_json("51B8CF2A346E", format!("JSON is not valid BSON: {}", e))
    })?;

    match bson {
        Bson::Document(doc) => Ok(doc),
        _ => Err(DbError::invalid_json(
            "62C9D03B457F",
            "expected a JSON object",
        )),
    }
}

/// Parse JSON text that must be an array of documents (e.g. an
/// aggregation pipeline).
pub fn parse_json_document_array(json: &str) -> Result<Vec<Document>, DbError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }

    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| {
        DbError::invalid_json("73DAE14C5680", format!("invalid JSON: {}", e))
    })?;

    let items = match value {
        serde_json::Value::Array(items) => items,
        _ => {
            return Err(DbError::invalid_json(
                "84EBF25D6791",
                "expected a JSON array",
            ));
        }
    };

    items
        .into_iter()
        .map(|item| {
            let bson = Bson::try_from(item).map_err(|e| {
                DbError::invalid_json("95FC036E78A2", format!("JSON is not valid BSON: {}", e))
            })?;
            match bson {
                Bson::Document(doc) => Ok(doc),
                _ => Err(DbError::invalid_json(
                    "A60D147F89B3",
                    "array elements must be JSON objects",
                )),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_preserves_fields() {
        let doc = MongoDocument::from_json(r#"{"name":"bob","age":30,"ok":true}"#).unwrap();
        assert_eq!(doc.get_string("name").unwrap(), "bob");
        assert_eq!(doc.get_int("age").unwrap(), 30);
        assert!(doc.get_bool("ok").unwrap());

        let reparsed = MongoDocument::from_json(&doc.to_json()).unwrap();
        assert_eq!(reparsed.get_string("name").unwrap(), "bob");
        assert_eq!(reparsed.get_int("age").unwrap(), 30);
    }

    #[test]
    fn dotted_paths_descend_documents_and_arrays() {
        let doc = MongoDocument::from_json(
            r#"{"address":{"city":"Lima","geo":{"lat":-12.05}},"tags":["a","b"]}"#,
        )
        .unwrap();

        assert_eq!(doc.get_string("address.city").unwrap(), "Lima");
        assert_eq!(doc.get_double("address.geo.lat").unwrap(), -12.05);
        assert_eq!(doc.get_string("tags.1").unwrap(), "b");
        assert!(doc.has_field("tags.0"));
        assert!(!doc.has_field("tags.7"));
        assert!(matches!(
            doc.get_string("address.country").unwrap_err(),
            DbError::FieldNotFound(_)
        ));
    }

    #[test]
    fn wrong_type_is_reported() {
        let doc = MongoDocument::from_json(r#"{"age":30}"#).unwrap();
        assert!(matches!(
            doc.get_string("age").unwrap_err(),
            DbError::TypeMismatch(_)
        ));
    }

    #[test]
    fn set_preserves_field_order_and_appends_new() {
        let mut doc = MongoDocument::from_json(r#"{"a":1,"b":2,"c":3}"#).unwrap();
        doc.set_int("b", 20).unwrap();
        doc.set_string("d", "new").unwrap();

        assert_eq!(doc.field_names(), vec!["a", "b", "c", "d"]);
        assert_eq!(doc.get_int("b").unwrap(), 20);
        assert_eq!(doc.get_string("d").unwrap(), "new");
    }

    #[test]
    fn nested_set_is_rejected() {
        let mut doc = MongoDocument::from_json(r#"{"address":{"city":"Lima"}}"#).unwrap();
        assert!(matches!(
            doc.set_string("address.city", "Cusco").unwrap_err(),
            DbError::NestedSetUnsupported(_)
        ));
    }

    #[test]
    fn clones_are_deep() {
        let original = MongoDocument::from_json(r#"{"a":{"b":1}}"#).unwrap();
        let mut copy = original.clone();
        assert_eq!(copy.to_json(), original.to_json());

        copy.set_int("x", 9).unwrap();
        assert!(!original.has_field("x"));
    }

    #[test]
    fn object_id_coercion() {
        let oid = ObjectId::new();
        let mut doc = MongoDocument::new();
        doc.set_id(&oid.to_hex()).unwrap();
        assert_eq!(doc.id().unwrap(), oid.to_hex());
        assert!(matches!(doc.as_document().get("_id"), Some(Bson::ObjectId(_))));

        doc.set_id("custom-key").unwrap();
        assert_eq!(doc.id().unwrap(), "custom-key");
        assert!(matches!(doc.as_document().get("_id"), Some(Bson::String(_))));
    }

    #[test]
    fn cached_id_invalidates_on_mutation() {
        let mut doc = MongoDocument::from_json(r#"{"_id":"k1","v":1}"#).unwrap();
        assert_eq!(doc.id().unwrap(), "k1");

        doc.set_id("k2").unwrap();
        assert_eq!(doc.id().unwrap(), "k2");
    }

    #[test]
    fn json_parsing_errors() {
        assert!(matches!(
            MongoDocument::from_json("{not json").unwrap_err(),
            DbError::InvalidJson(_)
        ));
        assert!(matches!(
            parse_json_document("[1,2]").unwrap_err(),
            DbError::InvalidJson(_)
        ));
        assert!(parse_json_document("").unwrap().is_empty());
        assert_eq!(
            parse_json_document_array(r#"[{"$match":{}}]"#).unwrap().len(),
            1
        );
    }
}
