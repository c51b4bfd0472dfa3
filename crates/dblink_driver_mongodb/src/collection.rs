use std::sync::{Arc, Weak};

use bson::oid::ObjectId;
use bson::{Bson, Document, doc};
use dblink_core::DbError;
use mongodb::options::{IndexOptions, InsertManyOptions};
use mongodb::sync::{Client, Collection};
use mongodb::IndexModel;

use crate::cursor::{CursorRegistry, CursorSource, MongoCursor};
use crate::document::{MongoDocument, parse_json_document, parse_json_document_array};

/// Result of an insert operation.
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub acknowledged: bool,
    pub inserted_count: u64,
    /// Textual form of each inserted `_id`, in insertion order.
    pub inserted_ids: Vec<String>,
}

/// Result of an update or replace operation.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub acknowledged: bool,
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<String>,
}

/// Result of a delete operation.
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub acknowledged: bool,
    pub deleted_count: u64,
}

/// One MongoDB collection, bound to the connection that produced it.
///
/// Filters, updates and options are JSON text; the collection transmits
/// them without interpreting operator semantics. Every operation is gated
/// on the connection still being open.
pub struct MongoCollection {
    name: String,
    database_name: String,
    client: Weak<Client>,
    collection: Collection<Document>,
    registry: Arc<CursorRegistry>,
}

impl MongoCollection {
    pub(crate) fn new(
        name: String,
        database_name: String,
        client: Weak<Client>,
        collection: Collection<Document>,
        registry: Arc<CursorRegistry>,
    ) -> Self {
        Self {
            name,
            database_name,
            client,
            collection,
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_connection(&self) -> Result<Arc<Client>, DbError> {
        self.client.upgrade().ok_or_else(|| {
            DbError::connection_closed("2E859CD0113B", "connection is closed")
        })
    }

    // ------------------------------------------------------------------
    // Inserts
    // ------------------------------------------------------------------

    pub fn insert_one(&self, document_json: &str) -> Result<InsertOutcome, DbError> {
        self.insert_one_document(&MongoDocument::from_json(document_json)?)
    }

    pub fn insert_one_document(&self, document: &MongoDocument) -> Result<InsertOutcome, DbError> {
        self.check_connection()?;
        let doc = with_generated_id(document.as_document().clone());
        let id = id_to_string(doc.get("_id"));

        self.collection
            .insert_one(doc)
            .run()
            .map_err(|e| format_collection_error(&e))?;

        Ok(InsertOutcome {
            acknowledged: true,
            inserted_count: 1,
            inserted_ids: id.into_iter().collect(),
        })
    }

    /// Ordered by default, like the wire protocol itself.
    pub fn insert_many(
        &self,
        documents_json: &str,
        ordered: bool,
        bypass_validation: bool,
    ) -> Result<InsertOutcome, DbError> {
        self.check_connection()?;

        let docs: Vec<Document> = parse_json_document_array(documents_json)?
            .into_iter()
            .map(with_generated_id)
            .collect();
        let ids: Vec<String> = docs
            .iter()
            .filter_map(|d| id_to_string(d.get("_id")))
            .collect();
        let count = docs.len() as u64;

        let mut options = InsertManyOptions::default();
        options.ordered = Some(ordered);
        options.bypass_document_validation = Some(bypass_validation);

        self.collection
            .insert_many(docs)
            .with_options(options)
            .run()
            .map_err(|e| format_collection_error(&e))?;

        Ok(InsertOutcome {
            acknowledged: true,
            inserted_count: count,
            inserted_ids: ids,
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn find(&self, filter_json: &str) -> Result<Arc<MongoCursor>, DbError> {
        self.check_connection()?;
        let filter = parse_json_document(filter_json)?;

        let cursor = Arc::new(MongoCursor::new(
            self.client.clone(),
            CursorSource::Find {
                collection: self.collection.clone(),
                filter,
            },
        ));
        self.registry.register(Arc::downgrade(&cursor));
        Ok(cursor)
    }

    pub fn find_all(&self) -> Result<Arc<MongoCursor>, DbError> {
        self.find("")
    }

    pub fn find_one(&self, filter_json: &str) -> Result<Option<MongoDocument>, DbError> {
        self.check_connection()?;
        let filter = parse_json_document(filter_json)?;

        let found = self
            .collection
            .find_one(filter)
            .run()
            .map_err(|e| format_collection_error(&e))?;
        Ok(found.map(MongoDocument::from_document))
    }

    /// The filter is built from BSON values, never by splicing the id
    /// into JSON text.
    pub fn find_by_id(&self, id: &str) -> Result<Option<MongoDocument>, DbError> {
        self.check_connection()?;

        let found = self
            .collection
            .find_one(id_filter(id))
            .run()
            .map_err(|e| format_collection_error(&e))?;
        Ok(found.map(MongoDocument::from_document))
    }

    pub fn aggregate(&self, pipeline_json: &str) -> Result<Arc<MongoCursor>, DbError> {
        self.check_connection()?;
        let pipeline = parse_json_document_array(pipeline_json)?;

        let cursor = Arc::new(MongoCursor::new(
            self.client.clone(),
            CursorSource::Aggregate {
                collection: self.collection.clone(),
                pipeline,
            },
        ));
        self.registry.register(Arc::downgrade(&cursor));
        Ok(cursor)
    }

    pub fn count_documents(&self, filter_json: &str) -> Result<u64, DbError> {
        self.check_connection()?;
        let filter = parse_json_document(filter_json)?;
        self.collection
            .count_documents(filter)
            .run()
            .map_err(|e| format_collection_error(&e))
    }

    pub fn estimated_count(&self) -> Result<u64, DbError> {
        self.check_connection()?;
        self.collection
            .estimated_document_count()
            .run()
            .map_err(|e| format_collection_error(&e))
    }

    pub fn distinct(&self, field: &str, filter_json: &str) -> Result<Vec<String>, DbError> {
        self.check_connection()?;
        let filter = parse_json_document(filter_json)?;

        let values = self
            .collection
            .distinct(field, filter)
            .run()
            .map_err(|e| format_collection_error(&e))?;

        Ok(values
            .into_iter()
            .map(|value| match value {
                Bson::String(s) => s,
                other => other.into_relaxed_extjson().to_string(),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Updates & deletes
    // ------------------------------------------------------------------

    pub fn update_one(
        &self,
        filter_json: &str,
        update_json: &str,
    ) -> Result<UpdateOutcome, DbError> {
        self.check_connection()?;
        let filter = parse_json_document(filter_json)?;
        let update = parse_json_document(update_json)?;

        let result = self
            .collection
            .update_one(filter, update)
            .run()
            .map_err(|e| format_collection_error(&e))?;
        Ok(update_outcome(result))
    }

    pub fn update_many(
        &self,
        filter_json: &str,
        update_json: &str,
    ) -> Result<UpdateOutcome, DbError> {
        self.check_connection()?;
        let filter = parse_json_document(filter_json)?;
        let update = parse_json_document(update_json)?;

        let result = self
            .collection
            .update_many(filter, update)
            .run()
            .map_err(|e| format_collection_error(&e))?;
        Ok(update_outcome(result))
    }

    pub fn replace_one(
        &self,
        filter_json: &str,
        replacement_json: &str,
    ) -> Result<UpdateOutcome, DbError> {
        self.check_connection()?;
        let filter = parse_json_document(filter_json)?;
        let replacement = parse_json_document(replacement_json)?;

        let result = self
            .collection
            .replace_one(filter, replacement)
            .run()
            .map_err(|e| format_collection_error(&e))?;
        Ok(update_outcome(result))
    }

    pub fn delete_one(&self, filter_json: &str) -> Result<DeleteOutcome, DbError> {
        self.check_connection()?;
        let filter = parse_json_document(filter_json)?;

        let result = self
            .collection
            .delete_one(filter)
            .run()
            .map_err(|e| format_collection_error(&e))?;
        Ok(DeleteOutcome {
            acknowledged: true,
            deleted_count: result.deleted_count,
        })
    }

    pub fn delete_many(&self, filter_json: &str) -> Result<DeleteOutcome, DbError> {
        self.check_connection()?;
        let filter = parse_json_document(filter_json)?;

        let result = self
            .collection
            .delete_many(filter)
            .run()
            .map_err(|e| format_collection_error(&e))?;
        Ok(DeleteOutcome {
            acknowledged: true,
            deleted_count: result.deleted_count,
        })
    }

    // ------------------------------------------------------------------
    // Index administration
    // ------------------------------------------------------------------

    /// `options_json` understands `unique`, `sparse` and `name`.
    pub fn create_index(&self, keys_json: &str, options_json: &str) -> Result<String, DbError> {
        self.check_connection()?;
        let keys = parse_json_document(keys_json)?;
        let options = parse_json_document(options_json)?;

        let index_options = IndexOptions::builder()
            .unique(options.get_bool("unique").ok())
            .sparse(options.get_bool("sparse").ok())
            .name(options.get_str("name").ok().map(String::from))
            .build();

        let model = IndexModel::builder()
            .keys(keys)
            .options(index_options)
            .build();

        let result = self
            .collection
            .create_index(model)
            .run()
            .map_err(|e| format_collection_error(&e))?;
        Ok(result.index_name)
    }

    pub fn drop_index(&self, name: &str) -> Result<(), DbError> {
        self.check_connection()?;
        self.collection
            .drop_index(name)
            .run()
            .map_err(|e| format_collection_error(&e))
    }

    /// `dropIndexes` with `index: "*"`.
    pub fn drop_all_indexes(&self) -> Result<(), DbError> {
        self.check_connection()?;
        self.collection
            .drop_indexes()
            .run()
            .map_err(|e| format_collection_error(&e))
    }

    pub fn list_indexes(&self) -> Result<Vec<String>, DbError> {
        self.check_connection()?;
        self.collection
            .list_index_names()
            .run()
            .map_err(|e| format_collection_error(&e))
    }

    // ------------------------------------------------------------------
    // Collection administration
    // ------------------------------------------------------------------

    pub fn drop(&self) -> Result<(), DbError> {
        self.check_connection()?;
        self.collection
            .drop()
            .run()
            .map_err(|e| format_collection_error(&e))
    }

    /// Rename within the same database, via the admin command.
    pub fn rename(&self, new_name: &str, drop_target: bool) -> Result<(), DbError> {
        let client = self.check_connection()?;

        let from = format!("{}.{}", self.database_name, self.name);
        let to = format!("{}.{}", self.database_name, new_name);
        client
            .database("admin")
            .run_command(doc! {
                "renameCollection": from,
                "to": to,
                "dropTarget": drop_target,
            })
            .run()
            .map_err(|e| format_collection_error(&e))?;
        Ok(())
    }
}

/// Attach a fresh ObjectId when the document has no `_id` yet.
fn with_generated_id(doc: Document) -> Document {
    if doc.contains_key("_id") {
        return doc;
    }
    let mut keyed = Document::new();
    keyed.insert("_id", ObjectId::new());
    keyed.extend(doc);
    keyed
}

/// Build an `_id` filter from BSON values: 24-hex text matches as an
/// ObjectId, anything else as a plain string key.
fn id_filter(id: &str) -> Document {
    match ObjectId::parse_str(id) {
        Ok(oid) => doc! { "_id": oid },
        Err(_) => doc! { "_id": id },
    }
}

fn id_to_string(id: Option<&Bson>) -> Option<String> {
    match id {
        Some(Bson::ObjectId(oid)) => Some(oid.to_hex()),
        Some(Bson::String(s)) => Some(s.clone()),
        Some(other) => Some(other.clone().into_relaxed_extjson().to_string()),
        None => None,
    }
}

fn update_outcome(result: mongodb::results::UpdateResult) -> UpdateOutcome {
    UpdateOutcome {
        acknowledged: true,
        matched_count: result.matched_count,
        modified_count: result.modified_count,
        upserted_id: id_to_string(result.upserted_id.as_ref()),
    }
}

fn format_collection_error(e: &mongodb::error::Error) -> DbError {
    let message = e.to_string();
    log::error!("MongoDB collection operation failed: {}", message);
    DbError::execute_failed("3F96AE01224C", message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_is_prepended_only_when_missing() {
        let doc = with_generated_id(doc! { "name": "bob" });
        assert!(matches!(doc.get("_id"), Some(Bson::ObjectId(_))));
        assert_eq!(doc.keys().next().map(String::as_str), Some("_id"));

        let keyed = with_generated_id(doc! { "_id": "custom", "name": "bob" });
        assert_eq!(keyed.get_str("_id").unwrap(), "custom");
    }

    #[test]
    fn id_filter_distinguishes_oids_from_strings() {
        let oid = ObjectId::new();
        assert!(matches!(
            id_filter(&oid.to_hex()).get("_id"),
            Some(Bson::ObjectId(_))
        ));
        assert!(matches!(
            id_filter("plain-key").get("_id"),
            Some(Bson::String(_))
        ));
    }

    #[test]
    fn id_rendering_round_trips() {
        let oid = ObjectId::new();
        assert_eq!(
            id_to_string(Some(&Bson::ObjectId(oid))),
            Some(oid.to_hex())
        );
        assert_eq!(
            id_to_string(Some(&Bson::String("k".into()))),
            Some("k".to_string())
        );
        assert_eq!(id_to_string(None), None);
    }
}
