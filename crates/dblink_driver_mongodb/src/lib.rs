#![allow(clippy::result_large_err)]

mod collection;
mod connection;
mod cursor;
mod document;
mod driver;

pub use collection::{DeleteOutcome, InsertOutcome, MongoCollection, UpdateOutcome};
pub use connection::MongoConnection;
pub use cursor::MongoCursor;
pub use document::{MongoDocument, parse_json_document, parse_json_document_array};
pub use driver::MongoDriver;
