#![allow(clippy::result_large_err)]

mod blob;
mod driver;

pub use blob::SqliteBlob;
pub use driver::{SqliteConnection, SqliteDriver};
