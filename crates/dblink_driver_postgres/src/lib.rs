#![allow(clippy::result_large_err)]

mod blob;
mod driver;

pub use blob::PgBlob;
pub use driver::{PgConnection, PgDriver};
