#![allow(clippy::result_large_err)]

mod blob;
mod config;
mod connection;
mod driver;
mod error;
mod registry;
mod result_set;
mod statement;
mod stream;
mod url;
mod value;

pub use blob::{BLOB_SEGMENT_SIZE, Blob, BlobResolver, MemoryBlob};
pub use config::{ConfigManager, DatabaseConfig, PoolConfig};
pub use connection::Connection;
pub use driver::Driver;
pub use error::{DbError, ErrorDetail};
pub use registry::DriverManager;
pub use result_set::{ColumnIndex, ResultSet};
pub use statement::{
    ParamSlots, ParamValue, PreparedStatement, ResolvedParam, count_placeholders,
};
pub use stream::{
    InputStream, MemoryInputStream, MemoryOutputStream, OutputStream, read_to_end,
};
pub use url::{
    HostPortDatabase, URL_PREFIX, has_scheme, parse_host_port_database, parse_mongodb_uri,
    parse_sqlite_path, split_scheme,
};
pub use value::{BlobId, IsolationLevel, ParamType, Value};
