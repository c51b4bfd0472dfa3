#![allow(clippy::result_large_err)]

mod driver;

pub use driver::{MySqlConnection, MySqlDriver};
