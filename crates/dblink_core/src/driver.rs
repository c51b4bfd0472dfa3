use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::Connection;
use crate::error::DbError;

/// Engine connection factory.
///
/// One instance per engine is registered with the
/// [`DriverManager`](crate::registry::DriverManager); URL dispatch asks
/// each registered driver whether it accepts the URL.
pub trait Driver: Send + Sync {
    /// Human-readable engine name ("MySQL", "PostgreSQL", ...).
    fn name(&self) -> &'static str;

    /// Prefix match on `cpp_dbc:<scheme>:`.
    fn accepts_url(&self, url: &str) -> bool;

    fn connect(
        &self,
        url: &str,
        user: &str,
        password: &str,
        options: &HashMap<String, String>,
    ) -> Result<Arc<dyn Connection>, DbError>;
}
