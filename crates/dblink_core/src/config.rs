use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::url::URL_PREFIX;

/// A named database endpoint: enough to build a connection URL plus the
/// credentials to open it with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    /// URL scheme: "mysql", "postgresql", "sqlite" or "mongodb".
    pub kind: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    /// Database name, or filesystem path for SQLite.
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl DatabaseConfig {
    pub fn connection_url(&self) -> String {
        match self.kind.as_str() {
            "sqlite" => format!("{}sqlite:{}", URL_PREFIX, self.database),
            "mongodb" => {
                if self.username.is_empty() {
                    format!(
                        "{}mongodb://{}:{}/{}",
                        URL_PREFIX, self.host, self.port, self.database
                    )
                } else {
                    format!(
                        "{}mongodb://{}:{}@{}:{}/{}",
                        URL_PREFIX,
                        urlencoding::encode(&self.username),
                        urlencoding::encode(&self.password),
                        self.host,
                        self.port,
                        self.database
                    )
                }
            }
            kind => format!(
                "{}{}://{}:{}/{}",
                URL_PREFIX, kind, self.host, self.port, self.database
            ),
        }
    }
}

/// Lookup table of named database configurations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigManager {
    databases: Vec<DatabaseConfig>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, config: DatabaseConfig) {
        self.databases.retain(|c| c.name != config.name);
        self.databases.push(config);
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseConfig> {
        self.databases.iter().find(|c| c.name == name)
    }

    pub fn databases(&self) -> &[DatabaseConfig] {
        &self.databases
    }
}

/// Connection pool sizing and validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub initial_size: usize,
    pub max_size: usize,
    pub min_idle: usize,
    pub max_wait_millis: u64,
    pub validation_timeout_millis: u64,
    pub idle_timeout_millis: u64,
    pub max_lifetime_millis: u64,
    pub test_on_borrow: bool,
    pub test_on_return: bool,
    pub validation_query: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            initial_size: 5,
            max_size: 20,
            min_idle: 3,
            max_wait_millis: 5_000,
            validation_timeout_millis: 5_000,
            idle_timeout_millis: 300_000,
            max_lifetime_millis: 1_800_000,
            test_on_borrow: true,
            test_on_return: false,
            validation_query: "SELECT 1".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_per_kind() {
        let mut config = DatabaseConfig {
            name: "main".into(),
            kind: "mysql".into(),
            host: "db".into(),
            port: 3306,
            database: "app".into(),
            ..Default::default()
        };
        assert_eq!(config.connection_url(), "cpp_dbc:mysql://db:3306/app");

        config.kind = "sqlite".into();
        config.database = ":memory:".into();
        assert_eq!(config.connection_url(), "cpp_dbc:sqlite::memory:");

        config.kind = "mongodb".into();
        config.database = "app".into();
        config.port = 27017;
        config.username = "u:ser".into();
        config.password = "p@ss".into();
        assert_eq!(
            config.connection_url(),
            "cpp_dbc:mongodb://u%3Aser:p%40ss@db:27017/app"
        );
    }

    #[test]
    fn manager_replaces_by_name() {
        let mut manager = ConfigManager::new();
        manager.add(DatabaseConfig {
            name: "a".into(),
            kind: "mysql".into(),
            ..Default::default()
        });
        manager.add(DatabaseConfig {
            name: "a".into(),
            kind: "postgresql".into(),
            ..Default::default()
        });

        assert_eq!(manager.databases().len(), 1);
        assert_eq!(manager.database("a").unwrap().kind, "postgresql");
        assert!(manager.database("b").is_none());
    }

    #[test]
    fn pool_defaults_match_documented_values() {
        let config = PoolConfig::default();
        assert_eq!(config.initial_size, 5);
        assert_eq!(config.max_size, 20);
        assert_eq!(config.min_idle, 3);
        assert_eq!(config.max_wait_millis, 5_000);
        assert_eq!(config.idle_timeout_millis, 300_000);
        assert_eq!(config.max_lifetime_millis, 1_800_000);
        assert!(config.test_on_borrow);
        assert!(!config.test_on_return);
        assert_eq!(config.validation_query, "SELECT 1");
    }
}
