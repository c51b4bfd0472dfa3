use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use crate::config::{ConfigManager, DatabaseConfig};
use crate::connection::Connection;
use crate::driver::Driver;
use crate::error::DbError;

static DRIVERS: LazyLock<RwLock<Vec<(String, Arc<dyn Driver>)>>> =
    LazyLock::new(|| RwLock::new(Vec::new()));

/// Process-wide scheme-to-driver table.
///
/// Drivers are tried in registration order; the first whose
/// `accepts_url` returns true handles the connection request.
pub struct DriverManager;

impl DriverManager {
    /// Register a driver under a name. Re-registering a name replaces the
    /// previous driver.
    pub fn register(name: impl Into<String>, driver: Arc<dyn Driver>) {
        let name = name.into();
        log::debug!("[REGISTRY] registering driver '{}' ({})", name, driver.name());

        let mut drivers = write_guard();
        if let Some(entry) = drivers.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = driver;
        } else {
            drivers.push((name, driver));
        }
    }

    pub fn unregister(name: &str) {
        log::debug!("[REGISTRY] unregistering driver '{}'", name);
        write_guard().retain(|(n, _)| n != name);
    }

    /// Remove every registered driver. Meant for tests.
    pub fn clear() {
        write_guard().clear();
    }

    pub fn registered_drivers() -> Vec<String> {
        read_guard().iter().map(|(n, _)| n.clone()).collect()
    }

    /// Dispatch a URL to the driver that accepts it.
    pub fn connection(
        url: &str,
        user: &str,
        password: &str,
    ) -> Result<Arc<dyn Connection>, DbError> {
        let driver = {
            let drivers = read_guard();
            drivers
                .iter()
                .find(|(_, d)| d.accepts_url(url))
                .map(|(_, d)| d.clone())
        };

        match driver {
            Some(driver) => driver.connect(url, user, password, &HashMap::new()),
            None => Err(DbError::unknown_url(
                "C308A1DB52F6",
                format!("no registered driver accepts '{}'", url),
            )),
        }
    }

    /// Connect using a configuration record.
    pub fn connection_from_config(
        config: &DatabaseConfig,
    ) -> Result<Arc<dyn Connection>, DbError> {
        Self::connection(&config.connection_url(), &config.username, &config.password)
    }

    /// Connect using a named configuration from a manager.
    pub fn connection_by_name(
        manager: &ConfigManager,
        name: &str,
    ) -> Result<Arc<dyn Connection>, DbError> {
        let config = manager.database(name).ok_or_else(|| {
            DbError::unknown_url(
                "D419B2EC6307",
                format!("no database configuration named '{}'", name),
            )
        })?;
        Self::connection_from_config(config)
    }
}

fn read_guard() -> std::sync::RwLockReadGuard<'static, Vec<(String, Arc<dyn Driver>)>> {
    DRIVERS.read().unwrap_or_else(|e| e.into_inner())
}

fn write_guard() -> std::sync::RwLockWriteGuard<'static, Vec<(String, Arc<dyn Driver>)>> {
    DRIVERS.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dblink_test_support::FakeDriver;

    // The registry is process-wide state shared by every test in this
    // binary; tests that touch it serialize on this lock.
    static REGISTRY_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn register_dispatch_unregister_clear() {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        DriverManager::register("reg-mysql", FakeDriver::with_scheme("mysql").into_driver());
        DriverManager::register(
            "reg-postgres",
            FakeDriver::with_scheme("postgresql").into_driver(),
        );

        let names = DriverManager::registered_drivers();
        assert!(names.contains(&"reg-mysql".to_string()));
        assert!(names.contains(&"reg-postgres".to_string()));

        let conn = DriverManager::connection("cpp_dbc:postgresql://localhost/app", "u", "p")
            .expect("postgresql URL should dispatch");
        assert_eq!(conn.url(), "cpp_dbc:postgresql://localhost/app");

        let err = DriverManager::connection("cpp_dbc:oracle://localhost/app", "u", "p")
            .expect_err("unknown scheme must not dispatch");
        assert!(matches!(err, DbError::UnknownUrl(_)));

        DriverManager::unregister("reg-postgres");
        assert!(
            DriverManager::connection("cpp_dbc:postgresql://localhost/app", "u", "p").is_err()
        );

        // Re-registering a name replaces, not duplicates.
        DriverManager::register("reg-mysql", FakeDriver::with_scheme("mysql").into_driver());
        assert_eq!(
            DriverManager::registered_drivers()
                .iter()
                .filter(|n| *n == "reg-mysql")
                .count(),
            1
        );

        DriverManager::clear();
        assert!(DriverManager::registered_drivers().is_empty());
    }

    #[test]
    fn connection_from_config_builds_url() {
        let _guard = REGISTRY_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        DriverManager::register(
            "cfg-fake",
            FakeDriver::with_scheme("fakecfg").into_driver(),
        );

        let config = DatabaseConfig {
            name: "main".to_string(),
            kind: "fakecfg".to_string(),
            host: "db1".to_string(),
            port: 1234,
            database: "app".to_string(),
            username: "svc".to_string(),
            password: "secret".to_string(),
            options: Default::default(),
        };

        let conn = DriverManager::connection_from_config(&config).unwrap();
        assert_eq!(conn.url(), "cpp_dbc:fakecfg://db1:1234/app");

        let mut manager = ConfigManager::new();
        manager.add(config);
        assert!(DriverManager::connection_by_name(&manager, "main").is_ok());
        assert!(DriverManager::connection_by_name(&manager, "absent").is_err());

        DriverManager::unregister("cfg-fake");
    }
}
