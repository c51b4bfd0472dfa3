//! Tests against a live MySQL server.
//!
//! Run with `DBLINK_MYSQL_URL=cpp_dbc:mysql://host:3306/db \
//! DBLINK_MYSQL_USER=... DBLINK_MYSQL_PASSWORD=... cargo test -- --ignored`.

use std::collections::HashMap;
use std::sync::Arc;

use dblink_core::{Connection, DbError, Driver, IsolationLevel};
use dblink_driver_mysql::MySqlDriver;

fn connect() -> Result<Arc<dyn Connection>, DbError> {
    let url = std::env::var("DBLINK_MYSQL_URL")
        .unwrap_or_else(|_| "cpp_dbc:mysql://localhost:3306/test".to_string());
    let user = std::env::var("DBLINK_MYSQL_USER").unwrap_or_else(|_| "root".to_string());
    let password = std::env::var("DBLINK_MYSQL_PASSWORD").unwrap_or_default();

    MySqlDriver::new().connect(&url, &user, &password, &HashMap::new())
}

#[test]
#[ignore = "requires a running MySQL server"]
fn prepared_statement_round_trip() -> Result<(), DbError> {
    let conn = connect()?;
    conn.execute_update("DROP TABLE IF EXISTS dblink_rt")?;
    conn.execute_update(
        "CREATE TABLE dblink_rt(id INT AUTO_INCREMENT PRIMARY KEY, name VARCHAR(64), payload BLOB)",
    )?;

    let stmt = conn.prepare_statement("INSERT INTO dblink_rt(name, payload) VALUES(?, ?)")?;
    stmt.set_string(1, "alice")?;
    stmt.set_bytes(2, &[1, 2, 3])?;
    assert_eq!(stmt.execute_update()?, 1);

    let mut rs = conn.execute_query("SELECT id, name, payload FROM dblink_rt")?;
    assert!(rs.next());
    assert_eq!(rs.get_int("id")?, 1);
    assert_eq!(rs.get_string("name")?, "alice");
    assert_eq!(rs.get_bytes("payload")?, vec![1, 2, 3]);

    conn.execute_update("DROP TABLE dblink_rt")?;
    conn.close()
}

#[test]
#[ignore = "requires a running MySQL server"]
fn transaction_rollback_discards_writes() -> Result<(), DbError> {
    let conn = connect()?;
    conn.execute_update("DROP TABLE IF EXISTS dblink_txn")?;
    conn.execute_update("CREATE TABLE dblink_txn(x INT) ENGINE=InnoDB")?;

    conn.set_transaction_isolation(IsolationLevel::ReadCommitted)?;
    conn.set_auto_commit(false)?;
    conn.execute_update("INSERT INTO dblink_txn(x) VALUES(1)")?;
    conn.rollback()?;
    conn.set_auto_commit(true)?;

    let mut rs = conn.execute_query("SELECT COUNT(*) AS n FROM dblink_txn")?;
    assert!(rs.next());
    assert_eq!(rs.get_int("n")?, 0);

    conn.execute_update("DROP TABLE dblink_txn")?;
    conn.close()
}
