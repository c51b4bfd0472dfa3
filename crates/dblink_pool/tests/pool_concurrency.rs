use std::sync::Arc;
use std::time::{Duration, Instant};

use dblink_core::{Connection, DbError, DriverManager, PoolConfig};
use dblink_pool::{ConnectionPool, TransactionManager};
use dblink_test_support::FakeDriver;

fn setup(scheme: &str, max_size: usize, max_wait_millis: u64) -> Arc<ConnectionPool> {
    DriverManager::register(
        format!("fake-{}", scheme),
        FakeDriver::with_scheme(scheme).into_driver(),
    );

    Arc::new(
        ConnectionPool::new(PoolConfig {
            url: format!("cpp_dbc:{}://concurrency-host:1/db", scheme),
            initial_size: max_size,
            max_size,
            min_idle: 1,
            max_wait_millis,
            ..PoolConfig::default()
        })
        .unwrap(),
    )
}

#[test]
fn saturated_pool_times_out_late_borrower() {
    let pool = setup("conctimeout", 2, 250);

    let mut holders = Vec::new();
    for _ in 0..2 {
        let pool = pool.clone();
        holders.push(std::thread::spawn(move || {
            let conn = pool.get_connection().unwrap();
            std::thread::sleep(Duration::from_millis(500));
            conn.close().unwrap();
        }));
    }

    // Give the holders time to take both connections.
    std::thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    let err = match pool.get_connection() {
        Err(e) => e,
        Ok(_) => panic!("expected get_connection to fail"),
    };
    let waited = start.elapsed();

    assert!(matches!(err, DbError::BorrowTimeout(_)));
    assert!(
        waited >= Duration::from_millis(250),
        "gave up after only {:?}",
        waited
    );

    for holder in holders {
        holder.join().unwrap();
    }
}

#[test]
fn borrower_succeeds_when_a_connection_returns_within_the_window() {
    let pool = setup("concreturn", 1, 1_000);

    let held = pool.get_connection().unwrap();
    let returner = {
        let pool = pool.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            held.close().unwrap();
            drop(pool);
        })
    };

    let conn = pool.get_connection().unwrap();
    assert_eq!(pool.active_connections(), 1);
    conn.close().unwrap();

    returner.join().unwrap();
}

#[test]
fn concurrent_borrowers_never_exceed_max_size() {
    let pool = setup("concinvariant", 3, 2_000);

    let mut workers = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        workers.push(std::thread::spawn(move || {
            for _ in 0..10 {
                let conn = pool.get_connection().unwrap();
                conn.execute_query("SELECT 1").unwrap();
                assert!(pool.total_connections() <= 3);
                assert!(pool.active_connections() <= 3);
                conn.close().unwrap();
            }
        }));
    }

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(pool.active_connections(), 0);
    assert!(pool.total_connections() <= 3);
}

#[test]
fn transactions_can_cross_threads() {
    let pool = setup("conctxn", 2, 1_000);
    let manager = Arc::new(TransactionManager::new(pool).unwrap());

    let id = manager.begin_transaction().unwrap();

    let worker = {
        let manager = manager.clone();
        let id = id.clone();
        std::thread::spawn(move || {
            let conn = manager.transaction_connection(&id).unwrap();
            conn.execute_update("INSERT INTO t(v) VALUES(1)").unwrap();
        })
    };
    worker.join().unwrap();

    manager.commit_transaction(&id).unwrap();
    assert!(!manager.is_transaction_active(&id));
}
