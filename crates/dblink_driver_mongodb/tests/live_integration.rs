//! Tests against a live MongoDB server.
//!
//! Run with `DBLINK_MONGO_URL=cpp_dbc:mongodb://host:27017/dblink_test \
//! cargo test -- --ignored`.

use std::collections::HashMap;
use std::sync::Arc;

use dblink_core::{Connection, DbError, Driver};
use dblink_driver_mongodb::{MongoConnection, MongoDriver};

fn connect() -> Result<(Arc<dyn Connection>, Arc<MongoConnection>), DbError> {
    let url = std::env::var("DBLINK_MONGO_URL")
        .unwrap_or_else(|_| "cpp_dbc:mongodb://localhost:27017/dblink_test".to_string());

    let conn = MongoDriver::new().connect(&url, "", "", &HashMap::new())?;
    let mongo = conn
        .clone()
        .as_any()
        .downcast::<MongoConnection>()
        .ok()
        .expect("driver should hand out MongoDB connections");
    Ok((conn, mongo))
}

#[test]
#[ignore = "requires a running MongoDB server"]
fn crud_round_trip() -> Result<(), DbError> {
    let (conn, mongo) = connect()?;
    let users = mongo.collection("users")?;
    users.delete_many("")?;

    let inserted = users.insert_one(r#"{"name":"bob","age":30}"#)?;
    assert!(inserted.acknowledged);
    assert_eq!(inserted.inserted_count, 1);
    assert_eq!(inserted.inserted_ids.len(), 1);

    let found = users
        .find_one(r#"{"name":"bob"}"#)?
        .expect("bob should be stored");
    assert_eq!(found.get_int("age")?, 30);
    assert!(!found.id()?.is_empty());

    let by_id = users.find_by_id(&found.id()?)?.expect("lookup by id");
    assert_eq!(by_id.get_string("name")?, "bob");

    let updated = users.update_one(r#"{"name":"bob"}"#, r#"{"$set":{"age":31}}"#)?;
    assert_eq!(updated.matched_count, 1);
    assert_eq!(updated.modified_count, 1);

    let deleted = users.delete_one(r#"{"name":"bob"}"#)?;
    assert_eq!(deleted.deleted_count, 1);
    assert_eq!(users.count_documents("")?, 0);

    conn.close()
}

#[test]
#[ignore = "requires a running MongoDB server"]
fn cursor_modifiers_and_exhaustion() -> Result<(), DbError> {
    let (conn, mongo) = connect()?;
    let items = mongo.collection("cursor_items")?;
    items.delete_many("")?;

    for i in 0..10 {
        items.insert_one(&format!(r#"{{"n":{}}}"#, i))?;
    }

    let cursor = items.find("")?;
    cursor.sort("n", false)?.skip(2)?.limit(3)?;

    assert!(cursor.next()?);
    assert_eq!(cursor.current()?.get_int("n")?, 7);

    // Iteration froze the modifiers.
    assert!(matches!(
        cursor.skip(1).map(|_| ()).unwrap_err(),
        DbError::ModifyAfterIteration(_)
    ));
    assert!(matches!(
        cursor.limit(1).map(|_| ()).unwrap_err(),
        DbError::ModifyAfterIteration(_)
    ));
    assert!(matches!(
        cursor.sort("n", true).map(|_| ()).unwrap_err(),
        DbError::ModifyAfterIteration(_)
    ));

    let rest = cursor.to_vector()?;
    assert_eq!(rest.len(), 2);
    assert!(cursor.is_exhausted());
    assert!(!cursor.next()?);
    assert!(!cursor.next()?);
    assert!(matches!(
        cursor.rewind().unwrap_err(),
        DbError::RewindUnsupported(_)
    ));

    let all = items.find("")?;
    assert_eq!(all.to_vector()?.len(), 10);

    items.drop()?;
    conn.close()
}

#[test]
#[ignore = "requires a running MongoDB server"]
fn aggregation_and_distinct() -> Result<(), DbError> {
    let (conn, mongo) = connect()?;
    let orders = mongo.collection("agg_orders")?;
    orders.delete_many("")?;

    orders.insert_many(
        r#"[{"item":"a","qty":2},{"item":"a","qty":3},{"item":"b","qty":1}]"#,
        true,
        false,
    )?;

    let cursor = orders.aggregate(
        r#"[{"$group":{"_id":"$item","total":{"$sum":"$qty"}}},{"$sort":{"_id":1}}]"#,
    )?;
    let groups = cursor.to_vector()?;
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].get_int("total")?, 5);

    let mut items = orders.distinct("item", "")?;
    items.sort();
    assert_eq!(items, vec!["a".to_string(), "b".to_string()]);

    orders.drop()?;
    conn.close()
}

#[test]
#[ignore = "requires a running MongoDB server"]
fn index_administration() -> Result<(), DbError> {
    let (conn, mongo) = connect()?;
    let coll = mongo.collection("indexed")?;
    coll.delete_many("")?;
    coll.insert_one(r#"{"email":"a@example.com"}"#)?;

    let name = coll.create_index(r#"{"email":1}"#, r#"{"unique":true,"name":"email_unique"}"#)?;
    assert_eq!(name, "email_unique");
    assert!(coll.list_indexes()?.contains(&"email_unique".to_string()));

    coll.drop_index("email_unique")?;
    coll.drop_all_indexes()?;
    coll.drop()?;
    conn.close()
}

#[test]
#[ignore = "requires a running MongoDB server"]
fn children_fail_after_close() -> Result<(), DbError> {
    let (conn, mongo) = connect()?;
    let coll = mongo.collection("closing")?;
    let cursor = coll.find("")?;

    conn.close()?;

    assert!(matches!(
        coll.count_documents("").unwrap_err(),
        DbError::ConnectionClosed(_)
    ));
    assert!(matches!(
        cursor.next().unwrap_err(),
        DbError::ConnectionClosed(_)
    ));
    assert!(!cursor.is_connection_valid());
    Ok(())
}

#[test]
#[ignore = "requires a running MongoDB server"]
fn sessions_follow_topology_support() -> Result<(), DbError> {
    let (conn, mongo) = connect()?;

    let session = mongo.start_session()?;
    if mongo.supports_transactions()? {
        mongo.start_transaction(&session)?;
        mongo.abort_transaction(&session)?;
    }
    mongo.end_session(&session)?;

    // Pool-return scrubbing ends whatever is still open.
    let other = mongo.start_session()?;
    mongo.prepare_for_pool_return()?;
    assert!(mongo.end_session(&other).is_err());

    conn.close()
}
