//! `_Installation` identity resolution through the full write pipeline:
//! token normalization, adoption of existing rows, merging and cleanup.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use basalt::config::{AppCache, AppHandles, AppSettings, Config};
use basalt::error::ErrorCode;
use basalt::identity::Auth;
use basalt::rest_write;
use basalt::storage::{query_eq, DatabaseAdapter, FindOptions, MemoryDatabase, Object, RunOptions};

const MOUNT: &str = "http://localhost:1337/1";
const IOS_TOKEN: &str = "0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF";

fn obj(v: Value) -> Object { v.as_object().cloned().unwrap() }

fn setup() -> (Arc<Config>, Arc<MemoryDatabase>) {
    let db = Arc::new(MemoryDatabase::new());
    let settings = AppSettings::new("app1", "mk");
    let handles = AppHandles::for_settings(&settings, db.clone());
    let cache = AppCache::new();
    cache.register(settings, handles).unwrap();
    (Arc::new(cache.config("app1", MOUNT)), db)
}

async fn seed(db: &MemoryDatabase, rows: &[Value]) {
    for row in rows {
        db.create("_Installation", &obj(row.clone()), &RunOptions::default()).await.unwrap();
    }
}

async fn all_rows(db: &MemoryDatabase) -> Vec<Object> {
    db.find("_Installation", &Object::new(), &FindOptions::default()).await.unwrap()
}

async fn register(config: &Arc<Config>, data: Value) -> Result<rest_write::WriteResponse, basalt::error::AppError> {
    rest_write::create(config.clone(), Auth::nobody(config), "_Installation", obj(data)).await
}

#[tokio::test]
async fn create_requires_an_id_and_a_device_type() {
    let (config, db) = setup();
    let err = register(&config, json!({"deviceType": "ios"})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::MissingRequiredField);
    let err = register(&config, json!({"installationId": "abc"})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::MissingRequiredField);
    assert_eq!(db.count("_Installation"), 0);
}

#[tokio::test]
async fn repeated_registration_updates_the_same_row() {
    let (config, db) = setup();
    let first = register(&config, json!({"deviceType": "ios", "deviceToken": IOS_TOKEN, "channels": ["news"]})).await.unwrap();
    assert_eq!(first.status_code(), 201);
    let id = first.response.unwrap()["objectId"].as_str().unwrap().to_string();

    let second = register(&config, json!({"deviceType": "ios", "deviceToken": IOS_TOKEN, "badge": 3})).await.unwrap();
    assert_eq!(second.status_code(), 200);
    assert!(second.response.unwrap().contains_key("updatedAt"));

    let rows = all_rows(&db).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["objectId"], id.as_str());
    assert_eq!(rows[0]["deviceToken"], IOS_TOKEN.to_lowercase());
    assert_eq!(rows[0]["badge"], 3);
    assert_eq!(rows[0]["channels"], json!(["news"]));
}

#[tokio::test]
async fn installation_id_is_case_insensitive() {
    let (config, db) = setup();
    register(&config, json!({"deviceType": "android", "installationId": "ABC-123", "deviceToken": "tok-1"})).await.unwrap();
    let again = register(&config, json!({"deviceType": "android", "installationId": "abc-123", "deviceToken": "tok-1"})).await.unwrap();
    assert_eq!(again.status_code(), 200);
    let rows = all_rows(&db).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["installationId"], "abc-123");
    // short tokens keep their case
    assert_eq!(rows[0]["deviceToken"], "tok-1");
}

#[tokio::test]
async fn token_only_row_absorbs_installation_row() {
    let (config, db) = setup();
    seed(&db, &[
        json!({"objectId": "i1", "installationId": "abc", "deviceType": "ios"}),
        json!({"objectId": "i2", "deviceToken": "tok", "deviceType": "ios"}),
    ]).await;

    let out = register(&config, json!({"installationId": "ABC", "deviceToken": "tok", "deviceType": "ios"})).await.unwrap();
    assert_eq!(out.status_code(), 200);
    let rows = all_rows(&db).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["objectId"], "i2");
    assert_eq!(rows[0]["installationId"], "abc");
    assert_eq!(rows[0]["deviceToken"], "tok");
}

#[tokio::test]
async fn shared_token_without_installation_id_is_ambiguous() {
    let (config, db) = setup();
    seed(&db, &[
        json!({"objectId": "i1", "deviceToken": "tok", "deviceType": "ios"}),
        json!({"objectId": "i2", "deviceToken": "tok", "deviceType": "ios"}),
    ]).await;
    let err = register(&config, json!({"deviceToken": "tok", "deviceType": "ios"})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidInstallationId);
    assert_eq!(db.count("_Installation"), 2);
}

#[tokio::test]
async fn token_moves_to_new_installation() {
    let (config, db) = setup();
    seed(&db, &[json!({"objectId": "old1", "deviceToken": "tok", "installationId": "old", "deviceType": "ios"})]).await;

    let out = register(&config, json!({"deviceToken": "tok", "installationId": "new", "deviceType": "ios"})).await.unwrap();
    assert_eq!(out.status_code(), 201);

    // the stale row is removed in the background
    for _ in 0..200 {
        if db.count("_Installation") == 1 { break; }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let rows = all_rows(&db).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["installationId"], "new");
}

#[tokio::test]
async fn token_moved_onto_existing_row_keeps_that_row() {
    let (config, db) = setup();
    seed(&db, &[
        json!({"objectId": "r1", "installationId": "x", "deviceToken": "old", "deviceType": "ios", "appIdentifier": "com.a"}),
        json!({"objectId": "s1", "installationId": "y", "deviceToken": "new", "deviceType": "ios", "appIdentifier": "com.a"}),
        json!({"objectId": "t1", "installationId": "z", "deviceToken": "new", "deviceType": "ios", "appIdentifier": "com.b"}),
    ]).await;

    // update by objectId without resending the installation id
    let out = rest_write::update(
        config.clone(),
        Auth::nobody(&config),
        "_Installation",
        "r1",
        obj(json!({"deviceToken": "new", "appIdentifier": "com.a"})),
    ).await.unwrap();
    assert_eq!(out.status_code(), 200);

    for _ in 0..200 {
        if db.count("_Installation") == 2 { break; }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut ids: Vec<String> = all_rows(&db).await.iter().map(|r| r["objectId"].as_str().unwrap().to_string()).collect();
    ids.sort();
    // s1 was stale; t1 belongs to another app
    assert_eq!(ids, vec!["r1".to_string(), "t1".to_string()]);
    let r1 = db.find("_Installation", &query_eq("objectId", "r1"), &FindOptions::default()).await.unwrap();
    assert_eq!(r1[0]["deviceToken"], "new");
    assert_eq!(r1[0]["installationId"], "x");
}

#[tokio::test]
async fn resubmitting_both_ids_is_idempotent() {
    let (config, db) = setup();
    let payload = json!({"installationId": "dev-1", "deviceToken": "tok", "deviceType": "android"});
    register(&config, payload.clone()).await.unwrap();
    let again = register(&config, payload).await.unwrap();
    assert_eq!(again.status_code(), 200);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(db.count("_Installation"), 1);
}

#[tokio::test]
async fn identity_fields_are_immutable_on_update() {
    let (config, db) = setup();
    seed(&db, &[json!({"objectId": "i1", "installationId": "abc", "deviceType": "ios"})]).await;

    let update = |data: Value| {
        let config = config.clone();
        async move { rest_write::update(config.clone(), Auth::nobody(&config), "_Installation", "i1", obj(data)).await }
    };
    assert_eq!(update(json!({"installationId": "other"})).await.unwrap_err().code, ErrorCode::ChangedImmutableField);
    assert_eq!(update(json!({"deviceType": "android"})).await.unwrap_err().code, ErrorCode::ChangedImmutableField);

    let out = update(json!({"installationId": "ABC", "badge": 1})).await.unwrap();
    assert_eq!(out.status_code(), 200);
    let row = db.find("_Installation", &query_eq("objectId", "i1"), &FindOptions::default()).await.unwrap().remove(0);
    assert_eq!(row["badge"], 1);

    let err = rest_write::update(config.clone(), Auth::nobody(&config), "_Installation", "missing", obj(json!({"badge": 2})))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ObjectNotFound);
}
