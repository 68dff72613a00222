//! `_User` writes: credentials, uniqueness, issued sessions, auth data linking
//! and email verification.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use basalt::config::{AppCache, AppHandles, AppSettings, Config};
use basalt::controllers::{FnValidator, LoggingMailAdapter};
use basalt::crypto::verify_password;
use basalt::error::{AppError, ErrorCode};
use basalt::identity::Auth;
use basalt::rest_write::{self, RestWrite};
use basalt::storage::{pointer, query_eq, DatabaseAdapter, FindOptions, MemoryDatabase, Object, RunOptions};

const MOUNT: &str = "http://localhost:1337/1";

fn obj(v: Value) -> Object { v.as_object().cloned().unwrap() }

fn setup_with(settings: AppSettings, mail: Option<Arc<LoggingMailAdapter>>) -> (Arc<Config>, Arc<MemoryDatabase>) {
    let db = Arc::new(MemoryDatabase::new());
    let handles = match mail {
        Some(m) => AppHandles::with_mail(&settings, db.clone(), m),
        None => AppHandles::for_settings(&settings, db.clone()),
    };
    let cache = AppCache::new();
    let app_id = settings.app_id.clone();
    cache.register(settings, handles).unwrap();
    (Arc::new(cache.config(&app_id, MOUNT)), db)
}

fn setup() -> (Arc<Config>, Arc<MemoryDatabase>) {
    let mut settings = AppSettings::new("app1", "mk");
    settings.server_url = MOUNT.into();
    setup_with(settings, None)
}

async fn fetch(db: &MemoryDatabase, class_name: &str, id: &str) -> Object {
    let rows = db.find(class_name, &query_eq("objectId", id), &FindOptions::default()).await.unwrap();
    rows.into_iter().next().unwrap_or_else(|| panic!("{} {} not found", class_name, id))
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() { return; }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn signup(config: &Arc<Config>, data: Value) -> Result<rest_write::WriteResponse, AppError> {
    rest_write::create(config.clone(), Auth::nobody(config), "_User", obj(data)).await
}

#[tokio::test]
async fn signup_issues_unrestricted_session() {
    let (config, db) = setup();
    let out = signup(&config, json!({"username": "u1", "password": "p1"})).await.unwrap();
    assert_eq!(out.status_code(), 201);
    let resp = out.response.unwrap();
    let id = resp["objectId"].as_str().unwrap().to_string();
    assert_eq!(id.len(), 10);
    assert!(resp.contains_key("createdAt"));
    let token = resp["sessionToken"].as_str().unwrap().to_string();
    assert!(token.starts_with("r:"));
    assert_eq!(out.location.as_deref(), Some(format!("{}/users/{}", MOUNT, id).as_str()));

    let sessions = db.find("_Session", &query_eq("user", pointer("_User", &id)), &FindOptions::default()).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["restricted"], false);
    assert_eq!(sessions[0]["sessionToken"], token.as_str());
    assert_eq!(sessions[0]["createdWith"], json!({"action": "login", "authProvider": "password"}));
    assert_eq!(sessions[0]["expiresAt"]["__type"], "Date");

    let user = fetch(&db, "_User", &id).await;
    assert!(user.get("password").is_none());
    let hashed = user["_hashed_password"].as_str().unwrap();
    assert_ne!(hashed, "p1");
    assert!(verify_password(hashed, "p1"));
    assert_eq!(user["ACL"], json!({ id.as_str(): {"read": true, "write": true}, "*": {"read": true, "write": false} }));
}

#[tokio::test]
async fn signup_requires_username_and_password() {
    let (config, db) = setup();
    let err = signup(&config, json!({"password": "p1"})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::UsernameMissing);
    let err = signup(&config, json!({"username": "u1"})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::PasswordMissing);
    assert_eq!(db.count("_User"), 0);
}

#[tokio::test]
async fn username_and_email_are_unique() {
    let (config, _db) = setup();
    let first = signup(&config, json!({"username": "u1", "password": "p", "email": "a@example.com"})).await.unwrap();
    let first_id = first.response.unwrap()["objectId"].as_str().unwrap().to_string();

    let err = signup(&config, json!({"username": "u1", "password": "p"})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::UsernameTaken);
    let err = signup(&config, json!({"username": "u2", "password": "p", "email": "a@example.com"})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::EmailTaken);
    let err = signup(&config, json!({"username": "u3", "password": "p", "email": "not-an-email"})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidEmailAddress);

    // re-saving your own username and email is fine
    let me = Auth::for_user(&config, first_id.clone());
    let out = rest_write::update(config.clone(), me, "_User", &first_id, obj(json!({"username": "u1", "email": "a@example.com"})))
        .await
        .unwrap();
    assert_eq!(out.status_code(), 200);
    assert!(out.response.unwrap().contains_key("updatedAt"));
}

#[tokio::test]
async fn users_cannot_modify_each_other() {
    let (config, _db) = setup();
    let a = signup(&config, json!({"username": "a", "password": "p"})).await.unwrap().response.unwrap();
    let b = signup(&config, json!({"username": "b", "password": "p"})).await.unwrap().response.unwrap();
    let a_id = a["objectId"].as_str().unwrap();
    let b_id = b["objectId"].as_str().unwrap();

    let err = rest_write::update(config.clone(), Auth::for_user(&config, a_id), "_User", b_id, obj(json!({"nick": "x"})))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SessionMissing);
    rest_write::update(config.clone(), Auth::master(&config), "_User", b_id, obj(json!({"nick": "x"}))).await.unwrap();
}

#[tokio::test]
async fn password_change_clears_sessions() {
    let (config, db) = setup();
    let resp = signup(&config, json!({"username": "u1", "password": "p1"})).await.unwrap().response.unwrap();
    let id = resp["objectId"].as_str().unwrap().to_string();
    assert_eq!(db.count("_Session"), 1);

    // master updates leave sessions alone
    rest_write::update(config.clone(), Auth::master(&config), "_User", &id, obj(json!({"password": "p2"}))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(db.count("_Session"), 1);

    rest_write::update(config.clone(), Auth::for_user(&config, id.clone()), "_User", &id, obj(json!({"password": "p3"}))).await.unwrap();
    let probe = db.clone();
    wait_until(move || probe.count("_Session") == 0).await;
    let user = fetch(&db, "_User", &id).await;
    assert!(verify_password(user["_hashed_password"].as_str().unwrap(), "p3"));
}

#[tokio::test]
async fn auth_data_signup_then_login() {
    let (config, db) = setup();
    let first = signup(&config, json!({"authData": {"anonymous": {"id": "anon-1"}}})).await.unwrap();
    assert_eq!(first.status_code(), 201);
    let first_resp = first.response.unwrap();
    let id = first_resp["objectId"].as_str().unwrap().to_string();
    let user = fetch(&db, "_User", &id).await;
    // generated username is a fresh token
    assert_eq!(user["username"].as_str().unwrap().len(), 32);
    let sessions = db.find("_Session", &query_eq("user", pointer("_User", &id)), &FindOptions::default()).await.unwrap();
    assert_eq!(sessions[0]["createdWith"]["authProvider"], "anonymous");

    // same credentials again log into the existing account
    let again = signup(&config, json!({"authData": {"anonymous": {"id": "anon-1"}}})).await.unwrap();
    assert_eq!(again.status_code(), 200);
    assert_eq!(again.location.as_deref(), Some(format!("{}/users/{}", MOUNT, id).as_str()));
    let login = again.response.unwrap();
    assert_eq!(login["objectId"], id.as_str());
    assert!(login["sessionToken"].as_str().unwrap().starts_with("r:"));
    assert_ne!(login["sessionToken"], first_resp["sessionToken"]);
    assert!(login.keys().all(|k| !k.starts_with('_')));
    assert_eq!(db.count("_User"), 1);
    assert_eq!(db.count("_Session"), 2);
}

#[tokio::test]
async fn login_response_expands_files() {
    let (config, db) = setup();
    db.create("_User", &obj(json!({
        "objectId": "u1", "username": "pic",
        "authData": {"anonymous": {"id": "anon-9"}},
        "avatar": {"__type": "File", "name": "me.png"}
    })), &RunOptions::default()).await.unwrap();
    let out = signup(&config, json!({"authData": {"anonymous": {"id": "anon-9"}}})).await.unwrap();
    let resp = out.response.unwrap();
    assert_eq!(resp["avatar"]["url"], format!("{}/files/app1/me.png", MOUNT));
}

#[tokio::test]
async fn auth_data_rejections() {
    let (config, db) = setup();
    let err = signup(&config, json!({"authData": {"twitter": {"id": "t1"}}})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::UnsupportedService);
    let err = signup(&config, json!({"authData": {"anonymous": {"token": "no id"}}})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::UnsupportedService);

    config.auth_data_manager.register("facebook", Arc::new(FnValidator(|data: &Value| {
        if data["access_token"] == "good" { Ok(()) } else { Err(AppError::new(ErrorCode::UnsupportedService, "bad token")) }
    })));
    let err = signup(&config, json!({"authData": {"facebook": {"id": "fb1", "access_token": "bad"}}})).await.unwrap_err();
    assert_eq!(err.message, "bad token");
    signup(&config, json!({"authData": {"facebook": {"id": "fb1", "access_token": "good"}}})).await.unwrap();

    // two accounts already share the id
    for id in ["x1", "x2"] {
        db.create("_User", &obj(json!({"objectId": id, "authData": {"anonymous": {"id": "shared"}}})), &RunOptions::default()).await.unwrap();
    }
    let err = signup(&config, json!({"authData": {"anonymous": {"id": "shared"}}})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::AccountAlreadyLinked);
}

#[tokio::test]
async fn update_with_auth_data_never_logs_in() {
    let (config, db) = setup();
    let linked = signup(&config, json!({"authData": {"anonymous": {"id": "anon-7"}}})).await.unwrap().response.unwrap();
    let linked_id = linked["objectId"].as_str().unwrap().to_string();
    let other = signup(&config, json!({"username": "b", "password": "p"})).await.unwrap().response.unwrap();
    let other_id = other["objectId"].as_str().unwrap().to_string();

    // another account's credentials cannot be attached
    let err = rest_write::update(config.clone(), Auth::master(&config), "_User", &other_id,
        obj(json!({"authData": {"anonymous": {"id": "anon-7"}}}))).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::AccountAlreadyLinked);

    // re-sending your own credentials is a plain update
    let out = rest_write::update(config.clone(), Auth::for_user(&config, linked_id.clone()), "_User", &linked_id,
        obj(json!({"authData": {"anonymous": {"id": "anon-7"}}, "nick": "me"}))).await.unwrap();
    assert_eq!(out.status_code(), 200);
    let resp = out.response.unwrap();
    assert!(resp.get("sessionToken").is_none());
    assert!(resp.contains_key("updatedAt"));
    assert_eq!(fetch(&db, "_User", &linked_id).await["nick"], "me");
}

#[tokio::test]
async fn email_verification_is_sent_after_signup() {
    let mut settings = AppSettings::new("app1", "mk");
    settings.server_url = MOUNT.into();
    settings.public_server_url = Some("https://api.example.com/1".into());
    settings.app_name = Some("Demo".into());
    settings.verify_user_emails = true;
    let mail = Arc::new(LoggingMailAdapter::new());
    let (config, db) = setup_with(settings, Some(mail.clone()));

    let resp = signup(&config, json!({"username": "u1", "password": "p", "email": "u1@example.com"})).await.unwrap().response.unwrap();
    let user = fetch(&db, "_User", resp["objectId"].as_str().unwrap()).await;
    assert_eq!(user["emailVerified"], false);
    let token = user["_email_verify_token"].as_str().unwrap().to_string();

    let probe = mail.clone();
    wait_until(move || !probe.sent().is_empty()).await;
    let sent = mail.sent();
    assert_eq!(sent[0].to, "u1@example.com");
    assert!(sent[0].text.contains("https://api.example.com/1/apps/app1/verify_email?token="));
    assert!(sent[0].text.contains(&token));
}

#[tokio::test]
async fn nested_session_survives_later_failure() {
    // the session row is written before the user row; a failing user insert does not undo it
    let (config, db) = setup();
    let write = RestWrite::new(config.clone(), Auth::nobody(&config), "_User", None,
        obj(json!({"username": "u1", "password": "p", "ACL": {"*unresolved": {"read": true}}})), None).unwrap();
    let err = write.execute().await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidAcl);
    assert_eq!(db.count("_User"), 0);
    assert_eq!(db.count("_Session"), 1);
}
