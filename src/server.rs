//!
//! basalt HTTP server
//! ------------------
//! Axum frontend mounting the write pipeline.
//!
//! Responsibilities:
//! - Resolve the application from `X-Application-Id` through the `AppCache`.
//! - Build the caller's `Auth` from `X-Master-Key`, `X-Session-Token` and
//!   `X-Installation-Id`.
//! - `POST` creates and `PUT` updates objects of a class, users, sessions and
//!   installations.
//! - Map results to status, `Location` header and JSON body; errors become
//!   `{"code": n, "error": "..."}`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{AppCache, Config};
use crate::error::{AppError, AppResult};
use crate::identity::{auth_for_session_token, Auth};
use crate::rest_write::{self, WriteResponse};
use crate::storage::Object;

pub const APP_ID_HEADER: &str = "x-application-id";
pub const MASTER_KEY_HEADER: &str = "x-master-key";
pub const SESSION_TOKEN_HEADER: &str = "x-session-token";
pub const INSTALLATION_ID_HEADER: &str = "x-installation-id";
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub cache: AppCache,
    /// Public root of the REST API, e.g. `http://localhost:1337/1`.
    pub mount: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
        (status, Json(json!({ "code": self.code.as_i32(), "error": self.message }))).into_response()
    }
}

fn unauthorized() -> Response {
    (StatusCode::FORBIDDEN, Json(json!({ "error": "unauthorized" }))).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|s| !s.is_empty())
}

/// Resolved application plus caller identity.
struct Caller {
    config: Arc<Config>,
    auth: Auth,
}

async fn resolve_caller(state: &AppState, headers: &HeaderMap) -> Result<Caller, Response> {
    let Some(app_id) = header_str(headers, APP_ID_HEADER) else { return Err(unauthorized()); };
    let config = state.cache.config(app_id, &state.mount);
    if !config.is_valid() {
        debug!(target: "basalt::server", "unknown application id '{}'", app_id);
        return Err(unauthorized());
    }
    let config = Arc::new(config);
    let installation_id = header_str(headers, INSTALLATION_ID_HEADER).map(str::to_string);

    if let Some(key) = header_str(headers, MASTER_KEY_HEADER) {
        if key != config.settings.master_key { return Err(unauthorized()); }
        let auth = Auth::master(&config).with_installation_id(installation_id);
        return Ok(Caller { config, auth });
    }
    let auth = match header_str(headers, SESSION_TOKEN_HEADER) {
        Some(token) => auth_for_session_token(&config, token, installation_id).await.map_err(IntoResponse::into_response)?,
        None => Auth::nobody(&config).with_installation_id(installation_id),
    };
    Ok(Caller { config, auth })
}

fn body_object(body: Value) -> AppResult<Object> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::invalid_key("request body must be a JSON object")),
    }
}

fn reply(request_id: &str, result: AppResult<WriteResponse>) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID_HEADER, v);
    }
    match result {
        Ok(written) => {
            let status = StatusCode::from_u16(written.status_code()).unwrap_or(StatusCode::OK);
            if let Some(loc) = written.location.as_deref().and_then(|l| HeaderValue::from_str(l).ok()) {
                headers.insert(header::LOCATION, loc);
            }
            (status, headers, Json(Value::Object(written.response.unwrap_or_default()))).into_response()
        }
        Err(e) => {
            warn!(target: "basalt::server", "request {} failed: {}", request_id, e);
            (headers, e).into_response()
        }
    }
}

async fn handle_create(state: AppState, headers: HeaderMap, class_name: String, body: Value) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    info!(target: "basalt::server", "request {} POST {}", request_id, class_name);
    let caller = match resolve_caller(&state, &headers).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let result = match body_object(body) {
        Ok(data) => rest_write::create(caller.config, caller.auth, &class_name, data).await,
        Err(e) => Err(e),
    };
    reply(&request_id, result)
}

async fn handle_update(state: AppState, headers: HeaderMap, class_name: String, object_id: String, body: Value) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    info!(target: "basalt::server", "request {} PUT {}/{}", request_id, class_name, object_id);
    let caller = match resolve_caller(&state, &headers).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let result = match body_object(body) {
        Ok(data) => rest_write::update(caller.config, caller.auth, &class_name, &object_id, data).await,
        Err(e) => Err(e),
    };
    reply(&request_id, result)
}

async fn create_object(State(state): State<AppState>, headers: HeaderMap, Path(class_name): Path<String>, Json(body): Json<Value>) -> Response {
    handle_create(state, headers, class_name, body).await
}

async fn update_object(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((class_name, object_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    handle_update(state, headers, class_name, object_id, body).await
}

async fn create_user(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    handle_create(state, headers, "_User".into(), body).await
}

async fn update_user(State(state): State<AppState>, headers: HeaderMap, Path(object_id): Path<String>, Json(body): Json<Value>) -> Response {
    handle_update(state, headers, "_User".into(), object_id, body).await
}

async fn create_session(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    handle_create(state, headers, "_Session".into(), body).await
}

async fn update_session(State(state): State<AppState>, headers: HeaderMap, Path(object_id): Path<String>, Json(body): Json<Value>) -> Response {
    handle_update(state, headers, "_Session".into(), object_id, body).await
}

async fn create_installation(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    handle_create(state, headers, "_Installation".into(), body).await
}

async fn update_installation(State(state): State<AppState>, headers: HeaderMap, Path(object_id): Path<String>, Json(body): Json<Value>) -> Response {
    handle_update(state, headers, "_Installation".into(), object_id, body).await
}

/// All routes, relative to the mount point.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "basalt ok" }))
        .route("/classes/{class_name}", post(create_object))
        .route("/classes/{class_name}/{object_id}", axum::routing::put(update_object))
        .route("/users", post(create_user))
        .route("/users/{object_id}", axum::routing::put(update_user))
        .route("/sessions", post(create_session))
        .route("/sessions/{object_id}", axum::routing::put(update_session))
        .route("/installations", post(create_installation))
        .route("/installations/{object_id}", axum::routing::put(update_installation))
        .with_state(state)
}

/// Serve `state` on `0.0.0.0:{http_port}` until the process exits.
pub async fn run_with_port(http_port: u16, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", http_port).parse()?;
    info!(target: "basalt::server", "Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
