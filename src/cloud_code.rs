//! Outbound HTTP helper for cloud code.
//!
//! Stateless request/response adapter: encodes the body according to the
//! content type header, never follows redirects unless asked, parses JSON
//! responses when possible and treats any status outside `200..400` as an
//! error carrying the full response.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

static CONTENT_TYPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)content-type").expect("static regex"));
static JSON_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)application/json").expect("static regex"));
static FORM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)application/x-www-form-urlencoded").expect("static regex"));

/// Query string parameters, either structured or already encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    Map(serde_json::Map<String, Value>),
    Query(String),
}

impl Params {
    fn pairs(&self) -> Vec<(String, String)> {
        match self {
            Params::Map(map) => map.iter().map(|(k, v)| (k.clone(), scalar_text(v))).collect(),
            Params::Query(qs) => qs
                .trim_start_matches('?')
                .split('&')
                .filter(|p| !p.is_empty())
                .map(|pair| {
                    let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                    (decode(k), decode(v))
                })
                .collect(),
        }
    }
}

fn decode(s: &str) -> String {
    let spaced = s.replace('+', " ");
    urlencoding::decode(&spaced).map(|c| c.into_owned()).unwrap_or(spaced)
}

fn scalar_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestOptions {
    #[serde(default = "HttpRequestOptions::default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub params: Option<Params>,
    #[serde(default)]
    pub follow_redirects: bool,
}

impl HttpRequestOptions {
    fn default_method() -> String { "GET".to_string() }

    pub fn get(url: impl Into<String>) -> Self {
        Self { method: Self::default_method(), url: url.into(), headers: BTreeMap::new(), body: None, params: None, follow_redirects: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub cookies: Vec<String>,
    pub text: String,
    /// Parsed body when it is valid JSON.
    pub data: Option<Value>,
}

#[derive(Debug, Error)]
pub enum HttpRequestError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request failed with status {}", .0.status)]
    Status(Box<HttpResponse>),
}

/// Serialize an object body according to the single `Content-Type` header:
/// JSON text for `application/json`, `k=v&...` for form encoding. Anything else
/// is returned untouched.
pub fn encode_body(body: Value, headers: &BTreeMap<String, String>) -> Value {
    if !body.is_object() && !body.is_array() { return body; }
    let content_types: Vec<&String> = headers.iter().filter(|(k, _)| CONTENT_TYPE_RE.is_match(k)).map(|(_, v)| v).collect();
    let [content_type] = content_types.as_slice() else { return body; };
    if JSON_RE.is_match(content_type) {
        return Value::String(body.to_string());
    }
    if FORM_RE.is_match(content_type) {
        if let Value::Object(map) = &body {
            let encoded = map
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencoding::encode(&scalar_text(v))))
                .collect::<Vec<_>>()
                .join("&");
            return Value::String(encoded);
        }
    }
    body
}

pub async fn http_request(options: HttpRequestOptions) -> Result<HttpResponse, HttpRequestError> {
    let redirect = if options.follow_redirects { reqwest::redirect::Policy::default() } else { reqwest::redirect::Policy::none() };
    let client = reqwest::Client::builder().redirect(redirect).build()?;
    let method = reqwest::Method::from_bytes(options.method.to_uppercase().as_bytes())
        .map_err(|_| HttpRequestError::InvalidRequest(format!("unsupported method {}", options.method)))?;

    let mut req = client.request(method.clone(), &options.url);
    for (name, value) in options.headers.iter() {
        req = req.header(name.as_str(), value.as_str());
    }
    if let Some(params) = &options.params {
        req = req.query(&params.pairs());
    }
    if let Some(body) = options.body.clone() {
        req = match encode_body(body, &options.headers) {
            Value::String(s) => req.body(s),
            Value::Null => req,
            other => req.body(other.to_string()),
        };
    }

    debug!(target: "basalt::cloud", "http_request {} {}", method, options.url);
    let resp = req.send().await?;
    let status = resp.status().as_u16();
    let mut headers = BTreeMap::new();
    let mut cookies = Vec::new();
    for (name, value) in resp.headers() {
        let Ok(v) = value.to_str() else { continue; };
        if *name == reqwest::header::SET_COOKIE { cookies.push(v.to_string()); }
        headers.insert(name.as_str().to_string(), v.to_string());
    }
    let text = resp.text().await?;
    let data = serde_json::from_str(&text).ok();
    let response = HttpResponse { status, headers, cookies, text, data };
    if !(200..400).contains(&status) {
        return Err(HttpRequestError::Status(Box::new(response)));
    }
    Ok(response)
}
