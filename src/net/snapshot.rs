//! Transport-neutral request and response values passed through the interceptor.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use url::Url;

/// Headers that describe a single connection and are never stored or forwarded.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
  "host",
  "content-length",
];

pub fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// An intercepted outbound request, fully buffered.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  /// POST with a JSON body
  pub fn post_json(url: Url, payload: &Value) -> Self {
    Self::new(Method::POST, url)
      .with_header("content-type", "application/json")
      .with_body(payload.to_string())
  }

  /// Cache key: method and full URL, query string included.
  pub fn cache_key(&self) -> String {
    format!("{} {}", self.method, self.url)
  }

  /// SHA256 of the cache key, for stable fixed-length storage keys
  pub fn key_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.cache_key().as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Only network-reachable schemes are ever cached.
  pub fn has_network_scheme(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }
}

/// A complete response held in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ResponseSnapshot {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn json(status: u16, value: &Value) -> Self {
    Self {
      status,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: value.to_string().into_bytes(),
    }
  }

  /// Body returned for a sale queued in the outbox.
  pub fn offline_accepted() -> Self {
    Self::json(
      200,
      &json!({
        "success": true,
        "offline": true,
        "message": "Sale stored offline. It will be synchronized when the connection returns.",
      }),
    )
  }

  /// Body returned when neither network nor cache can answer.
  pub fn offline_error() -> Self {
    Self::json(
      503,
      &json!({
        "success": false,
        "offline": true,
        "error": "No internet connection",
      }),
    )
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  #[cfg(test)]
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  #[cfg(test)]
  pub fn json_body(&self) -> Option<Value> {
    serde_json::from_slice(&self.body).ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_includes_method_and_query() {
    let url = Url::parse("http://pos.local/api/v1/productos/?q=agua").unwrap();
    let get = Request::get(url.clone());
    let head = Request::new(Method::HEAD, url);
    assert_eq!(get.cache_key(), "GET http://pos.local/api/v1/productos/?q=agua");
    assert_ne!(get.key_hash(), head.key_hash());
    assert_eq!(get.key_hash().len(), 64);
  }

  #[test]
  fn test_non_http_scheme_is_not_network() {
    let req = Request::get(Url::parse("chrome-extension://abc/script.js").unwrap());
    assert!(!req.has_network_scheme());
  }

  #[test]
  fn test_synthesized_bodies() {
    let accepted = ResponseSnapshot::offline_accepted();
    assert_eq!(accepted.status, 200);
    let body = accepted.json_body().unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["offline"], true);
    assert!(body["message"].is_string());

    let error = ResponseSnapshot::offline_error();
    assert_eq!(error.status, 503);
    let body = error.json_body().unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["offline"], true);
    assert!(body["error"].is_string());
    assert_eq!(error.header("Content-Type"), Some("application/json"));
  }

  #[test]
  fn test_hop_by_hop_is_case_insensitive() {
    assert!(is_hop_by_hop("Transfer-Encoding"));
    assert!(!is_hop_by_hop("content-type"));
  }
}
