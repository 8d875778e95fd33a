//! Request and response values that flow through the caching layer.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{Result, WorkerError};

/// Body served when the network is down and nothing usable is cached.
const OFFLINE_BODY: &str = "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>Offline</h1><p>The news feed is unavailable while you are offline.</p></body></html>\n";

/// An outgoing request intercepted from the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Only GET requests ever touch the cache.
  pub fn is_cacheable(&self) -> bool {
    self.method == Method::GET
  }

  pub fn identity(&self) -> RequestIdentity {
    RequestIdentity::new(self.method.as_str(), self.url.as_str())
  }
}

/// The (method, URL) pair used as a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestIdentity {
  pub method: String,
  pub url: String,
}

impl RequestIdentity {
  pub fn new(method: &str, url: &str) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url: url.to_string(),
    }
  }

  pub fn get(url: &Url) -> Self {
    Self::new("GET", url.as_str())
  }

  /// Stable fixed-length key for storage rows.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Where a response handed back to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// Served from a cache generation
  Cache,
  /// Synthesised offline document
  Offline,
}

/// A network response.
///
/// The body is treated as single-read: anything that wants to keep a copy
/// (the cache) must call [`Response::duplicate`] before consuming it, so the
/// original can still be handed to the caller.
#[derive(Debug, PartialEq, Eq)]
pub struct Response {
  status: u16,
  headers: Vec<(String, String)>,
  body: Vec<u8>,
  source: ResponseSource,
}

impl Response {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers,
      body: body.into(),
      source: ResponseSource::Network,
    }
  }

  /// Rebuild a response from a stored snapshot.
  pub fn from_snapshot(snapshot: ResponseSnapshot, source: ResponseSource) -> Self {
    Self {
      status: snapshot.status,
      headers: snapshot.headers,
      body: snapshot.body,
      source,
    }
  }

  /// Last-resort document for navigations made while offline.
  pub fn offline_document() -> Self {
    Self {
      status: 503,
      headers: vec![(
        "content-type".to_string(),
        "text/html; charset=utf-8".to_string(),
      )],
      body: OFFLINE_BODY.as_bytes().to_vec(),
      source: ResponseSource::Offline,
    }
  }

  pub fn status(&self) -> u16 {
    self.status
  }

  pub fn headers(&self) -> &[(String, String)] {
    &self.headers
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn body(&self) -> &[u8] {
    &self.body
  }

  pub fn source(&self) -> ResponseSource {
    self.source
  }

  /// Only exact 200 responses are stored; errors and partial content never are.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }

  /// Duplicate the response so one copy can be stored and the other returned.
  pub fn duplicate(&self) -> Self {
    Self {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
      source: self.source,
    }
  }

  /// Consume the response into an immutable snapshot stamped with the current time.
  pub fn into_snapshot(self) -> ResponseSnapshot {
    ResponseSnapshot {
      status: self.status,
      headers: self.headers,
      body: self.body,
      cached_at: Utc::now(),
    }
  }

  pub fn into_body(self) -> Vec<u8> {
    self.body
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_slice(&self.body)
      .map_err(|e| WorkerError::Network(format!("Failed to decode JSON body: {}", e)))
  }
}

/// Immutable capture of a response at the time it was cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub cached_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_only_get_is_cacheable() {
    let get = Request::get(url("http://localhost/api/articles"));
    let post = Request::new(Method::POST, url("http://localhost/api/bookmarks"));
    assert!(get.is_cacheable());
    assert!(!post.is_cacheable());
  }

  #[test]
  fn test_identity_hash_depends_on_method_and_url() {
    let a = RequestIdentity::new("get", "http://localhost/static/style.css");
    let b = RequestIdentity::new("GET", "http://localhost/static/style.css");
    let c = RequestIdentity::new("HEAD", "http://localhost/static/style.css");
    let d = RequestIdentity::new("GET", "http://localhost/static/script.js");

    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
    assert_ne!(a.cache_hash(), c.cache_hash());
    assert_ne!(a.cache_hash(), d.cache_hash());
    assert_eq!(a.cache_hash().len(), 64);
  }

  #[test]
  fn test_duplicate_keeps_original_readable() {
    let response = Response::new(200, vec![("etag".into(), "abc".into())], "hello");
    let snapshot = response.duplicate().into_snapshot();

    assert_eq!(response.body(), b"hello");
    assert_eq!(snapshot.body, b"hello");
    assert_eq!(snapshot.status, 200);
    assert_eq!(response.header("ETag"), Some("abc"));
  }

  #[test]
  fn test_only_exact_200_is_cacheable() {
    assert!(Response::new(200, vec![], "").is_cacheable());
    assert!(!Response::new(204, vec![], "").is_cacheable());
    assert!(!Response::new(206, vec![], "").is_cacheable());
    assert!(!Response::new(404, vec![], "").is_cacheable());
    assert!(!Response::new(500, vec![], "").is_cacheable());
  }

  #[test]
  fn test_offline_document() {
    let response = Response::offline_document();
    assert_eq!(response.status(), 503);
    assert_eq!(response.source(), ResponseSource::Offline);
    assert!(response.text().contains("Offline"));
  }
}
