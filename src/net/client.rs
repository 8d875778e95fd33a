use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::Network;
use crate::error::{Result, WorkerError};
use crate::http::{Request, Response};

/// reqwest-backed network for a real backend origin.
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
  origin: Url,
}

impl HttpClient {
  pub fn new(origin: Url, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("newscache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| WorkerError::Network(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self { client, origin })
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  /// Resolve a dashboard path such as `/api/articles` against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| WorkerError::Network(format!("Invalid request path '{}': {}", path, e)))
  }
}

#[async_trait]
impl Network for HttpClient {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| WorkerError::Network(format!("{} {}: {}", request.method, request.url, e)))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(|e| {
      WorkerError::Network(format!(
        "Failed to read body of {} {}: {}",
        request.method, request.url, e
      ))
    })?;

    debug!(method = %request.method, url = %request.url, status, "fetched");
    Ok(Response::new(status, headers, body.to_vec()))
  }
}
