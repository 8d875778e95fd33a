//! Cache layer that orchestrates caching strategies with network fetching.

use std::sync::Arc;
use tracing::{debug, error, warn};

use super::traits::CacheStorage;
use crate::error::Result;
use crate::http::{Request, RequestIdentity, Response, ResponseSource};
use crate::net::Network;

/// Cache layer that serves intercepted requests.
///
/// Static assets go through [`CacheLayer::cache_first`] against the primary
/// generation; API calls and documents go through [`CacheLayer::network_first`]
/// against the runtime generation.
pub struct CacheLayer<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  /// Generation pre-populated at install and used for static assets
  primary: String,
  /// Generation filled by network-first responses
  runtime: String,
  /// Path of the document served when offline with nothing cached
  offline_page: String,
}

impl<S: CacheStorage, N: Network> CacheLayer<S, N> {
  pub fn new(
    storage: Arc<S>,
    network: Arc<N>,
    primary: impl Into<String>,
    runtime: impl Into<String>,
    offline_page: impl Into<String>,
  ) -> Self {
    Self {
      storage,
      network,
      primary: primary.into(),
      runtime: runtime.into(),
      offline_page: offline_page.into(),
    }
  }

  pub fn primary(&self) -> &str {
    &self.primary
  }

  pub fn runtime(&self) -> &str {
    &self.runtime
  }

  /// Serve from the primary generation, falling back to the network.
  ///
  /// 1. Hit in the primary generation - return it, no network call
  /// 2. Miss or unreadable cache - fetch; a 200 is duplicated and stored
  /// 3. Network failure - propagated, there is no offline substitute
  pub async fn cache_first(&self, request: &Request) -> Result<Response> {
    let identity = request.identity();

    // Check cache first
    match self.storage.match_in(&self.primary, &identity) {
      Ok(Some(snapshot)) => {
        debug!(url = %request.url, generation = %self.primary, "cache hit");
        return Ok(Response::from_snapshot(snapshot, ResponseSource::Cache));
      }
      Ok(None) => debug!(url = %request.url, generation = %self.primary, "cache miss"),
      Err(e) => warn!(url = %request.url, error = %e, "cache lookup failed, fetching"),
    }

    let response = self.network.fetch(request).await.map_err(|e| {
      error!(url = %request.url, error = %e, "request failed");
      e
    })?;

    if response.is_cacheable() {
      self.store(&self.primary, &identity, &response);
    }
    Ok(response)
  }

  /// Try the network first, falling back to cached copies and finally the
  /// offline document. Never fails.
  pub async fn network_first(&self, request: &Request) -> Response {
    let identity = request.identity();

    match self.network.fetch(request).await {
      Ok(response) => {
        // Only complete 200 responses are worth replaying offline
        if response.is_cacheable() {
          self.store(&self.runtime, &identity, &response);
        }
        response
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "network unavailable, serving from cache");
        self.offline_fallback(request, &identity)
      }
    }
  }

  /// Store a duplicate of the response; the original goes back to the caller.
  ///
  /// Write failures are logged only, the caller still gets its response.
  fn store(&self, generation: &str, identity: &RequestIdentity, response: &Response) {
    let snapshot = response.duplicate().into_snapshot();
    match self.storage.put(generation, identity, &snapshot) {
      Ok(()) => debug!(url = %identity.url, generation, "cached"),
      Err(e) => warn!(url = %identity.url, generation, error = %e, "failed to cache response"),
    }
  }

  fn offline_fallback(&self, request: &Request, identity: &RequestIdentity) -> Response {
    // Runtime copy from an earlier online visit
    match self.storage.match_in(&self.runtime, identity) {
      Ok(Some(snapshot)) => return Response::from_snapshot(snapshot, ResponseSource::Cache),
      Ok(None) => {}
      Err(e) => warn!(url = %request.url, error = %e, "runtime cache lookup failed"),
    }

    // Anything precached, e.g. the dashboard shell
    match self.storage.match_any(identity) {
      Ok(Some(snapshot)) => return Response::from_snapshot(snapshot, ResponseSource::Cache),
      Ok(None) => {}
      Err(e) => warn!(url = %request.url, error = %e, "cache lookup failed"),
    }

    // Nothing for this request, serve the offline page instead
    match request.url.join(&self.offline_page) {
      Ok(offline_url) => match self.storage.match_any(&RequestIdentity::get(&offline_url)) {
        Ok(Some(snapshot)) => {
          debug!(url = %request.url, "serving cached offline page");
          return Response::from_snapshot(snapshot, ResponseSource::Offline);
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "offline page lookup failed"),
      },
      Err(e) => warn!(page = %self.offline_page, error = %e, "invalid offline page path"),
    }

    debug!(url = %request.url, "nothing cached, serving built-in offline document");
    Response::offline_document()
  }
}

impl<S: CacheStorage, N: Network> Clone for CacheLayer<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      primary: self.primary.clone(),
      runtime: self.runtime.clone(),
      offline_page: self.offline_page.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::error::WorkerError;
  use crate::http::ResponseSnapshot;
  use crate::net::testing::FakeNetwork;
  use url::Url;

  const ORIGIN: &str = "http://localhost:5000";

  fn url(path: &str) -> Url {
    Url::parse(&format!("{}{}", ORIGIN, path)).unwrap()
  }

  type Fixture = (
    CacheLayer<SqliteStorage, FakeNetwork>,
    Arc<SqliteStorage>,
    Arc<FakeNetwork>,
  );

  fn layer(network: FakeNetwork) -> Fixture {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(network);
    let layer = CacheLayer::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      "news-v2",
      "news-runtime",
      "/offline.html",
    );
    (layer, storage, network)
  }

  /// Storage whose lookups always fail; writes go through.
  struct UnreadableStorage(SqliteStorage);

  impl CacheStorage for UnreadableStorage {
    fn open(&self, generation: &str) -> Result<()> {
      self.0.open(generation)
    }

    fn has(&self, generation: &str) -> Result<bool> {
      self.0.has(generation)
    }

    fn generations(&self) -> Result<Vec<String>> {
      self.0.generations()
    }

    fn delete(&self, generation: &str) -> Result<bool> {
      self.0.delete(generation)
    }

    fn match_in(&self, _: &str, _: &RequestIdentity) -> Result<Option<ResponseSnapshot>> {
      Err(WorkerError::CacheStorage("disk I/O error".to_string()))
    }

    fn match_any(&self, _: &RequestIdentity) -> Result<Option<ResponseSnapshot>> {
      Err(WorkerError::CacheStorage("disk I/O error".to_string()))
    }

    fn put(
      &self,
      generation: &str,
      identity: &RequestIdentity,
      snapshot: &ResponseSnapshot,
    ) -> Result<()> {
      self.0.put(generation, identity, snapshot)
    }

    fn put_all(
      &self,
      generation: &str,
      entries: &[(RequestIdentity, ResponseSnapshot)],
    ) -> Result<()> {
      self.0.put_all(generation, entries)
    }

    fn keys(&self, generation: &str) -> Result<Vec<RequestIdentity>> {
      self.0.keys(generation)
    }
  }

  #[tokio::test]
  async fn test_cache_first_fetches_once_then_serves_cache() {
    let (layer, storage, network) =
      layer(FakeNetwork::new().with_route(url("/static/style.css").as_str(), 200, "css"));
    let request = Request::get(url("/static/style.css"));

    let first = layer.cache_first(&request).await.unwrap();
    assert_eq!(first.source(), ResponseSource::Network);
    assert_eq!(network.calls(), 1);
    assert_eq!(storage.entry_count("news-v2").unwrap(), 1);

    let second = layer.cache_first(&request).await.unwrap();
    assert_eq!(second.source(), ResponseSource::Cache);
    assert_eq!(second.body(), b"css");
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_unreadable_cache_falls_through_to_network() {
    let storage = Arc::new(UnreadableStorage(SqliteStorage::open_in_memory().unwrap()));
    let network = Arc::new(
      FakeNetwork::new().with_route(url("/static/script.js").as_str(), 200, "init();"),
    );
    let layer = CacheLayer::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      "news-v2",
      "news-runtime",
      "/offline.html",
    );

    let response = layer
      .cache_first(&Request::get(url("/static/script.js")))
      .await
      .unwrap();
    assert_eq!(response.source(), ResponseSource::Network);
    assert_eq!(response.body(), b"init();");
    assert_eq!(network.calls(), 1);
    assert_eq!(storage.0.entry_count("news-v2").unwrap(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let (layer, storage, network) = layer(FakeNetwork::new());
    let request = Request::get(url("/static/missing.png"));

    let response = layer.cache_first(&request).await.unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(storage.entry_count("news-v2").unwrap(), 0);

    layer.cache_first(&request).await.unwrap();
    assert_eq!(network.calls(), 2);
  }

  #[tokio::test]
  async fn test_cache_first_propagates_network_failure() {
    let (layer, storage, network) = layer(FakeNetwork::new());
    network.set_online(false);

    let err = layer
      .cache_first(&Request::get(url("/static/script.js")))
      .await
      .unwrap_err();
    assert!(err.is_network());
    assert!(storage.generations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_network_first_caches_200_in_runtime_generation() {
    let body = r#"{"success":true,"articles":[{"id":1}]}"#;
    let (layer, storage, network) =
      layer(FakeNetwork::new().with_route(url("/api/articles").as_str(), 200, body));
    let request = Request::get(url("/api/articles"));

    let online = layer.network_first(&request).await;
    assert_eq!(online.source(), ResponseSource::Network);
    assert_eq!(storage.entry_count("news-runtime").unwrap(), 1);
    assert_eq!(storage.entry_count("news-v2").unwrap(), 0);

    network.set_online(false);
    let offline = layer.network_first(&request).await;
    assert_eq!(offline.source(), ResponseSource::Cache);
    assert_eq!(offline.status(), 200);
    assert_eq!(offline.body(), body.as_bytes());
  }

  #[tokio::test]
  async fn test_network_first_always_hits_network_when_online() {
    let (layer, _storage, network) =
      layer(FakeNetwork::new().with_route(url("/api/stats").as_str(), 200, "v1"));
    let request = Request::get(url("/api/stats"));

    layer.network_first(&request).await;
    network.route(url("/api/stats").as_str(), 200, "v2");
    let response = layer.network_first(&request).await;

    assert_eq!(network.calls(), 2);
    assert_eq!(response.body(), b"v2");
  }

  #[tokio::test]
  async fn test_network_first_skips_non_200() {
    let (layer, storage, _network) =
      layer(FakeNetwork::new().with_route(url("/api/trends").as_str(), 500, "boom"));

    let response = layer.network_first(&Request::get(url("/api/trends"))).await;
    assert_eq!(response.status(), 500);
    assert_eq!(storage.entry_count("news-runtime").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_network_first_offline_without_cache_serves_offline_document() {
    let (layer, storage, network) = layer(FakeNetwork::new());
    network.set_online(false);

    let response = layer.network_first(&Request::get(url("/api/bookmarks"))).await;
    assert_eq!(response.source(), ResponseSource::Offline);
    assert_eq!(response.status(), 503);
    assert!(storage.generations().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_network_first_prefers_cached_offline_page() {
    let (layer, storage, network) = layer(FakeNetwork::new());
    let page = Response::new(200, vec![], "<h1>offline</h1>").into_snapshot();
    storage
      .put("news-v2", &RequestIdentity::get(&url("/offline.html")), &page)
      .unwrap();
    network.set_online(false);

    let response = layer.network_first(&Request::get(url("/settings"))).await;
    assert_eq!(response.source(), ResponseSource::Offline);
    assert_eq!(response.body(), b"<h1>offline</h1>");
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_precached_document() {
    let (layer, storage, network) = layer(FakeNetwork::new());
    let index = Response::new(200, vec![], "<html>dashboard</html>").into_snapshot();
    storage
      .put("news-v2", &RequestIdentity::get(&url("/")), &index)
      .unwrap();
    network.set_online(false);

    let response = layer.network_first(&Request::get(url("/"))).await;
    assert_eq!(response.source(), ResponseSource::Cache);
    assert_eq!(response.body(), b"<html>dashboard</html>");
  }
}
