//! Background sync: refresh recent articles into the local database.

use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};
use url::Url;

use crate::config::SyncConfig;
use crate::db::{Database, Upgrade};
use crate::error::{Result, WorkerError};
use crate::http::Request;
use crate::net::Network;

/// What happened when a sync event fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
  /// The tag belongs to someone else
  Ignored,
  /// Records upserted into the local database
  Synced(usize),
  /// Logged and swallowed; the host decides when to retry
  Failed(String),
}

/// Body of `/api/articles`: either the `{success, articles}` envelope or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ArticlesPayload {
  Envelope {
    #[serde(default = "default_success")]
    success: bool,
    articles: Option<Vec<Value>>,
    error: Option<String>,
  },
  Records(Vec<Value>),
}

fn default_success() -> bool {
  true
}

impl ArticlesPayload {
  fn into_records(self) -> Result<Vec<Value>> {
    match self {
      Self::Records(records) => Ok(records),
      Self::Envelope {
        success: true,
        articles: Some(articles),
        ..
      } => Ok(articles),
      // Any other JSON object, e.g. a proxy or maintenance page
      Self::Envelope {
        success: true,
        articles: None,
        error,
      } => Err(WorkerError::Network(format!(
        "Response has no articles: {}",
        error.unwrap_or_else(|| "missing field".to_string())
      ))),
      Self::Envelope { error, .. } => Err(WorkerError::Network(format!(
        "Backend reported failure: {}",
        error.unwrap_or_else(|| "unknown error".to_string())
      ))),
    }
  }
}

/// Answers sync events for one tag.
pub struct SyncAgent<N: Network> {
  network: Arc<N>,
  origin: Url,
  config: SyncConfig,
  database_path: Option<PathBuf>,
}

impl<N: Network> SyncAgent<N> {
  /// `database_path` of `None` keeps the database in memory (tests, dry runs).
  pub fn new(
    network: Arc<N>,
    origin: Url,
    config: &SyncConfig,
    database_path: Option<PathBuf>,
  ) -> Self {
    Self {
      network,
      origin,
      config: config.clone(),
      database_path,
    }
  }

  pub fn tag(&self) -> &str {
    &self.config.tag
  }

  /// Handle a sync event. Never fails: errors are logged and reported in the outcome.
  pub async fn handle(&self, tag: &str) -> SyncOutcome {
    if tag != self.config.tag {
      debug!(tag, "ignoring sync for unknown tag");
      return SyncOutcome::Ignored;
    }

    match self.sync().await {
      Ok(count) => {
        info!(tag, count, "background sync complete");
        SyncOutcome::Synced(count)
      }
      Err(e) => {
        error!(tag, error = %e, "background sync failed");
        SyncOutcome::Failed(e.to_string())
      }
    }
  }

  async fn sync(&self) -> Result<usize> {
    let url = self.origin.join(&self.config.endpoint).map_err(|e| {
      WorkerError::Config(format!(
        "Invalid sync endpoint '{}': {}",
        self.config.endpoint, e
      ))
    })?;

    let response = self.network.fetch(&Request::get(url)).await?;
    let records = response.json::<ArticlesPayload>()?.into_records()?;

    let mut db = self.open_database()?;
    db.put_all(&self.config.store, &records)
  }

  /// Open the local database, creating the object store on first open or upgrade.
  pub fn open_database(&self) -> Result<Database> {
    let (store, key_path) = (self.config.store.as_str(), self.config.key_path.as_str());
    let version = self.config.database_version;

    match &self.database_path {
      Some(path) => Database::open(path, version, |u| ensure_store(u, store, key_path)),
      None => Database::open_in_memory(version, |u| ensure_store(u, store, key_path)),
    }
  }
}

fn ensure_store(upgrade: &Upgrade<'_>, store: &str, key_path: &str) -> Result<()> {
  if !upgrade.contains_store(store)? {
    upgrade.create_object_store(store, key_path)?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::testing::FakeNetwork;
  use serde_json::json;

  const ORIGIN: &str = "http://localhost:5000";
  const ENDPOINT: &str = "http://localhost:5000/api/articles?limit=10";

  fn agent(network: &Arc<FakeNetwork>, dir: &tempfile::TempDir) -> SyncAgent<FakeNetwork> {
    SyncAgent::new(
      Arc::clone(network),
      Url::parse(ORIGIN).unwrap(),
      &SyncConfig::default(),
      Some(Database::path_in(dir.path(), "semiconductor-news")),
    )
  }

  #[tokio::test]
  async fn test_sync_upserts_envelope_articles() {
    let dir = tempfile::tempdir().unwrap();
    let body = json!({
      "success": true,
      "articles": [{"id": 1, "title": "A"}, {"id": 2, "title": "B"}],
      "page": 1,
      "limit": 10,
      "total": 2
    })
    .to_string();
    let network = Arc::new(FakeNetwork::new().with_route(ENDPOINT, 200, &body));
    let agent = agent(&network, &dir);

    assert_eq!(agent.handle("sync-news").await, SyncOutcome::Synced(2));

    network.route(ENDPOINT, 200, r#"[{"id": 1, "title": "A2"}]"#);
    assert_eq!(agent.handle("sync-news").await, SyncOutcome::Synced(1));

    let db = agent.open_database().unwrap();
    assert_eq!(db.count("articles").unwrap(), 2);
    assert_eq!(db.get("articles", &json!(1)).unwrap().unwrap()["title"], "A2");
  }

  #[tokio::test]
  async fn test_unknown_tag_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let network = Arc::new(FakeNetwork::new());
    let agent = agent(&network, &dir);

    assert_eq!(agent.handle("sync-bookmarks").await, SyncOutcome::Ignored);
    assert_eq!(network.calls(), 0);
  }

  #[tokio::test]
  async fn test_network_failure_is_swallowed() {
    let dir = tempfile::tempdir().unwrap();
    let network = Arc::new(FakeNetwork::new());
    network.set_online(false);
    let agent = agent(&network, &dir);

    assert!(matches!(agent.handle("sync-news").await, SyncOutcome::Failed(_)));
  }

  #[tokio::test]
  async fn test_backend_failure_envelope_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let network = Arc::new(FakeNetwork::new().with_route(
      ENDPOINT,
      500,
      r#"{"success": false, "error": "db down"}"#,
    ));
    let agent = agent(&network, &dir);

    match agent.handle("sync-news").await {
      SyncOutcome::Failed(msg) => assert!(msg.contains("db down")),
      other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(agent.open_database().unwrap().count("articles").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_object_without_articles_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let network = Arc::new(FakeNetwork::new().with_route(
      ENDPOINT,
      200,
      r#"{"message": "maintenance"}"#,
    ));
    let agent = agent(&network, &dir);

    assert!(matches!(agent.handle("sync-news").await, SyncOutcome::Failed(_)));

    network.route(ENDPOINT, 200, "{}");
    assert!(matches!(agent.handle("sync-news").await, SyncOutcome::Failed(_)));
    assert_eq!(agent.open_database().unwrap().count("articles").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_empty_article_list_is_a_success() {
    let dir = tempfile::tempdir().unwrap();
    let network = Arc::new(FakeNetwork::new().with_route(
      ENDPOINT,
      200,
      r#"{"success": true, "articles": [], "total": 0}"#,
    ));
    let agent = agent(&network, &dir);

    assert_eq!(agent.handle("sync-news").await, SyncOutcome::Synced(0));
  }

  #[tokio::test]
  async fn test_non_json_body_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let network = Arc::new(FakeNetwork::new().with_route(ENDPOINT, 502, "<html>bad gateway</html>"));
    let agent = agent(&network, &dir);

    assert!(matches!(agent.handle("sync-news").await, SyncOutcome::Failed(_)));
  }

  #[tokio::test]
  async fn test_record_without_id_fails_batch() {
    let dir = tempfile::tempdir().unwrap();
    let network = Arc::new(FakeNetwork::new().with_route(
      ENDPOINT,
      200,
      r#"{"success": true, "articles": [{"id": 1}, {"title": "no id"}]}"#,
    ));
    let agent = agent(&network, &dir);

    assert!(matches!(agent.handle("sync-news").await, SyncOutcome::Failed(_)));
    assert_eq!(agent.open_database().unwrap().count("articles").unwrap(), 0);
  }
}
