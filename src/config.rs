use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{Result, WorkerError};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Config {
  /// Backend origin the dashboard is served from
  #[serde(default = "default_origin")]
  pub origin: String,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub routes: RouteConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Where cache storage, the local database and logs live
  /// (defaults to $XDG_DATA_HOME/newscache)
  pub data_dir: Option<PathBuf>,
  /// Per-request network timeout in seconds
  #[serde(default = "default_timeout_secs")]
  pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
  /// Prefix of the primary generation name, e.g. "semiconductor-news"
  pub app_name: String,
  /// Worker version; bumping it creates a new primary generation
  pub version: u32,
  /// Exact primary generation name, replacing `<app>-v<N>`
  pub primary_cache: Option<String>,
  /// Name of the runtime generation filled by network-first requests
  pub runtime_name: String,
  /// Paths that must be cached before a version may activate
  pub essential_assets: Vec<String>,
  /// Document served for offline requests with nothing cached
  pub offline_page: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RouteConfig {
  pub api_prefix: String,
  pub static_prefix: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
  /// Tag the background sync agent answers to
  pub tag: String,
  /// Path fetched when the sync fires
  pub endpoint: String,
  /// Local database name (file stem)
  pub database: String,
  pub database_version: u32,
  /// Object store the fetched records land in
  pub store: String,
  /// Record field used as the object store key
  pub key_path: String,
}

fn default_origin() -> String {
  "http://localhost:5000".to_string()
}

fn default_timeout_secs() -> u64 {
  10
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: default_origin(),
      cache: CacheConfig::default(),
      routes: RouteConfig::default(),
      sync: SyncConfig::default(),
      data_dir: None,
      request_timeout_secs: default_timeout_secs(),
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      app_name: "semiconductor-news".to_string(),
      version: 1,
      primary_cache: None,
      runtime_name: "runtime-cache".to_string(),
      essential_assets: vec![
        "/".to_string(),
        "/static/style.css".to_string(),
        "/static/script.js".to_string(),
        "/static/images/icon-192.png".to_string(),
        "/static/images/icon-512.png".to_string(),
      ],
      offline_page: "/offline.html".to_string(),
    }
  }
}

impl Default for RouteConfig {
  fn default() -> Self {
    Self {
      api_prefix: "/api/".to_string(),
      static_prefix: "/static/".to_string(),
    }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "sync-news".to_string(),
      endpoint: "/api/articles?limit=10".to_string(),
      database: "semiconductor-news".to_string(),
      database_version: 1,
      store: "articles".to_string(),
      key_path: "id".to_string(),
    }
  }
}

impl CacheConfig {
  /// Name of the primary generation, `<app>-v<N>` unless overridden.
  pub fn primary_name(&self) -> String {
    match &self.primary_cache {
      Some(name) => name.clone(),
      None => format!("{}-v{}", self.app_name, self.version),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./newscache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/newscache/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(WorkerError::Config(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("newscache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("newscache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      WorkerError::Config(format!(
        "Failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_yaml(&contents).map_err(|e| match e {
      WorkerError::Config(msg) => WorkerError::Config(format!("{}: {}", path.display(), msg)),
      other => other,
    })
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)
      .map_err(|e| WorkerError::Config(format!("Failed to parse config: {}", e)))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    if self.cache.primary_name() == self.cache.runtime_name {
      return Err(WorkerError::Config(format!(
        "Primary and runtime cache names must differ (both are {})",
        self.cache.runtime_name
      )));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin)
      .map_err(|e| WorkerError::Config(format!("Invalid origin '{}': {}", self.origin, e)))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  /// Resolve the data directory, falling back to the platform data dir.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| WorkerError::Config("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("newscache"))
  }

  /// Get the origin override from the environment, if any.
  pub fn origin_from_env() -> Option<String> {
    std::env::var("NEWSCACHE_ORIGIN").ok()
  }
}
