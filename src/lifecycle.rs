//! Worker lifecycle: install, activate and update adoption.
//!
//! A [`Registration`] tracks which worker version is installing, waiting and
//! active. The [`LifecycleManager`] performs the cache work behind each
//! transition:
//!
//! ```text
//! Uninstalled -> Installing -> Installed (waiting) -> Activating -> Activated
//!                    |                                                  |
//!                    +-- precache failed --> Redundant <-- replaced ----+
//! ```

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::config::CacheConfig;
use crate::error::{Result, WorkerError};
use crate::http::{Request, RequestIdentity, ResponseSnapshot};
use crate::net::Network;

/// Lifecycle state of one worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
  #[default]
  Uninstalled,
  Installing,
  /// Installed and waiting to take control
  Installed,
  Activating,
  Activated,
  /// Failed to install or replaced by a newer version
  Redundant,
}

/// One version of the worker and the cache generations it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerVersion {
  pub version: u32,
  pub primary_cache: String,
  pub runtime_cache: String,
  pub state: WorkerState,
  pub state_changed_at: DateTime<Utc>,
}

impl WorkerVersion {
  pub fn new(config: &CacheConfig) -> Self {
    Self {
      version: config.version,
      primary_cache: config.primary_name(),
      runtime_cache: config.runtime_name.clone(),
      state: WorkerState::Uninstalled,
      state_changed_at: Utc::now(),
    }
  }

  pub fn set_state(&mut self, state: WorkerState) {
    debug!(version = self.version, from = ?self.state, to = ?state, "worker state change");
    self.state = state;
    self.state_changed_at = Utc::now();
  }
}

/// Installing, waiting and active versions for the dashboard scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
  pub installing: Option<WorkerVersion>,
  pub waiting: Option<WorkerVersion>,
  pub active: Option<WorkerVersion>,
  /// Set by a skip-waiting signal or when no controlled page remains
  #[serde(default)]
  pub skip_waiting: bool,
}

impl Registration {
  /// Load persisted registration state; a missing file means nothing is registered.
  pub fn load(path: &Path) -> Result<Self> {
    if !path.exists() {
      return Ok(Self::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| {
      WorkerError::State(format!(
        "Failed to read registration {}: {}",
        path.display(),
        e
      ))
    })?;
    serde_json::from_str(&contents).map_err(|e| {
      WorkerError::State(format!(
        "Failed to parse registration {}: {}",
        path.display(),
        e
      ))
    })
  }

  pub fn save(&self, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| WorkerError::State(format!("Failed to create state directory: {}", e)))?;
    }
    let contents = serde_json::to_string_pretty(self)
      .map_err(|e| WorkerError::State(format!("Failed to encode registration: {}", e)))?;
    std::fs::write(path, contents).map_err(|e| {
      WorkerError::State(format!(
        "Failed to write registration {}: {}",
        path.display(),
        e
      ))
    })
  }

  pub fn is_active(&self, version: u32) -> bool {
    self
      .active
      .as_ref()
      .is_some_and(|w| w.version == version && w.state == WorkerState::Activated)
  }

  /// Whether a waiting version may take control now.
  ///
  /// True on first install (nothing in control) or after a skip-waiting signal.
  pub fn should_activate(&self) -> bool {
    self.waiting.is_some() && (self.active.is_none() || self.skip_waiting)
  }

  /// Explicit update adoption requested by the page.
  ///
  /// Only a version already waiting is released; with nothing waiting the
  /// signal is dropped so it cannot carry over to a later install.
  pub fn request_skip_waiting(&mut self) {
    if self.waiting.is_some() {
      self.skip_waiting = true;
    }
  }

  /// The host reports every controlled page has closed.
  pub fn clients_closed(&mut self) {
    if self.waiting.is_some() {
      self.skip_waiting = true;
    }
  }

  fn begin_install(&mut self, mut worker: WorkerVersion) {
    if let Some(mut stale) = self.installing.take() {
      stale.set_state(WorkerState::Redundant);
    }
    worker.set_state(WorkerState::Installing);
    self.installing = Some(worker);
  }

  fn install_succeeded(&mut self) {
    if let Some(mut worker) = self.installing.take() {
      worker.set_state(WorkerState::Installed);
      if let Some(mut replaced) = self.waiting.replace(worker) {
        replaced.set_state(WorkerState::Redundant);
      }
    }
  }

  fn install_failed(&mut self) {
    if let Some(mut worker) = self.installing.take() {
      worker.set_state(WorkerState::Redundant);
    }
  }

  /// Move the waiting version into control, or re-run activation for the
  /// active version if nothing is waiting.
  fn begin_activation(&mut self) -> Result<WorkerVersion> {
    if let Some(mut worker) = self.waiting.take() {
      if let Some(mut old) = self.active.take() {
        old.set_state(WorkerState::Redundant);
        info!(version = old.version, "previous worker version retired");
      }
      worker.set_state(WorkerState::Activating);
      self.active = Some(worker.clone());
      return Ok(worker);
    }

    match self.active.as_mut() {
      Some(worker) => {
        worker.set_state(WorkerState::Activating);
        Ok(worker.clone())
      }
      None => Err(WorkerError::State(
        "No installed worker to activate".to_string(),
      )),
    }
  }

  fn activation_complete(&mut self) {
    if let Some(worker) = self.active.as_mut() {
      worker.set_state(WorkerState::Activated);
    }
    self.skip_waiting = false;
  }
}

/// Result of an install transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOutcome {
  /// Essential assets stored in the primary generation
  pub assets: usize,
  /// Whether the new version has to wait for the current one to let go
  pub waiting: bool,
}

/// Performs the cache work behind install and activate.
pub struct LifecycleManager<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  origin: Url,
  config: CacheConfig,
}

impl<S: CacheStorage, N: Network> LifecycleManager<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, origin: Url, config: &CacheConfig) -> Self {
    Self {
      storage,
      network,
      origin,
      config: config.clone(),
    }
  }

  /// Install the configured version.
  ///
  /// On failure the version becomes redundant and whatever was active stays
  /// in control; the host retries on the next load.
  pub async fn install(&self, registration: &mut Registration) -> Result<InstallOutcome> {
    if registration.is_active(self.config.version) {
      let assets = self.precache().await?;
      info!(version = self.config.version, "version already active, essential assets refreshed");
      return Ok(InstallOutcome {
        assets,
        waiting: false,
      });
    }

    registration.begin_install(WorkerVersion::new(&self.config));
    info!(version = self.config.version, "installing worker");

    match self.precache().await {
      Ok(assets) => {
        registration.install_succeeded();
        let waiting = !registration.should_activate();
        if waiting {
          info!(version = self.config.version, "installed, waiting for the active version to release control");
        }
        Ok(InstallOutcome { assets, waiting })
      }
      Err(e) => {
        registration.install_failed();
        warn!(version = self.config.version, error = %e, "install failed");
        Err(e)
      }
    }
  }

  /// Fetch every essential asset and store them only if all succeeded.
  pub async fn precache(&self) -> Result<usize> {
    let generation = self.config.primary_name();
    self.storage.open(&generation)?;
    info!(generation = %generation, count = self.config.essential_assets.len(), "caching essential assets");

    let fetches = self
      .config
      .essential_assets
      .iter()
      .map(|path| self.fetch_asset(path));
    let entries = try_join_all(fetches).await?;

    self.storage.put_all(&generation, &entries)?;
    Ok(entries.len())
  }

  async fn fetch_asset(&self, path: &str) -> Result<(RequestIdentity, ResponseSnapshot)> {
    let url = self.origin.join(path).map_err(|e| WorkerError::Install {
      url: path.to_string(),
      reason: e.to_string(),
    })?;
    let request = Request::get(url);

    let response = self
      .network
      .fetch(&request)
      .await
      .map_err(|e| WorkerError::Install {
        url: request.url.to_string(),
        reason: e.to_string(),
      })?;

    if !response.is_cacheable() {
      return Err(WorkerError::Install {
        url: request.url.to_string(),
        reason: format!("unexpected status {}", response.status()),
      });
    }

    Ok((request.identity(), response.into_snapshot()))
  }

  /// Promote the waiting version and evict every other generation.
  pub fn activate(&self, registration: &mut Registration) -> Result<Vec<String>> {
    let worker = registration.begin_activation()?;
    info!(version = worker.version, "activating worker");

    let evicted = self.evict_stale(&worker)?;
    registration.activation_complete();
    info!(version = worker.version, evicted = evicted.len(), "worker activated");
    Ok(evicted)
  }

  /// Delete every generation not owned by `worker`. Returns the deleted names.
  pub fn evict_stale(&self, worker: &WorkerVersion) -> Result<Vec<String>> {
    self.storage.open(&worker.primary_cache)?;
    self.storage.open(&worker.runtime_cache)?;

    let mut evicted = Vec::new();
    for name in self.storage.generations()? {
      if name != worker.primary_cache && name != worker.runtime_cache {
        info!(generation = %name, "deleting stale cache");
        self.storage.delete(&name)?;
        evicted.push(name);
      }
    }
    Ok(evicted)
  }
}
