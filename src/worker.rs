//! Event dispatcher: routes host lifecycle events to the caching components.

use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{CacheLayer, CacheStorage};
use crate::config::Config;
use crate::error::{Result, WorkerError};
use crate::http::{Request, Response};
use crate::lifecycle::{InstallOutcome, LifecycleManager, Registration};
use crate::net::Network;
use crate::strategy::{Strategy, StrategySelector};
use crate::sync::{SyncAgent, SyncOutcome};

/// Messages the page can post to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  /// Take control without waiting for open pages to close
  SkipWaiting,
}

impl WorkerMessage {
  /// Parse a JSON message such as `{"type": "SKIP_WAITING"}`.
  pub fn parse(raw: &str) -> Result<Self> {
    serde_json::from_str(raw).map_err(|e| WorkerError::Message(format!("{}: {}", raw, e)))
  }
}

/// Events raised by the host environment.
#[derive(Debug)]
pub enum WorkerEvent {
  Install,
  Activate,
  Fetch(Request),
  Sync { tag: String },
  Message(WorkerMessage),
}

/// What an event produced once the host has awaited it.
#[derive(Debug)]
pub enum EventOutcome {
  Installed(InstallOutcome),
  /// Activation finished; names of the evicted generations
  Activated { evicted: Vec<String> },
  Response(Response),
  Synced(SyncOutcome),
  /// Message handled, nothing else to report
  Acknowledged,
}

/// The caching worker for one dashboard origin.
pub struct ServiceWorker<S: CacheStorage, N: Network> {
  selector: StrategySelector,
  layer: CacheLayer<S, N>,
  lifecycle: LifecycleManager<S, N>,
  sync: SyncAgent<N>,
  network: Arc<N>,
  registration: Registration,
}

impl<S: CacheStorage, N: Network> ServiceWorker<S, N> {
  /// Build a worker from configuration.
  ///
  /// `database_path` is where background-synced records are stored; `None`
  /// keeps them in memory.
  pub fn new(
    config: &Config,
    storage: Arc<S>,
    network: Arc<N>,
    registration: Registration,
    database_path: Option<PathBuf>,
  ) -> Result<Self> {
    let origin = config.origin_url()?;

    Ok(Self {
      selector: StrategySelector::new(&config.routes),
      layer: CacheLayer::new(
        Arc::clone(&storage),
        Arc::clone(&network),
        config.cache.primary_name(),
        config.cache.runtime_name.clone(),
        config.cache.offline_page.clone(),
      ),
      lifecycle: LifecycleManager::new(
        storage,
        Arc::clone(&network),
        origin.clone(),
        &config.cache,
      ),
      sync: SyncAgent::new(Arc::clone(&network), origin, &config.sync, database_path),
      network,
      registration,
    })
  }

  pub fn registration(&self) -> &Registration {
    &self.registration
  }

  pub fn registration_mut(&mut self) -> &mut Registration {
    &mut self.registration
  }

  pub fn sync_agent(&self) -> &SyncAgent<N> {
    &self.sync
  }

  /// Run one event to completion.
  pub async fn dispatch(&mut self, event: WorkerEvent) -> Result<EventOutcome> {
    match event {
      WorkerEvent::Install => {
        let outcome = self.lifecycle.install(&mut self.registration).await?;
        Ok(EventOutcome::Installed(outcome))
      }
      WorkerEvent::Activate => {
        let evicted = self.lifecycle.activate(&mut self.registration)?;
        Ok(EventOutcome::Activated { evicted })
      }
      WorkerEvent::Fetch(request) => Ok(EventOutcome::Response(self.fetch(&request).await?)),
      WorkerEvent::Sync { tag } => Ok(EventOutcome::Synced(self.sync.handle(&tag).await)),
      WorkerEvent::Message(message) => self.on_message(message),
    }
  }

  /// Install, then activate straight away if nothing else holds control.
  pub async fn update(&mut self) -> Result<(InstallOutcome, Option<Vec<String>>)> {
    let installed = self.lifecycle.install(&mut self.registration).await?;
    if self.registration.should_activate() {
      let evicted = self.lifecycle.activate(&mut self.registration)?;
      return Ok((installed, Some(evicted)));
    }
    Ok((installed, None))
  }

  /// Serve an intercepted request.
  ///
  /// Until a version is active nothing is intercepted, and non-GET requests
  /// are never intercepted: both go straight to the network untouched.
  pub async fn fetch(&self, request: &Request) -> Result<Response> {
    if self.registration.active.is_none() {
      debug!(url = %request.url, "no active worker, passing through");
      return self.network.fetch(request).await;
    }

    match self.selector.select(request) {
      None => {
        debug!(method = %request.method, url = %request.url, "not intercepted");
        self.network.fetch(request).await
      }
      Some(Strategy::CacheFirst) => self.layer.cache_first(request).await,
      Some(Strategy::NetworkFirst) => Ok(self.layer.network_first(request).await),
    }
  }

  fn on_message(&mut self, message: WorkerMessage) -> Result<EventOutcome> {
    match message {
      WorkerMessage::SkipWaiting => {
        info!("skip waiting requested");
        self.registration.request_skip_waiting();
        if self.registration.should_activate() {
          let evicted = self.lifecycle.activate(&mut self.registration)?;
          return Ok(EventOutcome::Activated { evicted });
        }
        Ok(EventOutcome::Acknowledged)
      }
    }
  }
}
