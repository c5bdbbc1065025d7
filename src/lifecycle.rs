//! Lifecycle, connectivity and control-message handling.
//!
//! `OfflineLayer` owns every component: it classifies each request, runs
//! the chosen strategy, tracks connectivity and triggers queue replay on
//! activation, on reconnect, after any successful network round trip and
//! on explicit request.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheKey, CacheLayer, TierStats, TieredCacheStore};
use crate::classifier::ResourceClassifier;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, CRITICAL_TIER, STATIC_TIER};
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::network::Network;
use crate::notify::{NotificationBus, Subscription};
use crate::queue::{OfflineQueue, QueueStore, ReplayReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Installing,
  Activating,
  Active,
}

/// Control messages accepted from the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  SyncNow,
  GetStatus,
  ClearCache,
  GetCacheStats,
  EnforceLimits,
  ClearQueue,
}

impl FromStr for ControlMessage {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    serde_json::from_value(serde_json::Value::String(s.to_ascii_uppercase()))
      .map_err(|_| Error::Config(format!("unknown control message: {}", s)))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
  pub online: bool,
  pub queue_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ControlReply {
  Synced(ReplayReport),
  Status(Status),
  Cleared { success: bool },
  Stats(BTreeMap<String, TierStats>),
  Enforced { evicted: usize },
}

impl fmt::Display for ControlReply {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
    f.write_str(&json)
  }
}

pub struct OfflineLayer {
  config: Config,
  classifier: ResourceClassifier,
  store: Arc<TieredCacheStore>,
  network: Arc<dyn Network>,
  queue: Arc<OfflineQueue>,
  cache: CacheLayer,
  bus: NotificationBus,
  clock: Arc<dyn Clock>,
  state: RwLock<LifecycleState>,
  installed: AtomicBool,
  online: AtomicBool,
}

impl OfflineLayer {
  pub fn new(
    config: Config,
    network: Arc<dyn Network>,
    queue_store: Arc<dyn QueueStore>,
  ) -> Result<Self> {
    Self::with_clock(config, network, queue_store, Arc::new(SystemClock))
  }

  /// Build every component. Fails on configuration errors (unknown tiers,
  /// malformed rules).
  pub fn with_clock(
    config: Config,
    network: Arc<dyn Network>,
    queue_store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    config.validate()?;

    let store = Arc::new(TieredCacheStore::new(
      config.tiers.iter().map(|(name, max)| (name.clone(), *max)),
    ));
    let classifier = ResourceClassifier::new(&config, &config.known_tiers())?;

    let bus = NotificationBus::new();
    let queue = Arc::new(OfflineQueue::new(
      queue_store,
      bus.clone(),
      clock.clone(),
      config.replay.drop_rejected,
    ));
    let cache = CacheLayer::new(store.clone(), network.clone(), queue.clone(), clock.clone());

    Ok(Self {
      config,
      classifier,
      store,
      network,
      queue,
      cache,
      bus,
      clock,
      state: RwLock::new(LifecycleState::Installing),
      installed: AtomicBool::new(false),
      online: AtomicBool::new(true),
    })
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.read().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: LifecycleState) {
    *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    info!(?state, version = %self.config.version, "Lifecycle transition");
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn cache_store(&self) -> &Arc<TieredCacheStore> {
    &self.store
  }

  pub fn queue(&self) -> &Arc<OfflineQueue> {
    &self.queue
  }

  pub fn subscribe(&self) -> Subscription {
    self.bus.subscribe()
  }

  pub fn bus(&self) -> &NotificationBus {
    &self.bus
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Precache the critical assets (all must succeed), then warm the
  /// secondary assets best-effort.
  pub async fn install(&self) -> Result<()> {
    self.set_state(LifecycleState::Installing);

    let pending = self.queue.load().await;
    debug!(pending, "Offline queue loaded");

    for asset in &self.config.critical_assets {
      let url = self.config.resolve(asset)?;
      self.precache(CRITICAL_TIER, url).await.map_err(|e| {
        error!(asset = %asset, error = %e, "Critical precache failed");
        Error::Install(format!("{}: {}", asset, e))
      })?;
    }

    let warm = self.config.warm_assets.iter().map(|asset| async move {
      let url = self.config.resolve(asset)?;
      self.precache(STATIC_TIER, url).await
    });
    for (asset, result) in self
      .config
      .warm_assets
      .iter()
      .zip(futures::future::join_all(warm).await)
    {
      if let Err(e) = result {
        warn!(asset = %asset, error = %e, "Failed to warm asset");
      }
    }

    self.installed.store(true, Ordering::SeqCst);
    info!(
      critical = self.config.critical_assets.len(),
      warm = self.config.warm_assets.len(),
      "Installed"
    );
    Ok(())
  }

  async fn precache(&self, tier: &str, url: Url) -> Result<()> {
    let request = Request::get(url);
    let response = self.network.fetch(&request).await?;
    if !response.is_success() {
      return Err(Error::Network(format!(
        "{} answered {}",
        request.url, response.status
      )));
    }
    let key = CacheKey::get(&request.url);
    self
      .store
      .put(tier, &key, CacheEntry::from_response(&response, self.clock.now()))?;
    Ok(())
  }

  /// Drop tiers from older versions, enforce limits, and replay anything
  /// left in the queue.
  pub async fn activate(&self) -> Result<ReplayReport> {
    if !self.installed.load(Ordering::SeqCst) {
      return Err(Error::Install("activate called before a successful install".to_string()));
    }
    self.set_state(LifecycleState::Activating);

    let removed = self.store.retain_tiers(&self.config.known_tiers())?;
    let evicted = self.store.enforce_all()?;
    debug!(removed = removed.len(), evicted, "Activation cleanup");

    let report = self.sync_now().await;
    self.set_state(LifecycleState::Active);
    Ok(report)
  }

  /// `install` followed by `activate`.
  pub async fn start(&self) -> Result<ReplayReport> {
    self.install().await?;
    self.activate().await
  }

  /// Intercept one request.
  pub async fn handle(&self, request: Request) -> Response {
    let class = self.classifier.classify(request.method, &request.url);
    let result = self.cache.execute(&request, &class).await;

    if let Some(reached) = result.source.network_reached() {
      let was_online = self.online.swap(reached, Ordering::SeqCst);
      if reached && self.queue.needs_replay() {
        debug!(was_online, "Network reachable with pending operations, replaying");
        self.spawn_replay();
      }
    }

    result.into_response()
  }

  /// Connectivity signal. Going from offline to online replays the queue.
  pub async fn set_online(&self, online: bool) -> Option<ReplayReport> {
    let was_online = self.online.swap(online, Ordering::SeqCst);
    if online && !was_online {
      info!("Connectivity restored");
      Some(self.sync_now().await)
    } else {
      if !online && was_online {
        info!("Connectivity lost");
      }
      None
    }
  }

  /// Replay the queue on its own task so it runs to completion even if the
  /// caller goes away.
  pub async fn sync_now(&self) -> ReplayReport {
    let queue = self.queue.clone();
    let network = self.network.clone();
    let report = tokio::spawn(async move { queue.replay(network.as_ref()).await })
      .await
      .unwrap_or_else(|e| {
        error!(error = %e, "Replay task failed");
        ReplayReport::default()
      });

    if report.synced > 0 {
      self.online.store(true, Ordering::SeqCst);
    }
    report
  }

  fn spawn_replay(&self) {
    let queue = self.queue.clone();
    let network = self.network.clone();
    tokio::spawn(async move {
      queue.replay(network.as_ref()).await;
    });
  }

  pub async fn handle_control(&self, message: ControlMessage) -> ControlReply {
    debug!(?message, "Control message");
    match message {
      ControlMessage::SyncNow => ControlReply::Synced(self.sync_now().await),
      ControlMessage::GetStatus => {
        self.queue.load().await;
        ControlReply::Status(self.status())
      }
      ControlMessage::ClearCache => {
        let success = match self.store.clear_all() {
          Ok(()) => true,
          Err(e) => {
            warn!(error = %e, "Failed to clear caches");
            false
          }
        };
        ControlReply::Cleared { success }
      }
      ControlMessage::GetCacheStats => match self.store.stats() {
        Ok(stats) => ControlReply::Stats(stats),
        Err(e) => {
          warn!(error = %e, "Failed to read cache stats");
          ControlReply::Stats(BTreeMap::new())
        }
      },
      ControlMessage::EnforceLimits => {
        let evicted = self.store.enforce_all().unwrap_or_else(|e| {
          warn!(error = %e, "Failed to enforce cache limits");
          0
        });
        ControlReply::Enforced { evicted }
      }
      ControlMessage::ClearQueue => {
        self.queue.clear().await;
        ControlReply::Cleared { success: true }
      }
    }
  }

  /// Connectivity and queue length as of the last queue access. Operations
  /// still unread in the mirror are only counted once it has been loaded.
  pub fn status(&self) -> Status {
    Status {
      online: self.is_online(),
      queue_length: self.queue.len(),
    }
  }

  /// Names of every tier currently held, including obsolete ones.
  pub fn tier_names(&self) -> HashSet<String> {
    self
      .store
      .tier_names()
      .map(|names| names.into_iter().collect())
      .unwrap_or_default()
  }
}
