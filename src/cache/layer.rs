//! Freshness strategies: how a classified request is answered from the
//! tier store and the network.

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheResult};
use super::key::CacheKey;
use super::storage::TieredCacheStore;
use crate::classifier::{Classification, StrategyKind};
use crate::clock::Clock;
use crate::error::Result;
use crate::http::{Method, Request, Response};
use crate::network::Network;
use crate::queue::OfflineQueue;

/// Cache layer that runs the freshness strategies.
///
/// Sits between the application and the network. Reads are answered from
/// the tier store and the network according to the classification; writes
/// that cannot reach the network are handed to the offline queue.
#[derive(Clone)]
pub struct CacheLayer {
  store: Arc<TieredCacheStore>,
  network: Arc<dyn Network>,
  queue: Arc<OfflineQueue>,
  clock: Arc<dyn Clock>,
}

impl CacheLayer {
  pub fn new(
    store: Arc<TieredCacheStore>,
    network: Arc<dyn Network>,
    queue: Arc<OfflineQueue>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      store,
      network,
      queue,
      clock,
    }
  }

  /// Answer `request` using the strategy chosen for it.
  pub async fn execute(&self, request: &Request, class: &Classification) -> CacheResult {
    let key = CacheKey::new(request.method, &request.url);
    debug!(key = %key, tier = %class.tier, strategy = %class.strategy, "Handling request");

    match class.strategy {
      StrategyKind::CacheFirst => self.cache_first(request, &key, class).await,
      StrategyKind::NetworkFirst => self.network_first(request, &key, class).await,
      StrategyKind::StaleWhileRevalidate => {
        self.stale_while_revalidate(request, &key, class).await
      }
      StrategyKind::NetworkOnly => self.network_only(request).await,
    }
  }

  /// 1. Fresh hit (any hit for the plain variant): return it
  /// 2. Otherwise fetch and store
  /// 3. On network failure: the expired entry if there is one, else 503
  async fn cache_first(
    &self,
    request: &Request,
    key: &CacheKey,
    class: &Classification,
  ) -> CacheResult {
    let cached = self.lookup(&class.tier, key);
    if let Some(entry) = &cached {
      if !self.is_expired(entry, class.ttl) {
        return CacheResult::from_cache(entry, false);
      }
    }

    match self.fetch_and_store(request, key, &class.tier).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => {
        debug!(key = %key, error = %e, "Network failed for cache-first request");
        match cached {
          Some(entry) => CacheResult::from_cache(&entry, true),
          None => CacheResult::unavailable(),
        }
      }
    }
  }

  /// Network, then cache. An expired entry still serves as a degraded
  /// fallback. Writes are queued instead of falling back.
  async fn network_first(
    &self,
    request: &Request,
    key: &CacheKey,
    class: &Classification,
  ) -> CacheResult {
    match self.fetch_and_store(request, key, &class.tier).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) if request.method.is_mutating() => {
        debug!(key = %key, error = %e, "Network failed for mutation");
        self.queue_offline(request).await
      }
      Err(e) => {
        debug!(key = %key, error = %e, "Network failed, falling back to cache");
        match self.lookup(&class.tier, key) {
          Some(entry) if self.is_expired(&entry, class.ttl) => CacheResult::from_cache(&entry, true),
          Some(entry) => CacheResult::offline(&entry),
          None => CacheResult::unavailable(),
        }
      }
    }
  }

  /// Serve what is cached right away and refresh it in the background.
  /// With nothing usable cached, wait for the network.
  async fn stale_while_revalidate(
    &self,
    request: &Request,
    key: &CacheKey,
    class: &Classification,
  ) -> CacheResult {
    let cached = self.lookup(&class.tier, key);

    if let Some(entry) = &cached {
      if !self.is_expired(entry, class.ttl) {
        self.revalidate(request.clone(), key.clone(), class.tier.clone());
        return CacheResult::from_cache(entry, false);
      }
    }

    match self.fetch_and_store(request, key, &class.tier).await {
      Ok(response) => CacheResult::from_network(response),
      Err(e) => {
        debug!(key = %key, error = %e, "Network failed for revalidating request");
        match cached {
          Some(entry) => CacheResult::from_cache(&entry, true),
          None => CacheResult::unavailable(),
        }
      }
    }
  }

  /// Never touches the store.
  async fn network_only(&self, request: &Request) -> CacheResult {
    match self.network.fetch(request).await {
      Ok(response) => CacheResult::from_network(response),
      Err(_) if request.method.is_mutating() => self.queue_offline(request).await,
      Err(e) => {
        debug!(url = %request.url, error = %e, "Network failed for network-only request");
        CacheResult::unavailable()
      }
    }
  }

  fn revalidate(&self, request: Request, key: CacheKey, tier: String) {
    let layer = self.clone();
    tokio::spawn(async move {
      match layer.fetch_and_store(&request, &key, &tier).await {
        Ok(response) => {
          debug!(key = %key, status = response.status, "Revalidated");
          // The origin answered, so pending writes can go out too
          if layer.queue.needs_replay() {
            layer.queue.replay(layer.network.as_ref()).await;
          }
        }
        Err(e) => debug!(key = %key, error = %e, "Background revalidation failed"),
      }
    });
  }

  /// Fetch, and store the response when it is cacheable (GET, 2xx).
  async fn fetch_and_store(
    &self,
    request: &Request,
    key: &CacheKey,
    tier: &str,
  ) -> Result<Response> {
    let response = self.network.fetch(request).await?;

    if request.method == Method::Get && response.is_success() {
      let entry = CacheEntry::from_response(&response, self.clock.now());
      if let Err(e) = self.store.put(tier, key, entry) {
        warn!(key = %key, tier, error = %e, "Failed to store response");
      }
    }

    Ok(response)
  }

  fn lookup(&self, tier: &str, key: &CacheKey) -> Option<CacheEntry> {
    match self.store.get(tier, key) {
      Ok(hit) => {
        debug!(key = %key, tier, hit = hit.is_some(), "Cache lookup");
        hit
      }
      Err(e) => {
        warn!(key = %key, tier, error = %e, "Cache lookup failed");
        None
      }
    }
  }

  fn is_expired(&self, entry: &CacheEntry, ttl: Option<Duration>) -> bool {
    entry.is_expired(ttl, self.clock.now())
  }

  async fn queue_offline(&self, request: &Request) -> CacheResult {
    let operation = self.queue.enqueue(request).await;
    CacheResult::queued(operation.sequence)
  }
}
