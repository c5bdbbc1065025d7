//! Tiered in-memory cache storage with insertion-order eviction.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use super::entry::CacheEntry;
use super::key::CacheKey;
use crate::error::{Error, Result};

/// Entry count and limit of one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierStats {
  pub entries: usize,
  pub limit: usize,
}

/// One named partition. Entries are evicted oldest-inserted first; reads
/// never change the order, only re-insertion does.
#[derive(Debug)]
struct Tier {
  max_entries: usize,
  entries: HashMap<String, CacheEntry>,
  /// Key digests, oldest first
  order: VecDeque<String>,
}

impl Tier {
  fn new(max_entries: usize) -> Self {
    Self {
      max_entries,
      entries: HashMap::new(),
      order: VecDeque::new(),
    }
  }

  fn insert(&mut self, digest: &str, entry: CacheEntry) {
    if self.entries.insert(digest.to_string(), entry).is_some() {
      self.order.retain(|k| k != digest);
    }
    self.order.push_back(digest.to_string());
  }

  fn remove(&mut self, digest: &str) -> bool {
    if self.entries.remove(digest).is_some() {
      self.order.retain(|k| k != digest);
      true
    } else {
      false
    }
  }

  fn evict(&mut self) -> usize {
    let mut removed = 0;
    while self.entries.len() > self.max_entries {
      match self.order.pop_front() {
        Some(oldest) => {
          self.entries.remove(&oldest);
          removed += 1;
        }
        None => break,
      }
    }
    removed
  }

  fn clear(&mut self) {
    self.entries.clear();
    self.order.clear();
  }

  fn stats(&self) -> TierStats {
    TierStats {
      entries: self.entries.len(),
      limit: self.max_entries,
    }
  }
}

/// Cache store partitioned into bounded tiers.
///
/// The tier table is behind a read-write lock (it only changes during
/// activation); each tier has its own mutex, so requests touching different
/// tiers never contend.
#[derive(Debug, Default)]
pub struct TieredCacheStore {
  tiers: RwLock<HashMap<String, Arc<Mutex<Tier>>>>,
}

impl TieredCacheStore {
  pub fn new<I, S>(tiers: I) -> Self
  where
    I: IntoIterator<Item = (S, usize)>,
    S: Into<String>,
  {
    let tiers = tiers
      .into_iter()
      .map(|(name, max)| (name.into(), Arc::new(Mutex::new(Tier::new(max)))))
      .collect();
    Self {
      tiers: RwLock::new(tiers),
    }
  }

  fn tier(&self, name: &str) -> Result<Arc<Mutex<Tier>>> {
    let tiers = self
      .tiers
      .read()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?;
    tiers
      .get(name)
      .cloned()
      .ok_or_else(|| Error::UnknownTier(name.to_string()))
  }

  pub fn has_tier(&self, name: &str) -> bool {
    self.tier(name).is_ok()
  }

  /// Look up an entry. Returns `Ok(None)` on a miss.
  pub fn get(&self, tier: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
    let tier = self.tier(tier)?;
    let tier = lock(&tier)?;
    Ok(tier.entries.get(key.digest()).cloned())
  }

  /// Insert an entry and enforce the tier's bound. Returns the number of
  /// entries evicted.
  pub fn put(&self, tier_name: &str, key: &CacheKey, entry: CacheEntry) -> Result<usize> {
    let tier = self.tier(tier_name)?;
    let mut tier = lock(&tier)?;
    tier.insert(key.digest(), entry);
    let evicted = tier.evict();
    if evicted > 0 {
      debug!(tier = tier_name, evicted, "Evicted oldest entries");
    }
    Ok(evicted)
  }

  pub fn remove(&self, tier: &str, key: &CacheKey) -> Result<bool> {
    let tier = self.tier(tier)?;
    let mut tier = lock(&tier)?;
    Ok(tier.remove(key.digest()))
  }

  /// Remove oldest-inserted entries until the tier is within its bound.
  pub fn evict(&self, tier: &str) -> Result<usize> {
    let tier = self.tier(tier)?;
    let mut tier = lock(&tier)?;
    Ok(tier.evict())
  }

  pub fn len(&self, tier: &str) -> Result<usize> {
    let tier = self.tier(tier)?;
    let tier = lock(&tier)?;
    Ok(tier.entries.len())
  }

  pub fn clear(&self, tier: &str) -> Result<()> {
    let tier = self.tier(tier)?;
    let mut tier = lock(&tier)?;
    tier.clear();
    Ok(())
  }

  pub fn clear_all(&self) -> Result<()> {
    for tier in self.all_tiers()? {
      lock(&tier)?.clear();
    }
    Ok(())
  }

  /// Run eviction across every tier. Returns the total evicted.
  pub fn enforce_all(&self) -> Result<usize> {
    let mut total = 0;
    for tier in self.all_tiers()? {
      total += lock(&tier)?.evict();
    }
    Ok(total)
  }

  pub fn stats(&self) -> Result<BTreeMap<String, TierStats>> {
    let tiers = self
      .tiers
      .read()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?;
    let mut stats = BTreeMap::new();
    for (name, tier) in tiers.iter() {
      stats.insert(name.clone(), lock(tier)?.stats());
    }
    Ok(stats)
  }

  pub fn tier_names(&self) -> Result<Vec<String>> {
    let tiers = self
      .tiers
      .read()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?;
    let mut names: Vec<String> = tiers.keys().cloned().collect();
    names.sort();
    Ok(names)
  }

  /// Add a tier, or change the limit of an existing one (entries are kept
  /// and the new bound is enforced immediately).
  pub fn register_tier(&self, name: &str, max_entries: usize) -> Result<()> {
    let mut tiers = self
      .tiers
      .write()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?;
    match tiers.get(name) {
      Some(tier) => {
        let mut tier = lock(tier)?;
        tier.max_entries = max_entries;
        tier.evict();
      }
      None => {
        tiers.insert(name.to_string(), Arc::new(Mutex::new(Tier::new(max_entries))));
      }
    }
    Ok(())
  }

  /// Drop every tier whose name is not in `known`. Returns the dropped names.
  pub fn retain_tiers(&self, known: &HashSet<String>) -> Result<Vec<String>> {
    let mut tiers = self
      .tiers
      .write()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?;
    let mut removed: Vec<String> = tiers
      .keys()
      .filter(|name| !known.contains(*name))
      .cloned()
      .collect();
    removed.sort();
    for name in &removed {
      tiers.remove(name);
      info!(tier = %name, "Deleted obsolete cache tier");
    }
    Ok(removed)
  }

  fn all_tiers(&self) -> Result<Vec<Arc<Mutex<Tier>>>> {
    let tiers = self
      .tiers
      .read()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?;
    Ok(tiers.values().cloned().collect())
  }
}

fn lock(tier: &Mutex<Tier>) -> Result<MutexGuard<'_, Tier>> {
  tier
    .lock()
    .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Response;
  use chrono::Utc;
  use url::Url;

  fn key(n: usize) -> CacheKey {
    CacheKey::get(&Url::parse(&format!("https://example.com/e{}", n)).unwrap())
  }

  fn entry(n: usize) -> CacheEntry {
    CacheEntry::from_response(&Response::new(200, format!("e{}", n)), Utc::now())
  }

  fn store(max: usize) -> TieredCacheStore {
    TieredCacheStore::new([("images", max)])
  }

  #[test]
  fn test_oldest_inserted_evicted_first() {
    let store = store(3);
    for n in 1..=5 {
      store.put("images", &key(n), entry(n)).unwrap();
    }

    assert_eq!(store.len("images").unwrap(), 3);
    for n in 1..=2 {
      assert!(store.get("images", &key(n)).unwrap().is_none());
    }
    for n in 3..=5 {
      let stored = store.get("images", &key(n)).unwrap().unwrap();
      assert_eq!(stored.body, format!("e{}", n).into_bytes());
    }
  }

  #[test]
  fn test_reads_do_not_protect_from_eviction() {
    let store = store(2);
    store.put("images", &key(1), entry(1)).unwrap();
    store.put("images", &key(2), entry(2)).unwrap();

    for _ in 0..10 {
      assert!(store.get("images", &key(1)).unwrap().is_some());
    }
    store.put("images", &key(3), entry(3)).unwrap();

    assert!(store.get("images", &key(1)).unwrap().is_none());
    assert!(store.get("images", &key(2)).unwrap().is_some());
  }

  #[test]
  fn test_reinsert_resets_position() {
    let store = store(2);
    store.put("images", &key(1), entry(1)).unwrap();
    store.put("images", &key(2), entry(2)).unwrap();
    store.put("images", &key(1), entry(1)).unwrap();
    store.put("images", &key(3), entry(3)).unwrap();

    assert!(store.get("images", &key(1)).unwrap().is_some());
    assert!(store.get("images", &key(2)).unwrap().is_none());
    assert_eq!(store.len("images").unwrap(), 2);
  }

  #[test]
  fn test_count_never_exceeds_limit() {
    let store = store(4);
    for n in 0..50 {
      store.put("images", &key(n % 7), entry(n)).unwrap();
      assert!(store.len("images").unwrap() <= 4);
    }
  }

  #[test]
  fn test_evict_twice_is_noop() {
    let store = store(5);
    for n in 0..5 {
      store.put("images", &key(n), entry(n)).unwrap();
    }
    // Lower the bound without the eviction register_tier would run
    store.tier("images").unwrap().lock().unwrap().max_entries = 2;
    assert_eq!(store.len("images").unwrap(), 5);

    assert_eq!(store.evict("images").unwrap(), 3);
    assert_eq!(store.evict("images").unwrap(), 0);
    assert_eq!(store.len("images").unwrap(), 2);
    assert!(store.get("images", &key(3)).unwrap().is_some());
    assert!(store.get("images", &key(2)).unwrap().is_none());
  }

  #[test]
  fn test_unknown_tier_is_an_error() {
    let store = store(1);
    let err = store.put("videos", &key(1), entry(1)).unwrap_err();
    assert!(matches!(err, Error::UnknownTier(name) if name == "videos"));
  }

  #[test]
  fn test_clear_and_stats() {
    let store = TieredCacheStore::new([("images", 3), ("fonts", 2)]);
    store.put("images", &key(1), entry(1)).unwrap();
    store.put("fonts", &key(2), entry(2)).unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats["images"], TierStats { entries: 1, limit: 3 });
    assert_eq!(stats["fonts"], TierStats { entries: 1, limit: 2 });

    store.clear("images").unwrap();
    assert_eq!(store.len("images").unwrap(), 0);
    assert_eq!(store.len("fonts").unwrap(), 1);

    store.clear_all().unwrap();
    assert_eq!(store.len("fonts").unwrap(), 0);
  }

  #[test]
  fn test_retain_tiers_drops_unknown() {
    let store = TieredCacheStore::new([("images", 3), ("images-v1", 3)]);
    let known: HashSet<String> = ["images".to_string()].into_iter().collect();

    let removed = store.retain_tiers(&known).unwrap();
    assert_eq!(removed, vec!["images-v1".to_string()]);
    assert_eq!(store.tier_names().unwrap(), vec!["images".to_string()]);
  }
}
