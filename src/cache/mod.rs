//! Tiered response cache and the freshness strategies built on it.
//!
//! This module provides:
//! - Bounded tiers with insertion-order (not LRU) eviction
//! - Cache keys derived from method and normalized URL
//! - Cache-first, network-first, stale-while-revalidate and network-only
//!   strategies, each optionally TTL-aware
//! - Basic offline mode (serve stale cache when network unavailable)

mod entry;
mod key;
mod layer;
mod storage;

pub use entry::{CacheEntry, CacheResult, CacheSource};
pub use key::CacheKey;
pub use layer::CacheLayer;
pub use storage::{TierStats, TieredCacheStore};
