//! Cached records and the result type returned by the strategies.

use chrono::{DateTime, Duration, Utc};

use crate::http::{Headers, Response, SOURCE_HEADER};

/// One cached response.
///
/// `cached_at` is stamped by the layer when the entry is written; it is
/// never taken from the origin's headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
  pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn from_response(response: &Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      cached_at,
    }
  }

  /// Whether the entry is past its TTL at `now`.
  ///
  /// No TTL means never expired; a zero TTL means always expired.
  pub fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
    match ttl {
      None => false,
      Some(ttl) if ttl <= Duration::zero() => true,
      Some(ttl) => now - self.cached_at > ttl,
    }
  }

  pub fn to_response(&self) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Expired data from cache, served because the network failed
  CacheStale,
  /// Network unavailable, serving cached data under a network-first policy
  Offline,
  /// Nothing cached and network unavailable
  Unavailable,
  /// Mutation accepted into the offline queue
  Queued,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::CacheFresh => "cache",
      CacheSource::CacheStale => "cache-stale",
      CacheSource::Offline => "offline",
      CacheSource::Unavailable => "unavailable",
      CacheSource::Queued => "queued",
    }
  }

  /// What this outcome says about connectivity, if anything.
  pub fn network_reached(&self) -> Option<bool> {
    match self {
      CacheSource::Network => Some(true),
      CacheSource::CacheStale
      | CacheSource::Offline
      | CacheSource::Unavailable
      | CacheSource::Queued => Some(false),
      CacheSource::CacheFresh => None,
    }
  }
}

/// Result of running a strategy, including metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult {
  pub response: Response,
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl CacheResult {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(entry: &CacheEntry, is_stale: bool) -> Self {
    Self {
      response: entry.to_response(),
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(entry.cached_at),
    }
  }

  pub fn offline(entry: &CacheEntry) -> Self {
    Self {
      response: entry.to_response(),
      source: CacheSource::Offline,
      cached_at: Some(entry.cached_at),
    }
  }

  pub fn unavailable() -> Self {
    Self {
      response: Response::unavailable(),
      source: CacheSource::Unavailable,
      cached_at: None,
    }
  }

  pub fn queued(sequence: u64) -> Self {
    Self {
      response: Response::accepted_offline(sequence),
      source: CacheSource::Queued,
      cached_at: None,
    }
  }

  /// The response handed back to the application, tagged with its source.
  pub fn into_response(self) -> Response {
    let mut response = self.response;
    response.set_header(SOURCE_HEADER, self.source.as_str());
    response
  }
}
