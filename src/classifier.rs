//! Maps an outbound request to a cache tier, a strategy and a TTL.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use url::Url;

use crate::config::{Config, API_TIER, CRITICAL_TIER, DYNAMIC_TIER};
use crate::error::{Error, Result};
use crate::http::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  NetworkOnly,
}

impl fmt::Display for StrategyKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      StrategyKind::CacheFirst => "cache-first",
      StrategyKind::NetworkFirst => "network-first",
      StrategyKind::StaleWhileRevalidate => "stale-while-revalidate",
      StrategyKind::NetworkOnly => "network-only",
    };
    f.write_str(name)
  }
}

/// The `{tier, strategy, ttl}` triple chosen for a request.
///
/// A `ttl` of `None` selects the plain strategy, `Some` the TTL-aware one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
  pub tier: String,
  pub strategy: StrategyKind,
  pub ttl: Option<Duration>,
}

impl Classification {
  fn new(tier: &str, strategy: StrategyKind, ttl_ms: Option<u64>) -> Self {
    Self {
      tier: tier.to_string(),
      strategy,
      ttl: ttl_ms.map(|ms| Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))),
    }
  }
}

#[derive(Debug, Clone)]
struct RouteRule {
  prefix: String,
  classification: Classification,
}

#[derive(Debug, Clone)]
struct ExtensionMatch {
  extensions: HashSet<String>,
  classification: Classification,
}

/// First-match-wins resource classifier, static after construction.
#[derive(Debug, Clone)]
pub struct ResourceClassifier {
  critical_paths: HashSet<String>,
  routes: Vec<RouteRule>,
  extensions: Vec<ExtensionMatch>,
}

impl ResourceClassifier {
  /// Build the rule tables, rejecting rules that name tiers outside `tiers`.
  pub fn new(config: &Config, tiers: &HashSet<String>) -> Result<Self> {
    for tier in [CRITICAL_TIER, API_TIER, DYNAMIC_TIER] {
      if !tiers.contains(tier) {
        return Err(Error::UnknownTier(tier.to_string()));
      }
    }

    let critical_paths = config
      .critical_assets
      .iter()
      .map(|asset| critical_path(config, asset))
      .collect::<Result<HashSet<_>>>()?;

    let routes = config
      .api_routes
      .iter()
      .map(|route| RouteRule {
        prefix: route.prefix.clone(),
        classification: Classification::new(API_TIER, route.strategy, route.ttl_ms),
      })
      .collect();

    let extensions = config
      .extension_rules
      .iter()
      .map(|rule| {
        if !tiers.contains(&rule.tier) {
          return Err(Error::UnknownTier(rule.tier.clone()));
        }
        Ok(ExtensionMatch {
          extensions: rule.extensions.iter().cloned().collect(),
          classification: Classification::new(&rule.tier, rule.strategy, rule.ttl_ms),
        })
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      critical_paths,
      routes,
      extensions,
    })
  }

  pub fn classify(&self, method: Method, url: &Url) -> Classification {
    let classification = self.classify_path(url.path());

    if method == Method::Get {
      return classification;
    }

    // Only GET responses are ever cached. Writes keep a network-first route
    // (which queues on failure); everything else goes straight to the network.
    let strategy = if method.is_mutating() && classification.strategy == StrategyKind::NetworkFirst
    {
      StrategyKind::NetworkFirst
    } else {
      StrategyKind::NetworkOnly
    };
    Classification {
      strategy,
      ..classification
    }
  }

  fn classify_path(&self, path: &str) -> Classification {
    // (a) exact critical asset
    if self.critical_paths.contains(path) {
      return Classification::new(CRITICAL_TIER, StrategyKind::CacheFirst, None);
    }

    // (b) API prefix table
    if let Some(route) = self.routes.iter().find(|r| path.starts_with(&r.prefix)) {
      return route.classification.clone();
    }

    // (c) extension patterns
    if let Some(ext) = extension_of(path) {
      if let Some(rule) = self.extensions.iter().find(|r| r.extensions.contains(&ext)) {
        return rule.classification.clone();
      }
    }

    // (d) fallback
    Classification::new(DYNAMIC_TIER, StrategyKind::StaleWhileRevalidate, None)
  }
}

fn critical_path(config: &Config, asset: &str) -> Result<String> {
  if asset.starts_with('/') {
    return Ok(asset.to_string());
  }
  Ok(config.resolve(asset)?.path().to_string())
}

/// Lowercased extension of the last path segment.
fn extension_of(path: &str) -> Option<String> {
  let segment = path.rsplit('/').next()?;
  let (stem, ext) = segment.rsplit_once('.')?;
  if stem.is_empty() || ext.is_empty() {
    return None;
  }
  Some(ext.to_lowercase())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn classifier() -> ResourceClassifier {
    let config = Config {
      critical_assets: vec!["/".to_string(), "/index.html".to_string(), "/app.js".to_string()],
      ..Config::default()
    };
    ResourceClassifier::new(&config, &config.known_tiers()).unwrap()
  }

  fn get(path: &str) -> Classification {
    let url = Url::parse("https://app.example.com").unwrap().join(path).unwrap();
    classifier().classify(Method::Get, &url)
  }

  #[test]
  fn test_critical_asset_wins_over_extension() {
    let c = get("/app.js");
    assert_eq!(c.tier, CRITICAL_TIER);
    assert_eq!(c.strategy, StrategyKind::CacheFirst);
    assert_eq!(c.ttl, None);
  }

  #[test]
  fn test_api_prefix_first_match_wins() {
    let export = get("/api/export/csv");
    assert_eq!(export.tier, API_TIER);
    assert_eq!(export.strategy, StrategyKind::NetworkFirst);
    assert_eq!(export.ttl, Some(Duration::zero()));

    let items = get("/api/items?page=2");
    assert_eq!(items.strategy, StrategyKind::NetworkFirst);
    assert_eq!(items.ttl, Some(Duration::minutes(5)));

    let stats = get("/api/stats");
    assert_eq!(stats.strategy, StrategyKind::StaleWhileRevalidate);
  }

  #[test]
  fn test_extension_rules() {
    assert_eq!(get("/img/logo.PNG").tier, "images");
    assert_eq!(get("/fonts/inter.woff2").tier, "fonts");
    assert_eq!(get("/css/site.css").strategy, StrategyKind::StaleWhileRevalidate);
    assert_eq!(get("/js/vendor.js").tier, "scripts");
  }

  #[test]
  fn test_fallback_is_dynamic_swr() {
    let c = get("/about");
    assert_eq!(c.tier, DYNAMIC_TIER);
    assert_eq!(c.strategy, StrategyKind::StaleWhileRevalidate);
    assert_eq!(get("/.hidden").tier, DYNAMIC_TIER);
  }

  #[test]
  fn test_mutations_never_use_cache_strategies() {
    let url = Url::parse("https://app.example.com/api/items").unwrap();
    let post = classifier().classify(Method::Post, &url);
    assert_eq!(post.strategy, StrategyKind::NetworkFirst);

    let url = Url::parse("https://app.example.com/upload/logo.png").unwrap();
    let put = classifier().classify(Method::Put, &url);
    assert_eq!(put.strategy, StrategyKind::NetworkOnly);

    let head = classifier().classify(Method::Head, &url);
    assert_eq!(head.strategy, StrategyKind::NetworkOnly);
  }

  #[test]
  fn test_rule_with_unknown_tier_fails_construction() {
    let config = Config::default();
    let mut tiers = config.known_tiers();
    tiers.remove("fonts");
    let err = ResourceClassifier::new(&config, &tiers).unwrap_err();
    assert!(matches!(err, Error::UnknownTier(t) if t == "fonts"));
  }

  #[test]
  fn test_huge_ttl_saturates() {
    let c = Classification::new("images", StrategyKind::CacheFirst, Some(1 << 63));
    assert_eq!(c.ttl, Some(Duration::milliseconds(i64::MAX)));
  }
}
