use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use url::Url;

use crate::classifier::StrategyKind;
use crate::error::{Error, Result};

/// Tier holding the critical app-shell assets.
pub const CRITICAL_TIER: &str = "critical";
/// Tier warmed best-effort at install time.
pub const STATIC_TIER: &str = "static";
pub const API_TIER: &str = "api-data";
/// Fallback tier for everything no rule claims.
pub const DYNAMIC_TIER: &str = "dynamic";

/// Largest TTL a rule may carry, in milliseconds.
pub const MAX_TTL_MS: u64 = i64::MAX as u64;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL that relative asset paths and console requests resolve against
  pub origin: Option<String>,
  /// Cache version label, logged on activation
  pub version: String,
  /// Tier name -> maximum entry count
  pub tiers: BTreeMap<String, usize>,
  /// Exact paths precached at install; any failure aborts the install
  pub critical_assets: Vec<String>,
  /// Paths warmed best-effort at install
  pub warm_assets: Vec<String>,
  /// API prefixes, first match wins
  pub api_routes: Vec<ApiRoute>,
  /// Extension-based rules, first match wins
  pub extension_rules: Vec<ExtensionRule>,
  pub storage: StorageConfig,
  pub network: NetworkConfig,
  pub replay: ReplayConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ApiRoute {
  pub prefix: String,
  pub strategy: StrategyKind,
  /// Time-to-live in milliseconds; absent means the plain strategy
  #[serde(default)]
  pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ExtensionRule {
  pub tier: String,
  #[serde(deserialize_with = "deserialize_lowercase_list")]
  pub extensions: Vec<String>,
  pub strategy: StrategyKind,
  #[serde(default)]
  pub ttl_ms: Option<u64>,
}

fn deserialize_lowercase_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite file backing the offline queue (default: $XDG_DATA_HOME/offsync/queue.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Per-request timeout; an elapsed timeout counts as a network failure
  pub timeout_ms: u64,
  /// How often the console probes the origin for connectivity
  pub probe_interval_ms: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_ms: 10_000,
      probe_interval_ms: 15_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
  /// Drop queued operations the origin permanently rejects (4xx) instead of
  /// halting replay on them
  pub drop_rejected: bool,
}

impl Default for ReplayConfig {
  fn default() -> Self {
    Self {
      drop_rejected: true,
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    let tiers = [
      (CRITICAL_TIER, 100),
      (STATIC_TIER, 60),
      ("images", 60),
      ("fonts", 30),
      ("scripts", 40),
      ("styles", 40),
      (API_TIER, 100),
      (DYNAMIC_TIER, 50),
    ]
    .into_iter()
    .map(|(name, max)| (name.to_string(), max))
    .collect();

    let route = |prefix: &str, strategy, ttl_ms| ApiRoute {
      prefix: prefix.to_string(),
      strategy,
      ttl_ms,
    };
    let ext = |tier: &str, extensions: &[&str], strategy, ttl_ms| ExtensionRule {
      tier: tier.to_string(),
      extensions: extensions.iter().map(|e| e.to_string()).collect(),
      strategy,
      ttl_ms,
    };

    const MINUTE: u64 = 60 * 1000;
    const DAY: u64 = 24 * 60 * MINUTE;

    Self {
      origin: None,
      version: "v1".to_string(),
      tiers,
      critical_assets: Vec::new(),
      warm_assets: Vec::new(),
      api_routes: vec![
        // Exports have side effects and must never be served stale
        route("/api/export", StrategyKind::NetworkFirst, Some(0)),
        route("/api/auth", StrategyKind::NetworkOnly, None),
        route("/api/sync", StrategyKind::NetworkOnly, None),
        route("/api/stats", StrategyKind::StaleWhileRevalidate, Some(MINUTE)),
        route("/api/", StrategyKind::NetworkFirst, Some(5 * MINUTE)),
      ],
      extension_rules: vec![
        ext(
          "images",
          &["png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "avif"],
          StrategyKind::CacheFirst,
          Some(30 * DAY),
        ),
        ext(
          "fonts",
          &["woff", "woff2", "ttf", "otf", "eot"],
          StrategyKind::CacheFirst,
          None,
        ),
        ext(
          "scripts",
          &["js", "mjs"],
          StrategyKind::StaleWhileRevalidate,
          Some(7 * DAY),
        ),
        ext(
          "styles",
          &["css"],
          StrategyKind::StaleWhileRevalidate,
          Some(7 * DAY),
        ),
      ],
      storage: StorageConfig::default(),
      network: NetworkConfig::default(),
      replay: ReplayConfig::default(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  ///
  /// With no file found the built-in defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(Error::Config(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      Error::Config(format!(
        "Failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_yaml(&contents).map_err(|e| {
      Error::Config(format!(
        "Failed to parse config file {}: {}",
        path.display(),
        e
      ))
    })
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
  }

  /// Check that every rule names a configured tier and is well formed.
  pub fn validate(&self) -> Result<()> {
    for required in [CRITICAL_TIER, STATIC_TIER, API_TIER, DYNAMIC_TIER] {
      if !self.tiers.contains_key(required) {
        return Err(Error::UnknownTier(required.to_string()));
      }
    }

    for rule in &self.extension_rules {
      if !self.tiers.contains_key(&rule.tier) {
        return Err(Error::UnknownTier(rule.tier.clone()));
      }
      if rule.extensions.is_empty() {
        return Err(Error::Config(format!(
          "extension rule for tier {} lists no extensions",
          rule.tier
        )));
      }
    }

    for route in &self.api_routes {
      if !route.prefix.starts_with('/') {
        return Err(Error::Config(format!(
          "API route prefix must start with '/': {}",
          route.prefix
        )));
      }
    }

    let ttls = self
      .api_routes
      .iter()
      .map(|r| (r.prefix.as_str(), r.ttl_ms))
      .chain(self.extension_rules.iter().map(|r| (r.tier.as_str(), r.ttl_ms)));
    for (rule, ttl_ms) in ttls {
      if ttl_ms.is_some_and(|ms| ms > MAX_TTL_MS) {
        return Err(Error::Config(format!(
          "ttl_ms for {} exceeds {}",
          rule, MAX_TTL_MS
        )));
      }
    }

    for (name, max) in &self.tiers {
      if *max == 0 {
        return Err(Error::Config(format!("tier {} has a zero entry limit", name)));
      }
    }

    self.origin_url()?;
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Option<Url>> {
    self
      .origin
      .as_deref()
      .map(|o| Url::parse(o).map_err(|e| Error::Config(format!("Invalid origin {}: {}", o, e))))
      .transpose()
  }

  /// Resolve an absolute URL or an origin-relative path.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    if let Ok(url) = Url::parse(target) {
      return Ok(url);
    }
    let origin = self
      .origin_url()?
      .ok_or_else(|| Error::Config(format!("No origin configured to resolve {}", target)))?;
    origin
      .join(target)
      .map_err(|e| Error::Config(format!("Invalid path {}: {}", target, e)))
  }

  pub fn known_tiers(&self) -> HashSet<String> {
    self.tiers.keys().cloned().collect()
  }

  /// Get the data directory used for the queue database and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("offsync"))
  }

  pub fn queue_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("queue.db")),
    }
  }
}
