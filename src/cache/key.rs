//! Cache keys: method plus normalized URL.

use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::http::Method;

/// Key of a cached response.
///
/// The readable form is `METHOD url` with the fragment and an empty query
/// stripped (the `url` crate already lowercases scheme and host and drops
/// default ports). Tier maps are keyed by the SHA256 digest of that form.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
  display: String,
  digest: String,
}

impl CacheKey {
  pub fn new(method: Method, url: &Url) -> Self {
    let display = format!("{} {}", method, normalize_url(url));

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(display.as_bytes());
    let digest = hex::encode(hasher.finalize());

    Self { display, digest }
  }

  pub fn get(url: &Url) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn digest(&self) -> &str {
    &self.digest
  }

  pub fn as_str(&self) -> &str {
    &self.display
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.display)
  }
}

fn normalize_url(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  if url.query() == Some("") {
    url.set_query(None);
  }
  url.to_string()
}
