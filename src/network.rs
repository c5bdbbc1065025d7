//! The network collaborator.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::http::{Request, Response};

/// Performs a request against the origin.
///
/// `Err(Error::Network)` means the origin could not be reached (transport
/// failure or timeout). Any HTTP status, including 4xx and 5xx, is a
/// successful fetch returned as `Ok`.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// reqwest-backed network client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_millis(config.timeout_ms))
      .build()
      .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| Error::Network(format!("Invalid method {}: {}", request.method, e)))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| Error::Network(format!("{} {}: {}", request.method, request.url, e)))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .map(|(name, value)| {
        (
          name.as_str().to_string(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| Error::Network(format!("Failed to read body of {}: {}", request.url, e)))?
      .to_vec();

    debug!(method = %request.method, url = %request.url, status, "Fetched");
    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

/// Wraps a network and can be forced offline, failing every fetch as if
/// the origin were unreachable.
pub struct SwitchableNetwork {
  inner: Arc<dyn Network>,
  forced_offline: AtomicBool,
}

impl SwitchableNetwork {
  pub fn new(inner: Arc<dyn Network>) -> Self {
    Self {
      inner,
      forced_offline: AtomicBool::new(false),
    }
  }

  pub fn set_forced_offline(&self, offline: bool) {
    self.forced_offline.store(offline, Ordering::SeqCst);
  }

  pub fn is_forced_offline(&self) -> bool {
    self.forced_offline.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Network for SwitchableNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    if self.is_forced_offline() {
      return Err(Error::Network(format!(
        "{} {}: forced offline",
        request.method, request.url
      )));
    }
    self.inner.fetch(request).await
  }
}
