//! Generic request and response shapes seen by the layer.
//!
//! Bodies are opaque bytes; the layer never parses payloads, with the
//! exception of the two responses it synthesizes itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::Error;

/// Header attached to every response the layer returns, naming where it came from.
pub const SOURCE_HEADER: &str = "x-offsync-source";

/// Header carrying the sequence id of an operation accepted while offline.
pub const QUEUED_HEADER: &str = "x-offsync-queued";

/// Status used for reads that could be served neither from cache nor network.
pub const STATUS_UNAVAILABLE: u16 = 503;

/// Status used for writes accepted into the offline queue.
pub const STATUS_ACCEPTED_OFFLINE: u16 = 202;

/// Ordered header list; order is preserved for replay.
pub type Headers = Vec<(String, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Options,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Options => "OPTIONS",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }

  /// Methods whose failed requests are queued for replay.
  pub fn is_mutating(&self) -> bool {
    matches!(
      self,
      Method::Post | Method::Put | Method::Patch | Method::Delete
    )
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

impl FromStr for Method {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "OPTIONS" => Ok(Method::Options),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(Error::Config(format!("unsupported method: {}", other))),
    }
  }
}

/// An outbound request intercepted by the layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }
}

/// An opaque response: status, headers and body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.set_header(name, value);
    self
  }

  /// Replace any existing header with the same (case-insensitive) name.
  pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
    self.headers.push((name, value.into()));
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// The generic "offline/unavailable" answer for reads.
  pub fn unavailable() -> Self {
    let body = serde_json::json!({
      "error": "offline",
      "message": "The resource is not available offline",
    });
    Self::new(STATUS_UNAVAILABLE, body.to_string())
      .with_header("content-type", "application/json")
  }

  /// The "accepted, offline" answer for writes placed in the offline queue.
  pub fn accepted_offline(sequence: u64) -> Self {
    let body = serde_json::json!({ "success": true, "offline": true });
    Self::new(STATUS_ACCEPTED_OFFLINE, body.to_string())
      .with_header("content-type", "application/json")
      .with_header(QUEUED_HEADER, sequence.to_string())
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_method_parse_is_case_insensitive() {
    assert_eq!("post".parse::<Method>().unwrap(), Method::Post);
    assert_eq!("DELETE".parse::<Method>().unwrap(), Method::Delete);
    assert!("TRACE".parse::<Method>().is_err());
  }

  #[test]
  fn test_mutating_methods() {
    assert!(Method::Post.is_mutating());
    assert!(Method::Put.is_mutating());
    assert!(Method::Patch.is_mutating());
    assert!(Method::Delete.is_mutating());
    assert!(!Method::Get.is_mutating());
    assert!(!Method::Head.is_mutating());
  }

  #[test]
  fn test_accepted_offline_body() {
    let response = Response::accepted_offline(7);
    assert_eq!(response.status, STATUS_ACCEPTED_OFFLINE);
    assert_eq!(response.header("X-Offsync-Queued"), Some("7"));

    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["offline"], true);
  }

  #[test]
  fn test_set_header_replaces_existing() {
    let mut response = Response::new(200, "ok").with_header("Content-Type", "text/plain");
    response.set_header("content-type", "text/html");
    assert_eq!(response.headers.len(), 1);
    assert_eq!(response.header("CONTENT-TYPE"), Some("text/html"));
  }
}
