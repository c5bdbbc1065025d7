use chrono::{DateTime, Utc};
use url::Url;

use crate::http::{Headers, Method, Request};

/// A mutating request waiting to be replayed.
///
/// Operations are totally ordered by `sequence`, which is assigned at
/// enqueue time and never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineOperation {
  pub sequence: u64,
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
  pub enqueued_at: DateTime<Utc>,
}

impl OfflineOperation {
  pub fn from_request(sequence: u64, request: &Request, enqueued_at: DateTime<Utc>) -> Self {
    Self {
      sequence,
      method: request.method,
      url: request.url.clone(),
      headers: request.headers.clone(),
      body: request.body.clone(),
      enqueued_at,
    }
  }

  /// The exact request to re-issue.
  pub fn to_request(&self) -> Request {
    Request {
      method: self.method,
      url: self.url.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}
