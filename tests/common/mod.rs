//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use offsync::{Config, Error, Method, Network, Request, Response, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use url::Url;

pub const ORIGIN: &str = "https://app.example.com";

/// A network whose answers are scripted per path.
///
/// Unscripted paths answer 200 with `body of <path>`.
#[derive(Default)]
pub struct ScriptedNetwork {
  down: AtomicBool,
  scripted: Mutex<HashMap<String, (u16, String)>>,
  calls: Mutex<Vec<(Method, String)>>,
  held: Mutex<HashMap<String, Arc<Notify>>>,
}

impl ScriptedNetwork {
  pub fn set_down(&self, down: bool) {
    self.down.store(down, Ordering::SeqCst);
  }

  pub fn script(&self, path: &str, status: u16, body: &str) {
    self
      .scripted
      .lock()
      .unwrap()
      .insert(path.to_string(), (status, body.to_string()));
  }

  /// Hold the next fetch of `path` until the returned handle is notified.
  pub fn hold(&self, path: &str) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    self
      .held
      .lock()
      .unwrap()
      .insert(path.to_string(), gate.clone());
    gate
  }

  pub fn calls(&self) -> Vec<(Method, String)> {
    self.calls.lock().unwrap().clone()
  }

  pub fn calls_to(&self, path: &str) -> usize {
    self.calls().iter().filter(|(_, p)| p == path).count()
  }

  pub fn reset_calls(&self) {
    self.calls.lock().unwrap().clear();
  }
}

#[async_trait]
impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let path = request.url.path().to_string();
    self.calls.lock().unwrap().push((request.method, path.clone()));

    let gate = self.held.lock().unwrap().remove(&path);
    if let Some(gate) = gate {
      gate.notified().await;
    }

    if self.down.load(Ordering::SeqCst) {
      return Err(Error::Network(format!("{} unreachable", request.url)));
    }

    let scripted = self.scripted.lock().unwrap().get(&path).cloned();
    Ok(match scripted {
      Some((status, body)) => Response::new(status, body),
      None => Response::new(200, format!("body of {}", path)),
    })
  }
}

pub fn config() -> Config {
  Config {
    origin: Some(ORIGIN.to_string()),
    ..Config::default()
  }
}

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn get(path: &str) -> Request {
  Request::get(url(path))
}

pub fn request(method: Method, path: &str) -> Request {
  Request::new(method, url(path))
}

pub fn post(path: &str, body: &str) -> Request {
  Request::new(Method::Post, url(path))
    .with_header("content-type", "application/json")
    .with_body(body.to_string())
}

/// Let spawned background tasks run to completion.
pub async fn settle() {
  for _ in 0..50 {
    tokio::task::yield_now().await;
  }
}
