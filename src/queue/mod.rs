//! Durable, ordered queue of mutations made while offline, and its replay engine.
//!
//! All mutations of the queue (enqueue, replay, clear) run under one async
//! mutex. An enqueue that arrives while a replay is in flight waits and is
//! appended after the operations being replayed.

mod operation;
mod storage;

pub use operation::OfflineOperation;
pub use storage::{MemoryQueueStore, QueueStore, SqliteQueueStore};

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::http::{Request, Response};
use crate::network::Network;
use crate::notify::{Notification, NotificationBus};

/// Summary of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
  /// Operations delivered and removed
  pub synced: usize,
  /// Operations the origin permanently rejected, removed without retry
  pub dropped: usize,
  /// Operations still queued
  pub remaining: usize,
  /// Sequence id of the operation that stopped the pass, if any
  pub halted_at: Option<u64>,
}

/// How a single replay attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
  Delivered,
  Rejected(u16),
  Transient,
}

impl ReplayOutcome {
  /// 2xx/3xx are delivered; 408, 429 and 5xx are worth retrying; any other
  /// 4xx will be rejected again on every retry.
  pub fn classify(result: &Result<Response>) -> Self {
    match result {
      Err(_) => ReplayOutcome::Transient,
      Ok(response) => match response.status {
        200..=399 => ReplayOutcome::Delivered,
        408 | 429 => ReplayOutcome::Transient,
        status @ 400..=499 => ReplayOutcome::Rejected(status),
        _ => ReplayOutcome::Transient,
      },
    }
  }
}

#[derive(Debug, Default)]
struct QueueState {
  operations: Vec<OfflineOperation>,
  next_sequence: u64,
  /// Whether the durable mirror has been read since startup
  loaded: bool,
}

pub struct OfflineQueue {
  state: Mutex<QueueState>,
  store: Arc<dyn QueueStore>,
  bus: NotificationBus,
  clock: Arc<dyn Clock>,
  drop_rejected: bool,
  /// Mirrors `state.operations.len()` for lock-free status reads
  len: AtomicUsize,
  /// Mirrors `state.loaded`
  loaded: AtomicBool,
}

impl OfflineQueue {
  pub fn new(
    store: Arc<dyn QueueStore>,
    bus: NotificationBus,
    clock: Arc<dyn Clock>,
    drop_rejected: bool,
  ) -> Self {
    Self {
      state: Mutex::new(QueueState {
        next_sequence: 1,
        ..QueueState::default()
      }),
      store,
      bus,
      clock,
      drop_rejected,
      len: AtomicUsize::new(0),
      loaded: AtomicBool::new(false),
    }
  }

  /// Queue length as of the last mutation.
  pub fn len(&self) -> usize {
    self.len.load(Ordering::SeqCst)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Whether the durable mirror has been read. Until then `len` only
  /// counts operations queued by this process.
  pub fn is_loaded(&self) -> bool {
    self.loaded.load(Ordering::SeqCst)
  }

  /// True when a replay could have work to do, including operations still
  /// sitting unread in the mirror.
  pub fn needs_replay(&self) -> bool {
    !self.is_loaded() || !self.is_empty()
  }

  /// Read the mirror if that has not happened yet. Returns the queue length.
  pub async fn load(&self) -> usize {
    let mut state = self.state.lock().await;
    self.ensure_loaded(&mut state).await;
    state.operations.len()
  }

  /// Append a mutation, persist the whole queue and notify subscribers.
  pub async fn enqueue(&self, request: &Request) -> OfflineOperation {
    let mut state = self.state.lock().await;
    self.ensure_loaded(&mut state).await;

    let operation =
      OfflineOperation::from_request(state.next_sequence, request, self.clock.now());
    state.next_sequence += 1;
    state.operations.push(operation.clone());
    self.persist(&state).await;

    let count = state.operations.len();
    self.len.store(count, Ordering::SeqCst);
    drop(state);

    info!(
      sequence = operation.sequence,
      method = %operation.method,
      url = %operation.url,
      count,
      "Queued offline operation"
    );
    self
      .bus
      .publish(Notification::QueuedOperationAdded { count });
    operation
  }

  /// Re-issue queued operations in order, stopping at the first transient
  /// failure. Completed operations are removed in a single rewrite.
  pub async fn replay(&self, network: &dyn Network) -> ReplayReport {
    let mut state = self.state.lock().await;

    // Covers cold start: the mirror may hold operations from a previous run
    self.ensure_loaded(&mut state).await;

    if state.operations.is_empty() {
      self.len.store(0, Ordering::SeqCst);
      return ReplayReport::default();
    }

    let mut report = ReplayReport::default();
    let mut completed = Vec::new();

    for op in &state.operations {
      let result = network.fetch(&op.to_request()).await;
      match ReplayOutcome::classify(&result) {
        ReplayOutcome::Delivered => {
          debug!(sequence = op.sequence, url = %op.url, "Replayed operation");
          completed.push(op.sequence);
          report.synced += 1;
        }
        ReplayOutcome::Rejected(status) if self.drop_rejected => {
          warn!(
            sequence = op.sequence,
            method = %op.method,
            url = %op.url,
            status,
            "Origin rejected queued operation, dropping it"
          );
          completed.push(op.sequence);
          report.dropped += 1;
        }
        outcome => {
          debug!(sequence = op.sequence, ?outcome, "Replay halted");
          report.halted_at = Some(op.sequence);
          break;
        }
      }
    }

    if !completed.is_empty() {
      state.operations.retain(|op| !completed.contains(&op.sequence));
      self.persist(&state).await;
    }

    report.remaining = state.operations.len();
    self.len.store(report.remaining, Ordering::SeqCst);
    drop(state);

    info!(
      synced = report.synced,
      dropped = report.dropped,
      remaining = report.remaining,
      "Replay finished"
    );
    self.bus.publish(Notification::OperationsSynced {
      synced: report.synced,
      remaining: report.remaining,
      dropped: report.dropped,
    });
    report
  }

  /// Drop every queued operation, in memory and in the mirror.
  pub async fn clear(&self) -> usize {
    let mut state = self.state.lock().await;
    self.ensure_loaded(&mut state).await;
    let cleared = state.operations.len();
    state.operations.clear();
    self.persist(&state).await;
    self.len.store(0, Ordering::SeqCst);
    info!(cleared, "Cleared offline queue");
    cleared
  }

  /// The queued operations, in replay order.
  pub async fn snapshot(&self) -> Vec<OfflineOperation> {
    let mut state = self.state.lock().await;
    self.ensure_loaded(&mut state).await;
    state.operations.clone()
  }

  /// Read the mirror once so operations from a previous run are kept ahead
  /// of anything queued now.
  async fn ensure_loaded(&self, state: &mut QueueState) {
    if state.loaded {
      return;
    }
    let stored = match self.store.load_queue().await {
      Ok(stored) => stored,
      Err(e) => {
        warn!(error = %e, "Failed to load offline queue");
        return;
      }
    };

    // Nothing queued before this point has reached the mirror, so it is
    // appended after the stored operations without any overlap.
    let pending = std::mem::take(&mut state.operations);
    state.next_sequence = stored.iter().map(|op| op.sequence).max().map_or(1, |s| s + 1);
    state.operations = stored;
    for mut op in pending.iter().cloned() {
      op.sequence = state.next_sequence;
      state.next_sequence += 1;
      state.operations.push(op);
    }
    state.loaded = true;
    self.loaded.store(true, Ordering::SeqCst);
    self.len.store(state.operations.len(), Ordering::SeqCst);

    if !pending.is_empty() {
      debug!(count = pending.len(), "Merged operations queued before the mirror was read");
      self.persist(state).await;
    }
  }

  /// Rewrite the mirror from memory. Skipped until the mirror has been read,
  /// since a rewrite would replace operations that are only stored there.
  async fn persist(&self, state: &QueueState) {
    if !state.loaded {
      debug!(count = state.operations.len(), "Mirror not read yet, keeping queue in memory");
      return;
    }
    // On failure the in-memory queue stays authoritative; the next mutation
    // rewrites the whole mirror again.
    if let Err(e) = self.store.save_queue(&state.operations).await {
      warn!(error = %e, count = state.operations.len(), "Failed to persist offline queue");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::SystemClock;
  use crate::error::Error;
  use crate::http::Method;
  use async_trait::async_trait;
  use std::collections::HashSet;
  use std::sync::Mutex as StdMutex;
  use url::Url;

  /// Answers by path: paths in `failing` are unreachable, paths in
  /// `statuses` answer with that status, everything else 200.
  #[derive(Default)]
  struct FakeNetwork {
    failing: StdMutex<HashSet<String>>,
    statuses: StdMutex<Vec<(String, u16)>>,
    calls: StdMutex<Vec<String>>,
  }

  impl FakeNetwork {
    fn fail(&self, path: &str) {
      self.failing.lock().unwrap().insert(path.to_string());
    }

    fn status(&self, path: &str, status: u16) {
      self.statuses.lock().unwrap().push((path.to_string(), status));
    }

    fn calls(&self) -> Vec<String> {
      self.calls.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl Network for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
      let path = request.url.path().to_string();
      self.calls.lock().unwrap().push(path.clone());
      if self.failing.lock().unwrap().contains(&path) {
        return Err(Error::Network(format!("{} unreachable", path)));
      }
      let status = self
        .statuses
        .lock()
        .unwrap()
        .iter()
        .find(|(p, _)| *p == path)
        .map(|(_, s)| *s)
        .unwrap_or(200);
      Ok(Response::new(status, ""))
    }
  }

  /// Fails every write.
  struct BrokenStore;

  #[async_trait]
  impl QueueStore for BrokenStore {
    async fn load_queue(&self) -> Result<Vec<OfflineOperation>> {
      Err(Error::Storage("disk gone".to_string()))
    }

    async fn save_queue(&self, _operations: &[OfflineOperation]) -> Result<()> {
      Err(Error::Storage("disk gone".to_string()))
    }
  }

  /// Fails the first load, then behaves like the wrapped store.
  struct FlakyLoadStore {
    inner: MemoryQueueStore,
    failed_once: AtomicBool,
  }

  impl FlakyLoadStore {
    fn new(inner: MemoryQueueStore) -> Self {
      Self {
        inner,
        failed_once: AtomicBool::new(false),
      }
    }
  }

  #[async_trait]
  impl QueueStore for FlakyLoadStore {
    async fn load_queue(&self) -> Result<Vec<OfflineOperation>> {
      if !self.failed_once.swap(true, Ordering::SeqCst) {
        return Err(Error::Storage("busy".to_string()));
      }
      self.inner.load_queue().await
    }

    async fn save_queue(&self, operations: &[OfflineOperation]) -> Result<()> {
      self.inner.save_queue(operations).await
    }
  }

  fn post(path: &str) -> Request {
    let url = Url::parse("https://app.example.com").unwrap().join(path).unwrap();
    Request::new(Method::Post, url).with_body(path.as_bytes().to_vec())
  }

  fn queue(store: Arc<dyn QueueStore>, drop_rejected: bool) -> (OfflineQueue, NotificationBus) {
    let bus = NotificationBus::new();
    let queue = OfflineQueue::new(store, bus.clone(), Arc::new(SystemClock), drop_rejected);
    (queue, bus)
  }

  fn paths(ops: &[OfflineOperation]) -> Vec<String> {
    ops.iter().map(|op| op.url.path().to_string()).collect()
  }

  #[tokio::test]
  async fn test_enqueue_persists_and_notifies() {
    let store = Arc::new(MemoryQueueStore::new());
    let (queue, bus) = queue(store.clone(), true);
    let mut sub = bus.subscribe();

    let a = queue.enqueue(&post("/a")).await;
    let b = queue.enqueue(&post("/b")).await;

    assert!(a.sequence < b.sequence);
    assert_eq!(store.snapshot(), queue.snapshot().await);
    assert_eq!(queue.len(), 2);
    assert_eq!(
      sub.try_recv(),
      Some(Notification::QueuedOperationAdded { count: 1 })
    );
    assert_eq!(
      sub.try_recv(),
      Some(Notification::QueuedOperationAdded { count: 2 })
    );
  }

  #[tokio::test]
  async fn test_replay_halts_at_first_failure() {
    let store = Arc::new(MemoryQueueStore::new());
    let (queue, bus) = queue(store.clone(), true);
    for path in ["/a", "/b", "/c"] {
      queue.enqueue(&post(path)).await;
    }
    let mut sub = bus.subscribe();

    let network = FakeNetwork::default();
    network.fail("/b");
    let report = queue.replay(&network).await;

    assert_eq!(report.synced, 1);
    assert_eq!(report.remaining, 2);
    assert_eq!(report.halted_at, Some(2));
    assert_eq!(network.calls(), vec!["/a", "/b"]);
    assert_eq!(paths(&queue.snapshot().await), vec!["/b", "/c"]);
    assert_eq!(paths(&store.snapshot()), vec!["/b", "/c"]);
    assert_eq!(
      sub.try_recv(),
      Some(Notification::OperationsSynced {
        synced: 1,
        remaining: 2,
        dropped: 0
      })
    );
  }

  #[tokio::test]
  async fn test_rejected_operations_are_dropped() {
    let (queue, _bus) = queue(Arc::new(MemoryQueueStore::new()), true);
    for path in ["/a", "/bad", "/c"] {
      queue.enqueue(&post(path)).await;
    }

    let network = FakeNetwork::default();
    network.status("/bad", 422);
    let report = queue.replay(&network).await;

    assert_eq!(report.synced, 2);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.remaining, 0);
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_rejection_halts_when_dropping_disabled() {
    let (queue, _bus) = queue(Arc::new(MemoryQueueStore::new()), false);
    for path in ["/bad", "/c"] {
      queue.enqueue(&post(path)).await;
    }

    let network = FakeNetwork::default();
    network.status("/bad", 400);
    let report = queue.replay(&network).await;

    assert_eq!(report.synced, 0);
    assert_eq!(report.remaining, 2);
    assert_eq!(network.calls(), vec!["/bad"]);
  }

  #[tokio::test]
  async fn test_server_errors_are_transient() {
    let (queue, _bus) = queue(Arc::new(MemoryQueueStore::new()), true);
    queue.enqueue(&post("/a")).await;
    queue.enqueue(&post("/b")).await;

    let network = FakeNetwork::default();
    network.status("/a", 503);
    let report = queue.replay(&network).await;

    assert_eq!(report.halted_at, Some(1));
    assert_eq!(report.remaining, 2);
  }

  #[tokio::test]
  async fn test_restart_reloads_from_mirror() {
    let store = Arc::new(MemoryQueueStore::new());
    {
      let (queue, _bus) = queue(store.clone(), true);
      queue.enqueue(&post("/first")).await;
      queue.enqueue(&post("/second")).await;
    }

    let (restarted, _bus) = queue(store.clone(), true);
    assert_eq!(restarted.len(), 0);

    let network = FakeNetwork::default();
    let report = restarted.replay(&network).await;

    assert_eq!(report.synced, 2);
    assert_eq!(network.calls(), vec!["/first", "/second"]);
    assert!(store.snapshot().is_empty());
  }

  #[tokio::test]
  async fn test_enqueue_after_restart_keeps_earlier_operations() {
    let store = Arc::new(MemoryQueueStore::new());
    {
      let (queue, _bus) = queue(store.clone(), true);
      queue.enqueue(&post("/old")).await;
    }

    let (restarted, _bus) = queue(store.clone(), true);
    let new = restarted.enqueue(&post("/new")).await;

    assert_eq!(new.sequence, 2);
    assert_eq!(paths(&store.snapshot()), vec!["/old", "/new"]);
  }

  #[tokio::test]
  async fn test_persistence_failure_keeps_memory_queue() {
    let (queue, _bus) = queue(Arc::new(BrokenStore), true);
    queue.enqueue(&post("/a")).await;
    queue.enqueue(&post("/b")).await;
    assert_eq!(queue.len(), 2);

    let report = queue.replay(&FakeNetwork::default()).await;
    assert_eq!(report.synced, 2);
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_clear_empties_mirror() {
    let store = Arc::new(MemoryQueueStore::new());
    let (queue, _bus) = queue(store.clone(), true);
    queue.enqueue(&post("/a")).await;

    assert_eq!(queue.clear().await, 1);
    assert!(queue.is_empty());
    assert!(store.snapshot().is_empty());
  }

  #[tokio::test]
  async fn test_replay_of_empty_queue_is_quiet() {
    let (queue, bus) = queue(Arc::new(MemoryQueueStore::new()), true);
    let mut sub = bus.subscribe();
    let report = queue.replay(&FakeNetwork::default()).await;
    assert_eq!(report, ReplayReport::default());
    assert!(sub.try_recv().is_none());
  }

  #[tokio::test]
  async fn test_failed_first_load_does_not_duplicate_operations() {
    let store = Arc::new(FlakyLoadStore::new(MemoryQueueStore::new()));
    let (queue, _bus) = queue(store.clone(), true);

    queue.enqueue(&post("/pay")).await;
    assert!(!queue.is_loaded());
    assert!(store.inner.snapshot().is_empty());

    queue.enqueue(&post("/other")).await;
    let queued = queue.snapshot().await;
    assert_eq!(paths(&queued), vec!["/pay", "/other"]);
    assert_eq!(
      queued.iter().map(|op| op.sequence).collect::<Vec<_>>(),
      vec![1, 2]
    );
    assert_eq!(store.inner.snapshot(), queued);

    let network = FakeNetwork::default();
    let report = queue.replay(&network).await;
    assert_eq!(report.synced, 2);
    assert_eq!(network.calls(), vec!["/pay", "/other"]);
  }

  #[tokio::test]
  async fn test_failed_first_load_keeps_operations_from_previous_run() {
    let mirror = MemoryQueueStore::new();
    {
      let (previous, _bus) = queue(Arc::new(MemoryQueueStore::new()), true);
      let old = previous.enqueue(&post("/old")).await;
      mirror.save_queue(&[old]).await.unwrap();
    }
    let store = Arc::new(FlakyLoadStore::new(mirror));
    let (queue, _bus) = queue(store.clone(), true);

    queue.enqueue(&post("/new")).await;
    assert_eq!(paths(&store.inner.snapshot()), vec!["/old"]);

    assert_eq!(queue.load().await, 2);
    assert_eq!(paths(&queue.snapshot().await), vec!["/old", "/new"]);
    assert_eq!(paths(&store.inner.snapshot()), vec!["/old", "/new"]);
    assert_eq!(queue.snapshot().await[1].sequence, 2);
  }

  #[tokio::test]
  async fn test_load_reports_mirror_length_before_any_mutation() {
    let store = Arc::new(MemoryQueueStore::new());
    {
      let (queue, _bus) = queue(store.clone(), true);
      queue.enqueue(&post("/a")).await;
      queue.enqueue(&post("/b")).await;
    }

    let (restarted, _bus) = queue(store, true);
    assert!(restarted.needs_replay());
    assert_eq!(restarted.load().await, 2);
    assert_eq!(restarted.len(), 2);
    assert!(restarted.is_loaded());
  }
}
