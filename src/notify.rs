//! Broadcast bus for queue notifications.
//!
//! Each subscriber owns an unbounded channel. Delivery is best-effort and
//! at-most-once: a subscriber whose receiver has been dropped misses the
//! message and is pruned.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Events published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
  /// A mutation was queued offline; `count` is the new queue length
  QueuedOperationAdded { count: usize },
  /// A replay pass finished
  OperationsSynced {
    synced: usize,
    remaining: usize,
    dropped: usize,
  },
}

pub type SubscriberId = u64;

#[derive(Debug, Default)]
struct BusState {
  next_id: SubscriberId,
  subscribers: Vec<(SubscriberId, mpsc::UnboundedSender<Notification>)>,
}

#[derive(Debug, Clone, Default)]
pub struct NotificationBus {
  state: Arc<Mutex<BusState>>,
}

/// Receiving half handed to a subscriber.
#[derive(Debug)]
pub struct Subscription {
  id: SubscriberId,
  rx: mpsc::UnboundedReceiver<Notification>,
}

impl Subscription {
  pub fn id(&self) -> SubscriberId {
    self.id
  }

  /// Receive the next notification
  pub async fn recv(&mut self) -> Option<Notification> {
    self.rx.recv().await
  }

  pub fn try_recv(&mut self) -> Option<Notification> {
    self.rx.try_recv().ok()
  }
}

impl NotificationBus {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn subscribe(&self) -> Subscription {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let id = state.next_id;
    state.next_id += 1;
    state.subscribers.push((id, tx));
    Subscription { id, rx }
  }

  pub fn unsubscribe(&self, id: SubscriberId) -> bool {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let before = state.subscribers.len();
    state.subscribers.retain(|(sid, _)| *sid != id);
    state.subscribers.len() != before
  }

  /// Send to every live subscriber. Returns how many received it.
  pub fn publish(&self, notification: Notification) -> usize {
    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    state
      .subscribers
      .retain(|(_, tx)| tx.send(notification.clone()).is_ok());
    let delivered = state.subscribers.len();
    debug!(?notification, delivered, "Published notification");
    delivered
  }

  pub fn subscriber_count(&self) -> usize {
    let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
    state.subscribers.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_every_subscriber_receives() {
    let bus = NotificationBus::new();
    let mut a = bus.subscribe();
    let mut b = bus.subscribe();

    let delivered = bus.publish(Notification::QueuedOperationAdded { count: 1 });
    assert_eq!(delivered, 2);
    assert_eq!(
      a.recv().await,
      Some(Notification::QueuedOperationAdded { count: 1 })
    );
    assert_eq!(
      b.recv().await,
      Some(Notification::QueuedOperationAdded { count: 1 })
    );
  }

  #[test]
  fn test_dropped_subscriber_is_pruned() {
    let bus = NotificationBus::new();
    let gone = bus.subscribe();
    let mut kept = bus.subscribe();
    drop(gone);

    let delivered = bus.publish(Notification::OperationsSynced {
      synced: 1,
      remaining: 0,
      dropped: 0,
    });
    assert_eq!(delivered, 1);
    assert_eq!(bus.subscriber_count(), 1);
    assert!(kept.try_recv().is_some());
  }

  #[test]
  fn test_unsubscribe_stops_delivery() {
    let bus = NotificationBus::new();
    let mut sub = bus.subscribe();
    assert!(bus.unsubscribe(sub.id()));
    assert!(!bus.unsubscribe(sub.id()));

    bus.publish(Notification::QueuedOperationAdded { count: 3 });
    assert!(sub.try_recv().is_none());
  }

  #[test]
  fn test_wire_shape() {
    let json = serde_json::to_value(Notification::OperationsSynced {
      synced: 2,
      remaining: 1,
      dropped: 0,
    })
    .unwrap();
    assert_eq!(json["type"], "operations-synced");
    assert_eq!(json["synced"], 2);
    assert_eq!(json["remaining"], 1);

    let json = serde_json::to_value(Notification::QueuedOperationAdded { count: 4 }).unwrap();
    assert_eq!(json["type"], "queued-operation-added");
    assert_eq!(json["count"], 4);
  }
}
