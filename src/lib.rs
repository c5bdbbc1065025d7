//! Offline-capable request cache and mutation sync layer.
//!
//! Every request passes through [`OfflineLayer::handle`]: the
//! [`ResourceClassifier`] picks a tier, strategy and TTL, the strategy
//! answers from the [`TieredCacheStore`] and the [`Network`], and writes
//! that cannot reach the network are parked in the [`OfflineQueue`] until
//! they can be replayed in order.

pub mod cache;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod network;
pub mod notify;
pub mod queue;

pub use cache::{CacheEntry, CacheKey, CacheLayer, CacheResult, CacheSource, TieredCacheStore};
pub use classifier::{Classification, ResourceClassifier, StrategyKind};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use http::{Method, Request, Response};
pub use lifecycle::{ControlMessage, ControlReply, LifecycleState, OfflineLayer, Status};
pub use network::{HttpNetwork, Network, SwitchableNetwork};
pub use notify::{Notification, NotificationBus, Subscription};
pub use queue::{
  MemoryQueueStore, OfflineOperation, OfflineQueue, QueueStore, ReplayReport, SqliteQueueStore,
};
