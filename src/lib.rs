//! Offline-tolerant fetch layer.
//!
//! A [`ResilientClient`] sits between application code and the network. It
//! answers reads from a TTL-bounded [`ResponseCache`], parks writes that
//! cannot complete in a durable [`MutationQueue`], and replays them when the
//! [`ConnectivityMonitor`] reports that the network is back.

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod event;
pub mod queue;
pub mod request;
pub mod retry;
pub mod store;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use cache::{cache_key, CacheConfig, CacheEntry, ResponseCache};
pub use client::{ClientBuilder, FetchOptions, FetchOutcome, ResilientClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use connectivity::{ConnectivityMonitor, ConnectivityState, NetworkKind};
pub use error::FetchError;
pub use event::{EventBus, NetworkEvent, SubscriptionId};
pub use queue::{DrainReport, MutationQueue, QueueConfig, QueuedRequest};
pub use request::{Method, RequestSpec, Response};
pub use retry::RetryPolicy;
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
pub use transport::{HttpTransport, Transport};
