//! Resilient client: the single entry point for network calls.
//!
//! Per call it decides between the response cache, the network and the
//! mutation queue:
//! 1. Cacheable reads are answered from the cache when possible
//! 2. Offline reads fail fast; offline writes are queued if the caller allows it
//! 3. Online calls go to the network; successful cacheable reads are stored,
//!    failed writes are queued if the caller allows it

use chrono::Duration as ChronoDuration;
use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{cache_key, CacheConfig, ResponseCache};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::connectivity::{spawn_probe, ConnectivityMonitor, ConnectivityState, TcpProbe};
use crate::error::FetchError;
use crate::event::{EventBus, NetworkEvent, SubscriptionId};
use crate::queue::{spawn_auto_drain, AutoDrain, DrainReport, MutationQueue, QueueConfig, QueueDeps};
use crate::request::{RequestSpec, Response};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::{KeyValueStore, MemoryStore, SqliteStore};
use crate::transport::{self, HttpTransport, Transport};

/// Per-call behaviour.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
  /// Serve reads from the cache and store successful reads
  pub cacheable: bool,
  /// Lifetime of a stored read (cache default when unset)
  pub ttl: Option<ChronoDuration>,
  /// Override for the `METHOD:url` cache key
  pub cache_key: Option<String>,
  /// Queue writes that cannot complete now instead of failing
  pub queue_on_failure: bool,
  /// Delivery attempts for a queued write (queue default when unset)
  pub max_attempts: Option<u32>,
  /// Diagnostic label for a queued write
  pub context: Option<String>,
}

impl FetchOptions {
  /// Cacheable read with the given lifetime.
  pub fn cached(ttl: ChronoDuration) -> Self {
    Self {
      cacheable: true,
      ttl: Some(ttl),
      ..Self::default()
    }
  }

  /// Write that is queued when it cannot be delivered now.
  pub fn queued(context: impl Into<String>) -> Self {
    Self {
      queue_on_failure: true,
      context: Some(context.into()),
      ..Self::default()
    }
  }

  pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
    self.cache_key = Some(key.into());
    self
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = Some(max_attempts);
    self
  }
}

/// What a call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
  /// Completed over the network
  Network(Response),
  /// Answered from the cache; no network call was made
  Cached(Response),
  /// Accepted into the queue for later delivery, not yet completed
  Deferred { id: String },
}

impl FetchOutcome {
  pub fn is_deferred(&self) -> bool {
    matches!(self, FetchOutcome::Deferred { .. })
  }

  pub fn response(&self) -> Option<&Response> {
    match self {
      FetchOutcome::Network(r) | FetchOutcome::Cached(r) => Some(r),
      FetchOutcome::Deferred { .. } => None,
    }
  }

  pub fn into_response(self) -> Option<Response> {
    match self {
      FetchOutcome::Network(r) | FetchOutcome::Cached(r) => Some(r),
      FetchOutcome::Deferred { .. } => None,
    }
  }
}

/// Assembles a [`ResilientClient`] from its parts.
pub struct ClientBuilder {
  transport: Arc<dyn Transport>,
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  events: Arc<EventBus>,
  initial_state: ConnectivityState,
  cache_config: CacheConfig,
  queue_config: QueueConfig,
  retry: RetryPolicy,
  request_timeout: Duration,
}

impl ClientBuilder {
  pub fn new(transport: Arc<dyn Transport>) -> Self {
    Self {
      transport,
      store: Arc::new(MemoryStore::new()),
      clock: Arc::new(SystemClock),
      events: Arc::new(EventBus::new()),
      initial_state: ConnectivityState::optimistic(),
      cache_config: CacheConfig::default(),
      queue_config: QueueConfig::default(),
      retry: RetryPolicy::default(),
      request_timeout: transport::DEFAULT_TIMEOUT,
    }
  }

  pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
    self.store = store;
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn events(mut self, events: Arc<EventBus>) -> Self {
    self.events = events;
    self
  }

  pub fn initial_state(mut self, state: ConnectivityState) -> Self {
    self.initial_state = state;
    self
  }

  pub fn cache_config(mut self, config: CacheConfig) -> Self {
    self.cache_config = config;
    self
  }

  pub fn queue_config(mut self, config: QueueConfig) -> Self {
    self.queue_config = config;
    self
  }

  pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
    self.retry = policy;
    self
  }

  pub fn request_timeout(mut self, timeout: Duration) -> Self {
    self.request_timeout = timeout;
    self
  }

  /// Build the client and start draining on reconnect.
  ///
  /// Must be called inside a tokio runtime.
  pub fn build(self) -> ResilientClient {
    let monitor = Arc::new(ConnectivityMonitor::with_state(
      self.events.clone(),
      self.initial_state,
    ));
    let cache = ResponseCache::new(self.store.clone(), self.clock.clone(), self.cache_config);
    let queue = Arc::new(MutationQueue::load(
      QueueDeps {
        store: self.store,
        clock: self.clock,
        monitor: monitor.clone(),
        transport: self.transport.clone(),
        events: self.events.clone(),
      },
      self.queue_config,
    ));
    let auto_drain = spawn_auto_drain(queue.clone());

    ResilientClient {
      monitor,
      cache,
      queue,
      transport: self.transport,
      events: self.events,
      retry: self.retry,
      request_timeout: self.request_timeout,
      _auto_drain: auto_drain,
      probe: None,
    }
  }
}

/// Cache-, queue- and connectivity-aware network client.
pub struct ResilientClient {
  monitor: Arc<ConnectivityMonitor>,
  cache: ResponseCache,
  queue: Arc<MutationQueue>,
  transport: Arc<dyn Transport>,
  events: Arc<EventBus>,
  retry: RetryPolicy,
  request_timeout: Duration,
  _auto_drain: AutoDrain,
  probe: Option<JoinHandle<()>>,
}

impl ResilientClient {
  pub fn builder(transport: Arc<dyn Transport>) -> ClientBuilder {
    ClientBuilder::new(transport)
  }

  /// Create a client from configuration: HTTP transport, SQLite store and,
  /// if configured, a reachability probe.
  pub fn from_config(config: &Config) -> Result<Self> {
    let transport = HttpTransport::new(config.base_url.as_deref(), config.request_timeout())?;
    let store = match &config.storage_path {
      Some(path) => SqliteStore::open_at(path)?,
      None => SqliteStore::open()?,
    };

    let mut client = ClientBuilder::new(Arc::new(transport))
      .store(Arc::new(store))
      .cache_config(config.cache_config())
      .queue_config(config.queue_config())
      .retry_policy(config.retry_policy())
      .request_timeout(config.request_timeout())
      .build();

    if let Some(probe) = &config.probe {
      let handle = spawn_probe(
        client.monitor.clone(),
        TcpProbe::new(&probe.host, probe.port),
        Duration::from_secs(probe.interval_secs.max(1)),
      );
      client.probe = Some(handle);
    }

    Ok(client)
  }

  /// Perform `request`, using the cache and queue as `options` allow.
  pub async fn fetch(&self, request: RequestSpec, options: FetchOptions) -> Result<FetchOutcome, FetchError> {
    self.run(request, options, false).await
  }

  /// Like [`fetch`](Self::fetch), but transient network failures are retried
  /// with backoff before the call is queued or fails.
  pub async fn fetch_with_retry(
    &self,
    request: RequestSpec,
    options: FetchOptions,
  ) -> Result<FetchOutcome, FetchError> {
    self.run(request, options, true).await
  }

  async fn run(
    &self,
    request: RequestSpec,
    options: FetchOptions,
    retry: bool,
  ) -> Result<FetchOutcome, FetchError> {
    let is_read = request.method.is_read();
    let key = (options.cacheable && is_read).then(|| {
      options
        .cache_key
        .clone()
        .unwrap_or_else(|| cache_key(request.method, &request.url))
    });

    if let Some(key) = &key {
      if let Some(response) = self.cache.get::<Response>(key) {
        return Ok(FetchOutcome::Cached(response));
      }
    }

    if !self.monitor.is_online() {
      if !is_read && options.queue_on_failure {
        return Ok(self.defer(request, &options));
      }
      debug!(method = %request.method, url = %request.url, "offline, failing fast");
      return Err(FetchError::Connectivity);
    }

    let result = if retry {
      with_retry(&self.retry, || self.attempt(&request)).await
    } else {
      self.attempt(&request).await
    };

    match result {
      Ok(response) => {
        if let Some(key) = &key {
          let ttl = options.ttl.unwrap_or(self.cache.config().default_ttl);
          self.cache.set(key, &response, ttl);
        }
        Ok(FetchOutcome::Network(response))
      }
      Err(error) if !is_read && options.queue_on_failure => {
        info!(method = %request.method, url = %request.url, %error, "write failed, queueing");
        Ok(self.defer(request, &options))
      }
      Err(error) => Err(error),
    }
  }

  async fn attempt(&self, request: &RequestSpec) -> Result<Response, FetchError> {
    transport::execute_with_timeout(self.transport.as_ref(), request, self.request_timeout).await
  }

  fn defer(&self, request: RequestSpec, options: &FetchOptions) -> FetchOutcome {
    let max_attempts = options
      .max_attempts
      .unwrap_or(self.queue.config().default_max_attempts);
    let context = options
      .context
      .clone()
      .unwrap_or_else(|| format!("{} {}", request.method, request.url));
    let id = self.queue.enqueue(request, max_attempts, context);
    FetchOutcome::Deferred { id }
  }

  /// Drain the queue now (e.g. when the application returns to foreground).
  pub async fn drain(&self) -> DrainReport {
    self.queue.drain().await
  }

  /// Register a listener for every event this client emits.
  pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
  where
    F: Fn(&NetworkEvent) + Send + Sync + 'static,
  {
    self.events.subscribe(listener)
  }

  pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
    self.events.unsubscribe(id)
  }

  pub fn events(&self) -> &Arc<EventBus> {
    &self.events
  }

  pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
    &self.monitor
  }

  pub fn cache(&self) -> &ResponseCache {
    &self.cache
  }

  pub fn queue(&self) -> &Arc<MutationQueue> {
    &self.queue
  }
}

impl Drop for ResilientClient {
  fn drop(&mut self) {
    if let Some(probe) = self.probe.take() {
      probe.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::request::Method;
  use crate::test_support::{ok_response, record_events, wait_until, MockTransport};
  use serde_json::json;

  fn client(transport: Arc<MockTransport>, state: ConnectivityState) -> ResilientClient {
    ResilientClient::builder(transport)
      .initial_state(state)
      .retry_policy(RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
      })
      .build()
  }

  #[tokio::test]
  async fn test_cache_hit_skips_network() {
    let transport = Arc::new(MockTransport::ok());
    let client = client(transport.clone(), ConnectivityState::optimistic());
    let options = FetchOptions::cached(ChronoDuration::minutes(1));

    let first = client
      .fetch(RequestSpec::get("/users/42"), options.clone())
      .await
      .unwrap();
    let second = client
      .fetch(RequestSpec::get("/users/42"), options)
      .await
      .unwrap();

    assert!(matches!(first, FetchOutcome::Network(_)));
    assert_eq!(second, FetchOutcome::Cached(ok_response()));
    assert_eq!(transport.call_count(), 1);
  }

  #[tokio::test]
  async fn test_cache_hit_works_offline() {
    let transport = Arc::new(MockTransport::ok());
    let client = client(transport.clone(), ConnectivityState::optimistic());
    let options = FetchOptions::cached(ChronoDuration::minutes(1));

    client
      .fetch(RequestSpec::get("/users/42"), options.clone())
      .await
      .unwrap();
    client.connectivity().update(ConnectivityState::offline());

    let outcome = client
      .fetch(RequestSpec::get("/users/42"), options)
      .await
      .unwrap();
    assert!(matches!(outcome, FetchOutcome::Cached(_)));
  }

  #[tokio::test]
  async fn test_cached_read_expires() {
    let transport = Arc::new(MockTransport::ok());
    let clock = Arc::new(ManualClock::default());
    let client = ResilientClient::builder(transport.clone())
      .clock(clock.clone())
      .build();
    let options = FetchOptions::cached(ChronoDuration::seconds(1));

    client
      .fetch(RequestSpec::get("/feed"), options.clone())
      .await
      .unwrap();
    clock.advance(ChronoDuration::milliseconds(1001));
    let outcome = client.fetch(RequestSpec::get("/feed"), options).await.unwrap();

    assert!(matches!(outcome, FetchOutcome::Network(_)));
    assert_eq!(transport.call_count(), 2);
  }

  #[tokio::test]
  async fn test_explicit_cache_key() {
    let transport = Arc::new(MockTransport::ok());
    let client = client(transport.clone(), ConnectivityState::optimistic());

    client
      .fetch(
        RequestSpec::get("/users/42?fields=all"),
        FetchOptions::cached(ChronoDuration::minutes(1)).with_cache_key("user:42"),
      )
      .await
      .unwrap();

    assert!(client.cache().get::<Response>("user:42").is_some());
    assert!(client
      .cache()
      .get::<Response>("GET:/users/42?fields=all")
      .is_none());
  }

  #[tokio::test]
  async fn test_non_cacheable_read_is_not_stored() {
    let transport = Arc::new(MockTransport::ok());
    let client = client(transport.clone(), ConnectivityState::optimistic());

    client
      .fetch(RequestSpec::get("/live"), FetchOptions::default())
      .await
      .unwrap();
    client
      .fetch(RequestSpec::get("/live"), FetchOptions::default())
      .await
      .unwrap();

    assert_eq!(transport.call_count(), 2);
    assert!(client.cache().is_empty());
  }

  #[tokio::test]
  async fn test_writes_are_never_cached() {
    let transport = Arc::new(MockTransport::ok());
    let client = client(transport.clone(), ConnectivityState::optimistic());
    let options = FetchOptions::cached(ChronoDuration::minutes(1));

    client
      .fetch(RequestSpec::post("/echanges", json!({})), options.clone())
      .await
      .unwrap();
    client
      .fetch(RequestSpec::post("/echanges", json!({})), options)
      .await
      .unwrap();

    assert_eq!(transport.call_count(), 2);
    assert!(client.cache().is_empty());
  }

  #[tokio::test]
  async fn test_offline_read_fails_fast() {
    let transport = Arc::new(MockTransport::ok());
    let client = client(transport.clone(), ConnectivityState::offline());

    let err = client
      .fetch(RequestSpec::get("/users"), FetchOptions::queued("read"))
      .await
      .unwrap_err();

    assert_eq!(err, FetchError::Connectivity);
    assert_eq!(transport.call_count(), 0);
    assert!(client.queue().is_empty());
  }

  #[tokio::test]
  async fn test_offline_write_is_deferred() {
    let transport = Arc::new(MockTransport::ok());
    let client = client(transport.clone(), ConnectivityState::offline());

    let outcome = client
      .fetch(
        RequestSpec::post("/echanges", json!({"amount": 10})),
        FetchOptions::queued("exchange").with_max_attempts(5),
      )
      .await
      .unwrap();

    let FetchOutcome::Deferred { id } = outcome else {
      panic!("expected deferred outcome");
    };
    let pending = client.queue().pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].max_attempts, 5);
    assert_eq!(pending[0].context, "exchange");
    assert_eq!(transport.call_count(), 0);
  }

  #[tokio::test]
  async fn test_offline_write_without_queueing_fails() {
    let transport = Arc::new(MockTransport::ok());
    let client = client(transport, ConnectivityState::offline());

    let err = client
      .fetch(RequestSpec::post("/echanges", json!({})), FetchOptions::default())
      .await
      .unwrap_err();
    assert_eq!(err, FetchError::Connectivity);
  }

  #[tokio::test]
  async fn test_failed_write_is_deferred() {
    let transport = Arc::new(MockTransport::failing(FetchError::ServerUnavailable {
      status: 502,
    }));
    let client = client(transport.clone(), ConnectivityState::optimistic());

    let outcome = client
      .fetch(RequestSpec::new(Method::Put, "/profile"), FetchOptions::queued("profile"))
      .await
      .unwrap();

    assert!(outcome.is_deferred());
    assert!(outcome.response().is_none());
    assert_eq!(client.queue().len(), 1);
  }

  #[tokio::test]
  async fn test_failed_write_without_queueing_propagates() {
    let transport = Arc::new(MockTransport::failing(FetchError::Conflict));
    let client = client(transport, ConnectivityState::optimistic());

    let err = client
      .fetch(RequestSpec::new(Method::Delete, "/items/1"), FetchOptions::default())
      .await
      .unwrap_err();
    assert_eq!(err, FetchError::Conflict);
    assert!(client.queue().is_empty());
  }

  #[tokio::test]
  async fn test_failed_read_propagates_unchanged() {
    let transport = Arc::new(MockTransport::failing(FetchError::NotFound));
    let client = client(transport, ConnectivityState::optimistic());

    let err = client
      .fetch(
        RequestSpec::get("/missing"),
        FetchOptions::cached(ChronoDuration::minutes(1)),
      )
      .await
      .unwrap_err();
    assert_eq!(err, FetchError::NotFound);
    assert!(client.cache().is_empty());
  }

  #[tokio::test]
  async fn test_fetch_with_retry_recovers_from_transient_errors() {
    let transport = Arc::new(
      MockTransport::ok()
        .then(Err(FetchError::RateLimited))
        .then(Err(FetchError::Timeout)),
    );
    let client = client(transport.clone(), ConnectivityState::optimistic());

    let outcome = client
      .fetch_with_retry(RequestSpec::get("/users"), FetchOptions::default())
      .await
      .unwrap();

    assert!(matches!(outcome, FetchOutcome::Network(_)));
    assert_eq!(transport.call_count(), 3);
  }

  #[tokio::test]
  async fn test_fetch_with_retry_does_not_retry_validation() {
    let transport = Arc::new(MockTransport::failing(FetchError::Validation {
      status: 422,
      message: "bad".to_string(),
    }));
    let client = client(transport.clone(), ConnectivityState::optimistic());

    let err = client
      .fetch_with_retry(RequestSpec::post("/echanges", json!({})), FetchOptions::default())
      .await
      .unwrap_err();

    assert!(matches!(err, FetchError::Validation { status: 422, .. }));
    assert_eq!(transport.call_count(), 1);
  }

  #[tokio::test]
  async fn test_fetch_with_retry_queues_after_exhaustion() {
    let transport = Arc::new(MockTransport::failing(FetchError::ServerUnavailable {
      status: 503,
    }));
    let client = client(transport.clone(), ConnectivityState::optimistic());

    let outcome = client
      .fetch_with_retry(RequestSpec::post("/echanges", json!({})), FetchOptions::queued("x"))
      .await
      .unwrap();

    assert!(outcome.is_deferred());
    assert_eq!(transport.call_count(), 3);
  }

  #[tokio::test]
  async fn test_attempt_timeout_is_transient() {
    let transport = Arc::new(MockTransport::ok().with_delay(Duration::from_millis(200)));
    let client = ResilientClient::builder(transport)
      .request_timeout(Duration::from_millis(10))
      .build();

    let err = client
      .fetch(RequestSpec::get("/slow"), FetchOptions::default())
      .await
      .unwrap_err();
    assert_eq!(err, FetchError::Timeout);
    assert!(err.is_retryable());
  }

  #[tokio::test]
  async fn test_offline_write_delivered_after_reconnect() {
    let transport = Arc::new(MockTransport::ok());
    let client = client(transport.clone(), ConnectivityState::offline());
    let seen = record_events(client.events());

    let outcome = client
      .fetch(
        RequestSpec::post("/echanges", json!({"amount": 10})),
        FetchOptions::queued("exchange").with_max_attempts(3),
      )
      .await
      .unwrap();
    assert!(outcome.is_deferred());
    assert_eq!(client.queue().len(), 1);

    client.connectivity().update(ConnectivityState::optimistic());

    let drained = wait_until(|| {
      seen
        .lock()
        .unwrap()
        .contains(&NetworkEvent::QueueChanged { count: 0 })
    })
    .await;
    assert!(drained);
    assert!(client.queue().is_empty());
    assert_eq!(transport.calls()[0].url, "/echanges");
    assert!(seen.lock().unwrap().contains(&NetworkEvent::Reconnected));
  }

  #[tokio::test]
  async fn test_subscribe_and_unsubscribe() {
    let transport = Arc::new(MockTransport::ok());
    let client = client(transport, ConnectivityState::optimistic());
    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter_clone = counter.clone();

    let id = client.subscribe(move |_| {
      counter_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });
    client.connectivity().update(ConnectivityState::offline());
    assert!(counter.load(std::sync::atomic::Ordering::SeqCst) > 0);

    assert!(client.unsubscribe(id));
  }
}
